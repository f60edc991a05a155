use axum::{
    Router,
    extract::Extension,
    http::{Method, header},
    routing::get,
};
use gangway::{
    auth::{AuthExtractor, hash_password},
    blob_store::build_blob_store,
    config::Config,
    db::{GatewayRepo, init_database},
    handlers::{self, ApiState},
    namespaces::ensure_reserved_namespaces,
    progress::ProgressHub,
    rate_limit::RateLimiter,
};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tokio::signal;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gangway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Gangway v{}", env!("CARGO_PKG_VERSION"));
    info!("Database path: {:?}", config.database_path);
    info!("CORS origins: {:?}", config.cors_origins);

    // Initialize database
    let conn = match Connection::open(&config.database_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_database(&conn) {
        error!("Failed to initialize database: {}", e);
        std::process::exit(1);
    }

    let repo = GatewayRepo::new(Arc::new(Mutex::new(conn)));

    if let Err(e) = seed_admin_user(&repo, &config) {
        error!("Failed to seed admin user: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = ensure_reserved_namespaces(&repo) {
        error!("Failed to seed reserved namespaces: {}", e);
        std::process::exit(1);
    }

    // Blob store backend
    let store = match build_blob_store(config.as_ref()).await {
        Ok(store) => {
            if config.is_s3_configured() {
                info!("Blob store: S3 ({})", config.s3.bucket);
            } else {
                warn!("Blob store: in-memory (S3 not configured); files are lost on restart");
            }
            store
        }
        Err(err) => {
            error!("Failed to initialize blob store: {}", err);
            std::process::exit(1);
        }
    };

    let hub = Arc::new(ProgressHub::new());
    let rate_limiter = Arc::new(RateLimiter::new());

    let state = ApiState {
        config: config.clone(),
        repo: repo.clone(),
        store,
        hub,
        rate_limiter: rate_limiter.clone(),
    };

    // Build CORS layer
    let origins: Vec<_> = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
        .allow_origin(AllowOrigin::list(origins));

    // Build the router
    let app = Router::new()
        .route("/", get(|| async { "Gangway File Gateway" }))
        .route("/health", get(|| async { "OK" }))
        .merge(handlers::router(state))
        .layer(Extension(AuthExtractor::new(repo)))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Sessions are reaped when they are next touched, so only the login rate
    // limiter needs a periodic sweep.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            rate_limiter.cleanup(tokio::time::Duration::from_secs(3600));
        }
    });

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    info!("Server shut down gracefully");
}

/// Create the admin user from configuration if it does not already exist.
fn seed_admin_user(repo: &GatewayRepo, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if repo.get_user_by_username(&config.admin_username)?.is_some() {
        return Ok(());
    }
    let password_hash = hash_password(&config.admin_password)?;
    repo.create_user(&config.admin_username, &password_hash)?;
    info!("Created admin user: {}", config.admin_username);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
