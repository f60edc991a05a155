use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};

use crate::auth::{RequireAuth, SESSION_COOKIE, verify_password};
use crate::error::{ApiError, ApiResult};
use crate::handlers::ApiState;

/// Login attempts allowed per username within the window.
const LOGIN_ATTEMPTS: usize = 10;
const LOGIN_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub username: String,
}

/// POST /api/login — verify credentials and set the session cookie.
pub async fn login(
    State(state): State<ApiState>,
    jar: CookieJar,
    Json(body): Json<LoginRequest>,
) -> ApiResult<(CookieJar, Json<SessionResponse>)> {
    if let Err(retry_after_secs) =
        state
            .rate_limiter
            .check(&body.username, "login", LOGIN_ATTEMPTS, LOGIN_WINDOW)
    {
        return Err(ApiError::RateLimited { retry_after_secs });
    }

    let user = state
        .repo
        .get_user_by_username(&body.username)?
        .filter(|user| verify_password(&body.password, &user.password_hash))
        .ok_or_else(|| ApiError::Unauthenticated("invalid credentials".to_string()))?;

    let expires_at = Utc::now() + chrono::Duration::days(state.config.session_expiry_days);
    let session = state.repo.create_session(&user.id, expires_at)?;

    let cookie = session_cookie(
        &session.token,
        state.config.session_expiry_days,
        state.config.cookie_secure,
    );
    tracing::info!(username = %user.username, "login");
    Ok((
        jar.add(cookie),
        Json(SessionResponse {
            username: user.username,
        }),
    ))
}

/// POST /api/logout — drop the session row and clear the cookie. Idempotent.
pub async fn logout(
    State(state): State<ApiState>,
    jar: CookieJar,
) -> ApiResult<(CookieJar, Json<serde_json::Value>)> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.repo.delete_session(cookie.value())?;
    }
    let removal = Cookie::build((SESSION_COOKIE, "")).path("/").build();
    Ok((
        jar.remove(removal),
        Json(serde_json::json!({ "status": "ok" })),
    ))
}

/// GET /api/session — whoami for the current session.
pub async fn session(RequireAuth(auth): RequireAuth) -> Json<SessionResponse> {
    Json(SessionResponse {
        username: auth.user.username,
    })
}

fn session_cookie(token: &str, expiry_days: i64, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token.to_string()))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(CookieDuration::days(expiry_days))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("tok", 7, true);
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.value(), "tok");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        assert_eq!(cookie.max_age(), Some(CookieDuration::days(7)));
    }
}
