pub mod repo;
pub mod schema;

pub use repo::{GatewayRepo, Namespace, SessionInfo, User};
pub use schema::init_database;
