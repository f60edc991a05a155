pub mod middleware;
pub mod password;

pub use middleware::{AuthExtractor, AuthUser, OptionalAuth, RequireAuth, SESSION_COOKIE};
pub use password::{hash_password, verify_password};
