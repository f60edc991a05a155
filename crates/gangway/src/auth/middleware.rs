use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use axum_extra::extract::cookie::CookieJar;

use crate::db::{GatewayRepo, User};
use crate::error::ApiError;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "gangway_session";

/// Resolves session tokens to users. Inserted into the router as an
/// `Extension` so extractors can reach the repository.
#[derive(Clone)]
pub struct AuthExtractor {
    repo: GatewayRepo,
}

impl AuthExtractor {
    pub fn new(repo: GatewayRepo) -> Self {
        Self { repo }
    }
}

/// An authenticated user attached to a request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
}

/// Extractor that rejects the request unless a valid session is present.
pub struct RequireAuth(pub AuthUser);

/// Extractor that yields `None` for anonymous requests instead of failing.
pub struct OptionalAuth(pub Option<AuthUser>);

impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match resolve_auth(parts)? {
            Some(auth) => Ok(RequireAuth(auth)),
            None => Err(ApiError::Unauthenticated(
                "authentication required".to_string(),
            )),
        }
    }
}

impl<S> FromRequestParts<S> for OptionalAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(OptionalAuth(resolve_auth(parts)?))
    }
}

fn resolve_auth(parts: &Parts) -> Result<Option<AuthUser>, ApiError> {
    let extractor = parts
        .extensions
        .get::<AuthExtractor>()
        .ok_or_else(|| ApiError::Internal("auth extractor not configured".to_string()))?;

    let Some(token) = extract_token(parts) else {
        return Ok(None);
    };
    let user = extractor.repo.validate_session(&token)?;
    Ok(user.map(|user| AuthUser { user }))
}

/// Pull the session token from the cookie, falling back to a bearer header.
fn extract_token(parts: &Parts) -> Option<String> {
    let jar = CookieJar::from_headers(&parts.headers);
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        return Some(cookie.value().to_string());
    }
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with_header(name: header::HeaderName, value: &str) -> Parts {
        let req = Request::builder()
            .header(name, value)
            .body(())
            .unwrap();
        req.into_parts().0
    }

    #[test]
    fn test_token_from_cookie() {
        let parts = parts_with_header(header::COOKIE, "gangway_session=tok123; theme=dark");
        assert_eq!(extract_token(&parts).as_deref(), Some("tok123"));
    }

    #[test]
    fn test_token_from_bearer_header() {
        let parts = parts_with_header(header::AUTHORIZATION, "Bearer tok456");
        assert_eq!(extract_token(&parts).as_deref(), Some("tok456"));
    }

    #[test]
    fn test_cookie_takes_precedence_over_bearer() {
        let req = Request::builder()
            .header(header::COOKIE, "gangway_session=from-cookie")
            .header(header::AUTHORIZATION, "Bearer from-header")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        assert_eq!(extract_token(&parts).as_deref(), Some("from-cookie"));
    }

    #[test]
    fn test_no_token() {
        let req = Request::builder().body(()).unwrap();
        let (parts, _) = req.into_parts();
        assert!(extract_token(&parts).is_none());
    }
}
