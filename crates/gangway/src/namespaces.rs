use crate::db::GatewayRepo;
use crate::error::ApiError;

/// The always-present visible namespace used when a request names none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// The always-present hidden namespace. Its hidden flag can never be cleared
/// and reads from it always require a session.
pub const HIDDEN_NAMESPACE: &str = "private";

/// Whether `name` is one of the two reserved namespaces.
pub fn is_reserved(name: &str) -> bool {
    name == DEFAULT_NAMESPACE || name == HIDDEN_NAMESPACE
}

/// Check a namespace name against the allowed character set: ASCII letters,
/// digits, `-`, `_`, `.`. Path separators are excluded by construction.
pub fn validate_namespace_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() {
        return Err(ApiError::InvalidInput(
            "namespace name must not be empty".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ApiError::InvalidInput(format!(
            "invalid namespace name: {name}"
        )));
    }
    Ok(())
}

/// Resolve an optional request parameter to a concrete namespace name.
pub fn resolve_namespace(param: Option<&str>) -> &str {
    match param {
        Some(name) if !name.is_empty() => name,
        _ => DEFAULT_NAMESPACE,
    }
}

/// Create the two reserved namespaces if missing and force the hidden flag
/// on the hidden one. Runs at startup; idempotent.
pub fn ensure_reserved_namespaces(repo: &GatewayRepo) -> Result<(), rusqlite::Error> {
    repo.ensure_namespace(DEFAULT_NAMESPACE, false)?;
    repo.ensure_namespace(HIDDEN_NAMESPACE, true)?;
    repo.set_namespace_hidden(HIDDEN_NAMESPACE, true)?;
    Ok(())
}
