//! File storage gateway: session-backed auth, a namespace registry over an
//! object-store backend, streaming uploads/downloads, and live transfer
//! progress pushed over WebSocket.

pub mod auth;
pub mod blob_store;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod namespaces;
pub mod progress;
pub mod rate_limit;
pub mod transfer;
