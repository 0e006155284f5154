//! Error types for scribe-dns.

use thiserror::Error;

use crate::store::StoreError;

/// Errors that can occur while running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket bind, accept, file access).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// DNS protocol error.
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Failed to parse a listener or upstream address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// TLS material could not be loaded or used.
    #[error("TLS error: {0}")]
    Tls(String),
}
