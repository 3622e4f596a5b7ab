//! Error kinds and the JSON-RPC codes they surface as.

use thiserror::Error;

/// Stratum error code for bad worker credentials.
pub const CODE_BAD_CREDENTIALS: i64 = -1;
/// Stratum error code for upstream/submit failures.
pub const CODE_UPSTREAM: i64 = -2;
/// Stratum error code for unknown methods.
pub const CODE_UNKNOWN_METHOD: i64 = -3;

/// Upstream session failures.
#[derive(Debug, Error, Clone)]
pub enum PoolError {
    /// RPC issued while the socket is down, or the connection dropped with
    /// the call in flight.
    #[error("upstream not connected")]
    Disconnected,
    /// The pool answered with an error object.
    #[error("pool rejected request (code {code}): {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed frame from pool: {0}")]
    Protocol(String),
}

/// Registry-side failures of getwork construction.
#[derive(Debug, Error)]
pub enum GetworkError {
    #[error("no job available yet")]
    NoJob,
    #[error("extranonce not negotiated with the pool yet")]
    NoExtranonce,
}

/// Extranonce tail allocation failures.
#[derive(Debug, Error)]
pub enum ExtranonceError {
    #[error("Extranonce slots are full, please disconnect some miners!")]
    SlotsFull,
}

/// Malformed data on either wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
    #[error("invalid hex in {what}")]
    BadHex { what: &'static str },
}

impl ProtocolError {
    pub fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        ProtocolError::Malformed { what, detail: detail.into() }
    }
}
