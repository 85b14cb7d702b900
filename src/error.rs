//! Error taxonomy for the command channel, synchronizer, and thumbnail
//! pipeline.
//!
//! Channel faults ([`Error::Connection`], [`Error::Timeout`],
//! [`Error::ConnectionClosed`], [`Error::Io`], [`Error::Protocol`]) abort the
//! enclosing `sync` or `refresh`. [`Error::ScriptExecution`] and
//! [`Error::AssetUnavailable`] are per-item failures that get recorded and
//! counted instead.

use std::path::PathBuf;
use std::time::Duration;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot connect to engine at {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine did not respond within {0:?}")]
    Timeout(Duration),

    #[error("engine closed the connection")]
    ConnectionClosed,

    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("script failed: {stderr}")]
    ScriptExecution { stderr: String },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("asset unavailable: {0}")]
    AssetUnavailable(String),

    #[error("thumbnail cache error at {}: {source}", path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    pub fn script<S: Into<String>>(stderr: S) -> Self {
        Self::ScriptExecution {
            stderr: stderr.into(),
        }
    }

    /// True for faults of the transport itself. These leave the connection
    /// unusable and abort the current high-level operation.
    pub fn is_channel_fault(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. }
                | Error::Timeout(_)
                | Error::ConnectionClosed
                | Error::Io(_)
                | Error::Protocol(_)
        )
    }

    /// Per-item failures that are counted but never abort a batch.
    pub fn is_item_failure(&self) -> bool {
        matches!(
            self,
            Error::ScriptExecution { .. } | Error::AssetUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_faults_are_classified() {
        assert!(Error::ConnectionClosed.is_channel_fault());
        assert!(Error::Timeout(Duration::from_secs(1)).is_channel_fault());
        assert!(Error::protocol("bad frame").is_channel_fault());
        assert!(!Error::script("boom").is_channel_fault());
        assert!(!Error::Cancelled.is_channel_fault());
    }

    #[test]
    fn item_failures_are_classified() {
        assert!(Error::script("boom").is_item_failure());
        assert!(Error::AssetUnavailable("/Game/X".into()).is_item_failure());
        assert!(!Error::ConnectionClosed.is_item_failure());
    }
}
