//! Top level error module for the crate

use haystack_config::ConfigError;

/// Failures talking to the ledger node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    /// Transport failure, the node could not be reached or did not answer.
    #[error("node unreachable. {0}")]
    Unreachable(String),
    /// The node answered with something that does not follow the RPC contract.
    #[error("protocol error. {0}")]
    Protocol(String),
    /// The fetcher task stopped before answering.
    #[error("fetch channel closed")]
    ChannelClosed,
}

/// Failures talking to the holder's key source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeySourceError {
    /// Credentials were rejected.
    #[error("key source rejected credentials. {0}")]
    AuthFailed(String),
    /// The key source could not answer.
    #[error("key source unavailable. {0}")]
    Unavailable(String),
}

/// Top level error enum for everything that stops a session before scanning begins.
///
/// Errors that happen while scanning are reported through
/// [`crate::scan::ScanStatus::Failed`] together with the partial results.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Bad or conflicting options
    #[error("Config error. {0}")]
    Config(#[from] ConfigError),
    /// Errors from the key source, including rejected credentials
    #[error("Key source error. {0}")]
    KeySource(#[from] KeySourceError),
    /// Node failures during session setup
    #[error("Node error. {0}")]
    Node(#[from] NodeError),
}

impl SyncError {
    /// True when the key source rejected the holder's credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SyncError::KeySource(KeySourceError::AuthFailed(_)))
    }
}
