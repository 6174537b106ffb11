//! Scan errors.

use crate::error::NodeError;
use crate::primitives::TxId;

/// Reasons a scan stopped before reaching its end height.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    /// The node failed a block or transaction request.
    #[error("Node error. {0}")]
    Node(NodeError),
    /// A transaction lookup came back with a different number of entries than requested.
    #[error("Length mismatch. Requested {requested} transactions but the node returned {returned}")]
    LengthMismatch {
        /// Hashes sent.
        requested: usize,
        /// Transactions received.
        returned: usize,
    },
    /// A transaction lookup returned a hash that is not the one requested at that position.
    #[error("Unexpected transaction. Node returned {0} which was not requested")]
    UnexpectedTransaction(TxId),
    /// The node answered a block request with a block from another height.
    #[error("Height mismatch. Requested block {requested} but the node returned block {returned}")]
    HeightMismatch {
        /// Height asked for.
        requested: u64,
        /// Height in the returned header.
        returned: u64,
    },
    /// The fetcher task went away while requests were outstanding.
    #[error("Fetcher task closed before the scan finished")]
    FetcherClosed,
}

impl From<NodeError> for ScanError {
    fn from(error: NodeError) -> Self {
        match error {
            NodeError::ChannelClosed => ScanError::FetcherClosed,
            other => ScanError::Node(other),
        }
    }
}
