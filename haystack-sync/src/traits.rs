//! Traits for interfacing the scan engine with its external collaborators

use std::future::Future;

use crate::error::{KeySourceError, NodeError};
use crate::primitives::{Block, IdentifierSlot, Transaction, TxId};

/// Remote ledger node.
///
/// Implementations own their transport. The engine only reaches the node through the fetcher
/// task in [`crate::client::fetch`], so implementations must be `Send + Sync + 'static`.
pub trait LedgerNode: Send + Sync + 'static {
    /// Current chain height as reported by the node.
    fn get_chain_height(&self) -> impl Future<Output = Result<u64, NodeError>> + Send;

    /// Block header and transaction hashes at `height`.
    fn get_block(&self, height: u64) -> impl Future<Output = Result<Block, NodeError>> + Send;

    /// Looks up transactions by hash.
    ///
    /// Implementations return whatever the node answered; the engine checks the response
    /// against the request.
    fn get_transactions(
        &self,
        tx_hashes: Vec<TxId>,
    ) -> impl Future<Output = Result<Vec<Transaction>, NodeError>> + Send;

    /// Whether the node only serves restricted RPC, which limits bulk queries.
    fn is_restricted(&self) -> impl Future<Output = Result<bool, NodeError>> + Send;
}

/// Local custody tool holding the holder's keys.
pub trait KeySource {
    /// Every one-time output the holder owns.
    fn list_owned_outputs(
        &self,
    ) -> impl Future<Output = Result<Vec<IdentifierSlot>, KeySourceError>> + Send;

    /// Height before which the holder cannot have received anything, if known.
    fn restore_height(&self) -> impl Future<Output = Result<Option<u64>, KeySourceError>> + Send;
}
