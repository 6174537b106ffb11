//! In-memory ledger node and key source for exercising the scan engine.
//!
//! [`MockNode`] serves a chain built block by block, can fork it, inject failures and fire
//! triggers when a given block is requested, which lets tests reorg or interrupt a scan while it
//! is running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use haystack_sync::error::{KeySourceError, NodeError};
use haystack_sync::primitives::{
    Block, BlockHash, BlockHeader, BlockSummary, GlobalIndex, IdentifierSlot, OneTimeKey,
    Transaction, TxId,
};
use haystack_sync::scan::ScanEvent;
use haystack_sync::traits::{KeySource, LedgerNode};

/// Installs the stdout subscriber once for the test binary.
pub fn init_test_logging() {
    haystack_config::init_logging();
}

/// Deterministic block hash for `height` on fork `branch`.
pub fn block_hash(height: u64, branch: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&height.to_le_bytes());
    bytes[8] = branch;
    bytes[31] = 0xb1;

    BlockHash(bytes)
}

/// Transaction hash with every byte set to `id`.
pub fn txid(id: u8) -> TxId {
    TxId([id; 32])
}

/// One-time key with every byte set to `id`.
pub fn pubkey(id: u8) -> OneTimeKey {
    OneTimeKey([id; 32])
}

/// Transaction mined at `height`, timestamped two minutes per block.
pub fn tx_at(
    id: u8,
    height: u64,
    ring_members: Vec<GlobalIndex>,
    outputs: Vec<OneTimeKey>,
) -> Transaction {
    Transaction::from_parts(txid(id), height, height * 120, ring_members, outputs)
}

/// Event channel for [`haystack_sync::sync::SessionOptions::events`].
pub fn event_channel() -> (
    mpsc::UnboundedSender<ScanEvent>,
    mpsc::UnboundedReceiver<ScanEvent>,
) {
    mpsc::unbounded_channel()
}

/// Drains every event sent so far.
pub fn drain_events(receiver: &mut mpsc::UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }

    events
}

#[derive(Debug, Clone)]
struct MockBlock {
    hash: BlockHash,
    prev_hash: BlockHash,
    // `None` mimics the daemon omitting the list
    tx_hashes: Option<Vec<TxId>>,
}

/// Action fired the first time a block height is requested.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Raise the interrupt flag.
    Interrupt(Arc<AtomicBool>),
    /// Replace the chain from `fork_height` with new blocks on `branch`.
    Reorg {
        /// First replaced height
        fork_height: u64,
        /// Branch tag for the new block hashes
        branch: u8,
        /// Transactions of each new block, lowest height first
        blocks: Vec<Vec<Transaction>>,
    },
}

#[derive(Debug, Default)]
struct MockChain {
    blocks: Vec<MockBlock>,
    transactions: HashMap<TxId, Transaction>,
    branch: u8,
    restricted: Option<bool>,
    fail_block_at: Option<u64>,
    fail_transactions: bool,
    short_responses: bool,
    misreported_heights: HashMap<u64, u64>,
    triggers: HashMap<u64, Trigger>,
    block_requests: Vec<u64>,
    transaction_requests: Vec<Vec<TxId>>,
}

impl MockChain {
    fn push_block(&mut self, transactions: Vec<Transaction>) -> BlockSummary {
        let height = self.blocks.len() as u64;
        let hash = block_hash(height, self.branch);
        let prev_hash = self
            .blocks
            .last()
            .map_or(BlockHash([0; 32]), |block| block.hash);
        let tx_hashes = if transactions.is_empty() {
            None
        } else {
            Some(transactions.iter().map(Transaction::hash).collect())
        };
        for transaction in transactions {
            self.transactions.insert(transaction.hash(), transaction);
        }
        self.blocks.push(MockBlock {
            hash,
            prev_hash,
            tx_hashes,
        });

        BlockSummary::from_parts(height, hash)
    }

    fn fork_at(&mut self, height: u64, branch: u8) {
        self.blocks.truncate(height as usize);
        self.branch = branch;
    }

    fn fire(&mut self, height: u64) {
        match self.triggers.remove(&height) {
            Some(Trigger::Interrupt(flag)) => flag.store(true, Ordering::Release),
            Some(Trigger::Reorg {
                fork_height,
                branch,
                blocks,
            }) => {
                tracing::debug!("Mock chain reorging at {} onto branch {}", fork_height, branch);
                self.fork_at(fork_height, branch);
                for transactions in blocks {
                    self.push_block(transactions);
                }
            }
            None => {}
        }
    }
}

/// Cloneable handle to an in-memory chain. Clones share state, so a test can keep one handle
/// while the scan engine owns another.
#[derive(Debug, Clone)]
pub struct MockNode {
    chain: Arc<Mutex<MockChain>>,
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNode {
    /// Empty chain, unrestricted.
    pub fn new() -> Self {
        let chain = MockChain {
            restricted: Some(false),
            ..MockChain::default()
        };
        Self {
            chain: Arc::new(Mutex::new(chain)),
        }
    }

    /// Chain of `count` empty blocks starting at genesis.
    pub fn with_empty_blocks(count: u64) -> Self {
        let node = Self::new();
        node.push_empty_blocks(count);
        node
    }

    fn chain(&self) -> MutexGuard<'_, MockChain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mines a block holding `transactions`.
    pub fn push_block(&self, transactions: Vec<Transaction>) -> BlockSummary {
        self.chain().push_block(transactions)
    }

    /// Mines `count` blocks without transactions.
    pub fn push_empty_blocks(&self, count: u64) {
        let mut chain = self.chain();
        for _ in 0..count {
            chain.push_block(Vec::new());
        }
    }

    /// Drops every block from `height` up. Later blocks get hashes on `branch`.
    pub fn fork_at(&self, height: u64, branch: u8) {
        self.chain().fork_at(height, branch);
    }

    /// Number of blocks, which is what a daemon reports as its height.
    pub fn chain_height(&self) -> u64 {
        self.chain().blocks.len() as u64
    }

    /// Summary of the current block at `height`.
    pub fn summary(&self, height: u64) -> Option<BlockSummary> {
        self.chain()
            .blocks
            .get(height as usize)
            .map(|block| BlockSummary::from_parts(height, block.hash))
    }

    /// `None` makes the restriction query fail.
    pub fn set_restricted(&self, restricted: Option<bool>) {
        self.chain().restricted = restricted;
    }

    /// Fail every request for the block at `height`.
    pub fn fail_block_at(&self, height: Option<u64>) {
        self.chain().fail_block_at = height;
    }

    /// Fail every transaction lookup.
    pub fn fail_transactions(&self, fail: bool) {
        self.chain().fail_transactions = fail;
    }

    /// Drop the last transaction from every lookup response.
    pub fn short_responses(&self, short: bool) {
        self.chain().short_responses = short;
    }

    /// Answer requests for the block at `height` with a header claiming `reported`.
    pub fn misreport_height(&self, height: u64, reported: u64) {
        self.chain().misreported_heights.insert(height, reported);
    }

    /// Fires `trigger` the first time the block at `height` is requested, before answering.
    pub fn on_block_request(&self, height: u64, trigger: Trigger) {
        self.chain().triggers.insert(height, trigger);
    }

    /// Every requested block height, in order.
    pub fn block_requests(&self) -> Vec<u64> {
        self.chain().block_requests.clone()
    }

    /// Every transaction lookup, in order.
    pub fn transaction_requests(&self) -> Vec<Vec<TxId>> {
        self.chain().transaction_requests.clone()
    }
}

impl LedgerNode for MockNode {
    async fn get_chain_height(&self) -> Result<u64, NodeError> {
        Ok(self.chain_height())
    }

    async fn get_block(&self, height: u64) -> Result<Block, NodeError> {
        let mut chain = self.chain();
        chain.block_requests.push(height);
        chain.fire(height);
        if chain.fail_block_at == Some(height) {
            return Err(NodeError::Unreachable(format!(
                "connection reset fetching block {height}"
            )));
        }

        let block = chain
            .blocks
            .get(height as usize)
            .ok_or_else(|| NodeError::Protocol(format!("no block at height {height}")))?;
        let reported = chain
            .misreported_heights
            .get(&height)
            .copied()
            .unwrap_or(height);
        let header = BlockHeader::from_parts(reported, block.hash, block.prev_hash);

        Ok(Block::from_parts(header, block.tx_hashes.clone()))
    }

    async fn get_transactions(&self, tx_hashes: Vec<TxId>) -> Result<Vec<Transaction>, NodeError> {
        let mut chain = self.chain();
        chain.transaction_requests.push(tx_hashes.clone());
        if chain.fail_transactions {
            return Err(NodeError::Unreachable("connection reset".to_string()));
        }

        let mut transactions = tx_hashes
            .iter()
            .map(|tx_hash| {
                chain
                    .transactions
                    .get(tx_hash)
                    .cloned()
                    .ok_or_else(|| NodeError::Protocol(format!("missed tx {tx_hash}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if chain.short_responses {
            transactions.pop();
        }

        Ok(transactions)
    }

    async fn is_restricted(&self) -> Result<bool, NodeError> {
        self.chain()
            .restricted
            .ok_or_else(|| NodeError::Unreachable("sync_info timed out".to_string()))
    }
}

/// Key source with a fixed set of owned outputs.
#[derive(Debug, Clone)]
pub struct MockKeySource {
    outputs: Result<Vec<IdentifierSlot>, KeySourceError>,
    restore_height: Result<Option<u64>, KeySourceError>,
}

impl MockKeySource {
    /// Owns `outputs`, no restore height.
    pub fn new(outputs: Vec<IdentifierSlot>) -> Self {
        Self {
            outputs: Ok(outputs),
            restore_height: Ok(None),
        }
    }

    /// Owns a single output.
    pub fn single(global_index: GlobalIndex, key: OneTimeKey) -> Self {
        Self::new(vec![IdentifierSlot::from_parts(global_index, key)])
    }

    /// Rejects every request as if the password were wrong.
    pub fn rejecting() -> Self {
        let error = KeySourceError::AuthFailed("invalid password".to_string());
        Self {
            outputs: Err(error.clone()),
            restore_height: Err(error),
        }
    }

    /// Reports `restore_height`.
    pub fn with_restore_height(mut self, restore_height: Option<u64>) -> Self {
        self.restore_height = Ok(restore_height);
        self
    }

    /// Fails restore height queries with `error`.
    pub fn with_restore_height_error(mut self, error: KeySourceError) -> Self {
        self.restore_height = Err(error);
        self
    }
}

impl KeySource for MockKeySource {
    async fn list_owned_outputs(&self) -> Result<Vec<IdentifierSlot>, KeySourceError> {
        self.outputs.clone()
    }

    async fn restore_height(&self) -> Result<Option<u64>, KeySourceError> {
        self.restore_height.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocks_link_to_their_parents() {
        let node = MockNode::with_empty_blocks(3);
        let second = node.get_block(2).await.unwrap();
        assert_eq!(second.header().prev_hash(), block_hash(1, 0));
        assert!(second.tx_hashes().is_empty());
        assert_eq!(node.get_chain_height().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn forks_change_hashes_from_the_fork_height() {
        let node = MockNode::with_empty_blocks(5);
        node.fork_at(3, 1);
        node.push_empty_blocks(2);
        assert_eq!(node.summary(2).unwrap().hash(), block_hash(2, 0));
        assert_eq!(node.summary(3).unwrap().hash(), block_hash(3, 1));
        let block = node.get_block(3).await.unwrap();
        assert_eq!(block.header().prev_hash(), block_hash(2, 0));
    }

    #[tokio::test]
    async fn reorg_trigger_fires_once() {
        let node = MockNode::with_empty_blocks(4);
        node.on_block_request(
            3,
            Trigger::Reorg {
                fork_height: 2,
                branch: 7,
                blocks: vec![vec![], vec![tx_at(1, 3, vec![], vec![])]],
            },
        );
        let block = node.get_block(3).await.unwrap();
        assert_eq!(block.summary().hash(), block_hash(3, 7));
        assert_eq!(block.tx_hashes(), &[txid(1)]);
        assert_eq!(node.block_requests(), vec![3]);
    }

    #[tokio::test]
    async fn lookups_report_missing_and_short_responses() {
        let node = MockNode::new();
        node.push_block(vec![tx_at(1, 0, vec![], vec![]), tx_at(2, 0, vec![], vec![])]);
        assert!(node.get_transactions(vec![txid(9)]).await.is_err());

        node.short_responses(true);
        let txs = node.get_transactions(vec![txid(1), txid(2)]).await.unwrap();
        assert_eq!(txs.len(), 1);
    }

    #[tokio::test]
    async fn misreported_heights_only_change_the_header() {
        let node = MockNode::with_empty_blocks(4);
        node.misreport_height(2, 3);
        let block = node.get_block(2).await.unwrap();
        assert_eq!(block.header().height(), 3);
        assert_eq!(block.header().hash(), block_hash(2, 0));
        assert_eq!(node.get_block(1).await.unwrap().header().height(), 1);
    }

    #[tokio::test]
    async fn rejecting_key_source_fails_auth() {
        let keys = MockKeySource::rejecting();
        assert!(matches!(
            keys.list_owned_outputs().await,
            Err(KeySourceError::AuthFailed(_))
        ));
    }
}
