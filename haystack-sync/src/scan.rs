//! Block by block scan of a height range
//!
//! Transaction hashes from each block are queued and looked up in batches. Every fetched
//! transaction is matched against the holder's slots. The chain window is checked against each
//! new block's previous hash, and a mismatch rolls the scan back one block at a time until the
//! window agrees with the live chain again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::client::{self, FetchRequest};
use crate::match_index::{MatchIndex, SlotMap};
use crate::primitives::{Block, GlobalIndex, MatchKind, Transaction, TxId};
use crate::resume::ResumePlan;
use crate::window::ChainWindow;

use self::progress::{ProgressReporter, ScanProgress};

pub use self::error::ScanError;

pub mod error;
pub mod progress;

/// How a scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus {
    /// Every height in the range was scanned.
    Completed,
    /// The interrupt flag was raised. Everything up to the last finished block is kept.
    Interrupted,
    /// A node or protocol error stopped the scan. Everything examined before it is kept.
    Failed(ScanError),
}

impl ScanStatus {
    /// True if every height in the range was scanned.
    pub fn is_completed(&self) -> bool {
        matches!(self, ScanStatus::Completed)
    }
}

/// Observational events emitted while scanning.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Periodic progress line.
    Progress(ScanProgress),
    /// A transaction newly matched to one of the holder's slots.
    Match {
        /// Slot the transaction was filed under
        global_index: GlobalIndex,
        /// Matched transaction
        tx_hash: TxId,
        /// Height the node reported for the transaction
        height: u64,
        /// Whether the transaction created or referenced the slot's key
        kind: MatchKind,
    },
}

/// Knobs for a single scan run.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Maximum number of hashes per transaction lookup
    pub batch_size: usize,
    /// Minimum time between progress events
    pub progress_interval: Duration,
    /// Checked at every block boundary
    pub interrupt: Arc<AtomicBool>,
    /// Receives [`ScanEvent`]s if set
    pub events: Option<UnboundedSender<ScanEvent>>,
}

/// Everything a scan produced, whatever its status.
#[derive(Debug)]
pub struct ScanOutcome {
    /// How the scan ended
    pub status: ScanStatus,
    /// Matches, including any seeded from the cache
    pub matches: MatchIndex,
    /// Chain window covering only fully examined blocks
    pub window: ChainWindow,
    /// Number of blocks rolled back because of reorgs
    pub reorgs: u32,
    /// Number of times a rollback emptied the chain window
    pub exhausted_rollbacks: u32,
}

enum Stop {
    Completed,
    Interrupted,
}

struct Scanner<'a> {
    fetch_request_sender: &'a UnboundedSender<FetchRequest>,
    slots: &'a SlotMap,
    matches: MatchIndex,
    window: ChainWindow,
    // hashes awaiting lookup, oldest first, tagged with the height of their block
    pending: VecDeque<(u64, TxId)>,
    batch_size: usize,
    events: Option<UnboundedSender<ScanEvent>>,
    reorgs: u32,
    exhausted_rollbacks: u32,
}

/// Scans `plan.start_height..=plan.end_height`, continuing from `matches` and `window`.
///
/// Matches carried in from earlier runs are only kept while the live chain agrees with them: those
/// above the end height are dropped up front, and those at a scanned height are dropped unless the
/// block now at that height still lists the transaction.
///
/// Node and protocol failures end the scan with [`ScanStatus::Failed`] rather than an `Err`, so
/// that partial results can still be cached by the caller.
pub async fn scan(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    slots: &SlotMap,
    mut matches: MatchIndex,
    window: ChainWindow,
    plan: &ResumePlan,
    options: ScanOptions,
) -> ScanOutcome {
    let above_tip = matches.invalidate_from_height(plan.end_height.saturating_add(1));
    if above_tip > 0 {
        tracing::warn!(
            "Dropped {} matches recorded above the chain tip at {}.",
            above_tip,
            plan.end_height
        );
    }

    let mut scanner = Scanner {
        fetch_request_sender,
        slots,
        matches,
        window,
        pending: VecDeque::new(),
        batch_size: options.batch_size.max(1),
        events: options.events,
        reorgs: 0,
        exhausted_rollbacks: 0,
    };
    let mut progress = ProgressReporter::new(
        plan.start_height,
        plan.end_height,
        options.progress_interval,
    );

    let status = match scanner
        .run(plan, &options.interrupt, &mut progress)
        .await
    {
        Ok(Stop::Completed) => {
            tracing::info!("Scan complete. {} matches.", scanner.matches.total_matches());
            ScanStatus::Completed
        }
        Ok(Stop::Interrupted) => {
            tracing::info!("Scan interrupted.");
            ScanStatus::Interrupted
        }
        Err(e) => {
            tracing::warn!("Scan failed. {}", e);
            scanner.abort();
            ScanStatus::Failed(e)
        }
    };

    ScanOutcome {
        status,
        matches: scanner.matches,
        window: scanner.window,
        reorgs: scanner.reorgs,
        exhausted_rollbacks: scanner.exhausted_rollbacks,
    }
}

impl Scanner<'_> {
    async fn run(
        &mut self,
        plan: &ResumePlan,
        interrupt: &AtomicBool,
        progress: &mut ProgressReporter,
    ) -> Result<Stop, ScanError> {
        let end_height = plan.end_height;
        let mut height = plan.start_height;

        while height <= end_height {
            if interrupt.load(Ordering::Acquire) {
                self.flush(true).await?;
                return Ok(Stop::Interrupted);
            }

            let block = client::get_block(self.fetch_request_sender, height).await?;
            if block.header().height() != height {
                return Err(ScanError::HeightMismatch {
                    requested: height,
                    returned: block.header().height(),
                });
            }
            if let Some(rollback_height) = self.check_continuity(&block) {
                height = rollback_height;
                continue;
            }

            let stale = self
                .matches
                .retain_at_height(height, block.tx_hashes());
            if stale > 0 {
                tracing::warn!(
                    "Dropped {} matches recorded at height {} that are not in its current block.",
                    stale,
                    height
                );
            }

            self.pending
                .extend(block.tx_hashes().iter().map(|tx_hash| (height, *tx_hash)));
            self.flush(height == end_height).await?;
            self.window.push(block.summary());

            if let Some(report) = progress.poll(height, self.matches.total_matches()) {
                tracing::debug!("{}", report);
                self.emit(ScanEvent::Progress(report));
            }

            height += 1;
        }

        Ok(Stop::Completed)
    }

    // returns the height to continue from if `block` does not extend the newest retained block
    fn check_continuity(&mut self, block: &Block) -> Option<u64> {
        let header = block.header();
        let newest = self.window.newest()?;
        if self.window.is_rescan(header.height())
            || header.height() != newest.height() + 1
            || header.prev_hash() == newest.hash()
        {
            return None;
        }

        let abandoned = self.window.pop_newest()?;
        self.reorgs += 1;
        let invalidated = self.matches.invalidate_from_height(abandoned.height());
        self.pending
            .retain(|(height, _)| *height < abandoned.height());
        tracing::warn!(
            "Reorg detected. Block {} does not extend {} at height {}. Rolled back {} matches.",
            header.hash(),
            abandoned.hash(),
            abandoned.height(),
            invalidated
        );

        if self.window.is_empty() {
            self.exhausted_rollbacks += 1;
            tracing::warn!(
                "Reorg rollback exhausted the chain window. Blocks below {} cannot be re-verified.",
                abandoned.height()
            );
        }

        Some(abandoned.height())
    }

    // looks up pending hashes in batches while a full batch is queued, or until the queue is
    // empty when `drain` is set
    async fn flush(&mut self, drain: bool) -> Result<(), ScanError> {
        while !self.pending.is_empty() && (drain || self.pending.len() >= self.batch_size) {
            self.lookup_batch().await?;
        }

        Ok(())
    }

    async fn lookup_batch(&mut self) -> Result<(), ScanError> {
        let count = self.batch_size.min(self.pending.len());
        let tx_hashes: Vec<TxId> = self
            .pending
            .iter()
            .take(count)
            .map(|(_, tx_hash)| *tx_hash)
            .collect();

        let transactions =
            client::get_transactions(self.fetch_request_sender, tx_hashes.clone()).await?;
        let transactions = order_response(&tx_hashes, transactions)?;
        tracing::debug!("Looked up {} transactions.", count);

        self.pending.drain(..count);
        for transaction in &transactions {
            self.process(transaction);
        }

        Ok(())
    }

    fn process(&mut self, transaction: &Transaction) {
        for global_index in self.matches.process_transaction(self.slots, transaction) {
            let kind = self
                .slots
                .pubkey(global_index)
                .map_or(MatchKind::Referenced, |pubkey| transaction.match_kind(&pubkey));
            tracing::info!(
                "Found tx {} at height {} for output {}. {}",
                transaction.hash(),
                transaction.height(),
                global_index,
                kind
            );
            self.emit(ScanEvent::Match {
                global_index,
                tx_hash: transaction.hash(),
                height: transaction.height(),
                kind,
            });
        }
    }

    fn emit(&self, event: ScanEvent) {
        if let Some(events) = &self.events {
            // a dropped receiver only stops reporting
            let _ = events.send(event);
        }
    }

    // drops window entries for blocks whose transactions were never examined
    fn abort(&mut self) {
        if let Some((height, _)) = self.pending.front() {
            self.window.truncate_from(*height);
        }
        self.pending.clear();
    }
}

// checks a lookup response against its request and returns it in request order
fn order_response(
    requested: &[TxId],
    transactions: Vec<Transaction>,
) -> Result<Vec<Transaction>, ScanError> {
    if transactions.len() != requested.len() {
        return Err(ScanError::LengthMismatch {
            requested: requested.len(),
            returned: transactions.len(),
        });
    }

    let mut by_hash: HashMap<TxId, Transaction> = HashMap::with_capacity(transactions.len());
    for transaction in transactions {
        if !requested.contains(&transaction.hash()) {
            return Err(ScanError::UnexpectedTransaction(transaction.hash()));
        }
        by_hash.insert(transaction.hash(), transaction);
    }

    let returned = by_hash.len();
    requested
        .iter()
        .map(|tx_hash| {
            by_hash.remove(tx_hash).ok_or(ScanError::LengthMismatch {
                requested: requested.len(),
                returned,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: u8) -> Transaction {
        Transaction::from_parts(TxId([id; 32]), 10, 10, vec![], vec![])
    }

    #[test]
    fn responses_are_put_in_request_order() {
        let requested = [TxId([1; 32]), TxId([2; 32]), TxId([3; 32])];
        let ordered = order_response(&requested, vec![tx(3), tx(1), tx(2)]).unwrap();
        let hashes: Vec<TxId> = ordered.iter().map(|t| t.hash()).collect();
        assert_eq!(hashes, requested);
    }

    #[test]
    fn short_responses_are_rejected() {
        let requested = [TxId([1; 32]), TxId([2; 32])];
        assert_eq!(
            order_response(&requested, vec![tx(1)]).unwrap_err(),
            ScanError::LengthMismatch {
                requested: 2,
                returned: 1
            }
        );
    }

    #[test]
    fn unrequested_transactions_are_rejected() {
        let requested = [TxId([1; 32]), TxId([2; 32])];
        assert_eq!(
            order_response(&requested, vec![tx(1), tx(9)]).unwrap_err(),
            ScanError::UnexpectedTransaction(TxId([9; 32]))
        );
    }

    #[test]
    fn duplicated_responses_are_rejected() {
        let requested = [TxId([1; 32]), TxId([2; 32])];
        assert!(matches!(
            order_response(&requested, vec![tx(1), tx(1)]),
            Err(ScanError::LengthMismatch {
                requested: 2,
                returned: 1
            })
        ));
    }

    #[test]
    fn node_channel_errors_map_to_fetcher_closed() {
        assert_eq!(
            ScanError::from(crate::error::NodeError::ChannelClosed),
            ScanError::FetcherClosed
        );
    }
}
