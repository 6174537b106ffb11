//! Entrypoint for a scan session

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use haystack_config::{ConfigError, ScanConfig};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::cache::{CacheError, CacheHandle, CacheRecord};
use crate::client::{self, FetchRequest};
use crate::error::SyncError;
use crate::match_index::{MatchIndex, SlotMap};
use crate::resume::{self, ResumePlan};
use crate::scan::{self, ScanEvent, ScanOptions, ScanOutcome, ScanStatus};
use crate::traits::{KeySource, LedgerNode};
use crate::window::ChainWindow;

/// Caller supplied inputs for [`scan_session`].
#[derive(Debug, Default)]
pub struct SessionOptions<'a> {
    /// Start here instead of resuming. Any cached chain window is discarded.
    pub start_height: Option<u64>,
    /// Loaded cache container and the passphrase for this holder's bucket. The scan state is
    /// written back into it once scanning ends; it is left untouched if the session fails earlier.
    pub cache: Option<&'a mut CacheHandle>,
    /// Raise to stop the scan at the next block boundary.
    pub interrupt: Arc<AtomicBool>,
    /// Progress and match events.
    pub events: Option<UnboundedSender<ScanEvent>>,
}

/// Result of a session that got as far as scanning, or found nothing to scan.
#[derive(Debug)]
pub struct SessionReport {
    /// Scan status, matches and final chain window
    pub outcome: ScanOutcome,
    /// The holder's owned outputs
    pub slots: SlotMap,
    /// Scanned range, `None` if the holder owns no outputs
    pub plan: Option<ResumePlan>,
    /// Set if the scan state could not be written back into the container.
    pub cache_error: Option<CacheError>,
}

/// Scans the ledger for transactions touching the key source's owned outputs.
///
/// Errors are only returned for failures before scanning starts: invalid options, rejected
/// credentials, or a node that cannot report its height. Once scanning starts, failures are
/// reported through [`ScanStatus::Failed`] and the partial results are still written into the
/// cache container. Persist the container afterwards with
/// [`crate::cache::CacheContainer::write_to_path`].
pub async fn scan_session<K, N>(
    key_source: &K,
    node: N,
    config: &ScanConfig,
    options: SessionOptions<'_>,
) -> Result<SessionReport, SyncError>
where
    K: KeySource,
    N: LedgerNode,
{
    config.validate()?;
    let SessionOptions {
        start_height,
        cache,
        interrupt,
        events,
    } = options;
    if cache
        .as_deref()
        .is_some_and(|handle| handle.passphrase().is_empty())
    {
        return Err(ConfigError::EmptyPassphrase.into());
    }

    tracing::info!("Getting owned outputs from key source.");
    let owned_outputs = key_source.list_owned_outputs().await?;
    if owned_outputs.is_empty() {
        tracing::info!("Key source reports no owned outputs. Nothing to scan.");
        return Ok(SessionReport {
            outcome: ScanOutcome {
                status: ScanStatus::Completed,
                matches: MatchIndex::default(),
                window: ChainWindow::new(config.max_window),
                reorgs: 0,
                exhausted_rollbacks: 0,
            },
            slots: SlotMap::default(),
            plan: None,
            cache_error: None,
        });
    }

    let slots = SlotMap::new(owned_outputs);
    let mut matches = MatchIndex::new(&slots);
    let cached_window = cache
        .as_deref()
        .and_then(|handle| load_cached_state(handle, &mut matches, config.max_window));

    let (fetch_request_sender, fetch_request_receiver) = mpsc::unbounded_channel();
    let fetcher_handle = tokio::spawn(client::fetch::fetch(fetch_request_receiver, node));

    let scan_result = plan_and_scan(
        &fetch_request_sender,
        key_source,
        config,
        &slots,
        matches,
        start_height,
        cached_window,
        ScanHooks { interrupt, events },
    )
    .await;

    drop(fetch_request_sender);
    if let Err(e) = fetcher_handle.await {
        tracing::warn!("Fetcher task ended abnormally. {}", e);
    }
    let (plan, outcome) = scan_result?;

    let cache_error = match cache {
        Some(handle) => store_scan_state(handle, &outcome).err(),
        None => None,
    };
    if let Some(e) = &cache_error {
        tracing::warn!("Failed to write scan state to cache. {}", e);
    }

    Ok(SessionReport {
        outcome,
        slots,
        plan: Some(plan),
        cache_error,
    })
}

struct ScanHooks {
    interrupt: Arc<AtomicBool>,
    events: Option<UnboundedSender<ScanEvent>>,
}

#[allow(clippy::too_many_arguments)]
async fn plan_and_scan<K: KeySource>(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    key_source: &K,
    config: &ScanConfig,
    slots: &SlotMap,
    matches: MatchIndex,
    start_height: Option<u64>,
    cached_window: Option<ChainWindow>,
    hooks: ScanHooks,
) -> Result<(ResumePlan, ScanOutcome), SyncError> {
    let chain_height = client::get_chain_height(fetch_request_sender).await?;
    let restricted = match client::is_restricted(fetch_request_sender).await {
        Ok(restricted) => restricted,
        Err(e) => {
            tracing::warn!("Could not query RPC restriction. Assuming restricted. {}", e);
            true
        }
    };
    let batch_size = config.batch_size(restricted);
    if restricted {
        tracing::warn!(
            "Node restricts RPC. Looking up transactions in batches of {}.",
            batch_size
        );
    }

    let (plan, window) = resume::plan_resume(
        fetch_request_sender,
        key_source,
        config,
        start_height,
        cached_window,
        chain_height,
    )
    .await?;

    let outcome = scan::scan(
        fetch_request_sender,
        slots,
        matches,
        window,
        &plan,
        ScanOptions {
            batch_size,
            progress_interval: config.progress_interval,
            interrupt: hooks.interrupt,
            events: hooks.events,
        },
    )
    .await;

    Ok((plan, outcome))
}

// seeds `matches` from every readable record and returns the window whose newest block is
// lowest, the most conservative place to resume from
fn load_cached_state(
    handle: &CacheHandle,
    matches: &mut MatchIndex,
    max_window: usize,
) -> Option<ChainWindow> {
    let records = match handle.container().get_all(handle.passphrase()) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!("Cache unusable. Falling back to cold start. {}", e);
            return None;
        }
    };
    if records.is_empty() {
        tracing::info!("No cached scan state for this passphrase.");
        return None;
    }

    let mut resume_window: Option<ChainWindow> = None;
    for record in records {
        let seeded = matches.seed(record.txs_by_global_index);
        tracing::debug!("Seeded {} matches from cache.", seeded);

        let window = ChainWindow::from_blocks(record.scanned_blocks, max_window);
        let Some(newest) = window.newest().map(|block| block.height()) else {
            continue;
        };
        let lower = resume_window
            .as_ref()
            .and_then(|current| current.newest())
            .map_or(true, |current| newest < current.height());
        if lower {
            resume_window = Some(window);
        }
    }

    resume_window
}

fn store_scan_state(handle: &mut CacheHandle, outcome: &ScanOutcome) -> Result<(), CacheError> {
    let record = CacheRecord {
        txs_by_global_index: outcome.matches.to_map(),
        scanned_blocks: outcome.window.to_vec(),
    };
    let (container, passphrase) = handle.parts_mut();
    let mut updated = container.clone();
    updated.clear(passphrase)?;
    updated.add(passphrase, &record)?;
    *container = updated;

    Ok(())
}
