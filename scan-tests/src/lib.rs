//! Fixtures shared by the scenario tests in `tests/`.

use std::time::Duration;

use haystack_config::ScanConfig;
use haystack_sync::cache::{CacheContainer, CacheHandle, CacheRecord};
use haystack_sync::error::SyncError;
use haystack_sync::primitives::{GlobalIndex, TxId};
use haystack_sync::sync::{scan_session, SessionOptions, SessionReport};
use haystack_testutils::{MockKeySource, MockNode};

pub const PASSPHRASE: &[u8] = b"correct horse battery staple";

/// Default limits with progress reported on every block.
pub fn test_config() -> ScanConfig {
    ScanConfig {
        progress_interval: Duration::ZERO,
        ..ScanConfig::default()
    }
}

/// [`test_config`] with both batch sizes set to `batch_size`.
pub fn batched_config(batch_size: usize) -> ScanConfig {
    ScanConfig {
        restricted_batch_size: batch_size,
        unrestricted_batch_size: batch_size,
        ..test_config()
    }
}

/// Runs a session against clones of the mocks.
pub async fn run_session(
    keys: &MockKeySource,
    node: &MockNode,
    config: &ScanConfig,
    options: SessionOptions<'_>,
) -> Result<SessionReport, SyncError> {
    haystack_testutils::init_test_logging();
    scan_session(keys, node.clone(), config, options).await
}

/// Session starting at `start_height` with no cache.
pub async fn scan_from(
    keys: &MockKeySource,
    node: &MockNode,
    config: &ScanConfig,
    start_height: u64,
) -> SessionReport {
    let options = SessionOptions {
        start_height: Some(start_height),
        ..SessionOptions::default()
    };
    match run_session(keys, node, config, options).await {
        Ok(report) => report,
        Err(e) => panic!("session failed to start: {e}"),
    }
}

/// Session that resumes from, and writes back into, `cache`.
pub async fn scan_cached(
    keys: &MockKeySource,
    node: &MockNode,
    config: &ScanConfig,
    cache: &mut CacheHandle,
    start_height: Option<u64>,
) -> SessionReport {
    let options = SessionOptions {
        start_height,
        cache: Some(cache),
        ..SessionOptions::default()
    };
    match run_session(keys, node, config, options).await {
        Ok(report) => report,
        Err(e) => panic!("session failed to start: {e}"),
    }
}

/// Hashes matched for `global_index`, in discovery order.
pub fn matched(report: &SessionReport, global_index: GlobalIndex) -> Vec<TxId> {
    report
        .outcome
        .matches
        .get(global_index)
        .map(|txs| txs.iter().map(|tx| tx.hash()).collect())
        .unwrap_or_default()
}

/// Empty container unlocked with [`PASSPHRASE`].
pub fn empty_cache() -> CacheHandle {
    CacheHandle::new(CacheContainer::new(), PASSPHRASE.to_vec())
}

/// Container holding one record under [`PASSPHRASE`].
pub fn cache_with(record: &CacheRecord) -> CacheHandle {
    let mut container = CacheContainer::new();
    if let Err(e) = container.add(PASSPHRASE, record) {
        panic!("could not seed cache: {e}");
    }
    CacheHandle::new(container, PASSPHRASE.to_vec())
}

/// The single record stored under [`PASSPHRASE`] in `cache`.
pub fn stored_record(cache: &CacheHandle) -> CacheRecord {
    let mut records = cache
        .container()
        .get_all(PASSPHRASE)
        .unwrap_or_else(|e| panic!("cache unreadable: {e}"));
    assert_eq!(records.len(), 1, "bucket should hold exactly one record");
    records.remove(0)
}
