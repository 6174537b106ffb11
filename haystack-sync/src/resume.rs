//! Choosing where a scan starts
//!
//! In priority order: an explicit height, the newest cached block if the live chain still agrees
//! with it, or the key source's restore height. Cached anchors and restore heights are moved back
//! by a random offset so the node cannot infer the holder's last visit or wallet age from the
//! first requested block.

use std::fmt;

use haystack_config::{ConfigError, ScanConfig};
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;

use crate::client::{self, FetchRequest};
use crate::error::{KeySourceError, SyncError};
use crate::primitives::BlockSummary;
use crate::traits::KeySource;
use crate::window::ChainWindow;

/// Where the start height came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeSource {
    /// Supplied by the caller.
    Explicit,
    /// Newest block of the cached window, confirmed against the live chain.
    CachedAnchor,
    /// Key source restore height.
    RestoreHeight,
    /// Nothing usable; full rescan from genesis.
    Genesis,
}

impl fmt::Display for ResumeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeSource::Explicit => write!(f, "explicit height"),
            ResumeSource::CachedAnchor => write!(f, "cached anchor"),
            ResumeSource::RestoreHeight => write!(f, "restore height"),
            ResumeSource::Genesis => write!(f, "genesis"),
        }
    }
}

/// Inclusive block range to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePlan {
    /// First height to scan
    pub start_height: u64,
    /// Last height to scan
    pub end_height: u64,
    /// How `start_height` was chosen
    pub source: ResumeSource,
}

/// Uniform draw from `min..=max`.
pub fn random_offset<R: Rng + ?Sized>(rng: &mut R, min: u64, max: u64) -> u64 {
    rng.gen_range(min..=max)
}

/// `height - offset`, clamped at 0.
pub fn offset_height(height: u64, offset: u64) -> u64 {
    height.saturating_sub(offset)
}

/// Plans the scan range and returns the chain window the scan continues from.
///
/// An explicit height always starts with an empty window. A cached window is only trusted if the
/// live block at its newest height has the same hash, and then only that one block is kept.
pub async fn plan_resume<K: KeySource>(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    key_source: &K,
    config: &ScanConfig,
    explicit_height: Option<u64>,
    cached_window: Option<ChainWindow>,
    chain_height: u64,
) -> Result<(ResumePlan, ChainWindow), SyncError> {
    let tip = chain_height.saturating_sub(1);
    let offset = {
        let mut rng = rand::thread_rng();
        random_offset(&mut rng, config.min_resume_offset, config.max_resume_offset)
    };

    let (start_height, source, window) = if let Some(height) = explicit_height {
        if height > tip {
            return Err(ConfigError::HeightAboveChainTip {
                requested: height,
                chain_height,
            }
            .into());
        }
        (height, ResumeSource::Explicit, ChainWindow::new(config.max_window))
    } else if let Some(anchor) =
        verify_anchor(fetch_request_sender, cached_window.as_ref(), chain_height).await?
    {
        (
            offset_height(anchor.height(), offset),
            ResumeSource::CachedAnchor,
            ChainWindow::from_blocks([anchor], config.max_window),
        )
    } else {
        let (height, source) = match key_source.restore_height().await {
            Ok(Some(restore_height)) => (
                offset_height(restore_height, offset).min(tip),
                ResumeSource::RestoreHeight,
            ),
            Ok(None) => {
                tracing::warn!("Key source has no restore height. Scanning from genesis.");
                (0, ResumeSource::Genesis)
            }
            Err(e @ KeySourceError::AuthFailed(_)) => return Err(e.into()),
            Err(e) => {
                tracing::warn!("Restore height unavailable. Scanning from genesis. {}", e);
                (0, ResumeSource::Genesis)
            }
        };
        (height, source, ChainWindow::new(config.max_window))
    };

    let plan = ResumePlan {
        start_height,
        end_height: tip.max(start_height),
        source,
    };
    tracing::info!(
        "Scanning {}..={} from {}.",
        plan.start_height,
        plan.end_height,
        plan.source
    );

    Ok((plan, window))
}

async fn verify_anchor(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    cached_window: Option<&ChainWindow>,
    chain_height: u64,
) -> Result<Option<BlockSummary>, SyncError> {
    let Some(anchor) = cached_window.and_then(|window| window.newest()).copied() else {
        return Ok(None);
    };
    if anchor.height() >= chain_height {
        tracing::warn!(
            "Cached anchor {} is above the live chain height {}. Ignoring cached window.",
            anchor.height(),
            chain_height
        );
        return Ok(None);
    }

    let live = client::get_block(fetch_request_sender, anchor.height()).await?;
    if live.summary() == anchor {
        Ok(Some(anchor))
    } else {
        tracing::warn!(
            "Cached anchor at height {} is no longer on the live chain. Ignoring cached window.",
            anchor.height()
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use crate::primitives::{Block, BlockHash, BlockHeader, IdentifierSlot, Transaction, TxId};
    use crate::traits::LedgerNode;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};
    use tokio::sync::mpsc;

    struct FixedChain {
        height: u64,
    }

    fn hash_at(height: u64) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&height.to_le_bytes());
        BlockHash(bytes)
    }

    impl LedgerNode for FixedChain {
        async fn get_chain_height(&self) -> Result<u64, NodeError> {
            Ok(self.height)
        }

        async fn get_block(&self, height: u64) -> Result<Block, NodeError> {
            let prev = hash_at(height.saturating_sub(1));
            Ok(Block::from_parts(
                BlockHeader::from_parts(height, hash_at(height), prev),
                None,
            ))
        }

        async fn get_transactions(&self, _: Vec<TxId>) -> Result<Vec<Transaction>, NodeError> {
            Ok(Vec::new())
        }

        async fn is_restricted(&self) -> Result<bool, NodeError> {
            Ok(false)
        }
    }

    struct Keys(Result<Option<u64>, KeySourceError>);

    impl KeySource for Keys {
        async fn list_owned_outputs(&self) -> Result<Vec<IdentifierSlot>, KeySourceError> {
            Ok(Vec::new())
        }

        async fn restore_height(&self) -> Result<Option<u64>, KeySourceError> {
            self.0.clone()
        }
    }

    async fn plan(
        keys: Keys,
        explicit_height: Option<u64>,
        cached: Option<ChainWindow>,
    ) -> Result<(ResumePlan, ChainWindow), SyncError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let fetcher = tokio::spawn(client::fetch::fetch(receiver, FixedChain { height: 1_000 }));
        let result =
            plan_resume(&sender, &keys, &ScanConfig::default(), explicit_height, cached, 1_000)
                .await;
        drop(sender);
        fetcher.await.unwrap();
        result
    }

    fn cached(height: u64, hash: BlockHash) -> ChainWindow {
        ChainWindow::from_blocks(
            [
                BlockSummary::from_parts(height - 1, hash_at(height - 1)),
                BlockSummary::from_parts(height, hash),
            ],
            50,
        )
    }

    #[tokio::test]
    async fn explicit_height_discards_cache() {
        let cache = Some(cached(200, hash_at(200)));
        let (plan, window) = plan(Keys(Ok(Some(500))), Some(10), cache).await.unwrap();
        assert_eq!(plan.start_height, 10);
        assert_eq!(plan.end_height, 999);
        assert_eq!(plan.source, ResumeSource::Explicit);
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn explicit_height_above_tip_is_rejected() {
        let err = plan(Keys(Ok(None)), Some(1_000), None).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Config(ConfigError::HeightAboveChainTip {
                requested: 1_000,
                chain_height: 1_000
            })
        ));
    }

    #[tokio::test]
    async fn matching_anchor_is_resumed_from() {
        // restore height must not be consulted
        let keys = Keys(Err(KeySourceError::AuthFailed("unused".into())));
        let cache = Some(cached(200, hash_at(200)));
        let (plan, window) = plan(keys, None, cache).await.unwrap();
        assert_eq!(plan.source, ResumeSource::CachedAnchor);
        assert!((0..=175).contains(&plan.start_height));
        assert_eq!(window.to_vec(), vec![BlockSummary::from_parts(200, hash_at(200))]);
    }

    #[tokio::test]
    async fn mismatched_anchor_falls_back_to_restore_height() {
        let cache = Some(cached(200, BlockHash([0xff; 32])));
        let (plan, window) = plan(Keys(Ok(Some(600))), None, cache).await.unwrap();
        assert_eq!(plan.source, ResumeSource::RestoreHeight);
        assert!((350..=575).contains(&plan.start_height));
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn anchor_above_chain_falls_back() {
        let cache = Some(cached(5_000, hash_at(5_000)));
        let (plan, _) = plan(Keys(Ok(None)), None, cache).await.unwrap();
        assert_eq!(plan.source, ResumeSource::Genesis);
        assert_eq!(plan.start_height, 0);
    }

    #[tokio::test]
    async fn unavailable_restore_height_scans_from_genesis() {
        let keys = Keys(Err(KeySourceError::Unavailable("timeout".into())));
        let (plan, _) = plan(keys, None, None).await.unwrap();
        assert_eq!((plan.start_height, plan.source), (0, ResumeSource::Genesis));
    }

    #[tokio::test]
    async fn rejected_credentials_are_fatal() {
        let keys = Keys(Err(KeySourceError::AuthFailed("bad password".into())));
        let err = plan(keys, None, None).await.unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn restore_height_beyond_tip_is_clamped() {
        let (plan, _) = plan(Keys(Ok(Some(50_000))), None, None).await.unwrap();
        assert_eq!(plan.start_height, 999);
        assert_eq!(plan.end_height, 999);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn offsets_stay_in_bounds(anchor in 0u64..10_000, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..1_000 {
                let start = offset_height(anchor, random_offset(&mut rng, 25, 250));
                prop_assert!(start >= anchor.saturating_sub(250));
                prop_assert!(start <= anchor.saturating_sub(25));
            }
        }
    }
}
