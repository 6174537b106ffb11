//! Bounded window of recently scanned blocks used for reorg detection and resume anchoring

use std::collections::VecDeque;

use crate::primitives::BlockSummary;

/// Recently scanned blocks, oldest first, at most `max_len` entries and strictly increasing in
/// height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainWindow {
    blocks: VecDeque<BlockSummary>,
    max_len: usize,
}

impl ChainWindow {
    /// Empty window holding at most `max_len` blocks.
    pub fn new(max_len: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(max_len),
            max_len,
        }
    }

    /// Builds a window from stored summaries in any order. Later duplicates of a height win and
    /// only the newest `max_len` entries are kept.
    pub fn from_blocks(blocks: impl IntoIterator<Item = BlockSummary>, max_len: usize) -> Self {
        let mut sorted: Vec<BlockSummary> = blocks.into_iter().collect();
        sorted.sort_by_key(|block| block.height());

        let mut window = Self::new(max_len);
        for block in sorted {
            window.push(block);
        }

        window
    }

    /// Appends `block` as the newest entry.
    ///
    /// Entries at the same or a greater height are dropped first so that rescanning an overlap
    /// keeps the window ordered. The oldest entries are evicted beyond the bound.
    pub fn push(&mut self, block: BlockSummary) {
        while self
            .blocks
            .back()
            .is_some_and(|newest| newest.height() >= block.height())
        {
            self.blocks.pop_back();
        }
        self.blocks.push_back(block);
        while self.blocks.len() > self.max_len {
            self.blocks.pop_front();
        }
    }

    /// Highest retained block.
    pub fn newest(&self) -> Option<&BlockSummary> {
        self.blocks.back()
    }

    /// Lowest retained block.
    pub fn oldest(&self) -> Option<&BlockSummary> {
        self.blocks.front()
    }

    /// Removes and returns the newest entry. Used when rolling back a reorg.
    pub fn pop_newest(&mut self) -> Option<BlockSummary> {
        self.blocks.pop_back()
    }

    /// Drops every entry at `height` or above.
    pub fn truncate_from(&mut self, height: u64) {
        while self
            .blocks
            .back()
            .is_some_and(|newest| newest.height() >= height)
        {
            self.blocks.pop_back();
        }
    }

    /// True when `height` lies at or below the newest retained block, i.e. the scan is walking
    /// back over blocks it has already seen.
    pub fn is_rescan(&self, height: u64) -> bool {
        self.newest()
            .is_some_and(|newest| height <= newest.height())
    }

    /// Number of retained blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True if no block is retained.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Bound on the number of retained blocks.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Retained blocks, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &BlockSummary> {
        self.blocks.iter()
    }

    /// Copy of the retained blocks, oldest first.
    pub fn to_vec(&self) -> Vec<BlockSummary> {
        self.blocks.iter().copied().collect()
    }
}
