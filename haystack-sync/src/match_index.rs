//! Owned identifier slots and the transactions matched against them

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::primitives::{GlobalIndex, IdentifierSlot, OneTimeKey, Transaction, TxId};

/// The holder's owned outputs, indexed both ways.
///
/// Built once per session and never mutated, so the two maps always agree.
#[derive(Debug, Clone, Default)]
pub struct SlotMap {
    by_index: BTreeMap<GlobalIndex, OneTimeKey>,
    by_pubkey: HashMap<OneTimeKey, GlobalIndex>,
}

impl SlotMap {
    /// If the same global index is listed twice the last pubkey wins.
    pub fn new(slots: impl IntoIterator<Item = IdentifierSlot>) -> Self {
        let mut by_index = BTreeMap::new();
        let mut by_pubkey = HashMap::new();
        for slot in slots {
            if let Some(previous) = by_index.insert(slot.global_index(), slot.pubkey()) {
                by_pubkey.remove(&previous);
            }
            by_pubkey.insert(slot.pubkey(), slot.global_index());
        }

        Self {
            by_index,
            by_pubkey,
        }
    }

    /// Number of owned slots.
    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    /// True if the holder owns no outputs.
    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    /// True if `global_index` is an owned slot.
    pub fn contains(&self, global_index: GlobalIndex) -> bool {
        self.by_index.contains_key(&global_index)
    }

    /// One-time key of the slot at `global_index`.
    pub fn pubkey(&self, global_index: GlobalIndex) -> Option<OneTimeKey> {
        self.by_index.get(&global_index).copied()
    }

    /// Global index of the slot holding `pubkey`.
    pub fn global_index(&self, pubkey: &OneTimeKey) -> Option<GlobalIndex> {
        self.by_pubkey.get(pubkey).copied()
    }

    /// Slots in ascending global index order.
    pub fn slots(&self) -> impl Iterator<Item = IdentifierSlot> + '_ {
        self.by_index
            .iter()
            .map(|(global_index, pubkey)| IdentifierSlot::from_parts(*global_index, *pubkey))
    }

    /// Owned slots a transaction touches, ascending: ring members among its inputs plus the
    /// slots of any owned key among its outputs.
    pub fn touched_indexes(&self, transaction: &Transaction) -> Vec<GlobalIndex> {
        let ring_members = transaction
            .inputs()
            .iter()
            .copied()
            .filter(|global_index| self.contains(*global_index));
        let created = transaction
            .outputs()
            .iter()
            .filter_map(|pubkey| self.global_index(pubkey));

        ring_members
            .chain(created)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Result of recording a transaction against a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchUpdate {
    /// First time this transaction was seen for the slot.
    Added,
    /// Already matched; the stored copy was replaced with the fresh one.
    Updated,
}

/// Transactions matched so far, per owned slot, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct MatchIndex {
    txs_by_global_index: BTreeMap<GlobalIndex, Vec<Transaction>>,
}

impl MatchIndex {
    /// One empty entry per owned slot.
    pub fn new(slots: &SlotMap) -> Self {
        Self {
            txs_by_global_index: slots
                .slots()
                .map(|slot| (slot.global_index(), Vec::new()))
                .collect(),
        }
    }

    /// Merges previously stored matches. Entries for indexes that are not owned slots are
    /// ignored. Returns how many transactions were added.
    pub fn seed(&mut self, stored: BTreeMap<GlobalIndex, Vec<Transaction>>) -> usize {
        let mut added = 0;
        for (global_index, transactions) in stored {
            for transaction in transactions {
                if self.record(global_index, transaction) == Some(MatchUpdate::Added) {
                    added += 1;
                }
            }
        }

        added
    }

    /// Files `transaction` under `global_index`, replacing an existing entry with the same hash.
    /// Returns `None` if the index is not an owned slot.
    pub fn record(
        &mut self,
        global_index: GlobalIndex,
        transaction: Transaction,
    ) -> Option<MatchUpdate> {
        let matches = self.txs_by_global_index.get_mut(&global_index)?;
        match matches.iter_mut().find(|existing| **existing == transaction) {
            Some(existing) => {
                *existing = transaction;
                Some(MatchUpdate::Updated)
            }
            None => {
                matches.push(transaction);
                Some(MatchUpdate::Added)
            }
        }
    }

    /// Records `transaction` under every slot it touches. Returns the slots for which it is a new
    /// match.
    pub fn process_transaction(
        &mut self,
        slots: &SlotMap,
        transaction: &Transaction,
    ) -> Vec<GlobalIndex> {
        slots
            .touched_indexes(transaction)
            .into_iter()
            .filter(|global_index| {
                self.record(*global_index, transaction.clone()) == Some(MatchUpdate::Added)
            })
            .collect()
    }

    /// Drops every match recorded at `height` or above. Returns how many were removed.
    pub fn invalidate_from_height(&mut self, height: u64) -> usize {
        let mut removed = 0;
        for matches in self.txs_by_global_index.values_mut() {
            let before = matches.len();
            matches.retain(|transaction| transaction.height() < height);
            removed += before - matches.len();
        }

        removed
    }

    /// Drops matches recorded at `height` whose hash is not in `tx_hashes`, the transactions of the
    /// block now at that height. Returns how many were removed.
    pub fn retain_at_height(&mut self, height: u64, tx_hashes: &[TxId]) -> usize {
        let mut removed = 0;
        for matches in self.txs_by_global_index.values_mut() {
            let before = matches.len();
            matches.retain(|transaction| {
                transaction.height() != height || tx_hashes.contains(&transaction.hash())
            });
            removed += before - matches.len();
        }

        removed
    }

    /// Matches recorded for `global_index`, or `None` if it is not an owned slot.
    pub fn get(&self, global_index: GlobalIndex) -> Option<&[Transaction]> {
        self.txs_by_global_index
            .get(&global_index)
            .map(Vec::as_slice)
    }

    /// Number of (slot, transaction) pairs.
    pub fn total_matches(&self) -> usize {
        self.txs_by_global_index.values().map(Vec::len).sum()
    }

    /// Iterates slots in global index order.
    pub fn iter(&self) -> impl Iterator<Item = (&GlobalIndex, &Vec<Transaction>)> {
        self.txs_by_global_index.iter()
    }

    /// Copy of the matches, keyed by global index.
    pub fn to_map(&self) -> BTreeMap<GlobalIndex, Vec<Transaction>> {
        self.txs_by_global_index.clone()
    }

    /// Consumes the index, returning the matches keyed by global index.
    pub fn into_map(self) -> BTreeMap<GlobalIndex, Vec<Transaction>> {
        self.txs_by_global_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const OWNED: OneTimeKey = OneTimeKey([42; 32]);

    fn slots() -> SlotMap {
        SlotMap::new([
            IdentifierSlot::from_parts(42, OWNED),
            IdentifierSlot::from_parts(7, OneTimeKey([7; 32])),
        ])
    }

    fn tx(id: u8, height: u64, inputs: Vec<u64>, outputs: Vec<OneTimeKey>) -> Transaction {
        Transaction::from_parts(TxId([id; 32]), height, height * 120, inputs, outputs)
    }

    #[test]
    fn reverse_lookup_follows_duplicates() {
        let map = SlotMap::new([
            IdentifierSlot::from_parts(1, OneTimeKey([1; 32])),
            IdentifierSlot::from_parts(1, OneTimeKey([2; 32])),
        ]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.global_index(&OneTimeKey([1; 32])), None);
        assert_eq!(map.global_index(&OneTimeKey([2; 32])), Some(1));
    }

    #[test]
    fn touched_indexes_cover_rings_and_outputs() {
        let map = slots();
        let created = tx(1, 103, vec![], vec![OneTimeKey([9; 32]), OWNED]);
        let referenced = tx(2, 104, vec![3, 7, 42, 99], vec![]);
        let unrelated = tx(3, 105, vec![1, 2, 3], vec![OneTimeKey([9; 32])]);

        assert_eq!(map.touched_indexes(&created), vec![42]);
        assert_eq!(map.touched_indexes(&referenced), vec![7, 42]);
        assert!(map.touched_indexes(&unrelated).is_empty());
    }

    #[test]
    fn index_starts_with_an_entry_per_slot() {
        let index = MatchIndex::new(&slots());
        assert_eq!(index.get(42), Some(&[][..]));
        assert_eq!(index.get(7), Some(&[][..]));
        assert_eq!(index.get(8), None);
        assert_eq!(index.total_matches(), 0);
    }

    #[test]
    fn refetched_transactions_replace_in_place() {
        let map = slots();
        let mut index = MatchIndex::new(&map);
        assert_eq!(index.process_transaction(&map, &tx(1, 103, vec![42], vec![])), vec![42]);
        assert_eq!(index.process_transaction(&map, &tx(2, 104, vec![42], vec![])), vec![42]);
        assert!(index.process_transaction(&map, &tx(1, 110, vec![42], vec![])).is_empty());

        let matches = index.get(42).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].hash(), TxId([1; 32]));
        assert_eq!(matches[0].height(), 110);
        assert_eq!(matches[1].hash(), TxId([2; 32]));
    }

    #[test]
    fn seeding_ignores_unknown_slots() {
        let mut index = MatchIndex::new(&slots());
        let stored = BTreeMap::from([
            (42, vec![tx(1, 103, vec![42], vec![])]),
            (1000, vec![tx(2, 104, vec![1000], vec![])]),
        ]);
        assert_eq!(index.seed(stored), 1);
        assert_eq!(index.total_matches(), 1);
        assert_eq!(index.get(1000), None);
    }

    #[test]
    fn invalidation_drops_matches_at_or_above_height() {
        let map = slots();
        let mut index = MatchIndex::new(&map);
        for (id, height) in [(1, 100), (2, 101), (3, 102)] {
            index.process_transaction(&map, &tx(id, height, vec![7, 42], vec![]));
        }
        assert_eq!(index.invalidate_from_height(101), 4);
        assert_eq!(index.get(42).unwrap().len(), 1);
        assert_eq!(index.get(7).unwrap()[0].height(), 100);
    }

    #[test]
    fn retain_at_height_drops_matches_missing_from_the_block() {
        let map = slots();
        let mut index = MatchIndex::new(&map);
        for (id, height) in [(1, 100), (2, 101), (3, 101), (4, 102)] {
            index.process_transaction(&map, &tx(id, height, vec![42], vec![]));
        }

        assert_eq!(index.retain_at_height(101, &[TxId([3; 32]), TxId([9; 32])]), 1);
        let kept: Vec<_> = index.get(42).unwrap().iter().map(|t| t.hash()).collect();
        assert_eq!(kept, vec![TxId([1; 32]), TxId([3; 32]), TxId([4; 32])]);

        assert_eq!(index.retain_at_height(102, &[]), 1);
        assert_eq!(index.retain_at_height(103, &[]), 0);
        assert_eq!(index.total_matches(), 2);
    }

    fn arb_transaction() -> impl Strategy<Value = Transaction> {
        (
            0u8..16,
            0u64..1_000,
            proptest::collection::vec(0u64..64, 0..11),
            proptest::collection::vec(0u8..64, 0..4),
        )
            .prop_map(|(id, height, inputs, outputs)| {
                let outputs = outputs.into_iter().map(|b| OneTimeKey([b; 32])).collect();
                Transaction::from_parts(TxId([id; 32]), height, height, inputs, outputs)
            })
    }

    proptest! {
        #[test]
        fn processing_twice_is_idempotent(
            owned in proptest::collection::btree_set(0u64..64, 1..8),
            transactions in proptest::collection::vec(arb_transaction(), 0..20),
        ) {
            let map = SlotMap::new(
                owned.iter().map(|gi| IdentifierSlot::from_parts(*gi, OneTimeKey([*gi as u8; 32]))),
            );
            let mut index = MatchIndex::new(&map);
            for transaction in &transactions {
                index.process_transaction(&map, transaction);
            }
            let first_pass: Vec<usize> = index.iter().map(|(_, txs)| txs.len()).collect();

            for transaction in &transactions {
                prop_assert!(index.process_transaction(&map, transaction).is_empty());
            }
            let second_pass: Vec<usize> = index.iter().map(|(_, txs)| txs.len()).collect();

            prop_assert_eq!(first_pass, second_pass);
        }
    }
}
