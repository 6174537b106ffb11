use haystack_config::ScanConfig;
use haystack_testutils::{block_hash, pubkey, tx_at, txid, MockKeySource, MockNode, Trigger};
use scan_tests::{batched_config, matched, scan_from, test_config};
use test_case::test_case;

// blocks 0..=9 with an owned output created at 5 and referenced at 6
fn chain_with_matches() -> MockNode {
    let node = MockNode::with_empty_blocks(5);
    node.push_block(vec![tx_at(1, 5, vec![], vec![pubkey(42)])]);
    node.push_block(vec![tx_at(2, 6, vec![42, 3, 4], vec![])]);
    node.push_empty_blocks(3);
    node
}

#[test_case(1 ; "abandoned transactions already looked up")]
#[test_case(10_000 ; "abandoned transactions still pending")]
#[tokio::test]
async fn reorg_replaces_matches_from_abandoned_blocks(batch_size: usize) {
    let node = chain_with_matches();
    node.on_block_request(
        7,
        Trigger::Reorg {
            fork_height: 5,
            branch: 1,
            blocks: vec![
                vec![tx_at(3, 5, vec![], vec![pubkey(42)])],
                vec![],
                vec![],
                vec![],
                vec![],
            ],
        },
    );
    let keys = MockKeySource::single(42, pubkey(42));

    let report = scan_from(&keys, &node, &batched_config(batch_size), 0).await;

    assert!(report.outcome.status.is_completed());
    assert_eq!(report.outcome.reorgs, 2);
    assert_eq!(report.outcome.exhausted_rollbacks, 0);
    assert_eq!(matched(&report, 42), vec![txid(3)]);
    assert_eq!(
        report.outcome.window.newest().unwrap().hash(),
        block_hash(9, 1)
    );
    assert_eq!(
        report.outcome.window.iter().find(|b| b.height() == 4).unwrap().hash(),
        block_hash(4, 0)
    );
}

#[tokio::test]
async fn pending_lookups_from_abandoned_blocks_are_dropped() {
    let node = chain_with_matches();
    node.on_block_request(
        7,
        Trigger::Reorg {
            fork_height: 5,
            branch: 1,
            blocks: vec![
                vec![tx_at(3, 5, vec![], vec![pubkey(42)])],
                vec![],
                vec![],
                vec![],
                vec![],
            ],
        },
    );
    let keys = MockKeySource::single(42, pubkey(42));

    scan_from(&keys, &node, &batched_config(10_000), 0).await;

    assert_eq!(node.transaction_requests(), vec![vec![txid(3)]]);
}

#[tokio::test]
async fn transaction_remined_higher_keeps_its_match() {
    let node = chain_with_matches();
    node.on_block_request(
        7,
        Trigger::Reorg {
            fork_height: 5,
            branch: 1,
            blocks: vec![
                vec![],
                vec![tx_at(1, 6, vec![], vec![pubkey(42)])],
                vec![],
                vec![],
                vec![],
            ],
        },
    );
    let keys = MockKeySource::single(42, pubkey(42));

    let report = scan_from(&keys, &node, &batched_config(1), 0).await;

    let matches = report.outcome.matches.get(42).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].hash(), txid(1));
    assert_eq!(matches[0].height(), 6);
}

#[tokio::test]
async fn block_requests_walk_back_to_the_fork() {
    let node = MockNode::with_empty_blocks(10);
    node.on_block_request(
        8,
        Trigger::Reorg {
            fork_height: 6,
            branch: 1,
            blocks: vec![vec![]; 4],
        },
    );
    let keys = MockKeySource::single(42, pubkey(42));

    let report = scan_from(&keys, &node, &test_config(), 0).await;

    assert_eq!(
        node.block_requests(),
        vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 7, 6, 7, 8, 9]
    );
    assert_eq!(report.outcome.reorgs, 2);
}

#[tokio::test]
async fn rollback_past_the_window_continues_from_the_oldest_block() {
    let node = MockNode::with_empty_blocks(10);
    node.on_block_request(
        8,
        Trigger::Reorg {
            fork_height: 3,
            branch: 1,
            blocks: vec![vec![]; 7],
        },
    );
    let keys = MockKeySource::single(42, pubkey(42));
    let config = ScanConfig {
        max_window: 2,
        ..test_config()
    };

    let report = scan_from(&keys, &node, &config, 0).await;

    assert!(report.outcome.status.is_completed());
    assert_eq!(report.outcome.reorgs, 2);
    assert_eq!(report.outcome.exhausted_rollbacks, 1);
    let hashes: Vec<_> = report.outcome.window.iter().map(|b| b.hash()).collect();
    assert_eq!(hashes, vec![block_hash(8, 1), block_hash(9, 1)]);
}
