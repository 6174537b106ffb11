use haystack_sync::primitives::MatchKind;
use haystack_sync::resume::ResumeSource;
use haystack_sync::scan::ScanEvent;
use haystack_sync::sync::SessionOptions;
use haystack_testutils::{
    drain_events, event_channel, pubkey, tx_at, txid, MockKeySource, MockNode,
};
use scan_tests::{batched_config, matched, run_session, scan_from, test_config};

#[tokio::test]
async fn finds_the_transaction_that_created_an_owned_output() {
    let node = MockNode::with_empty_blocks(103);
    node.push_block(vec![tx_at(1, 103, vec![], vec![pubkey(7), pubkey(42)])]);
    node.push_empty_blocks(2);
    let keys = MockKeySource::single(42, pubkey(42));

    let report = scan_from(&keys, &node, &test_config(), 100).await;

    assert!(report.outcome.status.is_completed());
    let plan = report.plan.unwrap();
    assert_eq!((plan.start_height, plan.end_height), (100, 105));
    assert_eq!(plan.source, ResumeSource::Explicit);
    assert_eq!(matched(&report, 42), vec![txid(1)]);
    assert_eq!(node.block_requests(), vec![100, 101, 102, 103, 104, 105]);
    assert_eq!(node.transaction_requests(), vec![vec![txid(1)]]);
    assert_eq!(report.outcome.window.newest().unwrap().height(), 105);
}

#[tokio::test]
async fn ring_references_are_matched_and_decoys_ignored() {
    let node = MockNode::with_empty_blocks(10);
    node.push_block(vec![
        tx_at(1, 10, vec![3, 42, 900], vec![pubkey(1)]),
        tx_at(2, 10, vec![4, 5, 6], vec![pubkey(2)]),
    ]);
    node.push_block(vec![tx_at(3, 11, vec![42, 43], vec![])]);
    let keys = MockKeySource::single(42, pubkey(42));

    let report = scan_from(&keys, &node, &test_config(), 0).await;

    assert_eq!(matched(&report, 42), vec![txid(1), txid(3)]);
    assert_eq!(report.outcome.matches.total_matches(), 2);
}

#[tokio::test]
async fn match_and_progress_events_are_emitted() {
    let node = MockNode::with_empty_blocks(3);
    node.push_block(vec![tx_at(1, 3, vec![], vec![pubkey(42)])]);
    node.push_block(vec![tx_at(2, 4, vec![42], vec![])]);
    let keys = MockKeySource::single(42, pubkey(42));
    let (sender, mut receiver) = event_channel();

    let report = run_session(
        &keys,
        &node,
        &batched_config(1),
        SessionOptions {
            start_height: Some(0),
            events: Some(sender),
            ..SessionOptions::default()
        },
    )
    .await
    .unwrap();
    assert!(report.outcome.status.is_completed());

    let events = drain_events(&mut receiver);
    let found: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ScanEvent::Match {
                global_index,
                tx_hash,
                height,
                kind,
            } => Some((*global_index, *tx_hash, *height, *kind)),
            ScanEvent::Progress(_) => None,
        })
        .collect();
    assert_eq!(
        found,
        vec![
            (42, txid(1), 3, MatchKind::Created),
            (42, txid(2), 4, MatchKind::Referenced),
        ]
    );

    let Some(ScanEvent::Progress(last)) = events
        .iter()
        .rev()
        .find(|event| matches!(event, ScanEvent::Progress(_)))
    else {
        panic!("no progress reported");
    };
    assert_eq!(last.height, 4);
    assert_eq!(last.end_height, 4);
    assert_eq!(last.percent, 100.0);
    assert_eq!(last.found, 2);
}

#[tokio::test]
async fn window_keeps_only_the_newest_blocks() {
    let node = MockNode::with_empty_blocks(200);
    let keys = MockKeySource::single(42, pubkey(42));

    let report = scan_from(&keys, &node, &test_config(), 0).await;

    let window = &report.outcome.window;
    assert_eq!(window.len(), 50);
    assert_eq!(window.oldest().unwrap().height(), 150);
    assert_eq!(window.newest().unwrap(), &node.summary(199).unwrap());
    assert!(node.transaction_requests().is_empty());
}

#[tokio::test]
async fn lookups_are_batched_in_block_order() {
    let node = MockNode::with_empty_blocks(10);
    node.push_block(vec![
        tx_at(1, 10, vec![], vec![]),
        tx_at(2, 10, vec![], vec![]),
        tx_at(3, 10, vec![], vec![]),
    ]);
    node.push_block(vec![tx_at(4, 11, vec![], vec![]), tx_at(5, 11, vec![42], vec![])]);
    node.push_empty_blocks(1);
    let keys = MockKeySource::single(42, pubkey(42));

    let report = scan_from(&keys, &node, &batched_config(2), 10).await;

    assert_eq!(
        node.transaction_requests(),
        vec![
            vec![txid(1), txid(2)],
            vec![txid(3), txid(4)],
            vec![txid(5)],
        ]
    );
    assert_eq!(matched(&report, 42), vec![txid(5)]);
}

#[test_case::test_case(Some(true) ; "restricted node")]
#[test_case::test_case(None ; "restriction unknown")]
#[tokio::test]
async fn restricted_nodes_get_small_batches(restricted: Option<bool>) {
    let node = MockNode::with_empty_blocks(1);
    node.push_block((1..=5).map(|id| tx_at(id, 1, vec![], vec![])).collect());
    node.set_restricted(restricted);
    let keys = MockKeySource::single(42, pubkey(42));
    let config = haystack_config::ScanConfig {
        restricted_batch_size: 2,
        ..test_config()
    };

    scan_from(&keys, &node, &config, 0).await;

    let sizes: Vec<usize> = node.transaction_requests().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[tokio::test]
async fn unrestricted_nodes_get_one_large_batch() {
    let node = MockNode::with_empty_blocks(1);
    node.push_block((1..=5).map(|id| tx_at(id, 1, vec![], vec![])).collect());
    let keys = MockKeySource::single(42, pubkey(42));
    let config = haystack_config::ScanConfig {
        restricted_batch_size: 2,
        ..test_config()
    };

    scan_from(&keys, &node, &config, 0).await;

    let sizes: Vec<usize> = node.transaction_requests().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![5]);
}

#[tokio::test]
async fn nothing_is_scanned_without_owned_outputs() {
    let node = MockNode::with_empty_blocks(10);
    let keys = MockKeySource::new(vec![]);

    let report = scan_from(&keys, &node, &test_config(), 0).await;

    assert!(report.outcome.status.is_completed());
    assert!(report.plan.is_none());
    assert!(report.slots.is_empty());
    assert!(node.block_requests().is_empty());
}

#[tokio::test]
async fn scan_without_start_height_uses_restore_height() {
    let node = MockNode::with_empty_blocks(1_000);
    let keys = MockKeySource::single(42, pubkey(42)).with_restore_height(Some(600));

    let report = run_session(&keys, &node, &test_config(), SessionOptions::default())
        .await
        .unwrap();

    let plan = report.plan.unwrap();
    assert_eq!(plan.source, ResumeSource::RestoreHeight);
    assert!((350..=575).contains(&plan.start_height));
    assert_eq!(plan.end_height, 999);
    assert!(report.outcome.status.is_completed());
}

#[tokio::test]
async fn scan_without_any_hint_starts_at_genesis() {
    let node = MockNode::with_empty_blocks(20);
    let keys = MockKeySource::single(42, pubkey(42));

    let report = run_session(&keys, &node, &test_config(), SessionOptions::default())
        .await
        .unwrap();

    let plan = report.plan.unwrap();
    assert_eq!(plan.source, ResumeSource::Genesis);
    assert_eq!(plan.start_height, 0);
    assert_eq!(node.block_requests().first(), Some(&0));
}
