//! Queue fetch requests and serve them from the ledger node

use std::collections::VecDeque;

use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};

use crate::client::FetchRequest;
use crate::traits::LedgerNode;

/// Receives [`crate::client::FetchRequest`]'s via an [`tokio::sync::mpsc::UnboundedReceiver`] for
/// queueing and fetching from the node.
/// Returns the data specified in the [`crate::client::FetchRequest`] variant via the provided
/// [`tokio::sync::oneshot::Sender`].
///
/// All requests to the node are handled from this single task, in the order they were sent.
/// Returns when every sender has been dropped and the queue is drained.
pub async fn fetch<N: LedgerNode>(
    mut fetch_request_receiver: UnboundedReceiver<FetchRequest>,
    node: N,
) {
    let mut fetch_request_queue: VecDeque<FetchRequest> = VecDeque::new();

    loop {
        if receive_fetch_requests(&mut fetch_request_receiver, &mut fetch_request_queue).await {
            return;
        }

        if let Some(request) = fetch_request_queue.pop_front() {
            fetch_from_node(&node, request).await;
        }
    }
}

// receives fetch requests and populates the fetch request queue
//
// returns `true` if the fetch request channel is closed and all fetch requests have been completed
async fn receive_fetch_requests(
    receiver: &mut UnboundedReceiver<FetchRequest>,
    fetch_request_queue: &mut VecDeque<FetchRequest>,
) -> bool {
    // sleep until the next fetch request is received or the channel is closed
    if fetch_request_queue.is_empty() {
        if let Some(fetch_request) = receiver.recv().await {
            fetch_request_queue.push_back(fetch_request);
        }
    }
    loop {
        match receiver.try_recv() {
            Ok(fetch_request) => fetch_request_queue.push_back(fetch_request),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => return fetch_request_queue.is_empty(),
        }
    }

    false
}

// replies to requesters that stopped waiting are dropped
async fn fetch_from_node<N: LedgerNode>(node: &N, fetch_request: FetchRequest) {
    match fetch_request {
        FetchRequest::ChainHeight(sender) => {
            tracing::debug!("Fetching chain height.");
            let _ = sender.send(node.get_chain_height().await);
        }
        FetchRequest::Block(sender, height) => {
            tracing::debug!("Fetching block. {}", height);
            let _ = sender.send(node.get_block(height).await);
        }
        FetchRequest::Transactions(sender, tx_hashes) => {
            tracing::debug!("Fetching {} transactions.", tx_hashes.len());
            let _ = sender.send(node.get_transactions(tx_hashes).await);
        }
        FetchRequest::Restricted(sender) => {
            tracing::debug!("Fetching RPC restriction status.");
            let _ = sender.send(node.is_restricted().await);
        }
    }
}
