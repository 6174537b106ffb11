//! Module for handling all connections to the ledger node

use tokio::sync::{mpsc::UnboundedSender, oneshot};

use crate::error::NodeError;
use crate::primitives::{Block, Transaction, TxId};

pub mod fetch;

/// Fetch requests are created and sent to the [`crate::client::fetch::fetch`] task when a
/// connection to the node is required.
///
/// Each variant includes a [`tokio::sync::oneshot::Sender`] for returning the fetched data, or the
/// node's error, to the requester.
#[derive(Debug)]
pub enum FetchRequest {
    /// Gets the height of the blockchain from the node.
    ChainHeight(oneshot::Sender<Result<u64, NodeError>>),
    /// Gets the block at the specified height.
    Block(oneshot::Sender<Result<Block, NodeError>>, u64),
    /// Looks up a batch of transactions by hash.
    Transactions(oneshot::Sender<Result<Vec<Transaction>, NodeError>>, Vec<TxId>),
    /// Asks whether the node restricts its RPC interface.
    Restricted(oneshot::Sender<Result<bool, NodeError>>),
}

async fn round_trip<T>(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    fetch_request: FetchRequest,
    receiver: oneshot::Receiver<Result<T, NodeError>>,
) -> Result<T, NodeError> {
    fetch_request_sender
        .send(fetch_request)
        .map_err(|_| NodeError::ChannelClosed)?;

    receiver.await.map_err(|_| NodeError::ChannelClosed)?
}

/// Gets the height of the blockchain from the node.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently, connected via the `fetch_request` channel.
pub async fn get_chain_height(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
) -> Result<u64, NodeError> {
    let (sender, receiver) = oneshot::channel();
    round_trip(
        fetch_request_sender,
        FetchRequest::ChainHeight(sender),
        receiver,
    )
    .await
}
/// Gets the block at the specified height.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently, connected via the `fetch_request` channel.
pub async fn get_block(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    height: u64,
) -> Result<Block, NodeError> {
    let (sender, receiver) = oneshot::channel();
    round_trip(
        fetch_request_sender,
        FetchRequest::Block(sender, height),
        receiver,
    )
    .await
}
/// Looks up a batch of transactions by hash.
///
/// The response is returned as the node sent it; checking it against `tx_hashes` is left to the
/// caller.
pub async fn get_transactions(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    tx_hashes: Vec<TxId>,
) -> Result<Vec<Transaction>, NodeError> {
    let (sender, receiver) = oneshot::channel();
    round_trip(
        fetch_request_sender,
        FetchRequest::Transactions(sender, tx_hashes),
        receiver,
    )
    .await
}
/// Whether the node restricts its RPC interface.
pub async fn is_restricted(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
) -> Result<bool, NodeError> {
    let (sender, receiver) = oneshot::channel();
    round_trip(
        fetch_request_sender,
        FetchRequest::Restricted(sender),
        receiver,
    )
    .await
}
