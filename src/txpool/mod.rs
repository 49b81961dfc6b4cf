//! Bridge between the VM transaction pool and the host mempool.
//!
//! - [iterator::PendingIterator] hands the VM's pending transactions to the host proposal builder
//!   in price/nonce order, each wrapped in a host envelope.
//! - [handler::Handler] broadcasts every transaction the VM pool accepts into host gossip.
//! - [ante::AdmissionFilter] ejects host mempool entries the VM pool reports as included.

use std::collections::BTreeMap;

use futures::channel::mpsc;
use thiserror::Error;

use crate::common::{Addr, Hash};
use crate::tx::{Transaction, TxError};

pub mod ante;
pub mod handler;
pub mod iterator;
pub mod serializer;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxPoolError {
    #[error("failed to serialize transaction: {0}")]
    Serialize(String),
    #[error("malformed host envelope: {0}")]
    Envelope(String),
    #[error("not a VM transaction: {0}")]
    ForeignType(String),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error("eject from host mempool: {0} already included")]
    Eject(Hash),
}

impl From<rlp::DecoderError> for TxPoolError {
    fn from(e: rlp::DecoderError) -> Self {
        TxPoolError::Envelope(e.to_string())
    }
}

/// Transactions newly accepted by the VM pool.
#[derive(Clone, Debug)]
pub struct NewTxsEvent {
    pub txs: Vec<Transaction>,
}

/// An active feed of [NewTxsEvent]s.
pub trait Subscription: Send {
    /// Yields at most one error, then closes. Also closes on unsubscribe.
    fn err(&mut self) -> &mut mpsc::UnboundedReceiver<String>;
    fn unsubscribe(&mut self);
}

pub trait TxSubProvider: Send + Sync {
    fn subscribe_new_txs(
        &self, ch: mpsc::Sender<NewTxsEvent>,
    ) -> Box<dyn Subscription>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxStatus {
    Unknown,
    Queued,
    Pending,
    Included,
}

pub trait TxStatusProvider: Send + Sync {
    fn status(&self, hash: &Hash) -> TxStatus;
}

/// Executable transactions of the VM pool, grouped by sender and sorted by nonce.
pub trait PendingSource: Send + Sync {
    fn pending(&self) -> BTreeMap<Addr, Vec<Transaction>>;
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BroadcastResponse {
    pub code: u32,
    pub log: String,
}

/// Host gossip entry point.
pub trait TxBroadcaster: Send + Sync {
    fn broadcast_tx_sync(&self, raw: &[u8]) -> Result<BroadcastResponse, String>;
}
