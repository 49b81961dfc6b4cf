use std::cmp::Ordering;
use std::collections::hash_map::HashMap;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use log::{debug, error};

use super::serializer::{HostEnvelope, TxSerializer};
use crate::common::{Addr, Wei};
use crate::tx::Transaction;

/// Head of one sender's queue in the price heap.
#[derive(PartialEq, Eq, Debug)]
struct Head {
    tip: Wei,
    sender: Addr,
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        // higher tip first; lower address breaks ties
        self.tip
            .cmp(&other.tip)
            .then_with(|| other.sender.cmp(&self.sender))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SenderQueue {
    txs: Vec<Transaction>,
    cursor: usize,
}

/// Walks the VM pool's pending transactions in the order a block producer should include them:
/// across senders by effective tip, within a sender by nonce.
pub struct PendingIterator {
    serializer: Arc<dyn TxSerializer>,
    base_fee: Option<Wei>,
    heads: BinaryHeap<Head>,
    queues: HashMap<Addr, SenderQueue>,
    empty: bool,
}

impl PendingIterator {
    pub fn new(serializer: Arc<dyn TxSerializer>) -> Self {
        Self {
            serializer,
            base_fee: None,
            heads: BinaryHeap::new(),
            queues: HashMap::new(),
            empty: true,
        }
    }

    /// Start a new pass over `pending` (nonce-sorted per sender). Senders whose next transaction
    /// cannot pay `base_fee` are left out.
    pub fn reset(
        &mut self, pending: BTreeMap<Addr, Vec<Transaction>>,
        base_fee: Option<Wei>,
    ) {
        self.base_fee = base_fee;
        self.heads.clear();
        self.queues.clear();
        for (sender, txs) in pending.into_iter() {
            let queue = SenderQueue { txs, cursor: 0 };
            if self.push_head(sender, &queue) {
                self.queues.insert(sender, queue);
            }
        }
        self.empty = self.heads.is_empty();
        debug!(
            "txpool iterator: reset with {} senders",
            self.queues.len()
        );
    }

    fn push_head(&mut self, sender: Addr, queue: &SenderQueue) -> bool {
        let tip = queue
            .txs
            .get(queue.cursor)
            .and_then(|tx| tx.effective_gas_tip(self.base_fee.as_ref()));
        match tip {
            Some(tip) => {
                self.heads.push(Head { tip, sender });
                true
            }
            None => false,
        }
    }

    fn drop_sender(&mut self, sender: &Addr) {
        self.heads.retain(|h| &h.sender != sender);
        self.queues.remove(sender);
        self.empty = self.heads.is_empty();
    }

    /// The current head transaction, unwrapped.
    pub fn peek_tx(&self) -> Option<&Transaction> {
        let head = self.heads.peek()?;
        let queue = self.queues.get(&head.sender)?;
        queue.txs.get(queue.cursor)
    }

    /// The current head wrapped in a host envelope. A head that fails to serialize takes the rest
    /// of its sender's transactions with it, since their nonces can no longer be filled.
    pub fn peek(&mut self) -> Option<HostEnvelope> {
        loop {
            if self.empty {
                return None
            }
            let sender = self.heads.peek()?.sender;
            let res = self.peek_tx().map(|tx| {
                self.serializer
                    .to_host_envelope(tx)
                    .map_err(|e| (*tx.hash(), e))
            });
            match res {
                None => self.drop_sender(&sender),
                Some(Ok(envelope)) => return Some(envelope),
                Some(Err((hash, e))) => {
                    error!(
                        "txpool iterator: dropping {} and the rest of {}: {}",
                        hash, sender, e
                    );
                    self.drop_sender(&sender);
                }
            }
        }
    }

    /// Move past the current head.
    pub fn advance(&mut self) {
        let head = match self.heads.pop() {
            Some(h) => h,
            None => {
                self.empty = true;
                return
            }
        };
        if let Some(mut queue) = self.queues.remove(&head.sender) {
            queue.cursor += 1;
            if self.push_head(head.sender, &queue) {
                self.queues.insert(head.sender, queue);
            }
        }
        self.empty = self.heads.is_empty();
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }
}
