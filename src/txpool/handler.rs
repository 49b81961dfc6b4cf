use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use log::{debug, error, info};
use parking_lot::Mutex;
use thiserror::Error;

use super::serializer::TxSerializer;
use super::{NewTxsEvent, Subscription, TxBroadcaster, TxSubProvider};
use crate::config::{Config, DEFAULT_TX_CHAN_SIZE};
use crate::tx::Transaction;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler already started")]
    AlreadyStarted,
    #[error("handler already stopped")]
    AlreadyStopped,
    #[error("failed to spawn handler thread: {0}")]
    Spawn(String),
}

struct Broadcast {
    broadcaster: Arc<dyn TxBroadcaster>,
    serializer: Arc<dyn TxSerializer>,
}

impl Broadcast {
    fn broadcast_transactions(&self, txs: &[Transaction]) {
        debug!("broadcasting {} transactions", txs.len());
        for tx in txs {
            let raw = match self.serializer.to_host_bytes(tx) {
                Ok(raw) => raw,
                Err(e) => {
                    error!("failed to serialize transaction {}: {}", tx.hash(), e);
                    continue
                }
            };
            match self.broadcaster.broadcast_tx_sync(&raw) {
                Ok(rsp) if rsp.code != 0 => error!(
                    "failed to broadcast transaction {}: code={} log={}",
                    tx.hash(),
                    rsp.code,
                    rsp.log
                ),
                Ok(_) => (),
                Err(e) => {
                    error!("error on broadcast of transaction {}: {}", tx.hash(), e)
                }
            }
        }
    }
}

struct Worker {
    stop_tx: oneshot::Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// Pushes every transaction the VM pool accepts into host gossip, one at a time and in the order
/// the pool emits them.
pub struct Handler {
    provider: Arc<dyn TxSubProvider>,
    broadcast: Arc<Broadcast>,
    chan_size: usize,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
}

impl Handler {
    pub fn new(
        provider: Arc<dyn TxSubProvider>, broadcaster: Arc<dyn TxBroadcaster>,
        serializer: Arc<dyn TxSerializer>,
    ) -> Self {
        Self::with_chan_size(provider, broadcaster, serializer, DEFAULT_TX_CHAN_SIZE)
    }

    pub fn from_config(
        provider: Arc<dyn TxSubProvider>, broadcaster: Arc<dyn TxBroadcaster>,
        serializer: Arc<dyn TxSerializer>, config: &Config,
    ) -> Self {
        Self::with_chan_size(provider, broadcaster, serializer, config.tx_chan_size)
    }

    pub fn with_chan_size(
        provider: Arc<dyn TxSubProvider>, broadcaster: Arc<dyn TxBroadcaster>,
        serializer: Arc<dyn TxSerializer>, chan_size: usize,
    ) -> Self {
        Self {
            provider,
            broadcast: Arc::new(Broadcast {
                broadcaster,
                serializer,
            }),
            chan_size,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&self) -> Result<(), HandlerError> {
        let mut worker = self.worker.lock();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HandlerError::AlreadyStarted)
        }
        // reap a loop that stopped on its own
        if let Some(w) = worker.take() {
            join(w.handle);
        }

        let (txs_tx, txs_rx) = mpsc::channel(self.chan_size);
        let sub = self.provider.subscribe_new_txs(txs_tx);
        let (stop_tx, stop_rx) = oneshot::channel();
        let broadcast = self.broadcast.clone();
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("txpool-handler".into())
            .spawn(move || {
                event_loop(broadcast, sub, txs_rx, stop_rx);
                running.store(false, Ordering::Release);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                HandlerError::Spawn(e.to_string())
            })?;
        *worker = Some(Worker { stop_tx, handle });
        info!("starting txpool handler");
        Ok(())
    }

    /// Stop the loop and wait for it to exit; no broadcast happens after this returns.
    pub fn stop(&self) -> Result<(), HandlerError> {
        let mut worker = self.worker.lock();
        let was_running = self.running.swap(false, Ordering::AcqRel);
        if let Some(w) = worker.take() {
            // the loop may already be gone, in which case nobody listens
            let _ = w.stop_tx.send(());
            join(w.handle);
        }
        if !was_running {
            return Err(HandlerError::AlreadyStopped)
        }
        info!("stopped txpool handler");
        Ok(())
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn join(handle: thread::JoinHandle<()>) {
    if handle.join().is_err() {
        error!("txpool handler thread panicked");
    }
}

fn event_loop(
    broadcast: Arc<Broadcast>, mut sub: Box<dyn Subscription>,
    mut txs_rx: mpsc::Receiver<NewTxsEvent>, mut stop_rx: oneshot::Receiver<()>,
) {
    futures::executor::block_on(async {
        loop {
            futures::select_biased! {
                _ = stop_rx => break,
                err = sub.err().next() => {
                    match err {
                        Some(e) => error!("txpool handler: subscription failed: {}", e),
                        None => debug!("txpool handler: subscription closed"),
                    }
                    break
                }
                ev = txs_rx.next() => match ev {
                    Some(ev) => broadcast.broadcast_transactions(&ev.txs),
                    None => break,
                },
            }
        }
    });
    sub.unsubscribe();
    txs_rx.close();
}
