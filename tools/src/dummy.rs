use std::collections::hash_map::HashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::channel::mpsc;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use evmhost::block::{Block, Header, Log, Receipt};
use evmhost::common::{Addr, Bytes, Gas, Hash, Wei};
use evmhost::host::{BlockPlugin, HostError, StatePlugin};
use evmhost::precompile::{HostEvent, LogFactory, VmHandle};
use evmhost::processor::{build_receipts, TxOutcome};
use evmhost::tx::{key_to_addr, Transaction};
use evmhost::txpool::{
    BroadcastResponse, NewTxsEvent, PendingSource, Subscription, TxBroadcaster,
    TxStatus, TxStatusProvider, TxSubProvider,
};

pub const CHAIN_ID: u64 = 1;
pub const TRANSFER_GAS: Gas = 21_000;

/// Headers the host has recorded, by number and by hash.
#[derive(Default)]
pub struct DummyBlockPlugin {
    headers: RwLock<HashMap<u64, Header>>,
}

impl DummyBlockPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_genesis(genesis: Header) -> Self {
        let bp = Self::new();
        bp.store_header(genesis);
        bp
    }

    pub fn store_header(&self, header: Header) {
        info!("store_header({}, {})", header.number(), header.hash());
        self.headers.write().insert(header.number(), header);
    }
}

impl BlockPlugin for DummyBlockPlugin {
    fn get_header_by_number(&self, number: u64) -> Result<Header, HostError> {
        self.headers
            .read()
            .get(&number)
            .cloned()
            .ok_or(HostError::NotFound)
    }

    fn get_header_by_hash(&self, hash: &Hash) -> Result<Header, HostError> {
        self.headers
            .read()
            .values()
            .find(|h| h.hash() == hash)
            .cloned()
            .ok_or(HostError::NotFound)
    }
}

#[derive(Default)]
pub struct DummyStateStore {
    balances: RwLock<HashMap<Addr, Wei>>,
    logs: Mutex<Vec<Log>>,
    factory: RwLock<Option<Arc<LogFactory>>>,
}

impl DummyStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, account: &Addr, balance: Wei) {
        info!("set_balance({}, {})", account, balance);
        self.balances.write().insert(*account, balance);
    }

    pub fn logs(&self) -> Vec<Log> {
        self.logs.lock().clone()
    }

    pub fn has_log_factory(&self) -> bool {
        self.factory.read().is_some()
    }
}

#[async_trait]
impl StatePlugin for DummyStateStore {
    async fn get_balance(&self, account: &Addr) -> Wei {
        info!("get_balance({})", account);
        self.balances
            .read()
            .get(account)
            .copied()
            .unwrap_or_else(|| *Wei::zero())
    }

    async fn transfer(
        &self, from: &Addr, to: &Addr, amount: &Wei,
    ) -> Result<(), HostError> {
        info!("transfer({}, {}, {})", from, to, amount);
        let mut balances = self.balances.write();
        let src = balances.get(from).copied().unwrap_or_default();
        let src = src
            .checked_sub(amount)
            .ok_or(HostError::InsufficientBalance(*from))?;
        let dst = balances.get(to).copied().unwrap_or_default();
        let dst = dst
            .checked_add(amount)
            .ok_or_else(|| HostError::Other("balance overflow".into()))?;
        balances.insert(*from, src);
        balances.insert(*to, dst);
        Ok(())
    }

    fn add_log(&self, log: Log) {
        info!(
            "add_log(contract={} topics={} data={})",
            log.address,
            log.topics.len(),
            log.data
        );
        self.logs.lock().push(log);
    }

    fn emit_host_event(&self, event: HostEvent) -> Result<(), HostError> {
        let log = match self.factory.read().as_ref() {
            Some(f) => f.build(&event)?,
            None => return Err(HostError::NotReady),
        };
        self.add_log(log);
        Ok(())
    }

    fn set_precompile_log_factory(&self, factory: Arc<LogFactory>) {
        info!("set_precompile_log_factory()");
        *self.factory.write() = Some(factory);
    }
}

pub struct DummyVm {
    pub number: u64,
    pub origin: Addr,
}

impl VmHandle for DummyVm {
    fn block_number(&self) -> u64 {
        self.number
    }
    fn origin(&self) -> Addr {
        self.origin
    }
}

struct Subscriber {
    txs: mpsc::Sender<NewTxsEvent>,
    err: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

pub struct DummySubscription {
    err: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

impl Subscription for DummySubscription {
    fn err(&mut self) -> &mut mpsc::UnboundedReceiver<String> {
        &mut self.err
    }

    fn unsubscribe(&mut self) {
        info!("unsubscribe()");
        self.closed.store(true, Ordering::Release);
        self.err.close();
    }
}

/// Stand-in for the VM transaction pool.
#[derive(Default)]
pub struct DummyTxPool {
    pending: RwLock<BTreeMap<Addr, Vec<Transaction>>>,
    status: RwLock<HashMap<Hash, TxStatus>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl DummyTxPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept signed transactions and announce them to subscribers.
    pub fn add(&self, txs: Vec<Transaction>) {
        {
            let mut pending = self.pending.write();
            let mut status = self.status.write();
            for tx in &txs {
                let sender = match tx.recover_sender() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("dropping {}: {}", tx.hash(), e);
                        continue
                    }
                };
                let queue = pending.entry(sender).or_default();
                queue.push(tx.clone());
                queue.sort_by_key(|t| t.nonce());
                status.insert(*tx.hash(), TxStatus::Pending);
            }
        }
        let mut subs = self.subscribers.lock();
        subs.retain(|s| !s.closed.load(Ordering::Acquire));
        for s in subs.iter_mut() {
            if let Err(e) = s.txs.try_send(NewTxsEvent { txs: txs.clone() }) {
                warn!("new txs event dropped: {}", e);
            }
        }
    }

    /// Mark transactions as included and take them out of the pending set.
    pub fn include(&self, hashes: &[Hash]) {
        let mut pending = self.pending.write();
        let mut status = self.status.write();
        for h in hashes {
            status.insert(*h, TxStatus::Included);
        }
        for queue in pending.values_mut() {
            queue.retain(|tx| !hashes.contains(tx.hash()));
        }
        pending.retain(|_, q| !q.is_empty());
    }

    /// Make every live subscription report an error.
    pub fn fail_subscriptions(&self, reason: &str) {
        for s in self.subscribers.lock().iter() {
            let _ = s.err.unbounded_send(reason.to_string());
        }
    }

    pub fn nsubscribers(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|s| !s.closed.load(Ordering::Acquire))
            .count()
    }
}

impl TxSubProvider for DummyTxPool {
    fn subscribe_new_txs(
        &self, ch: mpsc::Sender<NewTxsEvent>,
    ) -> Box<dyn Subscription> {
        info!("subscribe_new_txs()");
        let (err_tx, err_rx) = mpsc::unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        self.subscribers.lock().push(Subscriber {
            txs: ch,
            err: err_tx,
            closed: closed.clone(),
        });
        Box::new(DummySubscription {
            err: err_rx,
            closed,
        })
    }
}

impl TxStatusProvider for DummyTxPool {
    fn status(&self, hash: &Hash) -> TxStatus {
        self.status
            .read()
            .get(hash)
            .copied()
            .unwrap_or(TxStatus::Unknown)
    }
}

impl PendingSource for DummyTxPool {
    fn pending(&self) -> BTreeMap<Addr, Vec<Transaction>> {
        self.pending.read().clone()
    }
}

/// Records what would have gone to host gossip.
#[derive(Default)]
pub struct MockBroadcaster {
    sent: Mutex<Vec<Vec<u8>>>,
    code: Mutex<u32>,
    fail: AtomicBool,
}

impl MockBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with `code` from now on.
    pub fn set_code(&self, code: u32) {
        *self.code.lock() = code;
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Wait until at least `n` broadcasts were made; `false` on timeout.
    pub fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.sent.lock().len() < n {
            if start.elapsed() > timeout {
                return false
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }
}

impl TxBroadcaster for MockBroadcaster {
    fn broadcast_tx_sync(&self, raw: &[u8]) -> Result<BroadcastResponse, String> {
        info!("broadcast_tx_sync(0x{})", hex::encode(raw));
        self.sent.lock().push(raw.to_vec());
        if self.fail.load(Ordering::Acquire) {
            return Err("connection refused".into())
        }
        let code = *self.code.lock();
        Ok(BroadcastResponse {
            code,
            log: if code == 0 { String::new() } else { "rejected".into() },
        })
    }
}

pub fn test_key(seed: u8) -> libsecp256k1::SecretKey {
    let mut raw = [seed; 32];
    raw[0] = 1;
    libsecp256k1::SecretKey::parse(&raw).unwrap_or_default()
}

pub fn test_addr(seed: u8) -> Addr {
    key_to_addr(&test_key(seed))
}

/// A signed EIP-1559 value transfer on [CHAIN_ID].
pub fn signed_transfer(
    key: &libsecp256k1::SecretKey, nonce: u64, tip: u64, fee_cap: u64,
) -> Transaction {
    let tx = Transaction::dynamic_fee(
        CHAIN_ID,
        nonce,
        tip.into(),
        fee_cap.into(),
        TRANSFER_GAS,
        Some(Addr::from([0xee; 20])),
        1u64.into(),
        Bytes::empty(),
    );
    match tx.sign(key) {
        Ok(tx) => tx,
        Err(e) => panic!("signing failed: {}", e),
    }
}

/// A successful block on top of `parent` (genesis when `None`) holding `txs`, with receipts
/// charging [TRANSFER_GAS] each. Returns the block, its receipts and the metered gas.
pub fn make_block(
    parent: Option<&Block>, txs: Vec<Transaction>,
) -> (Block, Vec<Receipt>, Vec<Gas>) {
    let outcomes: Vec<_> = txs
        .iter()
        .map(|_| TxOutcome {
            status: 1,
            gas_metered: TRANSFER_GAS,
            logs: Vec::new(),
        })
        .collect();
    let receipts = build_receipts(&outcomes);
    let metered = outcomes.iter().map(|o| o.gas_metered).collect();
    let (parent_hash, number) = match parent {
        Some(p) => (*p.hash(), p.number() + 1),
        None => (Hash::default(), 0),
    };
    let header = Header::new(
        parent_hash,
        Addr::from([0xc0; 20]),
        number,
        30_000_000,
        TRANSFER_GAS * txs.len() as Gas,
        1_700_000_000 + number,
        Some(7u64.into()),
    );
    (Block::new(header, txs), receipts, metered)
}

/// `n` consecutive blocks from genesis, each with one transfer from `key`.
pub fn make_chain(
    key: &libsecp256k1::SecretKey, n: u64,
) -> Vec<(Block, Vec<Receipt>, Vec<Gas>)> {
    let mut chain: Vec<(Block, Vec<Receipt>, Vec<Gas>)> = Vec::new();
    for i in 0..n {
        let txs = if i == 0 {
            Vec::new()
        } else {
            vec![signed_transfer(key, i - 1, 2, 100)]
        };
        let next = make_block(chain.last().map(|(b, _, _)| b), txs);
        chain.push(next);
    }
    chain
}
