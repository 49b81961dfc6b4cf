use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use evmhost::common::{Bytes, Hash};
use evmhost::config::Config;
use evmhost::tx::Transaction;
use evmhost::txpool::ante::{AdmissionFilter, ExecMode};
use evmhost::txpool::handler::{Handler, HandlerError};
use evmhost::txpool::iterator::PendingIterator;
use evmhost::txpool::serializer::{EnvelopeSerializer, HostEnvelope, TxSerializer};
use evmhost::txpool::{PendingSource, TxPoolError, TxStatus, TxStatusProvider};
use evmhost_tools::dummy::{
    signed_transfer, test_addr, test_key, DummyTxPool, MockBroadcaster,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn drain(it: &mut PendingIterator) -> Vec<Transaction> {
    let mut out = Vec::new();
    while let Some(envelope) = it.peek() {
        out.push(envelope.unwrap_tx().unwrap());
        it.advance();
    }
    out
}

#[test]
fn test_iterator_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (a, b) = (test_key(1), test_key(2));
    let a0 = signed_transfer(&a, 0, 30, 100);
    let a1 = signed_transfer(&a, 1, 10, 100);
    let b0 = signed_transfer(&b, 0, 20, 100);
    let mut pending = BTreeMap::new();
    pending.insert(test_addr(1), vec![a0.clone(), a1.clone()]);
    pending.insert(test_addr(2), vec![b0.clone()]);

    let mut it = PendingIterator::new(Arc::new(EnvelopeSerializer));
    assert!(it.is_empty());
    it.reset(pending, Some(5u64.into()));
    assert!(!it.is_empty());
    assert_eq!(it.peek_tx(), Some(&a0));

    let order = drain(&mut it);
    assert_eq!(order, vec![a0, b0, a1]);
    assert!(it.is_empty());
    assert!(it.peek().is_none());
    // advancing past the end is harmless
    it.advance();
    assert!(it.is_empty());
}

#[test]
fn test_iterator_base_fee() {
    let (a, b) = (test_key(1), test_key(2));
    // tip 50 capped to fee_cap - base_fee = 40
    let a0 = signed_transfer(&a, 0, 50, 50);
    let b0 = signed_transfer(&b, 0, 45, 100);
    // cannot pay the base fee: held back with everything after it
    let c0 = signed_transfer(&test_key(3), 0, 1, 5);
    let mut pending = BTreeMap::new();
    pending.insert(test_addr(1), vec![a0.clone()]);
    pending.insert(test_addr(2), vec![b0.clone()]);
    pending.insert(test_addr(3), vec![c0]);

    let mut it = PendingIterator::new(Arc::new(EnvelopeSerializer));
    it.reset(pending, Some(10u64.into()));
    assert_eq!(drain(&mut it), vec![b0, a0]);
}

/// Refuses to wrap one particular transaction.
struct Picky(Hash);

impl TxSerializer for Picky {
    fn to_host_envelope(&self, tx: &Transaction) -> Result<HostEnvelope, TxPoolError> {
        if tx.hash() == &self.0 {
            return Err(TxPoolError::Serialize("picky".into()))
        }
        EnvelopeSerializer.to_host_envelope(tx)
    }
}

#[test]
fn test_iterator_skips_unserializable() {
    let (a, b) = (test_key(1), test_key(2));
    let a0 = signed_transfer(&a, 0, 30, 100);
    let a1 = signed_transfer(&a, 1, 25, 100);
    let a2 = signed_transfer(&a, 2, 24, 100);
    let b0 = signed_transfer(&b, 0, 20, 100);
    let b1 = signed_transfer(&b, 1, 10, 100);
    let mut pending = BTreeMap::new();
    pending.insert(test_addr(1), vec![a0.clone(), a1.clone(), a2]);
    pending.insert(test_addr(2), vec![b0.clone(), b1.clone()]);

    let mut it = PendingIterator::new(Arc::new(Picky(*a1.hash())));
    it.reset(pending, None);
    // a1 fails, so a2 can never be included either
    assert_eq!(drain(&mut it), vec![a0, b0, b1]);
}

#[test]
fn test_iterator_reset() {
    let pool = DummyTxPool::new();
    let txs: Vec<_> = (0..3).map(|n| signed_transfer(&test_key(1), n, 3, 100)).collect();
    pool.add(txs.clone());

    let mut it = PendingIterator::new(Arc::new(EnvelopeSerializer));
    it.reset(pool.pending(), None);
    it.advance();
    // a new pass starts over from the pool's current view
    pool.include(&[*txs[0].hash()]);
    it.reset(pool.pending(), None);
    assert_eq!(drain(&mut it), txs[1..].to_vec());
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > TIMEOUT {
            return false
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

fn handler() -> (Arc<DummyTxPool>, Arc<MockBroadcaster>, Handler) {
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = Arc::new(DummyTxPool::new());
    let broadcaster = Arc::new(MockBroadcaster::new());
    let h = Handler::from_config(
        pool.clone(),
        broadcaster.clone(),
        Arc::new(EnvelopeSerializer),
        &Config::default(),
    );
    (pool, broadcaster, h)
}

#[test]
fn test_handler_lifecycle() {
    let (pool, broadcaster, h) = handler();
    assert!(!h.running());
    assert_eq!(h.stop(), Err(HandlerError::AlreadyStopped));

    h.start().unwrap();
    assert!(h.running());
    assert_eq!(h.start(), Err(HandlerError::AlreadyStarted));
    assert_eq!(pool.nsubscribers(), 1);

    let key = test_key(1);
    let txs = vec![signed_transfer(&key, 0, 2, 100), signed_transfer(&key, 1, 2, 100)];
    pool.add(txs.clone());
    assert!(broadcaster.wait_for(2, TIMEOUT));
    let sent: Vec<_> = broadcaster
        .sent()
        .iter()
        .map(|raw| HostEnvelope::decode(raw).unwrap().unwrap_tx().unwrap())
        .collect();
    assert_eq!(sent, txs);

    h.stop().unwrap();
    assert!(!h.running());
    assert_eq!(pool.nsubscribers(), 0);
    pool.add(vec![signed_transfer(&key, 2, 2, 100)]);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(broadcaster.sent().len(), 2);
    assert_eq!(h.stop(), Err(HandlerError::AlreadyStopped));

    // a stopped handler can be started again
    h.start().unwrap();
    pool.add(vec![signed_transfer(&key, 3, 2, 100)]);
    assert!(broadcaster.wait_for(3, TIMEOUT));
    h.stop().unwrap();
}

#[test]
fn test_handler_subscription_error() {
    let (pool, _, h) = handler();
    h.start().unwrap();
    pool.fail_subscriptions("pool closed");
    assert!(wait_until(|| !h.running()));
    assert_eq!(h.stop(), Err(HandlerError::AlreadyStopped));
    assert_eq!(pool.nsubscribers(), 0);
    h.start().unwrap();
    assert!(h.running());
    h.stop().unwrap();
}

#[test]
fn test_handler_survives_broadcast_errors() {
    let (pool, broadcaster, h) = handler();
    let key = test_key(1);
    h.start().unwrap();

    broadcaster.set_code(19);
    pool.add(vec![signed_transfer(&key, 0, 2, 100)]);
    assert!(broadcaster.wait_for(1, TIMEOUT));

    broadcaster.set_fail(true);
    pool.add(vec![signed_transfer(&key, 1, 2, 100)]);
    assert!(broadcaster.wait_for(2, TIMEOUT));

    broadcaster.set_fail(false);
    broadcaster.set_code(0);
    pool.add(vec![signed_transfer(&key, 2, 2, 100)]);
    assert!(broadcaster.wait_for(3, TIMEOUT));
    assert!(h.running());
    h.stop().unwrap();
}

#[test]
fn test_admission_filter() {
    let pool = Arc::new(DummyTxPool::new());
    let filter = AdmissionFilter::new(pool.clone());
    let tx = signed_transfer(&test_key(1), 0, 2, 100);
    let raw = EnvelopeSerializer.to_host_bytes(&tx).unwrap();

    assert_eq!(pool.status(tx.hash()), TxStatus::Unknown);
    assert_eq!(filter.ante_handle(ExecMode::ReCheck, &raw), Ok(()));
    pool.add(vec![tx.clone()]);
    assert_eq!(filter.ante_handle(ExecMode::ReCheck, &raw), Ok(()));

    pool.include(&[*tx.hash()]);
    assert_eq!(pool.status(tx.hash()), TxStatus::Included);
    assert_eq!(
        filter.ante_handle(ExecMode::ReCheck, &raw),
        Err(TxPoolError::Eject(*tx.hash()))
    );
    // never on first admission or delivery
    assert_eq!(filter.ante_handle(ExecMode::Check, &raw), Ok(()));
    assert_eq!(filter.ante_handle(ExecMode::Deliver, &raw), Ok(()));

    let foreign = HostEnvelope {
        type_url: "/bank.MsgSend".into(),
        payload: Bytes::from(tx.encode()),
    };
    assert_eq!(filter.ante_handle(ExecMode::ReCheck, &foreign.encode()), Ok(()));
    assert_eq!(filter.ante_handle(ExecMode::ReCheck, &[0xff, 0x00]), Ok(()));
}

#[test]
fn test_concurrent_start() {
    let (pool, _, h) = handler();
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..16).map(|_| s.spawn(|| h.start())).collect();
        handles.into_iter().map(|j| j.join().unwrap()).collect()
    });
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .all(|r| r.is_ok() || *r == Err(HandlerError::AlreadyStarted)));
    assert!(h.running());
    assert_eq!(pool.nsubscribers(), 1);
    h.stop().unwrap();
    assert_eq!(pool.nsubscribers(), 0);
}
