use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use evmhost::block::{Block, Receipt};
use evmhost::chain::{ChainBlockReader, ChainCaches, ChainReader};
use evmhost::common::{Gas, Hash};
use evmhost::config::Config;
use evmhost::historical::{
    block_number_key, HistoricalError, HistoricalPlugin, HistoricalStore, KvBatch,
    KvStore, MemKv, Unsupported,
};
use evmhost_tools::dummy::{make_chain, test_key, DummyBlockPlugin};

/// Counts every call that reaches the historical store.
struct Counting {
    inner: HistoricalStore,
    calls: AtomicUsize,
}

impl Counting {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl HistoricalPlugin for Counting {
    fn get_block_by_number(&self, number: u64) -> Result<Block, HistoricalError> {
        self.hit();
        self.inner.get_block_by_number(number)
    }
    fn get_block_by_hash(&self, hash: &Hash) -> Result<Block, HistoricalError> {
        self.hit();
        self.inner.get_block_by_hash(hash)
    }
    fn get_receipts_by_hash(
        &self, hash: &Hash,
    ) -> Result<Vec<Receipt>, HistoricalError> {
        self.hit();
        self.inner.get_receipts_by_hash(hash)
    }
    fn get_tx_block_number(&self, tx_hash: &Hash) -> Result<u64, HistoricalError> {
        self.hit();
        self.inner.get_tx_block_number(tx_hash)
    }
}

type Chain = Vec<(Block, Vec<Receipt>, Vec<Gas>)>;

fn setup(n: u64, config: &Config) -> (Chain, Arc<MemKv>, Arc<Counting>, ChainReader) {
    let _ = env_logger::builder().is_test(true).try_init();
    let chain = make_chain(&test_key(1), n);
    let kv = Arc::new(MemKv::new());
    let store = HistoricalStore::new(kv.clone());
    for (b, r, _) in &chain {
        store.append(b, r).unwrap();
    }
    let hp = Arc::new(Counting {
        inner: store,
        calls: AtomicUsize::new(0),
    });
    let bp = Arc::new(DummyBlockPlugin::with_genesis(chain[0].0.header.clone()));
    let reader = ChainReader::new(bp, hp.clone(), ChainCaches::new(config));
    (chain, kv, hp, reader)
}

#[test]
fn test_cache_coherence() {
    let (chain, _, hp, reader) = setup(4, &Config::default());
    let b2 = &chain[2].0;

    let first = reader.get_block_by_number(2).unwrap();
    assert_eq!(hp.calls(), 1);
    assert!(reader.caches().contains_hash(b2.hash()));

    let by_hash = reader.get_block_by_hash(b2.hash()).unwrap();
    assert_eq!(hp.calls(), 1);
    let again = reader.get_block_by_number(2).unwrap();
    assert_eq!(hp.calls(), 1);

    // bit-identical whether served from the store or the cache
    assert_eq!(first.encode(), b2.encode());
    assert_eq!(by_hash.encode(), first.encode());
    assert_eq!(again.encode(), first.encode());

    // and the other way round
    let b3 = &chain[3].0;
    reader.get_block_by_hash(b3.hash()).unwrap();
    assert_eq!(hp.calls(), 2);
    reader.get_block_by_number(3).unwrap();
    assert_eq!(hp.calls(), 2);
}

#[test]
fn test_cache_eviction() {
    let config = Config {
        block_cache_size: 2,
        ..Default::default()
    };
    let (_, _, hp, reader) = setup(4, &config);
    for n in 1..4 {
        reader.get_block_by_number(n).unwrap();
    }
    assert_eq!(hp.calls(), 3);
    assert!(!reader.caches().contains_number(1));
    reader.get_block_by_number(1).unwrap();
    assert_eq!(hp.calls(), 4);
}

#[test]
fn test_genesis_and_unsupported() {
    let chain = make_chain(&test_key(1), 2);
    let genesis = chain[0].0.header.clone();
    let reader = ChainReader::new(
        Arc::new(DummyBlockPlugin::with_genesis(genesis.clone())),
        Arc::new(Unsupported),
        ChainCaches::default(),
    );
    let b0 = reader.get_block_by_number(0).unwrap();
    assert_eq!(b0.header, genesis);
    assert!(b0.txs.is_empty());
    // cached under its hash as well
    assert!(reader.get_block_by_hash(genesis.hash()).is_some());

    let b1 = &chain[1].0;
    assert!(reader.get_block_by_number(1).is_none());
    assert!(reader.get_block_by_hash(b1.hash()).is_none());
    assert!(reader.get_receipts_by_hash(b1.hash()).is_none());
    assert!(reader.get_transaction_lookup(b1.txs[0].hash()).is_none());
    assert!(!reader.has_block(b1.hash(), 1));
    assert!(reader.has_block(genesis.hash(), 0));
}

#[test]
fn test_receipts_hit_and_miss() {
    let (chain, _, hp, reader) = setup(3, &Config::default());
    let (b1, stored, _) = &chain[1];

    let miss = reader.get_receipts_by_hash(b1.hash()).unwrap();
    assert!(reader.caches().contains_receipts(b1.hash()));
    let calls = hp.calls();
    let hit = reader.get_receipts_by_hash(b1.hash()).unwrap();
    assert_eq!(hp.calls(), calls);

    assert_eq!(miss, hit);
    assert_eq!(hit[0].block_hash, *b1.hash());
    assert_eq!(hit[0].block_number, 1);
    assert_eq!(hit[0].tx_hash, *b1.txs[0].hash());
    assert_eq!(hit[0].gas_used, stored[0].gas_used);
    assert!(hit[0].contract_address.is_none());
}

#[test]
fn test_malformed_record_not_cached() {
    let (_, kv, _, reader) = setup(3, &Config::default());
    let mut batch = KvBatch::default();
    batch.put(block_number_key(2), vec![0xc2, 0x80, 0x80]);
    kv.write(batch).unwrap();

    assert!(reader.get_block_by_number(2).is_none());
    assert!(!reader.caches().contains_number(2));
    // other records are unaffected
    assert!(reader.get_block_by_number(1).is_some());
}

#[test]
fn test_tx_lookup() {
    let (chain, _, hp, reader) = setup(3, &Config::default());
    let (b2, _, _) = &chain[2];
    let tx = b2.txs[0].hash();

    let entry = reader.get_transaction_lookup(tx).unwrap();
    assert_eq!(entry.block_hash, *b2.hash());
    assert_eq!(entry.block_number, 2);
    assert_eq!(entry.index, 0);
    let calls = hp.calls();
    assert_eq!(reader.get_transaction_lookup(tx), Some(entry));
    assert_eq!(hp.calls(), calls);

    assert!(reader.get_transaction_lookup(&Hash::from([9; 32])).is_none());
}

#[test]
fn test_insert_block() {
    let chain = make_chain(&test_key(4), 2);
    let reader = ChainReader::new(
        Arc::new(DummyBlockPlugin::with_genesis(chain[0].0.header.clone())),
        Arc::new(Unsupported),
        ChainCaches::default(),
    );
    assert!(reader.current_header().is_none());

    let (b1, r1, _) = chain[1].clone();
    reader.insert_block(b1.clone(), r1);
    assert_eq!(reader.current_header(), Some(b1.header.clone()));
    assert_eq!(reader.current_block(), Some(b1.header.clone()));
    assert_eq!(reader.current_final_block(), Some(b1.header.clone()));
    assert_eq!(reader.current_safe_block(), Some(b1.header.clone()));

    // all of it is served without any historical plugin
    assert_eq!(reader.get_block(&Hash::default(), 1).as_deref(), Some(&b1));
    let receipts = reader.get_receipts_by_hash(b1.hash()).unwrap();
    assert_eq!(receipts[0].block_hash, *b1.hash());
    let entry = reader.get_transaction_lookup(b1.txs[0].hash()).unwrap();
    assert_eq!(entry.block_number, 1);
    assert!(reader.has_block_and_state(b1.hash(), 1));
}

#[test]
fn test_headers() {
    let (chain, _, _, reader) = setup(3, &Config::default());
    let genesis = &chain[0].0.header;
    assert_eq!(reader.get_header_by_number(0).as_ref(), Some(genesis));
    assert_eq!(reader.get_header_by_hash(genesis.hash()).as_ref(), Some(genesis));
    // not known to the host, found in history
    let b2 = &chain[2].0;
    assert_eq!(reader.get_header_by_number(2), Some(b2.header.clone()));
    assert_eq!(reader.get_header_by_hash(b2.hash()), Some(b2.header.clone()));
    assert!(reader.get_header_by_number(7).is_none());
}

#[test]
fn test_receipts_outlive_block_cache() {
    let config = Config {
        block_cache_size: 1,
        ..Default::default()
    };
    let chain = make_chain(&test_key(5), 4);
    let reader = ChainReader::new(
        Arc::new(DummyBlockPlugin::with_genesis(chain[0].0.header.clone())),
        Arc::new(Unsupported),
        ChainCaches::new(&config),
    );
    for (b, r, _) in chain[1..].iter().cloned() {
        reader.insert_block(b, r);
    }
    let b1 = &chain[1].0;
    assert!(!reader.caches().contains_hash(b1.hash()));
    assert!(reader.caches().contains_receipts(b1.hash()));

    let receipts = reader.get_receipts_by_hash(b1.hash()).unwrap();
    assert_eq!(receipts[0].block_hash, *b1.hash());
    assert_eq!(receipts[0].block_number, 1);
    assert_eq!(receipts[0].tx_hash, *b1.txs[0].hash());
}
