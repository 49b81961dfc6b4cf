//! Append-only store of finalized blocks and their receipts.
//!
//! Every committed block is written as one record under its number, with two secondary indexes
//! (`hash -> number` and `tx hash -> number`) and a single `version` scalar that always equals
//! the number of the latest appended block. Appends must extend the version by exactly one; a gap
//! halts the store for the rest of its lifetime.
//!
//! The store sits on top of any [KvStore]. [MemKv] is provided here; a durable RocksDB backend
//! lives in the tools crate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use thiserror::Error;

use crate::block::{Block, Receipt};
use crate::common::{be_to_u64, u64_to_be, Hash};
use crate::config::Config;

/// Namespace shared by every key of the store.
pub const NAMESPACE: &[u8] = b"historical";
pub const PREFIX_BLOCK_HASH: u8 = 0x0b;
pub const PREFIX_BLOCK_NUM: u8 = 0xbb;
pub const PREFIX_VERSION: u8 = 0x11;
pub const PREFIX_TX_HASH: u8 = 0x12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoricalError {
    #[error("not found")]
    NotFound,
    #[error("malformed historical record: {0}")]
    Decode(String),
    #[error("version skip: expected block {expected}, got {got}")]
    VersionSkip { expected: u64, got: u64 },
    #[error("version {0} has no successor")]
    VersionOverflow(u64),
    #[error("historical store halted")]
    Halted,
    #[error("block has {txs} transactions but {receipts} receipts")]
    ReceiptCount { txs: usize, receipts: usize },
    #[error("historical plugin not supported by host chain")]
    Unsupported,
    #[error("backend: {0}")]
    Backend(String),
}

impl From<DecoderError> for HistoricalError {
    fn from(e: DecoderError) -> Self {
        HistoricalError::Decode(e.to_string())
    }
}

/// A set of puts applied as one unit.
#[derive(Default, Debug)]
pub struct KvBatch {
    ops: Vec<(Vec<u8>, Vec<u8>)>,
}

impl KvBatch {
    pub fn put(&mut self, key: Vec<u8>, val: Vec<u8>) {
        self.ops.push((key, val))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.ops
    }
}

/// Key-value backend of the historical store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, HistoricalError>;
    /// Apply the whole batch atomically; it must be durable when this returns.
    fn write(&self, batch: KvBatch) -> Result<(), HistoricalError>;
}

#[derive(Default)]
pub struct MemKv(RwLock<BTreeMap<Vec<u8>, Vec<u8>>>);

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

impl KvStore for MemKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, HistoricalError> {
        Ok(self.0.read().get(key).cloned())
    }

    fn write(&self, batch: KvBatch) -> Result<(), HistoricalError> {
        let mut map = self.0.write();
        for (k, v) in batch.into_ops() {
            map.insert(k, v);
        }
        Ok(())
    }
}

/// Durable lookup of committed blocks, used by the chain reader when its caches miss.
pub trait HistoricalPlugin: Send + Sync {
    /// `false` only for [Unsupported].
    fn is_supported(&self) -> bool {
        true
    }
    fn get_block_by_number(&self, number: u64) -> Result<Block, HistoricalError>;
    fn get_block_by_hash(&self, hash: &Hash) -> Result<Block, HistoricalError>;
    /// Stored receipts of a block; derived fields are left empty.
    fn get_receipts_by_hash(
        &self, hash: &Hash,
    ) -> Result<Vec<Receipt>, HistoricalError>;
    fn get_tx_block_number(&self, tx_hash: &Hash) -> Result<u64, HistoricalError>;
}

/// The host keeps no history: every lookup misses.
#[derive(Clone, Copy, Default, Debug)]
pub struct Unsupported;

impl HistoricalPlugin for Unsupported {
    fn is_supported(&self) -> bool {
        false
    }
    fn get_block_by_number(&self, _: u64) -> Result<Block, HistoricalError> {
        Err(HistoricalError::Unsupported)
    }
    fn get_block_by_hash(&self, _: &Hash) -> Result<Block, HistoricalError> {
        Err(HistoricalError::Unsupported)
    }
    fn get_receipts_by_hash(
        &self, _: &Hash,
    ) -> Result<Vec<Receipt>, HistoricalError> {
        Err(HistoricalError::Unsupported)
    }
    fn get_tx_block_number(&self, _: &Hash) -> Result<u64, HistoricalError> {
        Err(HistoricalError::Unsupported)
    }
}

fn prefixed_key(prefix: u8, payload: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(NAMESPACE.len() + 1 + payload.len());
    key.extend_from_slice(NAMESPACE);
    key.push(prefix);
    key.extend_from_slice(payload);
    key
}

pub fn block_number_key(number: u64) -> Vec<u8> {
    prefixed_key(PREFIX_BLOCK_NUM, &u64_to_be(number))
}

pub fn block_hash_key(hash: &Hash) -> Vec<u8> {
    prefixed_key(PREFIX_BLOCK_HASH, hash.as_bytes())
}

pub fn tx_hash_key(hash: &Hash) -> Vec<u8> {
    prefixed_key(PREFIX_TX_HASH, hash.as_bytes())
}

pub fn version_key() -> Vec<u8> {
    prefixed_key(PREFIX_VERSION, &[])
}

/// What is persisted under a block number.
struct Record {
    block: Block,
    receipts: Vec<Receipt>,
}

impl Encodable for Record {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.block);
        s.append_list::<Receipt, Receipt>(&self.receipts);
    }
}

impl Decodable for Record {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        Ok(Record {
            block: rlp.val_at(0)?,
            receipts: rlp.list_at(1)?,
        })
    }
}

pub struct HistoricalStore {
    kv: Arc<dyn KvStore>,
    writer: Mutex<()>,
    halted: AtomicBool,
}

impl HistoricalStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            writer: Mutex::new(()),
            halted: AtomicBool::new(false),
        }
    }

    /// Number of the latest appended block, `None` for an empty store.
    pub fn version(&self) -> Result<Option<u64>, HistoricalError> {
        match self.kv.get(&version_key())? {
            Some(raw) => Ok(Some(decode_number(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Persist a finalized block and its stored receipts. The block must be the successor of the
    /// current version (or block 0 on an empty store); nothing is written otherwise.
    pub fn append(
        &self, block: &Block, receipts: &[Receipt],
    ) -> Result<(), HistoricalError> {
        let _guard = self.writer.lock();
        if self.is_halted() {
            return Err(HistoricalError::Halted)
        }
        let expected = match self.version()? {
            Some(v) => match v.checked_add(1) {
                Some(next) => next,
                None => {
                    self.halted.store(true, Ordering::Release);
                    error!("historical store halted: version {} has no successor", v);
                    return Err(HistoricalError::VersionOverflow(v))
                }
            },
            None => 0,
        };
        let number = block.number();
        if number != expected {
            self.halted.store(true, Ordering::Release);
            error!(
                "historical store halted: version skip (expected {}, got {} {})",
                expected,
                number,
                block.hash()
            );
            return Err(HistoricalError::VersionSkip {
                expected,
                got: number,
            })
        }
        if receipts.len() != block.txs.len() {
            return Err(HistoricalError::ReceiptCount {
                txs: block.txs.len(),
                receipts: receipts.len(),
            })
        }

        let number_be = u64_to_be(number).to_vec();
        let record = Record {
            block: block.clone(),
            receipts: receipts.to_vec(),
        };
        let mut batch = KvBatch::default();
        batch.put(block_number_key(number), rlp::encode(&record).to_vec());
        batch.put(block_hash_key(block.hash()), number_be.clone());
        for tx in &block.txs {
            batch.put(tx_hash_key(tx.hash()), number_be.clone());
        }
        batch.put(version_key(), number_be);
        self.kv.write(batch)?;
        debug!("historical: appended {}", block);
        Ok(())
    }

    fn get_record(&self, number: u64) -> Result<Record, HistoricalError> {
        let raw = self
            .kv
            .get(&block_number_key(number))?
            .ok_or(HistoricalError::NotFound)?;
        Ok(rlp::decode(&raw)?)
    }

    fn number_of(&self, key: &[u8]) -> Result<u64, HistoricalError> {
        let raw = self.kv.get(key)?.ok_or(HistoricalError::NotFound)?;
        decode_number(&raw)
    }

    /// The record the hash index points at, which must hold the block with that hash.
    fn get_record_by_hash(&self, hash: &Hash) -> Result<Record, HistoricalError> {
        let number = self.number_of(&block_hash_key(hash))?;
        let record = self.get_record(number)?;
        if record.block.hash() != hash {
            return Err(HistoricalError::Decode(format!(
                "index of {} points at block {}",
                hash,
                record.block.hash()
            )))
        }
        Ok(record)
    }
}

fn decode_number(raw: &[u8]) -> Result<u64, HistoricalError> {
    be_to_u64(raw).ok_or_else(|| {
        HistoricalError::Decode(format!(
            "expected 8-byte block number, got {} bytes",
            raw.len()
        ))
    })
}

impl HistoricalPlugin for HistoricalStore {
    fn get_block_by_number(&self, number: u64) -> Result<Block, HistoricalError> {
        Ok(self.get_record(number)?.block)
    }

    fn get_block_by_hash(&self, hash: &Hash) -> Result<Block, HistoricalError> {
        Ok(self.get_record_by_hash(hash)?.block)
    }

    fn get_receipts_by_hash(
        &self, hash: &Hash,
    ) -> Result<Vec<Receipt>, HistoricalError> {
        Ok(self.get_record_by_hash(hash)?.receipts)
    }

    fn get_tx_block_number(&self, tx_hash: &Hash) -> Result<u64, HistoricalError> {
        self.number_of(&tx_hash_key(tx_hash))
    }
}

/// Open a store over `kv` and report where it resumes.
pub fn open(kv: Arc<dyn KvStore>) -> Result<HistoricalStore, HistoricalError> {
    let store = HistoricalStore::new(kv);
    match store.version()? {
        Some(v) => info!("historical store resumes at block {}", v),
        None => info!("historical store is empty"),
    }
    Ok(store)
}

/// Open the store over `kv` unless `config` turns history off.
pub fn from_config(
    kv: Arc<dyn KvStore>, config: &Config,
) -> Result<Option<HistoricalStore>, HistoricalError> {
    if !config.historical_enabled {
        info!("historical store disabled");
        return Ok(None)
    }
    open(kv).map(Some)
}

#[cfg(test)]
fn chain_of(n: u64) -> Vec<Block> {
    use crate::block::Header;
    use crate::common::Addr;
    let mut blocks: Vec<Block> = Vec::new();
    for i in 0..n {
        let parent = blocks
            .last()
            .map(|b| *b.hash())
            .unwrap_or_default();
        blocks.push(Block::with_header(Header::new(
            parent,
            Addr::from([1; 20]),
            i,
            8_000_000,
            0,
            1_000 + i,
            None,
        )));
    }
    blocks
}

#[test]
fn test_append_and_get() {
    let store = HistoricalStore::new(Arc::new(MemKv::new()));
    assert_eq!(store.version(), Ok(None));
    for b in chain_of(3) {
        store.append(&b, &[]).unwrap();
    }
    assert_eq!(store.version(), Ok(Some(2)));
    let b1 = store.get_block_by_number(1).unwrap();
    assert_eq!(store.get_block_by_hash(b1.hash()).unwrap(), b1);
    assert_eq!(store.get_receipts_by_hash(b1.hash()), Ok(Vec::new()));
    assert_eq!(
        store.get_block_by_number(3).unwrap_err(),
        HistoricalError::NotFound
    );
    assert_eq!(
        store.get_tx_block_number(&Hash::from([7; 32])),
        Err(HistoricalError::NotFound)
    );
}

#[test]
fn test_empty_store_accepts_only_genesis() {
    let store = HistoricalStore::new(Arc::new(MemKv::new()));
    let blocks = chain_of(2);
    assert_eq!(
        store.append(&blocks[1], &[]),
        Err(HistoricalError::VersionSkip {
            expected: 0,
            got: 1
        })
    );
    assert!(store.is_halted());
    assert_eq!(store.append(&blocks[0], &[]), Err(HistoricalError::Halted));
    assert_eq!(store.version(), Ok(None));
}

#[test]
fn test_version_skip_leaves_state() {
    let kv = Arc::new(MemKv::new());
    let store = HistoricalStore::new(kv.clone());
    let blocks = chain_of(6);
    for b in &blocks[..4] {
        store.append(b, &[]).unwrap();
    }
    let nkeys = kv.len();
    assert!(matches!(
        store.append(&blocks[5], &[]),
        Err(HistoricalError::VersionSkip {
            expected: 4,
            got: 5
        })
    ));
    assert_eq!(kv.len(), nkeys);
    assert_eq!(store.version(), Ok(Some(3)));
    // reads keep working while writes are refused
    assert!(store.get_block_by_number(3).is_ok());
    assert_eq!(store.append(&blocks[4], &[]), Err(HistoricalError::Halted));
}

#[test]
fn test_malformed_record() {
    let kv = Arc::new(MemKv::new());
    let store = HistoricalStore::new(kv.clone());
    let mut batch = KvBatch::default();
    batch.put(block_number_key(0), vec![0xc3, 0x01]);
    kv.write(batch).unwrap();
    assert!(matches!(
        store.get_block_by_number(0),
        Err(HistoricalError::Decode(_))
    ));
}

#[test]
fn test_unsupported() {
    let hp = Unsupported;
    assert!(!hp.is_supported());
    assert_eq!(
        hp.get_block_by_number(0).unwrap_err(),
        HistoricalError::Unsupported
    );
}

#[test]
fn test_version_overflow_halts() {
    let kv = Arc::new(MemKv::new());
    let mut batch = KvBatch::default();
    batch.put(version_key(), u64_to_be(u64::MAX).to_vec());
    kv.write(batch).unwrap();
    let store = HistoricalStore::new(kv);
    let blocks = chain_of(1);
    assert_eq!(
        store.append(&blocks[0], &[]),
        Err(HistoricalError::VersionOverflow(u64::MAX))
    );
    assert!(store.is_halted());
    assert_eq!(store.append(&blocks[0], &[]), Err(HistoricalError::Halted));
}

#[test]
fn test_hash_index_mismatch() {
    let kv = Arc::new(MemKv::new());
    let store = HistoricalStore::new(kv.clone());
    let blocks = chain_of(3);
    for b in &blocks {
        store.append(b, &[]).unwrap();
    }
    // point block 1's hash at block 2's record
    let mut batch = KvBatch::default();
    batch.put(block_hash_key(blocks[1].hash()), u64_to_be(2).to_vec());
    kv.write(batch).unwrap();
    assert!(matches!(
        store.get_block_by_hash(blocks[1].hash()),
        Err(HistoricalError::Decode(_))
    ));
    assert!(matches!(
        store.get_receipts_by_hash(blocks[1].hash()),
        Err(HistoricalError::Decode(_))
    ));
    assert_eq!(store.get_receipts_by_hash(blocks[2].hash()), Ok(Vec::new()));
}
