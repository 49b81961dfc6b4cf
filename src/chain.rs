use std::num::NonZeroUsize;
use std::sync::Arc;

use log::{debug, error, info};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::block::{derive_receipts, tx_lookup_entries, Block, Header, Receipt, TxLookupEntry};
use crate::common::Hash;
use crate::config::Config;
use crate::historical::{HistoricalError, HistoricalPlugin};
use crate::host::BlockPlugin;

/// Read access to committed blocks as the VM engine needs it. Every lookup may miss; a miss is a
/// normal outcome and is reported as `None`.
pub trait ChainBlockReader: Send + Sync {
    fn current_header(&self) -> Option<Header>;
    fn current_block(&self) -> Option<Header>;
    fn current_final_block(&self) -> Option<Header>;
    fn current_safe_block(&self) -> Option<Header>;
    fn get_block(&self, hash: &Hash, number: u64) -> Option<Arc<Block>>;
    fn get_block_by_hash(&self, hash: &Hash) -> Option<Arc<Block>>;
    fn get_block_by_number(&self, number: u64) -> Option<Arc<Block>>;
    fn get_header_by_number(&self, number: u64) -> Option<Header>;
    fn get_header_by_hash(&self, hash: &Hash) -> Option<Header>;
    fn get_receipts_by_hash(&self, hash: &Hash) -> Option<Vec<Receipt>>;
    fn get_transaction_lookup(&self, tx_hash: &Hash) -> Option<TxLookupEntry>;
    fn has_block(&self, hash: &Hash, number: u64) -> bool;
    fn has_block_and_state(&self, hash: &Hash, number: u64) -> bool;
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

/// Stored receipts together with the block they are derived against.
#[derive(Clone)]
struct CachedReceipts {
    block: Arc<Block>,
    stored: Arc<Vec<Receipt>>,
}

/// The LRU caches owned by one [ChainReader]. Receipts are kept as stored (without derived
/// fields) and keyed by block hash only.
pub struct ChainCaches {
    by_number: Mutex<LruCache<u64, Arc<Block>>>,
    by_hash: Mutex<LruCache<Hash, Arc<Block>>>,
    receipts: Mutex<LruCache<Hash, CachedReceipts>>,
    tx_lookup: Mutex<LruCache<Hash, TxLookupEntry>>,
}

impl ChainCaches {
    pub fn new(config: &Config) -> Self {
        Self {
            by_number: Mutex::new(LruCache::new(capacity(config.block_cache_size))),
            by_hash: Mutex::new(LruCache::new(capacity(config.block_cache_size))),
            receipts: Mutex::new(LruCache::new(capacity(
                config.receipts_cache_size,
            ))),
            tx_lookup: Mutex::new(LruCache::new(capacity(
                config.tx_lookup_cache_size,
            ))),
        }
    }

    fn add_block(&self, block: &Arc<Block>) {
        self.by_number.lock().put(block.number(), block.clone());
        self.by_hash.lock().put(*block.hash(), block.clone());
    }

    pub fn contains_number(&self, number: u64) -> bool {
        self.by_number.lock().contains(&number)
    }

    pub fn contains_hash(&self, hash: &Hash) -> bool {
        self.by_hash.lock().contains(hash)
    }

    pub fn contains_receipts(&self, hash: &Hash) -> bool {
        self.receipts.lock().contains(hash)
    }
}

impl Default for ChainCaches {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

/// Serves [ChainBlockReader] from its caches, then from the host (genesis only), then from the
/// historical plugin.
pub struct ChainReader {
    bp: Arc<dyn BlockPlugin>,
    hp: Arc<dyn HistoricalPlugin>,
    caches: ChainCaches,
    current: RwLock<Option<Arc<Block>>>,
    finalized: RwLock<Option<Arc<Block>>>,
}

impl ChainReader {
    pub fn new(
        bp: Arc<dyn BlockPlugin>, hp: Arc<dyn HistoricalPlugin>,
        caches: ChainCaches,
    ) -> Self {
        Self {
            bp,
            hp,
            caches,
            current: RwLock::new(None),
            finalized: RwLock::new(None),
        }
    }

    pub fn caches(&self) -> &ChainCaches {
        &self.caches
    }

    /// Record a freshly committed block: it becomes the current and finalized head and every
    /// cache is warmed with it.
    pub fn insert_block(&self, block: Block, receipts: Vec<Receipt>) {
        let block = Arc::new(block);
        self.caches.add_block(&block);
        self.caches.receipts.lock().put(
            *block.hash(),
            CachedReceipts {
                block: block.clone(),
                stored: Arc::new(receipts),
            },
        );
        {
            let mut lookups = self.caches.tx_lookup.lock();
            for (h, entry) in tx_lookup_entries(&block) {
                lookups.put(h, entry);
            }
        }
        info!("chain: new head {}", block);
        *self.current.write() = Some(block.clone());
        *self.finalized.write() = Some(block);
    }

    /// Returns `false` when there is no historical plugin, so callers can bail out early.
    fn historical_available(&self) -> bool {
        if !self.hp.is_supported() {
            debug!("historical plugin not supported by host chain");
            return false
        }
        true
    }

    fn historical_miss(&self, what: &str, err: HistoricalError) {
        match err {
            HistoricalError::Decode(e) => {
                error!("failed to decode {} from historical plugin: {}", what, e)
            }
            e => debug!("failed to get {} from historical plugin: {}", what, e),
        }
    }

    fn derive(cached: &CachedReceipts) -> Option<Vec<Receipt>> {
        match derive_receipts(&cached.stored, &cached.block) {
            Ok(r) => Some(r),
            Err(e) => {
                error!("failed to derive receipts of {}: {}", cached.block.hash(), e);
                None
            }
        }
    }

    fn head(slot: &RwLock<Option<Arc<Block>>>, caches: &ChainCaches) -> Option<Header> {
        let block = slot.read().clone()?;
        caches.add_block(&block);
        Some(block.header.clone())
    }
}

impl ChainBlockReader for ChainReader {
    fn current_header(&self) -> Option<Header> {
        Self::head(&self.current, &self.caches)
    }

    fn current_block(&self) -> Option<Header> {
        Self::head(&self.current, &self.caches)
    }

    fn current_final_block(&self) -> Option<Header> {
        Self::head(&self.finalized, &self.caches)
    }

    fn current_safe_block(&self) -> Option<Header> {
        // every finalized block is safe on a host with instant finality
        self.current_final_block()
    }

    fn get_block(&self, hash: &Hash, number: u64) -> Option<Arc<Block>> {
        self.get_block_by_hash(hash)
            .or_else(|| self.get_block_by_number(number))
    }

    fn get_block_by_hash(&self, hash: &Hash) -> Option<Arc<Block>> {
        let cached = self.caches.by_hash.lock().get(hash).cloned();
        if let Some(block) = cached {
            self.caches.by_number.lock().put(block.number(), block.clone());
            return Some(block)
        }
        if !self.historical_available() {
            return None
        }
        let block = match self.hp.get_block_by_hash(hash) {
            Ok(b) => Arc::new(b),
            Err(e) => {
                self.historical_miss("block", e);
                return None
            }
        };
        self.caches.add_block(&block);
        Some(block)
    }

    fn get_block_by_number(&self, number: u64) -> Option<Arc<Block>> {
        let cached = self.caches.by_number.lock().get(&number).cloned();
        if let Some(block) = cached {
            self.caches.by_hash.lock().put(*block.hash(), block.clone());
            return Some(block)
        }
        let block = if number == 0 {
            match self.bp.get_header_by_number(0) {
                Ok(header) => Arc::new(Block::with_header(header)),
                Err(e) => {
                    debug!("failed to get genesis header from host: {}", e);
                    return None
                }
            }
        } else {
            if !self.historical_available() {
                return None
            }
            match self.hp.get_block_by_number(number) {
                Ok(b) => Arc::new(b),
                Err(e) => {
                    self.historical_miss("block", e);
                    return None
                }
            }
        };
        self.caches.add_block(&block);
        Some(block)
    }

    fn get_header_by_number(&self, number: u64) -> Option<Header> {
        match self.bp.get_header_by_number(number) {
            Ok(h) => Some(h),
            Err(_) => self
                .get_block_by_number(number)
                .map(|b| b.header.clone()),
        }
    }

    fn get_header_by_hash(&self, hash: &Hash) -> Option<Header> {
        match self.bp.get_header_by_hash(hash) {
            Ok(h) => Some(h),
            Err(_) => self.get_block_by_hash(hash).map(|b| b.header.clone()),
        }
    }

    fn get_receipts_by_hash(&self, hash: &Hash) -> Option<Vec<Receipt>> {
        let cached = self.caches.receipts.lock().get(hash).cloned();
        if let Some(cached) = cached {
            return Self::derive(&cached)
        }
        if !self.historical_available() {
            return None
        }
        let stored = match self.hp.get_receipts_by_hash(hash) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                self.historical_miss("receipts", e);
                return None
            }
        };
        let block = match self.get_block_by_hash(hash) {
            Some(b) => b,
            None => {
                error!("failed to derive receipts: block {} not found", hash);
                return None
            }
        };
        let cached = CachedReceipts { block, stored };
        let receipts = Self::derive(&cached)?;
        self.caches.receipts.lock().put(*hash, cached);
        Some(receipts)
    }

    fn get_transaction_lookup(&self, tx_hash: &Hash) -> Option<TxLookupEntry> {
        if let Some(entry) = self.caches.tx_lookup.lock().get(tx_hash) {
            return Some(*entry)
        }
        if !self.historical_available() {
            return None
        }
        let number = match self.hp.get_tx_block_number(tx_hash) {
            Ok(n) => n,
            Err(e) => {
                self.historical_miss("transaction lookup", e);
                return None
            }
        };
        let block = self.get_block_by_number(number)?;
        let entry = match block.txs.iter().position(|tx| tx.hash() == tx_hash) {
            Some(i) => TxLookupEntry {
                block_hash: *block.hash(),
                block_number: number,
                index: i as u64,
            },
            None => {
                error!(
                    "historical index places {} in block {} which does not contain it",
                    tx_hash, number
                );
                return None
            }
        };
        self.caches.tx_lookup.lock().put(*tx_hash, entry);
        Some(entry)
    }

    fn has_block(&self, hash: &Hash, number: u64) -> bool {
        self.get_block_by_number(number).is_some() ||
            self.get_block_by_hash(hash).is_some()
    }

    fn has_block_and_state(&self, hash: &Hash, number: u64) -> bool {
        // the host keeps state for every block it has
        self.has_block(hash, number)
    }
}
