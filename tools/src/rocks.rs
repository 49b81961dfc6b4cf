use std::path::Path;

use rocksdb::{WriteBatch, WriteOptions, DB};

use evmhost::historical::{HistoricalError, KvBatch, KvStore};

/// Durable [KvStore] on RocksDB. Every batch is synced to disk before `write` returns.
pub struct RocksKv {
    db: DB,
}

fn backend(e: rocksdb::Error) -> HistoricalError {
    HistoricalError::Backend(e.to_string())
}

impl RocksKv {
    pub fn new(db: DB) -> Self {
        Self { db }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HistoricalError> {
        Ok(Self::new(DB::open_default(path).map_err(backend)?))
    }

    pub fn db(&self) -> &DB {
        &self.db
    }
}

impl KvStore for RocksKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, HistoricalError> {
        self.db.get(key).map_err(backend)
    }

    fn write(&self, batch: KvBatch) -> Result<(), HistoricalError> {
        let mut wb = WriteBatch::default();
        for (k, v) in batch.into_ops() {
            wb.put(k, v);
        }
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.write_opt(wb, &opts).map_err(backend)
    }
}
