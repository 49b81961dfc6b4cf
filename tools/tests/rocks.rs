use std::sync::Arc;

use evmhost::historical::{self, HistoricalError, HistoricalPlugin};
use evmhost_tools::dummy::{make_chain, test_key};
use evmhost_tools::rocks::RocksKv;

#[test]
fn test_rocks_survives_reopen() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = "./historical-rocks-test";
    let _ = rocksdb::DB::destroy(&rocksdb::Options::default(), path);
    let chain = make_chain(&test_key(1), 3);
    {
        let store = historical::open(Arc::new(RocksKv::open(path).unwrap())).unwrap();
        for (b, r, _) in &chain {
            store.append(b, r).unwrap();
        }
        assert_eq!(store.version(), Ok(Some(2)));
    }

    let store = historical::open(Arc::new(RocksKv::open(path).unwrap())).unwrap();
    assert_eq!(store.version(), Ok(Some(2)));
    let (b2, r2, _) = &chain[2];
    assert_eq!(&store.get_block_by_hash(b2.hash()).unwrap(), b2);
    assert_eq!(&store.get_receipts_by_hash(b2.hash()).unwrap(), r2);
    assert_eq!(store.get_tx_block_number(b2.txs[0].hash()), Ok(2));

    // the reopened store keeps enforcing succession
    let (b1, r1, _) = &chain[1];
    assert_eq!(
        store.append(b1, r1),
        Err(HistoricalError::VersionSkip {
            expected: 3,
            got: 1
        })
    );
    drop(store);
    rocksdb::DB::destroy(&rocksdb::Options::default(), path).unwrap();
}
