use std::sync::Arc;

use evmhost::config::Config;
use evmhost::historical::{
    self, HistoricalError, HistoricalPlugin, HistoricalStore, MemKv,
};
use evmhost_tools::dummy::{make_chain, test_key};

#[test]
fn test_commit_and_skip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let kv = Arc::new(MemKv::new());
    let store = HistoricalStore::new(kv.clone());
    let chain = make_chain(&test_key(1), 5);
    for (b, r, _) in &chain[..3] {
        store.append(b, r).unwrap();
    }
    assert_eq!(store.version(), Ok(Some(2)));

    let (b1, _, _) = &chain[1];
    let by_number = store.get_block_by_number(1).unwrap();
    let by_hash = store.get_block_by_hash(b1.hash()).unwrap();
    assert_eq!(by_number, by_hash);
    assert_eq!(&by_number, b1);
    assert_eq!(by_number.txs, b1.txs);
    assert_eq!(store.get_tx_block_number(b1.txs[0].hash()), Ok(1));

    let nkeys = kv.len();
    let (b4, r4, _) = &chain[4];
    assert_eq!(
        store.append(b4, r4),
        Err(HistoricalError::VersionSkip {
            expected: 3,
            got: 4
        })
    );
    assert_eq!(store.version(), Ok(Some(2)));
    assert_eq!(kv.len(), nkeys);
    assert_eq!(
        store.get_block_by_hash(b4.hash()),
        Err(HistoricalError::NotFound)
    );
    // the gap is permanent for this instance
    let (b3, r3, _) = &chain[3];
    assert_eq!(store.append(b3, r3), Err(HistoricalError::Halted));
}

#[test]
fn test_version_increases_by_one() {
    let store = HistoricalStore::new(Arc::new(MemKv::new()));
    let chain = make_chain(&test_key(2), 6);
    let mut last = None;
    for (b, r, _) in &chain {
        store.append(b, r).unwrap();
        let v = store.version().unwrap();
        assert_eq!(v, Some(last.map_or(0, |l: u64| l + 1)));
        last = v;
    }
    // re-appending the head is a skip backwards
    let (b5, r5, _) = &chain[5];
    assert!(matches!(
        store.append(b5, r5),
        Err(HistoricalError::VersionSkip { expected: 6, got: 5 })
    ));
}

#[test]
fn test_receipt_count_is_checked() {
    let store = HistoricalStore::new(Arc::new(MemKv::new()));
    let chain = make_chain(&test_key(3), 2);
    let (b0, r0, _) = &chain[0];
    store.append(b0, r0).unwrap();
    let (b1, _, _) = &chain[1];
    assert_eq!(
        store.append(b1, &[]),
        Err(HistoricalError::ReceiptCount {
            txs: 1,
            receipts: 0
        })
    );
    assert!(!store.is_halted());
    assert_eq!(store.version(), Ok(Some(0)));
}

#[test]
fn test_open_from_config() {
    let kv = Arc::new(MemKv::new());
    let chain = make_chain(&test_key(2), 2);
    {
        let store = historical::from_config(kv.clone(), &Config::default())
            .unwrap()
            .unwrap();
        for (b, r, _) in &chain {
            store.append(b, r).unwrap();
        }
    }
    // a reopened store picks up where the last one stopped
    let store = historical::open(kv.clone()).unwrap();
    assert_eq!(store.version(), Ok(Some(1)));

    let off = Config {
        historical_enabled: false,
        ..Default::default()
    };
    assert!(historical::from_config(kv, &off).unwrap().is_none());
}

#[test]
fn test_concurrent_appends_of_one_successor() {
    let store = HistoricalStore::new(Arc::new(MemKv::new()));
    let chain = make_chain(&test_key(3), 2);
    let (b0, r0, _) = &chain[0];
    store.append(b0, r0).unwrap();

    let (b1, r1, _) = &chain[1];
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| store.append(b1, r1)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(store.version(), Ok(Some(1)));
    assert_eq!(&store.get_block_by_number(1).unwrap(), b1);
}
