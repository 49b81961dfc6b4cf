use std::sync::Arc;

use evmhost::chain::{ChainBlockReader, ChainCaches, ChainReader};
use evmhost::config::Config;
use evmhost::historical::{HistoricalError, HistoricalStore, MemKv};
use evmhost::host::{Host, HostError, PrecompileRegistry};
use evmhost::processor::{ProcessError, Processor, TxOutcome};
use evmhost_tools::dummy::{
    make_chain, test_key, DummyBlockPlugin, DummyStateStore, TRANSFER_GAS,
};

type Setup = (Arc<Host>, Option<Arc<HistoricalStore>>, Processor, Arc<ChainReader>);

fn setup(with_history: bool) -> Setup {
    let _ = env_logger::builder().is_test(true).try_init();
    let chain = make_chain(&test_key(1), 1);
    let mut host = Host::new(
        Arc::new(DummyBlockPlugin::with_genesis(chain[0].0.header.clone())),
        Arc::new(DummyStateStore::new()),
        Arc::new(PrecompileRegistry::new()),
    );
    let store = if with_history {
        let store = Arc::new(HistoricalStore::new(Arc::new(MemKv::new())));
        host = host.with_historical(store.clone());
        Some(store)
    } else {
        None
    };
    let host = Arc::new(host);
    let reader = Arc::new(host.chain_reader(ChainCaches::new(&Config::default())));
    let processor = Processor::new(host.clone(), store.clone(), reader.clone());
    (host, store, processor, reader)
}

#[test]
fn test_finalize_commits() {
    let (host, store, processor, reader) = setup(true);
    let chain = make_chain(&test_key(2), 3);

    let (b0, _, _) = chain[0].clone();
    assert_eq!(
        processor.finalize(b0.clone(), &[]),
        Err(ProcessError::Host(HostError::NotReady))
    );
    host.setup(Vec::new()).unwrap();

    for (b, r, _) in chain.iter().cloned() {
        let outcomes: Vec<_> = r
            .iter()
            .map(|r| TxOutcome {
                status: r.status,
                gas_metered: r.gas_used,
                logs: r.logs.clone(),
            })
            .collect();
        processor.finalize(b, &outcomes).unwrap();
    }
    let store = store.unwrap();
    assert_eq!(store.version(), Ok(Some(2)));

    let (b2, _, _) = &chain[2];
    assert_eq!(reader.current_header(), Some(b2.header.clone()));
    let receipts = reader.get_receipts_by_hash(b2.hash()).unwrap();
    assert_eq!(receipts[0].gas_used, TRANSFER_GAS);
    assert_eq!(receipts[0].cumulative_gas_used, TRANSFER_GAS);
    assert_eq!(receipts[0].block_number, 2);
}

#[test]
fn test_commit_rejects_bad_receipts() {
    let (host, store, processor, reader) = setup(true);
    host.setup(Vec::new()).unwrap();
    let chain = make_chain(&test_key(3), 2);
    let (b0, r0, m0) = chain[0].clone();
    processor.commit(b0, r0, &m0).unwrap();

    let (b1, mut r1, m1) = chain[1].clone();
    r1[0].gas_used -= 1;
    assert!(matches!(
        processor.commit(b1.clone(), r1, &m1),
        Err(ProcessError::GasUsed { index: 0, .. })
    ));
    // nothing reached the store or the caches
    assert_eq!(store.as_ref().map(|s| s.version()), Some(Ok(Some(0))));
    assert_eq!(reader.current_header().map(|h| h.number()), Some(0));

    // a skipped block is refused by the store and never becomes the head
    let chain = make_chain(&test_key(3), 4);
    let (b3, r3, m3) = chain[3].clone();
    assert_eq!(
        processor.commit(b3, r3, &m3),
        Err(ProcessError::Historical(HistoricalError::VersionSkip {
            expected: 1,
            got: 3
        }))
    );
    assert_eq!(reader.current_header().map(|h| h.number()), Some(0));
}

#[test]
fn test_commit_without_history() {
    let (host, store, processor, reader) = setup(false);
    assert!(store.is_none());
    host.setup(Vec::new()).unwrap();
    let chain = make_chain(&test_key(4), 2);
    for (b, r, m) in chain.iter().cloned() {
        processor.commit(b, r, &m).unwrap();
    }
    let (b1, _, _) = &chain[1];
    assert_eq!(reader.get_block_by_number(1).as_deref(), Some(b1));
    assert!(reader.get_transaction_lookup(b1.txs[0].hash()).is_some());
}
