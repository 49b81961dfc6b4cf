//! Block finalization: the point where the VM's execution results become a committed block.

use std::sync::Arc;

use log::info;
use thiserror::Error;

use crate::block::{Block, Log, Receipt};
use crate::chain::ChainReader;
use crate::common::Gas;
use crate::historical::{HistoricalError, HistoricalStore};
use crate::host::{Host, HostError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Historical(#[from] HistoricalError),
    #[error("block has {txs} transactions but {results} results")]
    ResultCount { txs: usize, results: usize },
    #[error("receipt {index}: gas used {receipt} but {metered} metered")]
    GasUsed { index: usize, receipt: Gas, metered: Gas },
    #[error("receipt {index}: cumulative gas used {receipt}, expected {expected}")]
    CumulativeGasUsed { index: usize, receipt: Gas, expected: Gas },
    #[error("header gas used {header} does not match receipts total {total}")]
    HeaderGasUsed { header: Gas, total: Gas },
    #[error("block uses {used} gas over limit {limit}")]
    GasLimit { limit: Gas, used: Gas },
}

/// Execution result of one transaction, as reported by the VM.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxOutcome {
    pub status: u64,
    pub gas_metered: Gas,
    pub logs: Vec<Log>,
}

/// Receipts for `outcomes`, with the running gas total filled in.
pub fn build_receipts(outcomes: &[TxOutcome]) -> Vec<Receipt> {
    let mut cumulative = 0;
    outcomes
        .iter()
        .map(|o| {
            cumulative += o.gas_metered;
            Receipt::new(o.status, cumulative, o.gas_metered, o.logs.clone())
        })
        .collect()
}

/// Check `receipts` against the gas metered for each transaction of `block`.
pub fn check_receipts(
    block: &Block, receipts: &[Receipt], metered: &[Gas],
) -> Result<(), ProcessError> {
    if receipts.len() != block.txs.len() || metered.len() != block.txs.len() {
        return Err(ProcessError::ResultCount {
            txs: block.txs.len(),
            results: receipts.len().min(metered.len()),
        })
    }
    let mut total: Gas = 0;
    for (index, (r, m)) in receipts.iter().zip(metered.iter()).enumerate() {
        if r.gas_used != *m {
            return Err(ProcessError::GasUsed {
                index,
                receipt: r.gas_used,
                metered: *m,
            })
        }
        total += m;
        if r.cumulative_gas_used != total {
            return Err(ProcessError::CumulativeGasUsed {
                index,
                receipt: r.cumulative_gas_used,
                expected: total,
            })
        }
    }
    if block.header.gas_used() != total {
        return Err(ProcessError::HeaderGasUsed {
            header: block.header.gas_used(),
            total,
        })
    }
    if total > block.header.gas_limit() {
        return Err(ProcessError::GasLimit {
            limit: block.header.gas_limit(),
            used: total,
        })
    }
    Ok(())
}

pub struct Processor {
    host: Arc<Host>,
    store: Option<Arc<HistoricalStore>>,
    reader: Arc<ChainReader>,
}

impl Processor {
    /// `store` is `None` when the host keeps no history.
    pub fn new(
        host: Arc<Host>, store: Option<Arc<HistoricalStore>>,
        reader: Arc<ChainReader>,
    ) -> Self {
        Self {
            host,
            store,
            reader,
        }
    }

    /// Commit an executed block: its receipts must agree with the metered gas. The block is
    /// persisted before it becomes visible through the chain reader.
    pub fn commit(
        &self, block: Block, receipts: Vec<Receipt>, metered: &[Gas],
    ) -> Result<(), ProcessError> {
        self.host.ensure_ready()?;
        check_receipts(&block, &receipts, metered)?;
        if let Some(store) = &self.store {
            store.append(&block, &receipts)?;
        }
        info!("processor: committed {}", block);
        self.reader.insert_block(block, receipts);
        Ok(())
    }

    /// Build the receipts of `block` from the VM's outcomes and commit it.
    pub fn finalize(
        &self, block: Block, outcomes: &[TxOutcome],
    ) -> Result<(), ProcessError> {
        let receipts = build_receipts(outcomes);
        let metered: Vec<Gas> = outcomes.iter().map(|o| o.gas_metered).collect();
        self.commit(block, receipts, &metered)
    }
}

#[cfg(test)]
fn block_with(gas_used: Gas, ntxs: usize) -> Block {
    use crate::block::Header;
    use crate::common::{Addr, Bytes, Hash, Wei};
    use crate::tx::Transaction;
    let txs = (0..ntxs)
        .map(|i| {
            Transaction::legacy(
                1,
                i as u64,
                1u64.into(),
                100_000,
                Some(Addr::from([1; 20])),
                *Wei::zero(),
                Bytes::empty(),
            )
        })
        .collect();
    Block::new(
        Header::new(Hash::default(), Addr::default(), 1, 100_000, gas_used, 0, None),
        txs,
    )
}

#[test]
fn test_receipt_invariants() {
    let outcomes = vec![
        TxOutcome {
            status: 1,
            gas_metered: 21_000,
            logs: Vec::new(),
        },
        TxOutcome {
            status: 0,
            gas_metered: 30_000,
            logs: Vec::new(),
        },
    ];
    let receipts = build_receipts(&outcomes);
    assert_eq!(receipts[1].cumulative_gas_used, 51_000);
    let metered = [21_000, 30_000];
    assert_eq!(check_receipts(&block_with(51_000, 2), &receipts, &metered), Ok(()));

    assert_eq!(
        check_receipts(&block_with(51_000, 2), &receipts, &[21_000, 29_000]),
        Err(ProcessError::GasUsed {
            index: 1,
            receipt: 30_000,
            metered: 29_000
        })
    );

    let mut bad = receipts.clone();
    bad[1].cumulative_gas_used = 30_000;
    assert_eq!(
        check_receipts(&block_with(51_000, 2), &bad, &metered),
        Err(ProcessError::CumulativeGasUsed {
            index: 1,
            receipt: 30_000,
            expected: 51_000
        })
    );
    assert_eq!(
        check_receipts(&block_with(50_000, 2), &receipts, &metered),
        Err(ProcessError::HeaderGasUsed {
            header: 50_000,
            total: 51_000
        })
    );
    assert!(matches!(
        check_receipts(&block_with(0, 1), &receipts, &metered),
        Err(ProcessError::ResultCount { txs: 1, .. })
    ));
}
