//! # evmhost: running an EVM engine on top of a host ledger
//!
//! The host ledger has its own consensus, its own key-value commit store and its own gossip
//! mempool. The VM engine has blocks, receipts and a price-ordered transaction pool. This crate
//! keeps the two data models apart and bridges them through explicit, cacheable lookups.
//!
//! # Overview
//! Leaf-first, the crate is made of:
//!
//! - [historical]: an append-only store of finalized blocks over any key-value backend, indexed by
//!   number, hash and transaction hash. Its `version` only ever grows by one.
//! - [chain]: the chain reader the VM engine reads blocks and receipts from. LRU caches first,
//!   then the host (for genesis), then the historical store.
//! - [host]: the capability surfaces a host implements ([host::BlockPlugin],
//!   [host::StatePlugin], [host::PrecompilePlugin], and optionally
//!   [historical::HistoricalPlugin]) and [host::Host] which wires them together.
//! - [precompile]: stateful precompiles, dispatched by 4-byte method selector.
//! - [txpool]: the transaction-pool bridge (ordered iterator for block proposals, background
//!   broadcaster into host gossip, admission filter for the host mempool).
//! - [processor]: block finalization, tying receipts, the historical store and the chain reader
//!   together.
//! - [common], [tx], [block]: the VM's basic types.
//!
//! # On the Data Flow
//!
//! ```notrust
//!        [ VM engine ] ---- execution results ----> [ Processor ]
//!             |                                        |      |
//!     <ChainBlockReader>                        append()|      | insert_block()
//!             |                                        v      |
//!             v            (miss)             [HistoricalStore]|
//!      [ ChainReader ] ---------------------> <HistoricalPlugin>
//!        |  LRU caches <-----------------------------------------'
//!        '--> (genesis) <BlockPlugin>
//!
//!     [ VM pool ] --NewTxsEvent--> [ Handler ] --broadcast_tx_sync()--> [ host gossip ]
//!          |                                                                 |
//!          '--pending()--> [ PendingIterator ] --HostEnvelope--> [ proposal builder ]
//!          '--status()---> [ AdmissionFilter ] <--- re-check ------------- '
//! ```
//!
//! No logger is installed here; everything goes through the `log` facade.

#[macro_use]
pub mod common;
pub mod block;
pub mod chain;
pub mod config;
pub mod historical;
pub mod host;
pub mod precompile;
pub mod processor;
pub mod tx;
pub mod txpool;
