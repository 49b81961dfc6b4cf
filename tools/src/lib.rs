//! Test and development helpers for `evmhost`: in-memory host plugins, a VM pool stand-in, a mock
//! broadcaster and a RocksDB backend for the historical store.

pub mod dummy;
#[cfg(feature = "rocks")]
pub mod rocks;
