//! The capability surfaces a host ledger implements so the VM engine can run on top of it, and
//! [Host], the wiring object that holds one implementation of each.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::block::{Header, Log};
use crate::chain::{ChainCaches, ChainReader};
use crate::common::{Addr, Bytes, Hash, Wei};
use crate::historical::{HistoricalPlugin, Unsupported};
use crate::precompile::{
    ExecContext, HostEvent, LogFactory, PrecompileError, Stateful, VmHandle,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("not found")]
    NotFound,
    #[error("host is not set up")]
    NotReady,
    #[error("host is already set up")]
    AlreadySetUp,
    #[error("precompile already registered at {0}")]
    DuplicatePrecompile(Addr),
    #[error("no precompile at {0}")]
    NoPrecompile(Addr),
    #[error("insufficient balance of {0}")]
    InsufficientBalance(Addr),
    #[error(transparent)]
    Precompile(#[from] PrecompileError),
    #[error("host: {0}")]
    Other(String),
}

/// Block headers as recorded by the host.
pub trait BlockPlugin: Send + Sync {
    fn get_header_by_number(&self, number: u64) -> Result<Header, HostError>;
    fn get_header_by_hash(&self, hash: &Hash) -> Result<Header, HostError>;
}

/// Account access used by native handlers.
#[async_trait]
pub trait StatePlugin: Send + Sync {
    async fn get_balance(&self, account: &Addr) -> Wei;
    async fn transfer(
        &self, from: &Addr, to: &Addr, amount: &Wei,
    ) -> Result<(), HostError>;
    fn add_log(&self, log: Log);
    /// Record an event emitted host-side; it surfaces to the VM as a log built by the bound
    /// factory.
    fn emit_host_event(&self, event: HostEvent) -> Result<(), HostError>;
    fn set_precompile_log_factory(&self, factory: Arc<LogFactory>);
}

pub trait PrecompilePlugin: Send + Sync {
    fn register(&self, precompile: Arc<Stateful>) -> Result<(), HostError>;
    fn get(&self, addr: &Addr) -> Option<Arc<Stateful>>;
    fn has(&self, addr: &Addr) -> bool {
        self.get(addr).is_some()
    }
}

#[derive(Default)]
pub struct PrecompileRegistry(RwLock<HashMap<Addr, Arc<Stateful>>>);

impl PrecompileRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrecompilePlugin for PrecompileRegistry {
    fn register(&self, precompile: Arc<Stateful>) -> Result<(), HostError> {
        let mut map = self.0.write();
        let addr = *precompile.address();
        if map.contains_key(&addr) {
            return Err(HostError::DuplicatePrecompile(addr))
        }
        map.insert(addr, precompile);
        Ok(())
    }

    fn get(&self, addr: &Addr) -> Option<Arc<Stateful>> {
        self.0.read().get(addr).cloned()
    }
}

pub struct Host {
    bp: Arc<dyn BlockPlugin>,
    hp: Arc<dyn HistoricalPlugin>,
    sp: Arc<dyn StatePlugin>,
    pp: Arc<dyn PrecompilePlugin>,
    ready: Mutex<bool>,
}

impl Host {
    /// A host without history; see [Host::with_historical].
    pub fn new(
        bp: Arc<dyn BlockPlugin>, sp: Arc<dyn StatePlugin>,
        pp: Arc<dyn PrecompilePlugin>,
    ) -> Self {
        Self {
            bp,
            hp: Arc::new(Unsupported),
            sp,
            pp,
            ready: Mutex::new(false),
        }
    }

    pub fn with_historical(mut self, hp: Arc<dyn HistoricalPlugin>) -> Self {
        self.hp = hp;
        self
    }

    /// Register the native precompiles and bind their log factory into the state plugin. Must be
    /// called once before any execution entry point.
    pub fn setup(&self, precompiles: Vec<Stateful>) -> Result<(), HostError> {
        let mut ready = self.ready.lock();
        if *ready {
            return Err(HostError::AlreadySetUp)
        }
        let precompiles: Vec<_> = precompiles.into_iter().map(Arc::new).collect();
        let factory = LogFactory::new(&precompiles)?;
        let mut seen = HashSet::new();
        for p in &precompiles {
            let addr = p.address();
            if !seen.insert(*addr) || self.pp.has(addr) {
                return Err(HostError::DuplicatePrecompile(*addr))
            }
        }
        for p in precompiles.into_iter() {
            info!("host: registering precompile at {}", p.address());
            self.pp.register(p)?;
        }
        self.sp.set_precompile_log_factory(Arc::new(factory));
        *ready = true;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.lock()
    }

    pub fn ensure_ready(&self) -> Result<(), HostError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(HostError::NotReady)
        }
    }

    pub fn block_plugin(&self) -> &Arc<dyn BlockPlugin> {
        &self.bp
    }

    pub fn historical_plugin(&self) -> &Arc<dyn HistoricalPlugin> {
        &self.hp
    }

    pub fn state_plugin(&self) -> &Arc<dyn StatePlugin> {
        &self.sp
    }

    pub fn precompile_plugin(&self) -> &Arc<dyn PrecompilePlugin> {
        &self.pp
    }

    /// A chain reader over this host's block and historical plugins.
    pub fn chain_reader(&self, caches: ChainCaches) -> ChainReader {
        ChainReader::new(self.bp.clone(), self.hp.clone(), caches)
    }

    /// Execute a call into the precompile at `addr`.
    pub async fn call_precompile(
        &self, addr: &Addr, vm: Arc<dyn VmHandle>, input: &[u8], caller: Addr,
        value: Wei, read_only: bool,
    ) -> Result<Bytes, HostError> {
        self.ensure_ready()?;
        let p = self.pp.get(addr).ok_or(HostError::NoPrecompile(*addr))?;
        let ctx = ExecContext {
            state: self.sp.clone(),
            read_only,
        };
        Ok(p.run(ctx, vm, input, caller, value).await?)
    }
}
