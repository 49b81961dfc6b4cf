//! Stateful precompiles: native handlers reachable from VM execution at a fixed address,
//! dispatched by the 4-byte selector that prefixes the call input.

use std::collections::hash_map::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::block::Log;
use crate::common::{selector, Addr, Bytes, Gas, Hash, Selector, Wei, SELECTOR_LEN};
use crate::host::StatePlugin;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrecompileError {
    #[error("the container has no methods")]
    NoMethods,
    #[error("duplicate method selector for {0}")]
    DuplicateSelector(String),
    #[error("input to precompile shorter than a method selector")]
    InvalidInput,
    #[error("method 0x{} not found", hex::encode(.0))]
    MethodNotFound(Selector),
    #[error("event {0} registered twice")]
    DuplicateEvent(String),
    #[error("no precompile emits event {0}")]
    UnknownEvent(String),
    #[error("write attempted in a read-only call")]
    ReadOnly,
    #[error("{0}")]
    Handler(String),
}

/// What a running VM exposes to native handlers.
pub trait VmHandle: Send + Sync {
    fn block_number(&self) -> u64;
    fn origin(&self) -> Addr;
}

/// Execution-scoped context of a precompile call.
#[derive(Clone)]
pub struct ExecContext {
    pub state: Arc<dyn StatePlugin>,
    pub read_only: bool,
}

/// Everything a handler sees besides the raw input.
#[derive(Clone)]
pub struct CallContext {
    pub ctx: ExecContext,
    pub vm: Arc<dyn VmHandle>,
    pub caller: Addr,
    pub value: Wei,
}

pub type MethodResult = Result<Bytes, PrecompileError>;

pub type MethodFn = Box<
    dyn Fn(CallContext, Bytes) -> Pin<Box<dyn Future<Output = MethodResult> + Send>>
        + Sync
        + Send,
>;

pub struct Method {
    signature: String,
    selector: Selector,
    execute: MethodFn,
}

impl Method {
    /// `signature` is the canonical ABI signature, e.g. `transfer(address,uint256)`.
    pub fn new<F, Fut>(signature: &str, f: F) -> Self
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        Self {
            signature: signature.to_string(),
            selector: selector(signature),
            execute: Box::new(move |call, input| Box::pin(f(call, input))),
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[0x{}]", self.signature, hex::encode(self.selector))
    }
}

/// An event a precompile may emit through the host, with the ABI signature of the VM log it
/// turns into.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EventSpec {
    pub kind: String,
    pub signature: String,
}

impl EventSpec {
    pub fn new(kind: &str, signature: &str) -> Self {
        Self {
            kind: kind.to_string(),
            signature: signature.to_string(),
        }
    }
}

/// An event emitted host-side by a native handler.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HostEvent {
    pub kind: String,
    pub topics: Vec<Hash>,
    pub data: Bytes,
}

/// Implemented by host-side modules that want to be callable from the VM.
pub trait StatefulImpl: Send + Sync {
    fn registry_key(&self) -> Addr;
    fn methods(self: Arc<Self>) -> Vec<Method>;
    fn events(&self) -> Vec<EventSpec> {
        Vec::new()
    }
}

/// A precompile with its method table. The table is fixed at construction.
pub struct Stateful {
    address: Addr,
    methods: HashMap<Selector, Method>,
    events: Vec<EventSpec>,
}

impl Stateful {
    pub fn new(
        address: Addr, methods: Vec<Method>, events: Vec<EventSpec>,
    ) -> Result<Self, PrecompileError> {
        if methods.is_empty() {
            return Err(PrecompileError::NoMethods)
        }
        let mut table = HashMap::new();
        for m in methods.into_iter() {
            if table.contains_key(&m.selector) {
                return Err(PrecompileError::DuplicateSelector(m.signature))
            }
            table.insert(m.selector, m);
        }
        Ok(Self {
            address,
            methods: table,
            events,
        })
    }

    pub fn from_impl(imp: Arc<dyn StatefulImpl>) -> Result<Self, PrecompileError> {
        let address = imp.registry_key();
        let events = imp.events();
        Self::new(address, imp.methods(), events)
    }

    pub fn address(&self) -> &Addr {
        &self.address
    }

    pub fn events(&self) -> &[EventSpec] {
        &self.events
    }

    pub fn method(&self, sel: &Selector) -> Option<&Method> {
        self.methods.get(sel)
    }

    /// Dispatch metering is free; handlers charge for their own work.
    pub fn required_gas(&self, _input: &[u8]) -> Gas {
        0
    }

    /// Route `input` to the method its selector names. The handler receives the whole input,
    /// selector included, and its outcome is returned as is.
    pub async fn run(
        &self, ctx: ExecContext, vm: Arc<dyn VmHandle>, input: &[u8],
        caller: Addr, value: Wei,
    ) -> MethodResult {
        if input.len() < SELECTOR_LEN {
            return Err(PrecompileError::InvalidInput)
        }
        let mut sel = [0u8; SELECTOR_LEN];
        sel.copy_from_slice(&input[..SELECTOR_LEN]);
        let method = self
            .methods
            .get(&sel)
            .ok_or(PrecompileError::MethodNotFound(sel))?;
        debug!("precompile {}: {:?} from {}", self.address, method, caller);
        let call = CallContext {
            ctx,
            vm,
            caller,
            value,
        };
        (method.execute)(call, input.into()).await
    }
}

/// Turns host events emitted by precompiles into VM logs attributed to the emitting precompile.
#[derive(Default, Debug)]
pub struct LogFactory {
    events: HashMap<String, (Addr, Hash)>,
}

impl LogFactory {
    pub fn new(precompiles: &[Arc<Stateful>]) -> Result<Self, PrecompileError> {
        let mut events = HashMap::new();
        for p in precompiles {
            for e in p.events() {
                let id = Hash::hash(e.signature.as_bytes());
                if events.insert(e.kind.clone(), (*p.address(), id)).is_some() {
                    return Err(PrecompileError::DuplicateEvent(e.kind.clone()))
                }
            }
        }
        Ok(Self { events })
    }

    pub fn build(&self, event: &HostEvent) -> Result<Log, PrecompileError> {
        let (address, id) = self
            .events
            .get(&event.kind)
            .ok_or_else(|| PrecompileError::UnknownEvent(event.kind.clone()))?;
        let mut topics = Vec::with_capacity(event.topics.len() + 1);
        topics.push(*id);
        topics.extend_from_slice(&event.topics);
        Ok(Log::new(*address, topics, event.data.clone()))
    }
}

#[cfg(test)]
fn noop(signature: &str) -> Method {
    Method::new(signature, |_, _| async { MethodResult::Ok(Bytes::empty()) })
}

#[test]
fn test_stateful_construction() {
    let addr = Addr::from([0x69; 20]);
    assert!(matches!(
        Stateful::new(addr, Vec::new(), Vec::new()),
        Err(PrecompileError::NoMethods)
    ));
    assert!(matches!(
        Stateful::new(
            addr,
            vec![noop("getBalance(address)"), noop("getBalance(address)")],
            Vec::new()
        ),
        Err(PrecompileError::DuplicateSelector(s)) if s == "getBalance(address)"
    ));
    let p = Stateful::new(
        addr,
        vec![noop("getBalance(address)"), noop("send(address,address,uint256)")],
        Vec::new(),
    )
    .unwrap();
    assert_eq!(p.required_gas(&[1, 2, 3, 4]), 0);
    assert_eq!(
        p.method(&selector("getBalance(address)"))
            .map(|m| m.signature()),
        Some("getBalance(address)")
    );
}

#[test]
fn test_log_factory() {
    let addr = Addr::from([0x69; 20]);
    let p = Arc::new(
        Stateful::new(
            addr,
            vec![noop("send(address,address,uint256)")],
            vec![EventSpec::new("transfer", "Transfer(address,address,uint256)")],
        )
        .unwrap(),
    );
    let factory = LogFactory::new(&[p.clone()]).unwrap();
    let from = Hash::from([1; 32]);
    let log = factory
        .build(&HostEvent {
            kind: "transfer".into(),
            topics: vec![from],
            data: vec![0x2a].into(),
        })
        .unwrap();
    assert_eq!(log.address, addr);
    assert_eq!(
        log.topics,
        vec![Hash::hash(b"Transfer(address,address,uint256)"), from]
    );
    assert_eq!(
        factory.build(&HostEvent {
            kind: "burn".into(),
            topics: Vec::new(),
            data: Bytes::empty(),
        }),
        Err(PrecompileError::UnknownEvent("burn".into()))
    );
    assert!(matches!(
        LogFactory::new(&[p.clone(), p]),
        Err(PrecompileError::DuplicateEvent(_))
    ));
}
