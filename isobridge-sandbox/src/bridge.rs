//! Marshaling bridge between host capabilities and guest proxies.
//!
//! Encoding walks a [`Capability`] tree and produces a [`Descriptor`]: every
//! host function is parked in the per-instance [`CapabilityTable`] and
//! replaced by a numeric handle. Root descriptors are stored as references
//! that the guest snapshots with `op_bridge_snapshot` and decodes into plain
//! objects and callable proxies (see `bootstrap.js`).
//!
//! A function handle stays alive while something holds it: the root
//! reference it was encoded under, or a guest proxy decoded from a snapshot.
//! Releasing the reference and collecting the proxies frees the host closure.
//!
//! Arguments and results cross the boundary as JSON text, so every value is
//! copied per call and no guest or host memory is shared. Both call paths
//! block the guest until the host has a result.

use crate::capability::{Capability, CapabilityObject, HostFunction};
use deno_core::{op2, Extension, OpState};
use deno_error::JsErrorBox;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Wire representation of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Descriptor {
    #[serde(rename_all = "camelCase")]
    Function { handle: u32, is_async: bool },
    /// Ordered `[name, descriptor]` pairs.
    Object { children: Vec<(String, Descriptor)> },
    Primitive { value: Value },
}

impl Descriptor {
    fn collect_handles(&self, out: &mut Vec<u32>) {
        match self {
            Descriptor::Function { handle, .. } => out.push(*handle),
            Descriptor::Object { children } => {
                for (_, child) in children {
                    child.collect_handles(out);
                }
            }
            Descriptor::Primitive { .. } => {}
        }
    }

    /// Function handles reachable from this descriptor.
    pub fn handles(&self) -> Vec<u32> {
        let mut handles = Vec::new();
        self.collect_handles(&mut handles);
        handles
    }
}

/// Live entry counts of a [`CapabilityTable`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    /// Root references not yet released by the guest.
    pub references: usize,
    /// Host functions still held by a reference or a guest proxy.
    pub functions: usize,
}

#[derive(Debug)]
struct Slot {
    function: HostFunction,
    holders: usize,
}

/// Host functions and root references owned by one sandbox instance.
#[derive(Debug, Default)]
pub struct CapabilityTable {
    functions: HashMap<u32, Slot>,
    references: HashMap<u32, Descriptor>,
    next_id: u32,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn retain(&mut self, handles: &[u32]) {
        for handle in handles {
            if let Some(slot) = self.functions.get_mut(handle) {
                slot.holders += 1;
            }
        }
    }

    fn drop_holder(&mut self, handle: u32) -> bool {
        let Some(slot) = self.functions.get_mut(&handle) else {
            return false;
        };
        slot.holders = slot.holders.saturating_sub(1);
        if slot.holders == 0 {
            self.functions.remove(&handle);
        }
        true
    }

    /// Encode a capability, parking every function it contains.
    ///
    /// The parked functions have no holder yet; [`register_reference`]
    /// gives them one.
    ///
    /// [`register_reference`]: CapabilityTable::register_reference
    pub fn encode(&mut self, capability: &Capability) -> Descriptor {
        match capability {
            Capability::Function { function, is_async } => {
                let handle = self.allocate();
                self.functions.insert(
                    handle,
                    Slot {
                        function: function.clone(),
                        holders: 0,
                    },
                );
                Descriptor::Function {
                    handle,
                    is_async: *is_async,
                }
            }
            Capability::Object(object) => Descriptor::Object {
                children: object
                    .iter()
                    .map(|(name, child)| (name.to_owned(), self.encode(child)))
                    .collect(),
            },
            Capability::Primitive(value) => Descriptor::Primitive {
                value: value.clone(),
            },
        }
    }

    /// Encode an object and store it as a root reference holding its functions.
    pub fn register_reference(&mut self, object: &CapabilityObject) -> u32 {
        let descriptor = self.encode(&Capability::Object(object.clone()));
        self.retain(&descriptor.handles());
        let id = self.allocate();
        self.references.insert(id, descriptor);
        tracing::debug!(
            reference = id,
            functions = self.functions.len(),
            "registered capability reference"
        );
        id
    }

    /// The descriptor behind a live reference.
    pub fn descriptor(&self, reference: u32) -> Option<&Descriptor> {
        self.references.get(&reference)
    }

    /// Copy a reference for decoding. Every function in the copy gains a
    /// holder for the proxy the guest builds from it.
    pub fn snapshot(&mut self, reference: u32) -> Option<Descriptor> {
        let descriptor = self.references.get(&reference)?.clone();
        self.retain(&descriptor.handles());
        Some(descriptor)
    }

    /// Drop a root reference and its hold on the functions it encoded.
    pub fn release(&mut self, reference: u32) -> bool {
        let Some(descriptor) = self.references.remove(&reference) else {
            return false;
        };
        for handle in descriptor.handles() {
            self.drop_holder(handle);
        }
        true
    }

    /// A guest proxy for `handle` was collected.
    pub fn drop_proxy(&mut self, handle: u32) -> bool {
        self.drop_holder(handle)
    }

    pub fn function(&self, handle: u32) -> Option<HostFunction> {
        self.functions.get(&handle).map(|slot| slot.function.clone())
    }

    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            references: self.reference_count(),
            functions: self.function_count(),
        }
    }
}

/// Runtime that drives future-backed host functions while the guest waits.
///
/// This is the runtime of the code that created the sandbox, not the engine
/// thread's own runtime, which is blocked for the duration of the call.
pub(crate) struct HostRuntime {
    handle: tokio::runtime::Handle,
    shutdown: CancellationToken,
}

impl HostRuntime {
    pub(crate) fn new(handle: tokio::runtime::Handle, shutdown: CancellationToken) -> Self {
        Self { handle, shutdown }
    }

    /// Run `function` to completion, blocking the calling thread until it
    /// settles or the sandbox shuts down.
    fn settle(&self, function: HostFunction, args: Vec<Value>) -> anyhow::Result<Value> {
        let future = match function {
            HostFunction::Blocking(f) => return f(args),
            HostFunction::Future(f) => f(args),
        };

        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let shutdown = self.shutdown.clone();
        self.handle.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Err(anyhow::anyhow!("sandbox destroyed while awaiting host function")),
                result = future => result,
            };
            if tx.send(result).is_err() {
                tracing::trace!("engine stopped waiting for host function");
            }
        });

        rx.recv()
            .map_err(|_| anyhow::anyhow!("host runtime stopped before the call settled"))?
    }
}

fn parse_args(args: &str) -> Result<Vec<Value>, JsErrorBox> {
    serde_json::from_str(args)
        .map_err(|e| JsErrorBox::type_error(format!("arguments are not serializable: {}", e)))
}

fn encode_result(result: anyhow::Result<Value>) -> Result<String, JsErrorBox> {
    let value = result.map_err(|e| JsErrorBox::generic(format!("{:#}", e)))?;
    serde_json::to_string(&value)
        .map_err(|e| JsErrorBox::type_error(format!("result is not serializable: {}", e)))
}

fn lookup(state: &OpState, handle: u32) -> Result<HostFunction, JsErrorBox> {
    state
        .borrow::<CapabilityTable>()
        .function(handle)
        .ok_or_else(|| JsErrorBox::type_error(format!("unknown capability handle {}", handle)))
}

/// Synchronous snapshot copy of a root reference.
#[op2]
#[string]
fn op_bridge_snapshot(state: &mut OpState, #[smi] reference: u32) -> Result<String, JsErrorBox> {
    let descriptor = state
        .borrow_mut::<CapabilityTable>()
        .snapshot(reference)
        .ok_or_else(|| {
            JsErrorBox::type_error(format!("reference {} has been released", reference))
        })?;
    serde_json::to_string(&descriptor).map_err(|e| JsErrorBox::type_error(e.to_string()))
}

/// Synchronous apply of a host function that returns immediately.
#[op2]
#[string]
fn op_bridge_apply(
    state: &mut OpState,
    #[smi] handle: u32,
    #[string] args: String,
) -> Result<String, JsErrorBox> {
    let function = lookup(state, handle)?;
    let args = parse_args(&args)?;
    tracing::debug!(handle, argc = args.len(), "bridge apply");
    match function {
        HostFunction::Blocking(f) => encode_result(f(args)),
        HostFunction::Future(_) => Err(JsErrorBox::type_error(format!(
            "capability {} is asynchronous and cannot be called synchronously",
            handle
        ))),
    }
}

/// Apply of an async-tagged function: the guest gets the settled value, not
/// a promise.
#[op2]
#[string]
fn op_bridge_apply_settled(
    state: &mut OpState,
    #[smi] handle: u32,
    #[string] args: String,
) -> Result<String, JsErrorBox> {
    let function = lookup(state, handle)?;
    let args = parse_args(&args)?;
    tracing::debug!(handle, argc = args.len(), "bridge apply (settled)");
    let result = state.borrow::<HostRuntime>().settle(function, args);
    encode_result(result)
}

#[op2(fast)]
fn op_bridge_release(state: &mut OpState, #[smi] reference: u32) -> bool {
    state.borrow_mut::<CapabilityTable>().release(reference)
}

#[op2(fast)]
fn op_bridge_drop_proxy(state: &mut OpState, #[smi] handle: u32) -> bool {
    state.borrow_mut::<CapabilityTable>().drop_proxy(handle)
}

/// Extension carrying the bridge ops. The engine places the
/// [`CapabilityTable`] and the [`HostRuntime`] in the op state after the
/// runtime is built.
pub fn extension() -> Extension {
    let ops = vec![
        op_bridge_snapshot(),
        op_bridge_apply(),
        op_bridge_apply_settled(),
        op_bridge_release(),
        op_bridge_drop_proxy(),
    ];

    Extension {
        name: "isobridge_bridge",
        ops: std::borrow::Cow::Owned(ops),
        ..Default::default()
    }
}
