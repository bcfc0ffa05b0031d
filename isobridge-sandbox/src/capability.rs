//! Host capabilities exposed to guest code.
//!
//! A [`Capability`] is the host-side value behind a guest global or plugin:
//! a callable host function, a nested object of further capabilities, or a
//! plain JSON value. Objects keep insertion order and expose exactly the
//! entries inserted into them; nothing is inherited.

use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Host function that completes on the engine thread before returning.
pub type BlockingFn = Arc<dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

/// Host function whose result is awaited by the guest.
pub type FutureFn =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// A host callable reachable from guest code.
///
/// Host functions must not call back into the sandbox that invoked them: the
/// engine thread is busy serving the call and would never see the request.
#[derive(Clone)]
pub enum HostFunction {
    Blocking(BlockingFn),
    Future(FutureFn),
}

impl HostFunction {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        HostFunction::Blocking(Arc::new(f))
    }

    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        HostFunction::Future(Arc::new(move |args| Box::pin(f(args))))
    }

    /// Invoke the function, awaiting it if it is future-backed.
    pub async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        match self {
            HostFunction::Blocking(f) => f(args),
            HostFunction::Future(f) => f(args).await,
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostFunction::Blocking(_) => f.write_str("HostFunction::Blocking"),
            HostFunction::Future(_) => f.write_str("HostFunction::Future"),
        }
    }
}

/// A host value that can be marshaled into the sandbox.
#[derive(Debug, Clone)]
pub enum Capability {
    /// Callable from the guest. With `is_async` the call goes through the
    /// owner's runtime and the guest blocks until the future settles; it
    /// still receives a plain value.
    Function {
        function: HostFunction,
        is_async: bool,
    },
    /// Traversable object of named capabilities.
    Object(CapabilityObject),
    /// Copied into the guest as-is.
    Primitive(Value),
}

impl Capability {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Capability::Function {
            function: HostFunction::blocking(f),
            is_async: false,
        }
    }

    /// Future-backed functions are always async for the guest.
    pub fn async_function<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Capability::Function {
            function: HostFunction::future(f),
            is_async: true,
        }
    }
}

impl From<Value> for Capability {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Capability::Object(
                map.into_iter()
                    .fold(CapabilityObject::new(), |object, (name, value)| {
                        object.insert(name, Capability::from(value))
                    }),
            ),
            other => Capability::Primitive(other),
        }
    }
}

impl From<CapabilityObject> for Capability {
    fn from(object: CapabilityObject) -> Self {
        Capability::Object(object)
    }
}

/// Ordered set of named capabilities.
#[derive(Debug, Clone, Default)]
pub struct CapabilityObject {
    entries: Vec<(String, Capability)>,
}

impl CapabilityObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry. Replacing keeps the original position.
    pub fn insert(mut self, name: impl Into<String>, capability: impl Into<Capability>) -> Self {
        let name = name.into();
        let capability = capability.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = capability,
            None => self.entries.push((name, capability)),
        }
        self
    }

    pub fn function<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(name, Capability::function(f))
    }

    pub fn async_function<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.insert(name, Capability::async_function(f))
    }

    pub fn object(self, name: impl Into<String>, object: CapabilityObject) -> Self {
        self.insert(name, Capability::Object(object))
    }

    pub fn value(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, Capability::Primitive(value.into()))
    }

    /// Tag the named function as asynchronous. The guest call blocks until
    /// the host side settles, then returns the value.
    /// Entries that are missing or not functions are left alone.
    pub fn mark_async(mut self, name: &str) -> Self {
        if let Some((_, Capability::Function { is_async, .. })) =
            self.entries.iter_mut().find(|(existing, _)| existing == name)
        {
            *is_async = true;
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, capability)| capability)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Capability)> {
        self.entries
            .iter()
            .map(|(name, capability)| (name.as_str(), capability))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
