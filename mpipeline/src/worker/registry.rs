//! Named worker factories for process-mode slots.
//!
//! A worker process cannot receive a closure from its parent, so process
//! stages refer to their worker by name. The worker-host binary registers
//! every worker it can run here, and the parent passes the name plus JSON
//! arguments when it starts the process.

use super::lazy::WorkerFactory;
use super::{short_type_name, BoxedWorker, Worker};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A type-erased worker that exchanges JSON values.
pub type DynJsonWorker = BoxedWorker<Value, Value>;

type RegisteredFactory = Arc<dyn Fn(&Value) -> anyhow::Result<DynJsonWorker> + Send + Sync>;

/// Adapts a typed worker to JSON input and output.
#[derive(Debug)]
pub struct JsonWorker<W> {
    inner: W,
}

impl<W> JsonWorker<W> {
    /// Wraps a typed worker.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W> Worker for JsonWorker<W>
where
    W: Worker,
    W::Input: DeserializeOwned,
    W::Output: Serialize,
{
    type Input = Value;
    type Output = Value;

    fn local_init(&mut self) -> anyhow::Result<()> {
        self.inner.local_init()
    }

    fn process(&mut self, input: &Value) -> anyhow::Result<Value> {
        let typed = <W::Input as Deserialize>::deserialize(input)
            .map_err(|e| anyhow::anyhow!("cannot decode input for {}: {e}", short_type_name::<W>()))?;
        let output = self.inner.process(&typed)?;
        Ok(serde_json::to_value(output)?)
    }

    fn dispose(&mut self) -> anyhow::Result<()> {
        self.inner.dispose()
    }
}

/// Registry of workers a worker process can host.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    factories: HashMap<String, RegisteredFactory>,
}

impl WorkerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker under an explicit name.
    ///
    /// The factory receives the stage's JSON arguments.
    #[must_use]
    pub fn register<W, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        W: Worker,
        W::Input: DeserializeOwned,
        W::Output: Serialize,
        F: Fn(&Value) -> anyhow::Result<W> + Send + Sync + 'static,
    {
        let erased: RegisteredFactory = Arc::new(move |args: &Value| -> anyhow::Result<DynJsonWorker> {
            let worker = factory(args)?;
            Ok(Box::new(JsonWorker::new(worker)) as DynJsonWorker)
        });
        self.factories.insert(name.into(), erased);
        self
    }

    /// Registers a worker under its unqualified type name.
    #[must_use]
    pub fn register_worker<W, F>(self, factory: F) -> Self
    where
        W: Worker,
        W::Input: DeserializeOwned,
        W::Output: Serialize,
        F: Fn(&Value) -> anyhow::Result<W> + Send + Sync + 'static,
    {
        self.register(short_type_name::<W>(), factory)
    }

    /// Returns true if a worker is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Returns the registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns a slot factory that builds `name` with `args`.
    pub(crate) fn factory(&self, name: &str, args: Value) -> Option<WorkerFactory<DynJsonWorker>> {
        let registered = self.factories.get(name)?.clone();
        Some(Arc::new(move || registered(&args)))
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.names())
            .finish()
    }
}
