//! Small workers for tests, benchmarks and the bundled worker host.

use crate::worker::{Worker, WorkerRegistry};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Doubles its input.
#[derive(Debug, Clone, Copy, Default)]
pub struct Doubler;

impl Worker for Doubler {
    type Input = i64;
    type Output = i64;

    fn process(&mut self, input: &i64) -> anyhow::Result<i64> {
        Ok(input * 2)
    }
}

/// Adds one to its input, optionally failing on one value.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AddOne {
    /// Value that makes `process` fail.
    #[serde(default)]
    pub fail_on: Option<i64>,
}

impl AddOne {
    /// An `AddOne` that fails on `value`.
    #[must_use]
    pub fn failing_on(value: i64) -> Self {
        Self {
            fail_on: Some(value),
        }
    }
}

impl Worker for AddOne {
    type Input = i64;
    type Output = i64;

    fn process(&mut self, input: &i64) -> anyhow::Result<i64> {
        if self.fail_on == Some(*input) {
            anyhow::bail!("AddOne refuses {input}");
        }
        Ok(input + 1)
    }
}

/// Renders its input as text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToText;

impl Worker for ToText {
    type Input = i64;
    type Output = String;

    fn process(&mut self, input: &i64) -> anyhow::Result<String> {
        Ok(input.to_string())
    }
}

/// Passes its input through after sleeping, longer for smaller values when
/// `skew` is set.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Sleepy {
    /// Base delay.
    #[serde(default)]
    pub millis: u64,
    /// Sleep `millis * (skew - input)` instead, clamped at zero.
    #[serde(default)]
    pub skew: Option<i64>,
}

impl Worker for Sleepy {
    type Input = i64;
    type Output = i64;

    fn process(&mut self, input: &i64) -> anyhow::Result<i64> {
        let factor = self
            .skew
            .map_or(1, |skew| u64::try_from(skew - input).unwrap_or(0));
        std::thread::sleep(Duration::from_millis(self.millis.saturating_mul(factor)));
        Ok(*input)
    }
}

/// A worker whose initialization always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingInit;

impl Worker for FailingInit {
    type Input = i64;
    type Output = i64;

    fn local_init(&mut self) -> anyhow::Result<()> {
        anyhow::bail!("FailingInit cannot start")
    }

    fn process(&mut self, input: &i64) -> anyhow::Result<i64> {
        Ok(*input)
    }
}

/// Passes its input through and leaves one file in `dir` per disposal.
#[derive(Debug, Clone, Deserialize)]
pub struct DisposeMarker {
    /// Directory receiving the marker files.
    pub dir: PathBuf,
}

impl Worker for DisposeMarker {
    type Input = i64;
    type Output = i64;

    fn process(&mut self, input: &i64) -> anyhow::Result<i64> {
        Ok(*input)
    }

    fn dispose(&mut self) -> anyhow::Result<()> {
        let name = format!("disposed-{}-{:p}", std::process::id(), self as *const Self);
        std::fs::write(self.dir.join(name), b"1")?;
        Ok(())
    }
}

/// Counts lifecycle calls across every slot of a stage.
#[derive(Debug, Default)]
pub struct LifecycleCounters {
    constructed: AtomicUsize,
    processed: AtomicUsize,
    disposed: AtomicUsize,
}

impl LifecycleCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wraps `worker` so its lifecycle is counted here. Call it inside the
    /// stage's factory: each call counts as one construction.
    pub fn track<W: Worker>(self: &Arc<Self>, worker: W) -> Tracked<W> {
        self.constructed.fetch_add(1, Ordering::SeqCst);
        Tracked {
            inner: worker,
            counters: self.clone(),
        }
    }

    /// Workers built, whether or not their `local_init` succeeded.
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    /// Calls to `process`.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Calls to `dispose`.
    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// A worker wrapped by [`LifecycleCounters::track`].
#[derive(Debug)]
pub struct Tracked<W> {
    inner: W,
    counters: Arc<LifecycleCounters>,
}

impl<W: Worker> Worker for Tracked<W> {
    type Input = W::Input;
    type Output = W::Output;

    fn local_init(&mut self) -> anyhow::Result<()> {
        self.inner.local_init()
    }

    fn process(&mut self, input: &W::Input) -> anyhow::Result<W::Output> {
        self.counters.processed.fetch_add(1, Ordering::SeqCst);
        self.inner.process(input)
    }

    fn dispose(&mut self) -> anyhow::Result<()> {
        self.counters.disposed.fetch_add(1, Ordering::SeqCst);
        self.inner.dispose()
    }
}

fn parse_args<T: for<'de> Deserialize<'de> + Default>(args: &Value) -> anyhow::Result<T> {
    if args.is_null() {
        return Ok(T::default());
    }
    Ok(T::deserialize(args)?)
}

/// Registry of every worker in this module, under its type name.
#[must_use]
pub fn demo_registry() -> WorkerRegistry {
    WorkerRegistry::new()
        .register_worker(|_: &Value| Ok(Doubler))
        .register_worker(|args: &Value| parse_args::<AddOne>(args))
        .register_worker(|_: &Value| Ok(ToText))
        .register_worker(|args: &Value| parse_args::<Sleepy>(args))
        .register_worker(|_: &Value| Ok(FailingInit))
        .register_worker(|args: &Value| Ok(DisposeMarker::deserialize(args)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_registry_names() {
        let registry = demo_registry();
        for name in ["Doubler", "AddOne", "ToText", "Sleepy", "FailingInit", "DisposeMarker"] {
            assert!(registry.contains(name), "missing {name}");
        }
    }

    #[test]
    fn test_add_one_fails_on_value() {
        let mut worker = AddOne::failing_on(5);
        assert_eq!(worker.process(&4).unwrap(), 5);
        assert_eq!(worker.process(&5).unwrap_err().to_string(), "AddOne refuses 5");
    }

    #[test]
    fn test_tracked_counts_lifecycle() {
        let counters = LifecycleCounters::new();
        let mut worker = counters.track(Doubler);
        worker.local_init().unwrap();
        worker.process(&2).unwrap();
        worker.dispose().unwrap();

        assert_eq!(
            (counters.constructed(), counters.processed(), counters.disposed()),
            (1, 1, 1)
        );
    }

    #[test]
    fn test_tracked_counts_construction_before_init() {
        let counters = LifecycleCounters::new();
        let mut worker = counters.track(FailingInit);
        assert_eq!(counters.constructed(), 1);
        assert!(worker.local_init().is_err());
        assert_eq!(counters.disposed(), 0);
    }

    #[test]
    fn test_sleepy_args() {
        let sleepy: Sleepy = parse_args(&serde_json::json!({"millis": 0, "skew": 3})).unwrap();
        assert_eq!(sleepy.skew, Some(3));
        let default: Sleepy = parse_args(&Value::Null).unwrap();
        assert_eq!(default.millis, 0);
    }
}
