//! The typed pipeline definition.

use super::run::{start, RunPlan};
use super::PipelineRun;
use crate::config::RunOptions;
use crate::errors::{ConfigurationError, PipelineError};
use crate::pool::StageRunner;
use crate::progress::{reporter_for, ProgressReporter};
use crate::stages::{ExecutionMode, ProcessLauncher, Stage, StageDescriptor};
use crate::worker::Payload;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::BitOr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// An ordered chain of stages turning `I` into `O`.
///
/// Consecutive stages must agree on their item types, which the compiler
/// checks: [`then`](Self::then) only accepts a stage consuming `O`.
///
/// # Example
///
/// ```rust,ignore
/// use mpipeline::prelude::*;
///
/// let pipeline = Pipeline::new(Stage::thread_fn(2, "Double", |x: &i64| Ok(x * 2)))
///     .then(Stage::thread_fn(2, "AddOne", |x: &i64| Ok(x + 1)))
///     | Stage::thread_fn(1, "ToText", |x: &i64| Ok(x.to_string()));
///
/// let outputs = pipeline.run(vec![1, 2, 3], RunOptions::default())?.collect_all().await?;
/// assert_eq!(outputs, vec!["3", "5", "7"]);
/// ```
pub struct Pipeline<I: Payload, O: Payload> {
    stages: Vec<Arc<dyn StageRunner>>,
    launchers: Arc<Mutex<HashMap<usize, Arc<ProcessLauncher>>>>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I: Payload, O: Payload> Pipeline<I, O> {
    /// Creates a pipeline with a single stage.
    #[must_use]
    pub fn new(stage: Stage<I, O>) -> Self {
        let stage: Arc<dyn StageRunner> = Arc::new(stage);
        Self {
            stages: vec![stage],
            launchers: Arc::default(),
            _types: PhantomData,
        }
    }

    /// Appends a stage consuming this pipeline's output.
    #[must_use]
    pub fn then<P: Payload>(self, stage: Stage<O, P>) -> Pipeline<I, P> {
        let mut stages = self.stages;
        stages.push(Arc::new(stage));
        Pipeline {
            stages,
            launchers: self.launchers,
            _types: PhantomData,
        }
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the pipeline has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Describes every stage.
    #[must_use]
    pub fn stages(&self) -> Vec<StageDescriptor> {
        self.stages
            .iter()
            .enumerate()
            .map(|(index, stage)| stage.descriptor(index))
            .collect()
    }

    /// Validates every stage.
    ///
    /// # Errors
    ///
    /// Returns the first configuration problem found.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.stages.is_empty() {
            return Err(ConfigurationError::new("Pipeline must have at least one stage")
                .with_fix_hint("Build the pipeline with Pipeline::new(stage)."));
        }
        for (index, stage) in self.stages.iter().enumerate() {
            stage.validate(index)?;
        }
        Ok(())
    }

    /// Runs the pipeline over `inputs`.
    ///
    /// Must be called from within a Tokio runtime. Items are pulled from
    /// `inputs` on a blocking thread as the stages make room for them. When
    /// the iterator reports an exact size hint, that length is the progress
    /// total.
    ///
    /// # Errors
    ///
    /// Returns a configuration error, before any worker starts, if the
    /// pipeline or the options are invalid or no runtime is available.
    pub fn run<It>(&self, inputs: It, options: RunOptions) -> Result<PipelineRun<O>, PipelineError>
    where
        It: IntoIterator<Item = I>,
        It::IntoIter: Send + 'static,
    {
        let progress = reporter_for(&options);
        self.run_with_reporter(inputs, options, progress)
    }

    /// Runs the pipeline, reporting progress to `progress`.
    ///
    /// `options.progress` is ignored.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub fn run_with_reporter<It>(
        &self,
        inputs: It,
        options: RunOptions,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<PipelineRun<O>, PipelineError>
    where
        It: IntoIterator<Item = I>,
        It::IntoIter: Send + 'static,
    {
        self.validate()?;
        options.validate()?;
        let handle = Handle::try_current().map_err(|_| {
            ConfigurationError::new("Pipeline::run must be called from within a Tokio runtime")
                .with_fix_hint("Call it from async code or inside Runtime::enter().")
        })?;
        let launchers = self.resolve_launchers()?;

        start(
            RunPlan {
                stages: &self.stages,
                descriptors: self.stages(),
                launchers,
                options,
                progress,
                handle,
            },
            inputs.into_iter(),
        )
    }

    /// Resolves the start method of every process stage, once per stage.
    fn resolve_launchers(&self) -> Result<Vec<Option<Arc<ProcessLauncher>>>, ConfigurationError> {
        let mut cache = self.launchers.lock();
        let mut resolved = Vec::with_capacity(self.stages.len());
        for (index, stage) in self.stages.iter().enumerate() {
            let Some(method) = stage.start_method() else {
                resolved.push(None);
                continue;
            };
            if let Some(launcher) = cache.get(&index) {
                resolved.push(Some(launcher.clone()));
                continue;
            }
            let launcher = Arc::new(method.resolve(index)?);
            debug!(stage = index, program = %launcher.program.display(), "Resolved worker launcher");
            cache.insert(index, launcher.clone());
            resolved.push(Some(launcher));
        }
        Ok(resolved)
    }

    #[cfg(test)]
    pub(crate) fn cached_launchers(&self) -> usize {
        self.launchers.lock().len()
    }
}

impl<I: Payload> Pipeline<I, I> {
    /// Creates a pipeline without stages. Running it is a configuration
    /// error until a stage is added.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            stages: Vec::new(),
            launchers: Arc::default(),
            _types: PhantomData,
        }
    }
}

impl<I: Payload, O: Payload, P: Payload> BitOr<Stage<O, P>> for Pipeline<I, O> {
    type Output = Pipeline<I, P>;

    fn bitor(self, stage: Stage<O, P>) -> Pipeline<I, P> {
        self.then(stage)
    }
}

impl<I: Payload, O: Payload> Clone for Pipeline<I, O> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
            launchers: self.launchers.clone(),
            _types: PhantomData,
        }
    }
}

impl<I: Payload, O: Payload> fmt::Debug for Pipeline<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages())
            .finish()
    }
}

/// Returns true if any stage runs in worker processes.
pub(crate) fn has_process_stage(descriptors: &[StageDescriptor]) -> bool {
    descriptors.iter().any(|d| d.mode == ExecutionMode::Process)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::StartMethod;

    fn double() -> Stage<i64, i64> {
        Stage::thread_fn(2, "Double", |x: &i64| Ok(x * 2))
    }

    fn to_text() -> Stage<i64, String> {
        Stage::thread_fn(1, "ToText", |x: &i64| Ok(x.to_string()))
    }

    #[test]
    fn test_then_and_operator_build_the_same_chain() {
        let fluent = Pipeline::new(double()).then(double()).then(to_text());
        let sugar = Pipeline::new(double()) | double() | to_text();

        assert_eq!(fluent.stages(), sugar.stages());
        assert_eq!(sugar.stage_count(), 3);
        assert_eq!(sugar.stages()[2].worker_type, "ToText");
        assert_eq!(sugar.stages()[1].index, 1);
    }

    #[test]
    fn test_empty_pipeline_is_invalid() {
        let pipeline: Pipeline<i64, i64> = Pipeline::empty();
        assert!(pipeline.is_empty());
        let err = pipeline.validate().unwrap_err();
        assert!(err.message.contains("at least one stage"));

        let extended = pipeline.then(double());
        assert!(extended.validate().is_ok());
    }

    #[test]
    fn test_run_outside_runtime_is_configuration_error() {
        let pipeline = Pipeline::new(double());
        let err = pipeline.run(vec![1_i64], RunOptions::default()).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Tokio runtime"));
    }

    #[test]
    fn test_launchers_resolved_once_per_stage() {
        let process: Stage<i64, i64> = Stage::process("Doubler", 1);
        let pipeline = Pipeline::new(double()).then(process);

        let first = pipeline.resolve_launchers().unwrap();
        let second = pipeline.resolve_launchers().unwrap();

        assert!(first[0].is_none());
        assert!(Arc::ptr_eq(first[1].as_ref().unwrap(), second[1].as_ref().unwrap()));
        assert_eq!(pipeline.cached_launchers(), 1);
        assert!(has_process_stage(&pipeline.stages()));
    }

    #[test]
    fn test_unresolvable_launcher_rejected() {
        let process: Stage<i64, i64> = Stage::process("Doubler", 1)
            .with_start_method(StartMethod::program("/no/such/worker-host"));
        let err = Pipeline::new(process).resolve_launchers().unwrap_err();
        assert_eq!(err.stage_index, Some(0));
    }
}
