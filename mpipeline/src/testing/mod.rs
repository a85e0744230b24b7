//! Testing utilities for mpipeline pipelines.
//!
//! This module provides:
//! - Small demo workers, also hosted by the `mpipeline-worker` binary
//! - Lifecycle counters for asserting exactly-once construction and disposal
//! - A registry of the demo workers for process stages

mod workers;

pub use workers::{
    demo_registry, AddOne, DisposeMarker, Doubler, FailingInit, LifecycleCounters, Sleepy, ToText,
    Tracked,
};
