//! Hermetic, cached, DAG-based developer task orchestration engine.
//!
//! A pipeline is built by registering [`StepDefinition`]s (directly, or via
//! the [`pipeline::StepBuilder`] fluent API) onto a [`Pipeline`], whose
//! [`Pipeline::build_graph`] expands parametrized steps into concrete
//! instances and resolves their `requires` edges into a DAG. The
//! [`scheduler::Scheduler`] then runs the selected subset with bounded
//! parallelism, a Setup/Run phase per instance, and full
//! Blocked/Cancelled/Skipped accounting.
//!
//! Grounded on `original_source/src/wast`: `_config.py` → [`config`],
//! `_runners.py` → [`env_cache`], `_exceptions.py` → [`error`],
//! `__main__.py` → [`cli`], `__init__.py`'s registration surface →
//! [`registry`] / [`params`] / [`pipeline`].

pub mod artifacts;
pub mod cli;
pub mod config;
pub mod env_cache;
pub mod error;
pub mod graph;
pub mod params;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod scheduler;

pub use artifacts::{downcast, ArtifactBucket, ArtifactBus, ArtifactValue};
pub use config::{ColorMode, Config};
pub use env_cache::{EnvironmentCache, EnvironmentHandle, EnvironmentKey};
pub use error::{Error, Result};
pub use graph::{PipelineGraph, StepInstance};
pub use params::{ParamValue, ParameterLayer, ParameterMap};
pub use pipeline::{Pipeline, StepBuilder};
pub use registry::{Registry, StepCallable, StepDefinition, StepOutcome};
pub use runner::StepRunner;
pub use scheduler::{InstanceStatus, ScheduleReport, Scheduler};
