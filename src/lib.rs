#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod batch;
pub mod config;
pub mod dispatcher;
mod error;
pub mod graph;
pub mod jobs;
#[cfg(feature = "logging")]
pub mod logging;
pub mod render;
pub mod runner;
#[cfg(feature = "server")]
pub mod server;
pub mod settings;
pub mod store;
pub mod versions;
pub mod workflow;
pub mod workspace;

pub use crate::config::{ConfigEditor, ParamValue, PipelineConfig, parse};
pub use crate::dispatcher::{Dashboard, DispatcherHandle};
pub use crate::error::*;
pub use crate::graph::{TaskGraph, TaskNode};
pub use crate::jobs::{JobKind, JobQueue, JobRecord, JobState};
pub use crate::runner::{CancelToken, CommandRunner, TaskRunner};
pub use crate::settings::Settings;
pub use crate::store::{DataStore, DatasetInfo, MemoryStore, RestStore, StoreAddress};
pub use crate::versions::{VersionRow, VersionTable};
pub use crate::workflow::{ReconstructionSession, RunMode, RunReport, WorkflowState};
