use thiserror::Error;

use crate::workflow::WorkflowState;

/// Malformed configuration text. The editor keeps its last accepted state.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid TOML syntax.\n{0}")]
    Syntax(#[from] toml::de::Error),

    #[error("Top-level entry '{0}' is not a section; every task must be a table")]
    NotASection(String),

    #[error("Entry '{0}' of the version section must be a string")]
    InvalidVersion(String),

    #[error("'{0}' can't be a task name, names may not be empty or contain '/', '\\' or '..'")]
    InvalidTaskName(String),
}

/// A dependency cycle between tasks of a configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Cyclic configuration, tasks depend on each other: {}", .nodes.join(", "))]
pub struct CyclicConfigurationError {
    /// Tasks taking part in at least one cycle, sorted by name.
    pub nodes: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error(transparent)]
    Cyclic(#[from] CyclicConfigurationError),

    #[error("Task '{task}' declares '{key} = \"{target}\"' but no task '{target}' is configured")]
    UnknownDependency {
        task: String,
        key: String,
        target: String,
    },
}

/// Failure talking to the data store or reading what it sent back.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Request to {url} failed.\n{source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Dataset '{0}' not found")]
    NotFound(String),

    #[error("Couldn't unpack the dataset archive.\n{0}")]
    Archive(#[from] std::io::Error),

    #[error("Couldn't decode the store response.\n{0}")]
    Decode(#[from] serde_json::Error),
}

/// The task runner raised while executing a task.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Couldn't start task runner '{program}'.\n{source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Task '{task}' exited with status {code:?}")]
    Exit { task: String, code: Option<i32> },

    #[error("Task '{0}' was cancelled")]
    Cancelled(String),

    #[error("Couldn't prepare the run.\n{0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Some files of a working copy could not be sent. Already sent files stay.
#[derive(Debug, Error)]
#[error("{} of {} files failed to upload", .failures.len(), .sent + .failures.len())]
pub struct UploadError {
    pub sent: usize,
    pub failures: Vec<FileFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Can't go from {from} to {to}")]
    InvalidTransition {
        from: WorkflowState,
        to: WorkflowState,
    },

    #[error("This dataset is already reconstructed, choose 'new' or 'append' first")]
    ModeRequired,

    #[error("No task selected")]
    NoTaskSelected,

    #[error("Task '{0}' is not part of the configuration")]
    UnknownTask(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("The configuration can't be run.\n{0}")]
    Graph(#[from] GraphError),

    #[error("A job is already attached to this session")]
    Busy,

    #[error("No local copy of dataset '{0}'")]
    NoLocalCopy(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Couldn't read settings file '{path}'.\n{source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings file.\n{0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
}

/// Umbrella error returned by the dispatcher and the HTTP surface.
#[derive(Debug, Error)]
pub enum DashError {
    #[error("Session '{0}' not found")]
    UnknownSession(String),

    #[error("Job '{0}' not found")]
    UnknownJob(String),

    #[error("Invalid dataset query '{0}'.\n{1}")]
    Query(String, regex::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("Couldn't start the job pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Dispatcher is gone")]
    Disconnected,
}
