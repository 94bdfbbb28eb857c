//! Execution of pipeline tasks.
//!
//! The reconstruction algorithms live in an external program. A runner
//! invokes it on a local dataset copy, sending everything it prints to the
//! run log.

use std::fs::{self, File, OpenOptions};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::ExecutionError;
use crate::workspace::file_stem;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Advisory stop request shared between a job and whoever submitted it.
///
/// Setting it never interrupts anything by itself, workers look at it
/// between stages and runners while the task runs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait TaskRunner: Send + Sync {
    /// Runs `task` on the dataset at `dataset_path`, appending its output to
    /// the file at `log_path`.
    fn run(
        &self,
        dataset_path: &Utf8Path,
        task: &str,
        config: &PipelineConfig,
        log_path: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<(), ExecutionError>;
}

/// How to invoke the external task runner.
///
/// In `args`, `{task}`, `{dataset}` and `{config}` are replaced with the task
/// name, the dataset directory and the path of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            program: "romi_run_task".into(),
            args: vec![
                "{task}".into(),
                "{dataset}".into(),
                "--config".into(),
                "{config}".into(),
            ],
        }
    }
}

/// Runs tasks by spawning the external runner program.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    settings: RunnerSettings,
}

impl CommandRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self { settings }
    }

    fn args(&self, task: &str, dataset: &Utf8Path, config: &Utf8Path) -> Vec<String> {
        self.settings
            .args
            .iter()
            .map(|arg| {
                arg.replace("{task}", task)
                    .replace("{dataset}", dataset.as_str())
                    .replace("{config}", config.as_str())
            })
            .collect()
    }
}

impl TaskRunner for CommandRunner {
    fn run(
        &self,
        dataset_path: &Utf8Path,
        task: &str,
        config: &PipelineConfig,
        log_path: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<(), ExecutionError> {
        let log = open_log(log_path)?;

        let config_path = config_path(log_path, task);
        fs::write(&config_path, config.to_toml_string())?;

        let args = self.args(task, dataset_path, &config_path);
        tracing::info!(program = %self.settings.program, ?args, "starting task runner");

        let mut child = Command::new(&self.settings.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                program: self.settings.program.clone(),
                source,
            })?;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }

            if cancel.is_cancelled() {
                tracing::warn!(task, pid = child.id(), "cancel requested, killing task runner");
                child.kill()?;
                child.wait()?;
                return Err(ExecutionError::Cancelled(task.to_string()));
            }

            thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            return Err(ExecutionError::Exit {
                task: task.to_string(),
                code: status.code(),
            });
        }

        Ok(())
    }
}

/// Opens a run log for appending, creating it and its directory if needed.
pub fn open_log(path: &Utf8Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn config_path(log_path: &Utf8Path, task: &str) -> Utf8PathBuf {
    let dir = log_path.parent().unwrap_or(Utf8Path::new("."));
    dir.join(format!("{}.toml", file_stem(task)))
}
