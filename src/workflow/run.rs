//! The worker side of a reconstruction.
//!
//! These functions run on the job pool. They never return errors: every
//! failure ends up in the run log and in the final [`RunReport`].

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use super::{RunMode, WorkflowState};
use crate::config::{CONFIG_FILE_NAME, ParamValue, PipelineConfig};
use crate::error::{ExecutionError, FileFailure, StoreError, UploadError};
use crate::runner::{CancelToken, TaskRunner, open_log};
use crate::store::DataStore;
use crate::workspace::WorkArea;

/// Task of the external runner wiping previous outputs.
pub const CLEAN_TASK: &str = "Clean";

const LOG_EXCERPT_LINES: usize = 40;

/// Everything a worker needs to reconstruct one dataset.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub dataset_id: String,
    pub task: String,
    pub config: PipelineConfig,
    pub mode: RunMode,
    pub area: WorkArea,
}

/// Collaborators of a run.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub store: &'a dyn DataStore,
    pub runner: &'a dyn TaskRunner,
    /// Installed library versions, stamped into the configuration.
    pub libraries: &'a BTreeMap<String, String>,
    pub cancel: &'a CancelToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Done,
    Failed,
    Cancelled,
}

impl From<RunState> for WorkflowState {
    fn from(state: RunState) -> Self {
        match state {
            RunState::Done => WorkflowState::Done,
            RunState::Failed => WorkflowState::Failed,
            RunState::Cancelled => WorkflowState::Cancelled,
        }
    }
}

/// Outcome of a run, as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub message: String,
    /// Tail of the run log.
    pub log_excerpt: String,
    pub log_path: Option<Utf8PathBuf>,
    pub uploaded: usize,
    pub upload_failures: Vec<FileFailure>,
}

impl RunReport {
    fn new(state: RunState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            log_excerpt: String::new(),
            log_path: None,
            uploaded: 0,
            upload_failures: Vec::new(),
        }
    }

    /// Report of a job that died without producing one.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(RunState::Failed, message)
    }
}

/// Human-readable log of one run, shared with the task runner which appends
/// its own output to the same file.
pub struct RunLog {
    path: Utf8PathBuf,
    file: Mutex<File>,
}

impl RunLog {
    /// Starts a fresh log, replacing any log of a previous run.
    pub fn create(path: Utf8PathBuf) -> io::Result<Self> {
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let file = open_log(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn line(&self, message: impl AsRef<str>) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = writeln!(file, "[{stamp}] {}", message.as_ref()) {
            tracing::warn!(path = %self.path, "couldn't write run log: {err}");
        }
    }

    /// Last lines of the log.
    pub fn excerpt(&self) -> String {
        let text = fs::read_to_string(&self.path).unwrap_or_default();
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(LOG_EXCERPT_LINES);
        lines[start..].join("\n")
    }

    fn report(&self, state: RunState, message: impl Into<String>) -> RunReport {
        let message = message.into();
        self.line(&message);
        RunReport {
            log_excerpt: self.excerpt(),
            log_path: Some(self.path.clone()),
            ..RunReport::new(state, message)
        }
    }
}

/// Imports, optionally cleans, runs, uploads and refreshes a dataset.
///
/// `on_stage` is called when the run enters a stage, so the job record can
/// follow along.
pub fn reconstruct(
    plan: &RunPlan,
    ctx: RunContext<'_>,
    mut on_stage: impl FnMut(WorkflowState),
) -> RunReport {
    let log = match RunLog::create(plan.area.log_path(&plan.task)) {
        Ok(log) => log,
        Err(err) => return RunReport::failed(format!("Couldn't create the run log: {err}")),
    };

    log.line(format!(
        "Reconstruction of '{}' up to task '{}' in {} mode",
        plan.dataset_id, plan.task, plan.mode
    ));

    on_stage(WorkflowState::Importing);
    if let Err(err) = import(plan, ctx.store) {
        tracing::error!(dataset = %plan.dataset_id, "import failed: {err}");
        return log.report(
            RunState::Failed,
            format!("Couldn't import dataset '{}': {err}", plan.dataset_id),
        );
    }
    log.line(format!("Imported dataset into {}", plan.area.dataset_path()));

    if plan.mode == RunMode::Clean {
        on_stage(WorkflowState::Cleaning);
        if let Err(err) = clean(&plan.area, ctx, &log) {
            tracing::warn!(dataset = %plan.dataset_id, "clean failed, running anyway: {err}");
            log.line(format!("Task '{CLEAN_TASK}' failed, running anyway: {err}"));
        }
    }

    on_stage(WorkflowState::Running);
    if ctx.cancel.is_cancelled() {
        return log.report(
            RunState::Cancelled,
            format!("Task '{}' cancelled before it started", plan.task),
        );
    }

    match run_task(plan, ctx, &log) {
        Ok(()) => log.line(format!("Task '{}' completed", plan.task)),
        Err(ExecutionError::Cancelled(_)) => {
            return log.report(
                RunState::Cancelled,
                format!("Task '{}' was cancelled", plan.task),
            );
        }
        Err(err) => {
            tracing::error!(dataset = %plan.dataset_id, task = %plan.task, "task failed: {err}");
            log.line(format!("Task '{}' failed: {err}", plan.task));
            return log.report(
                RunState::Failed,
                format!(
                    "Reconstruction of '{}' failed at task '{}'. {err}",
                    plan.dataset_id, plan.task
                ),
            );
        }
    }

    on_stage(WorkflowState::Uploading);
    let uploaded = match upload(&plan.area, ctx.store, &log) {
        Ok(sent) => sent,
        Err(err) => {
            let report = log.report(
                RunState::Failed,
                format!("Upload of '{}' failed: {err}", plan.dataset_id),
            );
            return RunReport {
                uploaded: err.sent,
                upload_failures: err.failures,
                ..report
            };
        }
    };

    on_stage(WorkflowState::Refreshing);
    let mut message = format!(
        "Task '{}' completed on dataset '{}', {uploaded} files uploaded",
        plan.task, plan.dataset_id
    );
    if let Err(err) = ctx.store.refresh(&plan.dataset_id) {
        tracing::warn!(dataset = %plan.dataset_id, "refresh failed: {err}");
        message.push_str(&format!(", but the store couldn't refresh the dataset: {err}"));
    }

    RunReport {
        uploaded,
        ..log.report(RunState::Done, message)
    }
}

/// Runs the clean task on the existing local copy.
pub fn clean_local(
    plan: &RunPlan,
    ctx: RunContext<'_>,
    mut on_stage: impl FnMut(WorkflowState),
) -> RunReport {
    if !plan.area.exists() {
        return RunReport::failed(format!("No local copy of dataset '{}'", plan.dataset_id));
    }

    let log = match RunLog::create(plan.area.log_path(CLEAN_TASK)) {
        Ok(log) => log,
        Err(err) => return RunReport::failed(format!("Couldn't create the run log: {err}")),
    };

    on_stage(WorkflowState::Cleaning);
    match clean(&plan.area, ctx, &log) {
        Ok(()) => log.report(
            RunState::Done,
            format!("Cleaned local copy of '{}'", plan.dataset_id),
        ),
        Err(ExecutionError::Cancelled(_)) => log.report(RunState::Cancelled, "Clean was cancelled"),
        Err(err) => log.report(
            RunState::Failed,
            format!("Couldn't clean local copy of '{}': {err}", plan.dataset_id),
        ),
    }
}

/// Sends the existing local copy to the store and refreshes it.
pub fn upload_local(
    plan: &RunPlan,
    ctx: RunContext<'_>,
    mut on_stage: impl FnMut(WorkflowState),
) -> RunReport {
    if !plan.area.exists() {
        return RunReport::failed(format!("No local copy of dataset '{}'", plan.dataset_id));
    }

    let log = match RunLog::create(plan.area.log_path("upload")) {
        Ok(log) => log,
        Err(err) => return RunReport::failed(format!("Couldn't create the run log: {err}")),
    };

    on_stage(WorkflowState::Uploading);
    let uploaded = match upload(&plan.area, ctx.store, &log) {
        Ok(sent) => sent,
        Err(err) => {
            let message = format!("Upload of '{}' failed: {err}", plan.dataset_id);
            let report = log.report(RunState::Failed, message);
            return RunReport {
                uploaded: err.sent,
                upload_failures: err.failures,
                ..report
            };
        }
    };

    on_stage(WorkflowState::Refreshing);
    let message = match ctx.store.refresh(&plan.dataset_id) {
        Ok(()) => format!("Uploaded {uploaded} files of '{}'", plan.dataset_id),
        Err(err) => format!(
            "Uploaded {uploaded} files of '{}', but the store couldn't refresh the dataset: {err}",
            plan.dataset_id
        ),
    };

    RunReport {
        uploaded,
        ..log.report(RunState::Done, message)
    }
}

fn import(plan: &RunPlan, store: &dyn DataStore) -> Result<(), StoreError> {
    let archive = store.fetch_archive(&plan.dataset_id)?;
    plan.area.unpack(&archive)?;
    Ok(())
}

fn clean(area: &WorkArea, ctx: RunContext<'_>, log: &RunLog) -> Result<(), ExecutionError> {
    area.remove_lock()?;

    let config =
        PipelineConfig::new().with_task(CLEAN_TASK, [("no_confirm", ParamValue::Boolean(true))]);

    log.line(format!("Running task '{CLEAN_TASK}'"));
    ctx.runner
        .run(&area.dataset_path(), CLEAN_TASK, &config, log.path(), ctx.cancel)
}

fn run_task(plan: &RunPlan, ctx: RunContext<'_>, log: &RunLog) -> Result<(), ExecutionError> {
    plan.area.remove_lock()?;

    let dataset = plan.area.dataset_path();
    let config = plan.config.stamped(ctx.libraries);
    fs::write(dataset.join(CONFIG_FILE_NAME), config.to_toml_string())?;

    log.line(format!("Running task '{}'", plan.task));
    ctx.runner
        .run(&dataset, &plan.task, &config, log.path(), ctx.cancel)
}

/// Sends every file of the local copy. Files already sent stay sent when
/// others fail.
pub fn upload(area: &WorkArea, store: &dyn DataStore, log: &RunLog) -> Result<usize, UploadError> {
    let files = area.files().map_err(|err| UploadError {
        sent: 0,
        failures: vec![FileFailure {
            path: area.dataset_path().to_string(),
            reason: err.to_string(),
        }],
    })?;

    let dataset = area.dataset_path();
    let mut sent = 0;
    let mut failures = Vec::new();

    for file in files {
        let result = if file.key == CONFIG_FILE_NAME {
            fs::read_to_string(dataset.join(&file.key))
                .map_err(StoreError::from)
                .and_then(|text| store.post_config(area.dataset_id(), &text))
        } else {
            fs::read(dataset.join(&file.key))
                .map_err(StoreError::from)
                .and_then(|data| store.post_file(area.dataset_id(), &file.key, &data))
        };

        match result {
            Ok(()) => sent += 1,
            Err(err) => {
                log.line(format!("Couldn't upload '{}': {err}", file.key));
                failures.push(FileFailure {
                    path: file.key.to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }

    log.line(format!("Uploaded {sent} files"));

    if failures.is_empty() {
        Ok(sent)
    } else {
        Err(UploadError { sent, failures })
    }
}
