use std::collections::BTreeMap;

use serde::Serialize;

use super::run::{RunPlan, RunReport, RunState};
use super::{ConflictChoice, RunMode, WorkflowState};
use crate::config::{ConfigEditor, PipelineConfig};
use crate::error::{GraphError, WorkflowError};
use crate::graph::{TaskGraph, build};
use crate::jobs::JobRecord;
use crate::render::{render_svg, to_data_uri};
use crate::store::DataStore;
use crate::versions::VersionTable;
use crate::workspace::{LocalCopy, LocalFile, WorkArea};

/// One user reconstructing one dataset.
///
/// The session owns everything derived from the configuration being edited
/// and follows the job running on its behalf. It never runs anything itself,
/// [`begin_run`](Self::begin_run) hands out a [`RunPlan`] for the job queue.
#[derive(Debug)]
pub struct ReconstructionSession {
    id: String,
    dataset_id: String,
    state: WorkflowState,
    history: Vec<WorkflowState>,
    conflict: bool,
    mode: Option<RunMode>,
    versions: VersionTable,
    editor: ConfigEditor,
    graph: Result<TaskGraph, GraphError>,
    selected: Option<String>,
    job: Option<String>,
    report: Option<RunReport>,
    area: WorkArea,
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: String,
    pub dataset_id: String,
    pub state: WorkflowState,
    pub history: Vec<WorkflowState>,
    pub conflict: bool,
    pub mode: Option<RunMode>,
    pub can_run: bool,
    pub versions: VersionTable,
    pub config: String,
    pub config_error: Option<String>,
    pub graph_error: Option<String>,
    /// The graph without its roots, as an SVG data URI for `<img>` tags.
    pub graph_image: Option<String>,
    pub tasks: Vec<String>,
    pub roots: Vec<String>,
    pub leaves: Vec<String>,
    pub default_task: Option<String>,
    pub selected_task: Option<String>,
    pub job_id: Option<String>,
    pub report: Option<RunReport>,
}

impl ReconstructionSession {
    /// Loads the configuration of a dataset.
    ///
    /// A dataset without configuration starts from the default template and
    /// can run right away. A dataset with one is in conflict: the user has to
    /// choose between a new reconstruction and appending to the previous one.
    pub fn open(
        id: impl Into<String>,
        dataset_id: impl Into<String>,
        store: &dyn DataStore,
        installed: &BTreeMap<String, String>,
        area: WorkArea,
    ) -> Result<Self, WorkflowError> {
        let template = PipelineConfig::default_template();
        let mut session = Self {
            id: id.into(),
            dataset_id: dataset_id.into(),
            state: WorkflowState::Idle,
            history: vec![WorkflowState::Idle],
            conflict: false,
            mode: None,
            versions: VersionTable::default(),
            editor: ConfigEditor::from_text(PipelineConfig::default_template_text())
                .unwrap_or_else(|_| ConfigEditor::new(template)),
            graph: Ok(TaskGraph::default()),
            selected: None,
            job: None,
            report: None,
            area,
        };

        let previous = store.fetch_config(&session.dataset_id)?;
        session.transition(WorkflowState::ConfigLoaded)?;

        match previous {
            None => {
                tracing::info!(
                    dataset = %session.dataset_id,
                    "no previous configuration, using template"
                );
                session.transition(WorkflowState::NoConflict)?;
            }
            Some(text) => {
                tracing::info!(dataset = %session.dataset_id, "dataset was already reconstructed");
                if let Err(err) = session.editor.update(text) {
                    tracing::warn!(
                        dataset = %session.dataset_id,
                        "previous configuration is invalid: {err}"
                    );
                }

                let empty = BTreeMap::new();
                let previous = session.editor.accepted().version().unwrap_or(&empty);
                session.versions = VersionTable::compare(previous, installed);
                session.conflict = true;
                session.transition(WorkflowState::ConflictDetected)?;
            }
        }

        session.rebuild_graph();
        session.tidy_local();
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Every state visited, oldest first.
    pub fn history(&self) -> &[WorkflowState] {
        &self.history
    }

    pub fn has_conflict(&self) -> bool {
        self.conflict
    }

    pub fn mode(&self) -> Option<RunMode> {
        self.mode
    }

    pub fn versions(&self) -> &VersionTable {
        &self.versions
    }

    pub fn editor(&self) -> &ConfigEditor {
        &self.editor
    }

    pub fn graph(&self) -> Result<&TaskGraph, &GraphError> {
        self.graph.as_ref()
    }

    pub fn selected_task(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job.as_deref()
    }

    pub fn report(&self) -> Option<&RunReport> {
        self.report.as_ref()
    }

    pub fn area(&self) -> &WorkArea {
        &self.area
    }

    pub fn can_run(&self) -> bool {
        self.state.can_run() && self.job.is_none() && self.graph.is_ok() && self.selected.is_some()
    }

    pub fn status(&self) -> SessionStatus {
        let names = |nodes: Vec<&crate::graph::TaskNode>| -> Vec<String> {
            nodes.into_iter().map(|n| n.name.clone()).collect()
        };

        let (tasks, roots, leaves, default_task, graph_error) = match &self.graph {
            Ok(graph) => (
                graph.tasks().into_iter().map(String::from).collect(),
                names(graph.roots()),
                names(graph.leaves()),
                graph.default_task().map(String::from),
                None,
            ),
            Err(err) => (
                self.editor.accepted().task_names().map(String::from).collect(),
                Vec::new(),
                Vec::new(),
                None,
                Some(err.to_string()),
            ),
        };
        let graph_image = self.graph_svg().ok().map(|svg| to_data_uri(&svg));

        SessionStatus {
            id: self.id.clone(),
            dataset_id: self.dataset_id.clone(),
            state: self.state,
            history: self.history.clone(),
            conflict: self.conflict,
            mode: self.mode,
            can_run: self.can_run(),
            versions: self.versions.clone(),
            config: self.editor.text().to_string(),
            config_error: self.editor.error().map(String::from),
            graph_error,
            graph_image,
            tasks,
            roots,
            leaves,
            default_task,
            selected_task: self.selected.clone(),
            job_id: self.job.clone(),
            report: self.report.clone(),
        }
    }

    /// Replaces the configuration text. Returns whether the accepted
    /// configuration changed; invalid text keeps the previous one.
    pub fn edit_config(&mut self, text: impl Into<String>) -> Result<bool, WorkflowError> {
        self.ensure_idle()?;

        let changed = self.editor.update(text)?;
        if changed {
            self.rebuild_graph();
        }
        Ok(changed)
    }

    /// The graph without its roots, as an SVG document.
    pub fn graph_svg(&self) -> Result<String, GraphError> {
        match &self.graph {
            Ok(graph) => Ok(render_svg(&graph.without_roots())),
            Err(err) => Err(err.clone()),
        }
    }

    pub fn choose_mode(&mut self, choice: ConflictChoice) -> Result<(), WorkflowError> {
        self.ensure_idle()?;

        match self.state {
            WorkflowState::ConflictDetected | WorkflowState::ModeChosen => {
                self.transition(WorkflowState::ModeChosen)?;
            }
            // After a run the mode can change without going through the
            // conflict again.
            WorkflowState::Done | WorkflowState::Failed | WorkflowState::Cancelled
                if self.conflict => {}
            from => {
                return Err(WorkflowError::InvalidTransition {
                    from,
                    to: WorkflowState::ModeChosen,
                });
            }
        }

        self.mode = Some(choice.into());
        Ok(())
    }

    pub fn select_task(&mut self, task: &str) -> Result<(), WorkflowError> {
        self.ensure_idle()?;

        if !self.editor.accepted().contains_task(task) {
            return Err(WorkflowError::UnknownTask(task.to_string()));
        }
        self.selected = Some(task.to_string());
        Ok(())
    }

    /// Moves to `Importing` and returns what the job has to do.
    ///
    /// A cancelled job still owns the working area until its record says it
    /// ended, a new run waits for that.
    pub fn begin_run(&mut self) -> Result<RunPlan, WorkflowError> {
        self.ensure_detached()?;

        if self.state == WorkflowState::ConflictDetected {
            return Err(WorkflowError::ModeRequired);
        }
        if let Err(err) = &self.graph {
            return Err(err.clone().into());
        }
        let task = self.selected.clone().ok_or(WorkflowError::NoTaskSelected)?;

        self.transition(WorkflowState::Importing)?;
        self.report = None;

        let mode = self.mode.unwrap_or(RunMode::Append);
        tracing::info!(
            session = %self.id,
            dataset = %self.dataset_id,
            %task,
            %mode,
            "run requested"
        );

        Ok(RunPlan {
            dataset_id: self.dataset_id.clone(),
            task,
            config: self.editor.accepted().clone(),
            mode,
            area: self.area.clone(),
        })
    }

    pub fn attach_job(&mut self, job_id: impl Into<String>) {
        self.job = Some(job_id.into());
    }

    /// Gives up on a run that couldn't be handed to the job queue.
    pub fn abort_run(&mut self, report: RunReport) {
        if self.state == WorkflowState::Importing {
            self.push(WorkflowState::Failed);
        }
        self.report = Some(report);
        self.job = None;
    }

    /// Requests the running job to stop.
    ///
    /// The session moves to `Cancelled` right away and returns the job to
    /// signal. Whether the job really stopped shows up in its record later.
    pub fn cancel(&mut self) -> Result<Option<String>, WorkflowError> {
        self.transition(WorkflowState::Cancelled)?;
        tracing::info!(session = %self.id, "cancel requested");
        Ok(self.job.clone())
    }

    /// Catches up with the job running on behalf of this session.
    pub fn reconcile(&mut self, record: &JobRecord) {
        if self.job.as_deref() != Some(record.id.as_str()) {
            return;
        }

        if self.state != WorkflowState::Cancelled {
            if let Some(stage) = record.stage {
                self.follow(stage);
            }
        }

        if let Some(report) = &record.report {
            let target = WorkflowState::from(report.state);
            if self.state != WorkflowState::Cancelled {
                self.settle(target);
            }
            self.report = Some(report.clone());
            self.job = None;

            if report.state == RunState::Failed {
                self.tidy_local();
            }
        }
    }

    /// The record of the attached job is gone from the queue.
    pub fn forget_job(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        tracing::warn!(session = %self.id, %job, "job record expired before the session caught up");

        if self.state.is_active() {
            self.settle(WorkflowState::Failed);
            self.report = Some(RunReport::failed("The job record expired, see the server log"));
        }
    }

    /// Looks at the local copy. An empty copy is deleted.
    pub fn inspect_local(&self) -> Result<LocalCopy, WorkflowError> {
        self.ensure_detached()?;
        Ok(self.area.inspect()?)
    }

    pub fn explore_local(&self) -> Result<Vec<LocalFile>, WorkflowError> {
        if !self.area.exists() {
            return Err(WorkflowError::NoLocalCopy(self.dataset_id.clone()));
        }
        Ok(self.area.files()?)
    }

    pub fn remove_local(&self) -> Result<bool, WorkflowError> {
        self.ensure_detached()?;
        Ok(self.area.remove()?)
    }

    /// Plan of a job working on the existing local copy.
    pub fn local_plan(&self) -> Result<RunPlan, WorkflowError> {
        self.ensure_detached()?;
        if !self.area.exists() {
            return Err(WorkflowError::NoLocalCopy(self.dataset_id.clone()));
        }

        Ok(RunPlan {
            dataset_id: self.dataset_id.clone(),
            task: self.selected.clone().unwrap_or_default(),
            config: self.editor.accepted().clone(),
            mode: self.mode.unwrap_or(RunMode::Append),
            area: self.area.clone(),
        })
    }

    /// Tears the session down, deleting its working area.
    pub fn close(self) {
        if let Err(err) = self.area.remove() {
            tracing::warn!(session = %self.id, "couldn't remove working area: {err}");
        }
    }

    fn ensure_idle(&self) -> Result<(), WorkflowError> {
        if self.state.is_active() {
            return Err(WorkflowError::Busy);
        }
        Ok(())
    }

    /// Idle and no job left touching the working area.
    fn ensure_detached(&self) -> Result<(), WorkflowError> {
        self.ensure_idle()?;
        if self.job.is_some() {
            return Err(WorkflowError::Busy);
        }
        Ok(())
    }

    /// Deletes an empty local copy.
    fn tidy_local(&self) {
        if self.job.is_some() {
            return;
        }
        if let Err(err) = self.area.inspect() {
            tracing::warn!(session = %self.id, "couldn't inspect the local copy: {err}");
        }
    }

    fn rebuild_graph(&mut self) {
        self.graph = build(self.editor.accepted());

        match &self.graph {
            Ok(graph) => {
                let keep = self.selected.as_deref().is_some_and(|task| graph.contains(task));
                if !keep {
                    self.selected = graph.default_task().map(String::from);
                }
            }
            Err(err) => {
                tracing::warn!(session = %self.id, "configuration can't be run: {err}");
            }
        }
    }

    fn push(&mut self, next: WorkflowState) {
        tracing::debug!(session = %self.id, from = %self.state, to = %next, "transition");
        self.state = next;
        self.history.push(next);
    }

    fn transition(&mut self, next: WorkflowState) -> Result<(), WorkflowError> {
        if !self.state.can_transition_to(next) {
            return Err(WorkflowError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.push(next);
        Ok(())
    }

    /// Like [`follow`](Self::follow), but always lands on `target`. A job
    /// that ended is the authority on where the run stopped.
    fn settle(&mut self, target: WorkflowState) {
        self.follow(target);
        if self.state != target {
            tracing::warn!(
                session = %self.id,
                from = %self.state,
                to = %target,
                "forcing the outcome of the job"
            );
            self.push(target);
        }
    }

    /// Walks the run path up to `target`, recording the stages the job went
    /// through between two polls.
    fn follow(&mut self, target: WorkflowState) {
        if self.state == target {
            return;
        }
        if self.state.can_transition_to(target) {
            self.push(target);
            return;
        }

        let path = &WorkflowState::RUN_PATH;
        let from = path.iter().position(|s| *s == self.state);
        let to = path.iter().position(|s| *s == target);

        let (Some(from), Some(to)) = (from, to) else {
            tracing::warn!(
                session = %self.id,
                from = %self.state,
                to = %target,
                "job state out of step with session"
            );
            return;
        };

        for &stage in path.iter().take(to + 1).skip(from + 1) {
            if stage == WorkflowState::Cleaning {
                continue;
            }
            self.push(stage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseError;
    use crate::jobs::{JobKind, JobState};
    use crate::store::MemoryStore;
    use crate::workspace::WorkAreas;
    use camino::Utf8PathBuf;

    fn open(store: &MemoryStore, dataset: &str) -> (tempfile::TempDir, ReconstructionSession) {
        let dir = tempfile::tempdir().unwrap();
        let areas = WorkAreas::new(Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap());
        let installed = BTreeMap::from([("romitask".to_string(), "0.10".to_string())]);
        let session =
            ReconstructionSession::open("s1", dataset, store, &installed, areas.area("s1", dataset))
                .unwrap();
        (dir, session)
    }

    fn record(job: &str, stage: WorkflowState, report: Option<RunReport>) -> JobRecord {
        let state = match report.as_ref().map(|r| r.state) {
            None => JobState::Started,
            Some(RunState::Done) => JobState::Succeeded,
            Some(RunState::Failed) => JobState::Failed,
            Some(RunState::Cancelled) => JobState::Revoked,
        };

        JobRecord {
            id: job.into(),
            kind: JobKind::Reconstruct,
            state,
            dataset_id: "plant".into(),
            task: "B".into(),
            mode: RunMode::Append,
            owner: "s1".into(),
            stage: Some(stage),
            fingerprint: String::new(),
            received: chrono::Utc::now(),
            started: None,
            finished: None,
            report,
        }
    }

    fn reconstructed() -> MemoryStore {
        MemoryStore::new().with_dataset(
            "plant",
            [(
                "pipeline.toml",
                b"[A]\n[B]\ninput = \"A\"\n[version]\nromitask = \"0.9\"\n".as_slice(),
            )],
        )
    }

    #[test]
    fn test_open_without_configuration() {
        let store = MemoryStore::new().with_dataset("plant", [("images/0.jpg", b"0".as_slice())]);
        let (_dir, session) = open(&store, "plant");

        assert_eq!(
            session.history(),
            [
                WorkflowState::Idle,
                WorkflowState::ConfigLoaded,
                WorkflowState::NoConflict
            ]
        );
        assert!(!session.has_conflict());
        assert!(session.can_run());
        assert_eq!(session.selected_task(), Some("AnglesAndInternodes"));
        let image = session.status().graph_image.unwrap();
        assert!(image.starts_with("data:image/svg+xml;base64,"));
        assert_eq!(session.editor().accepted(), &PipelineConfig::default_template());
    }

    #[test]
    fn test_open_with_configuration() {
        let (_dir, mut session) = open(&reconstructed(), "plant");

        assert_eq!(session.state(), WorkflowState::ConflictDetected);
        assert!(!session.can_run());
        assert_eq!(session.selected_task(), Some("B"));

        let row = &session.versions().rows[0];
        assert_eq!((row.previous.as_str(), row.current.as_str()), ("0.9", "0.10"));

        assert!(matches!(session.begin_run(), Err(WorkflowError::ModeRequired)));

        session.choose_mode(ConflictChoice::New).unwrap();
        assert_eq!(session.state(), WorkflowState::ModeChosen);
        assert_eq!(session.mode(), Some(RunMode::Clean));

        let plan = session.begin_run().unwrap();
        assert_eq!(plan.mode, RunMode::Clean);
        assert_eq!(plan.task, "B");
        assert_eq!(session.state(), WorkflowState::Importing);
    }

    #[test]
    fn test_choose_mode_without_conflict() {
        let store = MemoryStore::new().with_dataset("plant", [("images/0.jpg", b"0".as_slice())]);
        let (_dir, mut session) = open(&store, "plant");

        assert!(matches!(
            session.choose_mode(ConflictChoice::Append),
            Err(WorkflowError::InvalidTransition { .. })
        ));
        assert_eq!(session.begin_run().unwrap().mode, RunMode::Append);
    }

    #[test]
    fn test_edit_keeps_last_good_configuration() {
        let (_dir, mut session) = open(&reconstructed(), "plant");

        assert!(session.edit_config("[A]\n[B]\ninput = \"A\"\n[C]\ninput = \"B\"\n").unwrap());
        assert_eq!(session.selected_task(), Some("B"));

        assert!(session.edit_config("[A\n").is_err());
        assert!(session.editor().error().is_some());
        assert_eq!(session.status().tasks, ["A", "B", "C"]);

        session.select_task("C").unwrap();
        assert!(session.edit_config("[A]\n[B]\ninput = \"A\"\n").unwrap());
        assert_eq!(session.selected_task(), Some("B"));

        assert!(matches!(
            session.select_task("Z"),
            Err(WorkflowError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_path_like_task_is_rejected() {
        let (_dir, mut session) = open(&reconstructed(), "plant");

        assert!(matches!(
            session.edit_config("[\"../../../escaped\"]\n"),
            Err(WorkflowError::Parse(ParseError::InvalidTaskName(_)))
        ));
        assert!(matches!(
            session.select_task("../../../escaped"),
            Err(WorkflowError::UnknownTask(_))
        ));
        assert_eq!(session.selected_task(), Some("B"));
    }

    #[test]
    fn test_cyclic_configuration_blocks_run() {
        let (_dir, mut session) = open(&reconstructed(), "plant");
        session.choose_mode(ConflictChoice::Append).unwrap();

        session.edit_config("[A]\ninput = \"B\"\n[B]\ninput = \"A\"\n").unwrap();

        assert!(session.graph_svg().is_err());
        assert!(session.status().graph_error.is_some());
        assert!(session.status().graph_image.is_none());
        assert!(matches!(session.begin_run(), Err(WorkflowError::Graph(_))));
        assert_eq!(session.state(), WorkflowState::ModeChosen);
    }

    #[test]
    fn test_cancel_only_while_running() {
        let store = MemoryStore::new().with_dataset("plant", [("images/0.jpg", b"0".as_slice())]);
        let (_dir, mut session) = open(&store, "plant");

        assert!(session.cancel().is_err());

        session.begin_run().unwrap();
        assert!(session.cancel().is_err());
        assert!(matches!(session.edit_config("[A]\n"), Err(WorkflowError::Busy)));

        session.follow(WorkflowState::Running);
        session.attach_job("job-1");
        assert_eq!(session.cancel().unwrap().as_deref(), Some("job-1"));
        assert_eq!(session.state(), WorkflowState::Cancelled);

        // The job may still be running, it keeps the working area.
        assert!(!session.can_run());
        assert!(matches!(session.begin_run(), Err(WorkflowError::Busy)));
        assert!(matches!(session.remove_local(), Err(WorkflowError::Busy)));

        let cancelled = RunReport {
            state: RunState::Cancelled,
            ..RunReport::failed("Task 'B' was cancelled")
        };
        session.reconcile(&record("job-1", WorkflowState::Running, Some(cancelled)));
        assert_eq!(session.state(), WorkflowState::Cancelled);
        assert!(session.job_id().is_none());
        assert!(session.can_run());
        session.begin_run().unwrap();
    }

    #[test]
    fn test_failure_while_cleaning_ends_run() {
        let (_dir, mut session) = open(&reconstructed(), "plant");
        session.choose_mode(ConflictChoice::New).unwrap();
        session.begin_run().unwrap();
        session.attach_job("job-1");

        session.reconcile(&record("job-1", WorkflowState::Cleaning, None));
        assert_eq!(session.state(), WorkflowState::Cleaning);

        let crashed = RunReport::failed("The job crashed, see the server log");
        session.reconcile(&record("job-1", WorkflowState::Cleaning, Some(crashed)));

        assert_eq!(session.state(), WorkflowState::Failed);
        assert!(session.job_id().is_none());
        assert!(session.can_run());
        session.edit_config("[A]\n").unwrap();
    }

    #[test]
    fn test_failure_while_refreshing_ends_run() {
        let store = MemoryStore::new().with_dataset("plant", [("images/0.jpg", b"0".as_slice())]);
        let (_dir, mut session) = open(&store, "plant");
        session.begin_run().unwrap();
        session.attach_job("job-1");

        let crashed = RunReport::failed("The job crashed, see the server log");
        session.reconcile(&record("job-1", WorkflowState::Refreshing, Some(crashed)));

        assert_eq!(session.state(), WorkflowState::Failed);
        assert!(session.history().contains(&WorkflowState::Refreshing));
        assert!(session.can_run());
    }

    #[test]
    fn test_expired_job_fails_run() {
        let store = MemoryStore::new().with_dataset("plant", [("images/0.jpg", b"0".as_slice())]);
        let (_dir, mut session) = open(&store, "plant");
        session.begin_run().unwrap();
        session.attach_job("job-1");

        session.forget_job();

        assert_eq!(session.state(), WorkflowState::Failed);
        assert_eq!(session.report().unwrap().state, RunState::Failed);
        assert!(session.can_run());
    }

    #[test]
    fn test_open_removes_empty_copy() {
        let dir = tempfile::tempdir().unwrap();
        let areas = WorkAreas::new(Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap());
        let area = areas.area("s1", "plant");
        area.create().unwrap();

        let store = MemoryStore::new().with_dataset("plant", [("images/0.jpg", b"0".as_slice())]);
        ReconstructionSession::open("s1", "plant", &store, &BTreeMap::new(), area.clone()).unwrap();

        assert!(!area.exists());
    }

    #[test]
    fn test_failed_import_removes_empty_copy() {
        let store = MemoryStore::new().with_dataset("plant", [("images/0.jpg", b"0".as_slice())]);
        let (_dir, mut session) = open(&store, "plant");
        session.begin_run().unwrap();
        session.attach_job("job-1");
        session.area().create().unwrap();

        let failed = RunReport::failed("Couldn't import dataset 'plant'");
        session.reconcile(&record("job-1", WorkflowState::Importing, Some(failed)));

        assert_eq!(session.state(), WorkflowState::Failed);
        assert!(!session.area().exists());
    }

    #[test]
    fn test_follow_skips_cleaning() {
        let store = MemoryStore::new().with_dataset("plant", [("images/0.jpg", b"0".as_slice())]);
        let (_dir, mut session) = open(&store, "plant");

        session.begin_run().unwrap();
        session.follow(WorkflowState::Done);

        assert_eq!(
            &session.history()[3..],
            [
                WorkflowState::Importing,
                WorkflowState::Running,
                WorkflowState::Uploading,
                WorkflowState::Refreshing,
                WorkflowState::Done,
            ]
        );
    }
}
