//! Background execution of reconstructions.
//!
//! Submitting a job returns at once. The job runs on a dedicated rayon pool
//! and publishes its progress in a [`JobRecord`], which is the only thing
//! callers ever see of it. Cancellation is advisory: it flips a flag that the
//! worker checks between stages and while the task runner runs.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::StoreError;
use crate::runner::{CancelToken, TaskRunner};
use crate::store::{DataStore, RestStore, StoreAddress};
use crate::workflow::{
    RunContext, RunMode, RunPlan, RunReport, RunState, WorkflowState, clean_local, reconstruct,
    upload_local,
};
use crate::workspace::WorkAreas;

/// Opens the data store a job talks to.
pub type StoreConnector =
    Arc<dyn Fn(&StoreAddress) -> Result<Arc<dyn DataStore>, StoreError> + Send + Sync>;

/// Connects to stores over their REST API.
pub fn rest_connector() -> StoreConnector {
    Arc::new(|address: &StoreAddress| {
        let store: Arc<dyn DataStore> = Arc::new(RestStore::new(address)?);
        Ok(store)
    })
}

/// Hands the same store to every job, whatever its address.
pub fn fixed_store(store: Arc<dyn DataStore>) -> StoreConnector {
    Arc::new(move |_: &StoreAddress| Ok(store.clone()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Started,
    Succeeded,
    Failed,
    Revoked,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Revoked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Import, clean if asked, run, upload and refresh.
    Reconstruct,
    /// Run the clean task on the existing local copy.
    Clean,
    /// Upload the existing local copy.
    Upload,
}

/// What to run.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: JobKind,
    pub dataset_id: String,
    pub task: String,
    pub config: PipelineConfig,
    pub mode: RunMode,
    pub store: StoreAddress,
    /// Owner of the working area, the job itself when `None`.
    pub owner: Option<String>,
}

impl JobSpec {
    pub fn from_plan(kind: JobKind, plan: RunPlan, store: StoreAddress, owner: &str) -> Self {
        Self {
            kind,
            dataset_id: plan.dataset_id,
            task: plan.task,
            config: plan.config,
            mode: plan.mode,
            store,
            owner: Some(owner.to_string()),
        }
    }

    /// Identifies jobs doing the same work.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in [
            format!("{:?}", self.kind),
            self.dataset_id.clone(),
            self.task.clone(),
            self.config.to_toml_string(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(&[0]);
        }
        hasher.finalize().to_hex()[..16].to_string()
    }
}

/// Snapshot of a job, as published by the queue.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    pub state: JobState,
    pub dataset_id: String,
    pub task: String,
    pub mode: RunMode,
    pub owner: String,
    /// Stage of the workflow the job is in, or failed in.
    pub stage: Option<WorkflowState>,
    pub fingerprint: String,
    pub received: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub report: Option<RunReport>,
}

/// Returned on submission.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: String,
    cancel: CancelToken,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct JobEntry {
    record: JobRecord,
    cancel: CancelToken,
}

type Jobs = Arc<Mutex<IndexMap<String, JobEntry>>>;

/// Finished records kept by default, older ones are dropped on submission.
pub const KEEP_FINISHED: usize = 500;

struct Worker {
    runner: Arc<dyn TaskRunner>,
    connect: StoreConnector,
    libraries: BTreeMap<String, String>,
    areas: WorkAreas,
}

pub struct JobQueue {
    pool: rayon::ThreadPool,
    jobs: Jobs,
    worker: Arc<Worker>,
    keep_finished: usize,
}

impl JobQueue {
    pub fn new(
        workers: usize,
        areas: WorkAreas,
        runner: Arc<dyn TaskRunner>,
        connect: StoreConnector,
        libraries: BTreeMap<String, String>,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("plantdash-job-{i}"))
            .build()?;

        Ok(Self {
            pool,
            jobs: Arc::default(),
            worker: Arc::new(Worker {
                runner,
                connect,
                libraries,
                areas,
            }),
            keep_finished: KEEP_FINISHED,
        })
    }

    /// How many finished records to remember.
    pub fn keep_finished(mut self, keep: usize) -> Self {
        self.keep_finished = keep;
        self
    }

    /// Queues a job and returns immediately.
    ///
    /// Identical jobs are not merged, submitting twice runs twice.
    pub fn submit(&self, spec: JobSpec) -> JobHandle {
        let id = Uuid::new_v4().to_string();
        let fingerprint = spec.fingerprint();
        let cancel = CancelToken::new();

        let record = JobRecord {
            id: id.clone(),
            kind: spec.kind,
            state: JobState::Pending,
            dataset_id: spec.dataset_id.clone(),
            task: spec.task.clone(),
            mode: spec.mode,
            owner: spec.owner.clone().unwrap_or_else(|| id.clone()),
            stage: None,
            fingerprint: fingerprint.clone(),
            received: Utc::now(),
            started: None,
            finished: None,
            report: None,
        };

        {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(twin) = jobs
                .values()
                .find(|e| !e.record.state.is_finished() && e.record.fingerprint == fingerprint)
            {
                tracing::warn!(
                    job = %id,
                    twin = %twin.record.id,
                    dataset = %spec.dataset_id,
                    task = %spec.task,
                    "an identical job is already queued"
                );
            }
            prune(&mut jobs, self.keep_finished);
            jobs.insert(
                id.clone(),
                JobEntry {
                    record,
                    cancel: cancel.clone(),
                },
            );
        }

        tracing::info!(
            job = %id,
            kind = ?spec.kind,
            dataset = %spec.dataset_id,
            task = %spec.task,
            "job submitted"
        );

        let jobs = self.jobs.clone();
        let worker = self.worker.clone();
        let job_id = id.clone();
        let token = cancel.clone();
        self.pool.spawn(move || {
            worker.execute(&jobs, &job_id, spec, &token);
        });

        JobHandle { id, cancel }
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(id).map(|e| e.record.clone())
    }

    /// Every job, in submission order.
    pub fn list(&self) -> Vec<JobRecord> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.values().map(|e| e.record.clone()).collect()
    }

    /// Asks a job to stop. Returns `false` for an unknown job.
    pub fn cancel(&self, id: &str) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(job = %id, "cancel requested");
                true
            }
            None => false,
        }
    }

    /// Blocks until the job finished or `timeout` elapsed.
    pub fn wait(&self, id: &str, timeout: Duration) -> Option<JobRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let record = self.get(id)?;
            if record.state.is_finished() || Instant::now() >= deadline {
                return Some(record);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Worker {
    fn execute(&self, jobs: &Jobs, id: &str, spec: JobSpec, cancel: &CancelToken) {
        update(jobs, id, |r| {
            r.state = JobState::Started;
            r.started = Some(Utc::now());
        });

        let report = if cancel.is_cancelled() {
            RunReport {
                state: RunState::Cancelled,
                ..RunReport::failed("Job cancelled before it started")
            }
        } else {
            catch_unwind(AssertUnwindSafe(|| self.run(jobs, id, &spec, cancel))).unwrap_or_else(
                |_| {
                    tracing::error!(job = %id, "job panicked");
                    RunReport::failed("The job crashed, see the server log")
                },
            )
        };

        let state = match report.state {
            RunState::Done => JobState::Succeeded,
            RunState::Failed => JobState::Failed,
            RunState::Cancelled => JobState::Revoked,
        };

        tracing::info!(job = %id, ?state, "{}", report.message);

        // Nobody else can reach the area of a job that owns it.
        if spec.owner.is_none() {
            let area = self.areas.area(id, &spec.dataset_id);
            if let Err(err) = area.remove() {
                tracing::warn!(job = %id, "couldn't remove working area: {err}");
            }
        }

        update(jobs, id, |r| {
            r.state = state;
            r.finished = Some(Utc::now());
            r.report = Some(report);
        });
    }

    fn run(&self, jobs: &Jobs, id: &str, spec: &JobSpec, cancel: &CancelToken) -> RunReport {
        let store = match (self.connect)(&spec.store) {
            Ok(store) => store,
            Err(err) => {
                let message = format!("Couldn't reach the store at {}: {err}", spec.store);
                return RunReport::failed(message);
            }
        };

        let owner = spec.owner.as_deref().unwrap_or(id);
        let plan = RunPlan {
            dataset_id: spec.dataset_id.clone(),
            task: spec.task.clone(),
            config: spec.config.clone(),
            mode: spec.mode,
            area: self.areas.area(owner, &spec.dataset_id),
        };

        let ctx = RunContext {
            store: store.as_ref(),
            runner: self.runner.as_ref(),
            libraries: &self.libraries,
            cancel,
        };

        let on_stage = |stage| update(jobs, id, |r| r.stage = Some(stage));

        match spec.kind {
            JobKind::Reconstruct => reconstruct(&plan, ctx, on_stage),
            JobKind::Clean => clean_local(&plan, ctx, on_stage),
            JobKind::Upload => upload_local(&plan, ctx, on_stage),
        }
    }
}

/// Drops the oldest finished records beyond `keep`.
fn prune(jobs: &mut IndexMap<String, JobEntry>, keep: usize) {
    let finished = jobs.values().filter(|e| e.record.state.is_finished()).count();
    let mut excess = finished.saturating_sub(keep);
    if excess == 0 {
        return;
    }

    jobs.retain(|_, entry| {
        if excess > 0 && entry.record.state.is_finished() {
            excess -= 1;
            return false;
        }
        true
    });
    tracing::debug!(kept = jobs.len(), "pruned finished job records");
}

fn update(jobs: &Jobs, id: &str, f: impl FnOnce(&mut JobRecord)) {
    let mut jobs = jobs.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = jobs.get_mut(id) {
        f(&mut entry.record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use crate::store::MemoryStore;
    use camino::{Utf8Path, Utf8PathBuf};
    use std::fs;

    struct Sleepy;

    impl TaskRunner for Sleepy {
        fn run(
            &self,
            _: &Utf8Path,
            task: &str,
            _: &PipelineConfig,
            _: &Utf8Path,
            cancel: &CancelToken,
        ) -> Result<(), ExecutionError> {
            for _ in 0..200 {
                if cancel.is_cancelled() {
                    return Err(ExecutionError::Cancelled(task.to_string()));
                }
                thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        }
    }

    struct Panicky;

    impl TaskRunner for Panicky {
        fn run(
            &self,
            _: &Utf8Path,
            _: &str,
            _: &PipelineConfig,
            _: &Utf8Path,
            _: &CancelToken,
        ) -> Result<(), ExecutionError> {
            panic!("runner bug");
        }
    }

    fn queue(runner: Arc<dyn TaskRunner>) -> (tempfile::TempDir, Arc<MemoryStore>, JobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let areas = WorkAreas::new(Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap());
        let store = Arc::new(
            MemoryStore::new().with_dataset("plant", [("images/0.jpg", b"0".as_slice())]),
        );
        let queue = JobQueue::new(2, areas, runner, fixed_store(store.clone()), BTreeMap::new())
            .unwrap();
        (dir, store, queue)
    }

    fn spec() -> JobSpec {
        JobSpec {
            kind: JobKind::Reconstruct,
            dataset_id: "plant".into(),
            task: "PointCloud".into(),
            config: PipelineConfig::new().with_task("PointCloud", [("level", 1i64.into())]),
            mode: RunMode::Append,
            store: StoreAddress::default(),
            owner: None,
        }
    }

    #[test]
    fn test_job_succeeds() {
        let (_dir, store, queue) = queue(Arc::new(Sleepy));

        let handle = queue.submit(spec());
        let record = queue.wait(handle.id(), Duration::from_secs(10)).unwrap();

        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.stage, Some(WorkflowState::Refreshing));
        assert_eq!(record.owner, record.id);
        assert!(record.started.is_some() && record.finished.is_some());
        assert_eq!(store.refresh_count("plant"), 1);
    }

    #[test]
    fn test_cancel_revokes_job() {
        let (_dir, _store, queue) = queue(Arc::new(Sleepy));

        let handle = queue.submit(spec());
        while queue.get(handle.id()).unwrap().stage != Some(WorkflowState::Running) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(queue.cancel(handle.id()));

        let record = queue.wait(handle.id(), Duration::from_secs(10)).unwrap();
        assert_eq!(record.state, JobState::Revoked);
        assert!(!queue.cancel("nope"));
    }

    #[test]
    fn test_job_owned_area_is_removed() {
        let (dir, _store, queue) = queue(Arc::new(Sleepy));
        let areas = WorkAreas::new(Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap());

        let handle = queue.submit(spec());
        let record = queue.wait(handle.id(), Duration::from_secs(10)).unwrap();

        assert_eq!(record.state, JobState::Succeeded);
        assert!(!areas.area(handle.id(), "plant").db_path().exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_session_owned_area_is_kept() {
        let (dir, _store, queue) = queue(Arc::new(Sleepy));
        let areas = WorkAreas::new(Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap());

        let handle = queue.submit(JobSpec {
            owner: Some("session-1".into()),
            ..spec()
        });
        queue.wait(handle.id(), Duration::from_secs(10)).unwrap();

        assert!(areas.area("session-1", "plant").exists());
    }

    #[test]
    fn test_finished_records_are_pruned() {
        let (_dir, _store, queue) = queue(Arc::new(Panicky));
        let queue = queue.keep_finished(1);

        let first = queue.submit(spec());
        queue.wait(first.id(), Duration::from_secs(10)).unwrap();
        let second = queue.submit(spec());
        queue.wait(second.id(), Duration::from_secs(10)).unwrap();
        let third = queue.submit(spec());

        assert!(queue.get(first.id()).is_none());
        assert!(queue.get(second.id()).is_some());
        assert!(queue.get(third.id()).is_some());
    }

    #[test]
    fn test_duplicates_are_not_merged() {
        let (_dir, _store, queue) = queue(Arc::new(Sleepy));

        let a = queue.submit(spec());
        let b = queue.submit(spec());

        assert_ne!(a.id(), b.id());
        assert_eq!(queue.list().len(), 2);
        assert_eq!(
            queue.get(a.id()).unwrap().fingerprint,
            queue.get(b.id()).unwrap().fingerprint
        );
    }

    #[test]
    fn test_panic_fails_job() {
        let (_dir, _store, queue) = queue(Arc::new(Panicky));

        let handle = queue.submit(spec());
        let record = queue.wait(handle.id(), Duration::from_secs(10)).unwrap();

        assert_eq!(record.state, JobState::Failed);
        assert!(record.report.unwrap().message.contains("crashed"));
    }

    #[test]
    fn test_fingerprint_depends_on_config() {
        let mut other = spec();
        other.config = PipelineConfig::new().with_task("PointCloud", [("level", 2i64.into())]);

        assert_eq!(spec().fingerprint(), spec().fingerprint());
        assert_ne!(spec().fingerprint(), other.fingerprint());
    }
}
