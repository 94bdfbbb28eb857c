//! The single owner of all interactive state.
//!
//! Sessions live on one dispatcher thread which handles [`Command`]s one at a
//! time, in arrival order. Every command carries the channel its answer goes
//! back on, so async HTTP handlers await replies without ever touching a
//! session. The dispatcher itself never waits on a job: runs are handed to the
//! [`JobQueue`] and sessions catch up with them when their status is asked.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::batch::{self, BatchRequest, BatchSummary};
use crate::error::DashError;
use crate::jobs::{JobKind, JobQueue, JobRecord, JobSpec, rest_connector};
use crate::runner::{CommandRunner, TaskRunner};
use crate::settings::Settings;
use crate::store::{DataStore, DatasetInfo, RestStore, StoreAddress};
use crate::workflow::{ConflictChoice, ReconstructionSession, SessionStatus};
use crate::workspace::{LocalCopy, LocalFile, WorkAreas};

pub type Reply<T> = oneshot::Sender<Result<T, DashError>>;

pub enum Command {
    ListDatasets {
        reply: Reply<Vec<String>>,
    },
    DatasetInfo {
        dataset_id: String,
        reply: Reply<DatasetInfo>,
    },
    Open {
        dataset_id: String,
        reply: Reply<SessionStatus>,
    },
    Status {
        session: String,
        reply: Reply<SessionStatus>,
    },
    Close {
        session: String,
        reply: Reply<()>,
    },
    EditConfig {
        session: String,
        text: String,
        reply: Reply<SessionStatus>,
    },
    GraphSvg {
        session: String,
        reply: Reply<String>,
    },
    ChooseMode {
        session: String,
        choice: ConflictChoice,
        reply: Reply<SessionStatus>,
    },
    SelectTask {
        session: String,
        task: String,
        reply: Reply<SessionStatus>,
    },
    Run {
        session: String,
        reply: Reply<SessionStatus>,
    },
    Cancel {
        session: String,
        reply: Reply<SessionStatus>,
    },
    InspectLocal {
        session: String,
        reply: Reply<LocalCopy>,
    },
    ExploreLocal {
        session: String,
        reply: Reply<Vec<LocalFile>>,
    },
    RemoveLocal {
        session: String,
        reply: Reply<bool>,
    },
    LocalJob {
        session: String,
        kind: JobKind,
        reply: Reply<JobRecord>,
    },
    Jobs {
        reply: Reply<Vec<JobRecord>>,
    },
    Job {
        id: String,
        reply: Reply<JobRecord>,
    },
    Batch {
        request: BatchRequest,
        reply: Reply<BatchSummary>,
    },
}

/// Sessions and the collaborators they need.
pub struct Dashboard {
    store: Arc<dyn DataStore>,
    address: StoreAddress,
    queue: JobQueue,
    areas: WorkAreas,
    libraries: BTreeMap<String, String>,
    sessions: HashMap<String, ReconstructionSession>,
}

impl Dashboard {
    pub fn new(
        store: Arc<dyn DataStore>,
        address: StoreAddress,
        queue: JobQueue,
        areas: WorkAreas,
        libraries: BTreeMap<String, String>,
    ) -> Self {
        Self {
            store,
            address,
            queue,
            areas,
            libraries,
            sessions: HashMap::new(),
        }
    }

    /// A dashboard talking to the REST store and running the external task
    /// runner, as configured.
    pub fn from_settings(settings: &Settings) -> Result<Self, DashError> {
        let areas = WorkAreas::new(settings.work_root.clone());
        let libraries = settings.installed_libraries();
        let runner: Arc<dyn TaskRunner> = Arc::new(CommandRunner::new(settings.runner.clone()));
        let queue = JobQueue::new(
            settings.jobs.workers,
            areas.clone(),
            runner,
            rest_connector(),
            libraries.clone(),
        )?
        .keep_finished(settings.jobs.keep_finished);

        Ok(Self::new(
            Arc::new(RestStore::new(&settings.store)?),
            settings.store.clone(),
            queue,
            areas,
            libraries,
        ))
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn list_datasets(&self) -> Result<Vec<String>, DashError> {
        Ok(self.store.list_datasets()?)
    }

    pub fn dataset_info(&self, dataset_id: &str) -> Result<DatasetInfo, DashError> {
        Ok(self.store.dataset_info(dataset_id)?)
    }

    pub fn open(&mut self, dataset_id: &str) -> Result<SessionStatus, DashError> {
        let id = Uuid::new_v4().to_string();
        let area = self.areas.area(&id, dataset_id);
        let session = ReconstructionSession::open(
            &id,
            dataset_id,
            self.store.as_ref(),
            &self.libraries,
            area,
        )?;

        tracing::info!(
            session = %id,
            dataset = %dataset_id,
            state = %session.state(),
            "session opened"
        );
        let status = session.status();
        self.sessions.insert(id, session);
        Ok(status)
    }

    pub fn status(&mut self, session: &str) -> Result<SessionStatus, DashError> {
        Ok(self.session(session)?.status())
    }

    pub fn close(&mut self, session: &str) -> Result<(), DashError> {
        let session = self
            .sessions
            .remove(session)
            .ok_or_else(|| DashError::UnknownSession(session.to_string()))?;

        if let Some(job) = session.job_id() {
            self.queue.cancel(job);
        }
        tracing::info!(session = %session.id(), "session closed");
        session.close();
        Ok(())
    }

    pub fn edit_config(&mut self, session: &str, text: String) -> Result<SessionStatus, DashError> {
        let session = self.session(session)?;
        session.edit_config(text)?;
        Ok(session.status())
    }

    pub fn graph_svg(&mut self, session: &str) -> Result<String, DashError> {
        let session = self.session(session)?;
        session.graph_svg().map_err(|err| DashError::Workflow(err.into()))
    }

    pub fn choose_mode(
        &mut self,
        session: &str,
        choice: ConflictChoice,
    ) -> Result<SessionStatus, DashError> {
        let session = self.session(session)?;
        session.choose_mode(choice)?;
        Ok(session.status())
    }

    pub fn select_task(&mut self, session: &str, task: &str) -> Result<SessionStatus, DashError> {
        let session = self.session(session)?;
        session.select_task(task)?;
        Ok(session.status())
    }

    /// Hands a run to the job queue. Clicking twice submits twice once the
    /// first run is over, a run is refused while the previous job lives.
    pub fn run(&mut self, session: &str) -> Result<SessionStatus, DashError> {
        let address = self.address.clone();
        let session = Self::reconciled(&mut self.sessions, &self.queue, session)?;

        let plan = session.begin_run()?;
        let spec = JobSpec::from_plan(JobKind::Reconstruct, plan, address, session.id());
        let handle = self.queue.submit(spec);
        session.attach_job(handle.id());

        Ok(session.status())
    }

    pub fn cancel(&mut self, session: &str) -> Result<SessionStatus, DashError> {
        let session = Self::reconciled(&mut self.sessions, &self.queue, session)?;

        if let Some(job) = session.cancel()? {
            self.queue.cancel(&job);
        }
        Ok(session.status())
    }

    pub fn inspect_local(&mut self, session: &str) -> Result<LocalCopy, DashError> {
        Ok(self.session(session)?.inspect_local()?)
    }

    pub fn explore_local(&mut self, session: &str) -> Result<Vec<LocalFile>, DashError> {
        Ok(self.session(session)?.explore_local()?)
    }

    pub fn remove_local(&mut self, session: &str) -> Result<bool, DashError> {
        Ok(self.session(session)?.remove_local()?)
    }

    /// Cleans or uploads the local copy of a session in the background.
    pub fn local_job(&mut self, session: &str, kind: JobKind) -> Result<JobRecord, DashError> {
        let address = self.address.clone();
        let spec = {
            let session = self.session(session)?;
            JobSpec::from_plan(kind, session.local_plan()?, address, session.id())
        };
        let handle = self.queue.submit(spec);

        self.job(handle.id())
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        self.queue.list()
    }

    pub fn job(&self, id: &str) -> Result<JobRecord, DashError> {
        self.queue
            .get(id)
            .ok_or_else(|| DashError::UnknownJob(id.to_string()))
    }

    pub fn batch(&self, request: &BatchRequest) -> Result<BatchSummary, DashError> {
        batch::submit(&self.queue, self.store.as_ref(), request)
    }

    /// Looks a session up, bringing it up to date with its job first.
    fn session(&mut self, id: &str) -> Result<&mut ReconstructionSession, DashError> {
        Self::reconciled(&mut self.sessions, &self.queue, id)
    }

    fn reconciled<'a>(
        sessions: &'a mut HashMap<String, ReconstructionSession>,
        queue: &JobQueue,
        id: &str,
    ) -> Result<&'a mut ReconstructionSession, DashError> {
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| DashError::UnknownSession(id.to_string()))?;

        if let Some(job) = session.job_id() {
            match queue.get(job) {
                Some(record) => session.reconcile(&record),
                None => session.forget_job(),
            }
        }
        Ok(session)
    }

    fn handle(&mut self, command: Command) {
        // A dropped receiver means the caller gave up, nothing to do.
        match command {
            Command::ListDatasets { reply } => {
                let _ = reply.send(self.list_datasets());
            }
            Command::DatasetInfo { dataset_id, reply } => {
                let _ = reply.send(self.dataset_info(&dataset_id));
            }
            Command::Open { dataset_id, reply } => {
                let _ = reply.send(self.open(&dataset_id));
            }
            Command::Status { session, reply } => {
                let _ = reply.send(self.status(&session));
            }
            Command::Close { session, reply } => {
                let _ = reply.send(self.close(&session));
            }
            Command::EditConfig {
                session,
                text,
                reply,
            } => {
                let _ = reply.send(self.edit_config(&session, text));
            }
            Command::GraphSvg { session, reply } => {
                let _ = reply.send(self.graph_svg(&session));
            }
            Command::ChooseMode {
                session,
                choice,
                reply,
            } => {
                let _ = reply.send(self.choose_mode(&session, choice));
            }
            Command::SelectTask {
                session,
                task,
                reply,
            } => {
                let _ = reply.send(self.select_task(&session, &task));
            }
            Command::Run { session, reply } => {
                let _ = reply.send(self.run(&session));
            }
            Command::Cancel { session, reply } => {
                let _ = reply.send(self.cancel(&session));
            }
            Command::InspectLocal { session, reply } => {
                let _ = reply.send(self.inspect_local(&session));
            }
            Command::ExploreLocal { session, reply } => {
                let _ = reply.send(self.explore_local(&session));
            }
            Command::RemoveLocal { session, reply } => {
                let _ = reply.send(self.remove_local(&session));
            }
            Command::LocalJob {
                session,
                kind,
                reply,
            } => {
                let _ = reply.send(self.local_job(&session, kind));
            }
            Command::Jobs { reply } => {
                let _ = reply.send(Ok(self.jobs()));
            }
            Command::Job { id, reply } => {
                let _ = reply.send(self.job(&id));
            }
            Command::Batch { request, reply } => {
                let _ = reply.send(self.batch(&request));
            }
        }
    }
}

/// Starts the dispatcher thread. It stops once every handle is dropped.
pub fn spawn(mut dashboard: Dashboard) -> io::Result<(DispatcherHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel::<Command>();

    let thread = thread::Builder::new()
        .name("plantdash-dispatcher".into())
        .spawn(move || {
            tracing::debug!("dispatcher started");
            for command in rx {
                dashboard.handle(command);
            }
            tracing::debug!("dispatcher stopped");
        })?;

    Ok((DispatcherHandle { tx }, thread))
}

/// Cheap to clone, one per HTTP handler.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, DashError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| DashError::Disconnected)?;
        rx.await.map_err(|_| DashError::Disconnected)?
    }

    pub async fn list_datasets(&self) -> Result<Vec<String>, DashError> {
        self.request(|reply| Command::ListDatasets { reply }).await
    }

    pub async fn dataset_info(&self, dataset_id: String) -> Result<DatasetInfo, DashError> {
        self.request(|reply| Command::DatasetInfo { dataset_id, reply }).await
    }

    pub async fn open(&self, dataset_id: String) -> Result<SessionStatus, DashError> {
        self.request(|reply| Command::Open { dataset_id, reply }).await
    }

    pub async fn status(&self, session: String) -> Result<SessionStatus, DashError> {
        self.request(|reply| Command::Status { session, reply }).await
    }

    pub async fn close(&self, session: String) -> Result<(), DashError> {
        self.request(|reply| Command::Close { session, reply }).await
    }

    pub async fn edit_config(
        &self,
        session: String,
        text: String,
    ) -> Result<SessionStatus, DashError> {
        self.request(|reply| Command::EditConfig {
            session,
            text,
            reply,
        })
        .await
    }

    pub async fn graph_svg(&self, session: String) -> Result<String, DashError> {
        self.request(|reply| Command::GraphSvg { session, reply }).await
    }

    pub async fn choose_mode(
        &self,
        session: String,
        choice: ConflictChoice,
    ) -> Result<SessionStatus, DashError> {
        self.request(|reply| Command::ChooseMode {
            session,
            choice,
            reply,
        })
        .await
    }

    pub async fn select_task(
        &self,
        session: String,
        task: String,
    ) -> Result<SessionStatus, DashError> {
        self.request(|reply| Command::SelectTask {
            session,
            task,
            reply,
        })
        .await
    }

    pub async fn run(&self, session: String) -> Result<SessionStatus, DashError> {
        self.request(|reply| Command::Run { session, reply }).await
    }

    pub async fn cancel(&self, session: String) -> Result<SessionStatus, DashError> {
        self.request(|reply| Command::Cancel { session, reply }).await
    }

    pub async fn inspect_local(&self, session: String) -> Result<LocalCopy, DashError> {
        self.request(|reply| Command::InspectLocal { session, reply }).await
    }

    pub async fn explore_local(&self, session: String) -> Result<Vec<LocalFile>, DashError> {
        self.request(|reply| Command::ExploreLocal { session, reply }).await
    }

    pub async fn remove_local(&self, session: String) -> Result<bool, DashError> {
        self.request(|reply| Command::RemoveLocal { session, reply }).await
    }

    pub async fn local_job(&self, session: String, kind: JobKind) -> Result<JobRecord, DashError> {
        self.request(|reply| Command::LocalJob {
            session,
            kind,
            reply,
        })
        .await
    }

    pub async fn jobs(&self) -> Result<Vec<JobRecord>, DashError> {
        self.request(|reply| Command::Jobs { reply }).await
    }

    pub async fn job(&self, id: String) -> Result<JobRecord, DashError> {
        self.request(|reply| Command::Job { id, reply }).await
    }

    pub async fn batch(&self, request: BatchRequest) -> Result<BatchSummary, DashError> {
        self.request(|reply| Command::Batch { request, reply }).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use camino::{Utf8Path, Utf8PathBuf};

    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::{ExecutionError, WorkflowError};
    use crate::jobs::{JobState, fixed_store};
    use crate::runner::CancelToken;
    use crate::store::MemoryStore;
    use crate::workflow::WorkflowState;

    struct Noop;

    impl TaskRunner for Noop {
        fn run(
            &self,
            _: &Utf8Path,
            _: &str,
            _: &PipelineConfig,
            _: &Utf8Path,
            _: &CancelToken,
        ) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn dashboard() -> (tempfile::TempDir, Dashboard) {
        let dir = tempfile::tempdir().unwrap();
        let areas = WorkAreas::new(Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap());
        let store: Arc<dyn DataStore> = Arc::new(
            MemoryStore::new().with_dataset("plant", [("images/0.jpg", b"0".as_slice())]),
        );
        let queue = JobQueue::new(
            1,
            areas.clone(),
            Arc::new(Noop),
            fixed_store(store.clone()),
            BTreeMap::new(),
        )
        .unwrap();
        let dashboard =
            Dashboard::new(store, StoreAddress::default(), queue, areas, BTreeMap::new());
        (dir, dashboard)
    }

    #[test]
    fn test_run_is_reconciled_on_status() {
        let (_dir, mut dashboard) = dashboard();

        let status = dashboard.open("plant").unwrap();
        assert_eq!(status.state, WorkflowState::NoConflict);

        let status = dashboard.run(&status.id).unwrap();
        assert_eq!(status.state, WorkflowState::Importing);
        let job = status.job_id.clone().unwrap();

        let record = dashboard.queue().wait(&job, Duration::from_secs(10)).unwrap();
        assert_eq!(record.state, JobState::Succeeded);

        let status = dashboard.status(&status.id).unwrap();
        assert_eq!(status.state, WorkflowState::Done);
        assert!(status.job_id.is_none());
        assert!(status.report.is_some());
    }

    #[test]
    fn test_unknown_session() {
        let (_dir, mut dashboard) = dashboard();

        assert!(matches!(dashboard.status("nope"), Err(DashError::UnknownSession(_))));
        assert!(matches!(dashboard.job("nope"), Err(DashError::UnknownJob(_))));
    }

    #[test]
    fn test_local_job_needs_copy() {
        let (_dir, mut dashboard) = dashboard();
        let status = dashboard.open("plant").unwrap();

        assert!(matches!(
            dashboard.local_job(&status.id, JobKind::Upload),
            Err(DashError::Workflow(WorkflowError::NoLocalCopy(_)))
        ));
    }

    #[test]
    fn test_close_removes_working_area() {
        let (_dir, mut dashboard) = dashboard();
        let status = dashboard.open("plant").unwrap();

        let job = dashboard.run(&status.id).unwrap().job_id.unwrap();
        dashboard.queue().wait(&job, Duration::from_secs(10)).unwrap();
        let area = dashboard.areas.area(&status.id, "plant");
        assert!(area.exists());

        dashboard.close(&status.id).unwrap();
        assert!(!area.exists());
        assert!(dashboard.status(&status.id).is_err());
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let (_dir, dashboard) = dashboard();
        let (handle, thread) = spawn(dashboard).unwrap();

        assert_eq!(handle.list_datasets().await.unwrap(), ["plant"]);

        let status = handle.open("plant".into()).await.unwrap();
        let svg = handle.graph_svg(status.id.clone()).await.unwrap();
        assert!(svg.contains("AnglesAndInternodes"));

        handle.close(status.id).await.unwrap();

        drop(handle);
        thread.join().unwrap();
    }
}
