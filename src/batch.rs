//! Unattended reconstruction of many datasets.

use regex::Regex;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::error::{DashError, WorkflowError};
use crate::graph;
use crate::jobs::{JobKind, JobQueue, JobSpec};
use crate::store::{DataStore, StoreAddress};
use crate::workflow::RunMode;

#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Regular expression searched in dataset names.
    pub pattern: String,
    pub task: String,
    pub config: PipelineConfig,
    pub mode: RunMode,
    pub store: StoreAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchJob {
    pub dataset_id: String,
    pub job_id: String,
    pub mode: RunMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub dataset_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub submitted: Vec<BatchJob>,
    pub skipped: Vec<Skipped>,
}

/// Dataset names matching `pattern`, sorted.
pub fn select(store: &dyn DataStore, pattern: &str) -> Result<Vec<String>, DashError> {
    let regex = Regex::new(pattern).map_err(|e| DashError::Query(pattern.to_string(), e))?;

    let mut names: Vec<String> = store
        .list_datasets()?
        .into_iter()
        .filter(|name| regex.is_match(name))
        .collect();
    names.sort();
    Ok(names)
}

/// Mode a dataset runs in, `None` when it is skipped.
///
/// Only datasets with a previous reconstruction are cleaned or avoided.
pub fn resolve_mode(requested: RunMode, reconstructed: bool) -> Option<RunMode> {
    match (requested, reconstructed) {
        (RunMode::Avoid, true) => None,
        (RunMode::Clean, true) => Some(RunMode::Clean),
        _ => Some(RunMode::Append),
    }
}

/// Submits one job per selected dataset.
///
/// Nothing is submitted unless the configuration forms a valid graph that
/// contains the requested task.
pub fn submit(
    queue: &JobQueue,
    store: &dyn DataStore,
    request: &BatchRequest,
) -> Result<BatchSummary, DashError> {
    let graph = graph::build(&request.config).map_err(WorkflowError::from)?;
    if !graph.contains(&request.task) {
        return Err(WorkflowError::UnknownTask(request.task.clone()).into());
    }

    let mut summary = BatchSummary::default();

    for dataset_id in select(store, &request.pattern)? {
        let reconstructed = match store.fetch_config(&dataset_id) {
            Ok(config) => config.is_some(),
            Err(err) => {
                tracing::warn!(dataset = %dataset_id, "skipping dataset: {err}");
                summary.skipped.push(Skipped {
                    dataset_id,
                    reason: err.to_string(),
                });
                continue;
            }
        };

        let Some(mode) = resolve_mode(request.mode, reconstructed) else {
            tracing::info!(dataset = %dataset_id, "already reconstructed, avoided");
            summary.skipped.push(Skipped {
                dataset_id,
                reason: "already reconstructed".into(),
            });
            continue;
        };

        let handle = queue.submit(JobSpec {
            kind: JobKind::Reconstruct,
            dataset_id: dataset_id.clone(),
            task: request.task.clone(),
            config: request.config.clone(),
            mode,
            store: request.store.clone(),
            owner: None,
        });

        summary.submitted.push(BatchJob {
            dataset_id,
            job_id: handle.id().to_string(),
            mode,
        });
    }

    tracing::info!(
        submitted = summary.submitted.len(),
        skipped = summary.skipped.len(),
        "batch submitted"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::error::GraphError;
    use crate::jobs::fixed_store;
    use crate::runner::CommandRunner;
    use crate::store::MemoryStore;
    use crate::workspace::WorkAreas;

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_dataset("arabido_001", [("images/0.jpg", b"0".as_slice())])
            .with_dataset("arabido_002", [("pipeline.toml", b"[Colmap]\n".as_slice())])
            .with_dataset("tomato_001", [("images/0.jpg", b"0".as_slice())])
    }

    #[test]
    fn test_select() {
        let store = store();

        assert_eq!(select(&store, "arabido").unwrap(), ["arabido_001", "arabido_002"]);
        assert_eq!(select(&store, "_001$").unwrap(), ["arabido_001", "tomato_001"]);
        assert!(matches!(select(&store, "("), Err(DashError::Query(..))));
    }

    #[test]
    fn test_resolve_mode() {
        assert_eq!(resolve_mode(RunMode::Avoid, true), None);
        assert_eq!(resolve_mode(RunMode::Avoid, false), Some(RunMode::Append));
        assert_eq!(resolve_mode(RunMode::Clean, true), Some(RunMode::Clean));
        assert_eq!(resolve_mode(RunMode::Clean, false), Some(RunMode::Append));
        assert_eq!(resolve_mode(RunMode::Append, true), Some(RunMode::Append));
    }

    fn queue() -> (tempfile::TempDir, Arc<MemoryStore>, JobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let areas = WorkAreas::new(Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap());
        let store = Arc::new(store());
        let queue = JobQueue::new(
            1,
            areas,
            Arc::new(CommandRunner::default()),
            fixed_store(store.clone()),
            BTreeMap::new(),
        )
        .unwrap();
        (dir, store, queue)
    }

    fn request(config: PipelineConfig, task: &str) -> BatchRequest {
        BatchRequest {
            pattern: "arabido".into(),
            task: task.into(),
            config,
            mode: RunMode::Avoid,
            store: StoreAddress::default(),
        }
    }

    #[test]
    fn test_avoid_skips_reconstructed() {
        let (_dir, store, queue) = queue();

        let config = PipelineConfig::new().with_task("Colmap", crate::config::Params::new());
        let summary = submit(&queue, store.as_ref(), &request(config, "Colmap")).unwrap();

        let submitted: Vec<_> = summary.submitted.iter().map(|j| j.dataset_id.as_str()).collect();
        assert_eq!(submitted, ["arabido_001"]);
        assert_eq!(summary.skipped[0].dataset_id, "arabido_002");
        assert_eq!(queue.list().len(), 1);
    }

    #[test]
    fn test_unrunnable_request_submits_nothing() {
        let (_dir, store, queue) = queue();
        let cyclic = crate::config::parse("[A]\ninput = \"B\"\n[B]\ninput = \"A\"\n").unwrap();

        let err = submit(&queue, store.as_ref(), &request(cyclic.clone(), "A")).unwrap_err();
        assert!(matches!(
            err,
            DashError::Workflow(WorkflowError::Graph(GraphError::Cyclic(_)))
        ));

        let err = submit(&queue, store.as_ref(), &request(cyclic, "Nope")).unwrap_err();
        assert!(matches!(err, DashError::Workflow(WorkflowError::Graph(_))));

        let colmap = PipelineConfig::new().with_task("Colmap", crate::config::Params::new());
        let err = submit(&queue, store.as_ref(), &request(colmap, "Nope")).unwrap_err();
        assert!(matches!(
            err,
            DashError::Workflow(WorkflowError::UnknownTask(task)) if task == "Nope"
        ));

        assert!(queue.list().is_empty());
    }
}
