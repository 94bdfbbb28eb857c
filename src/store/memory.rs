use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};

use super::{DataStore, DatasetInfo};
use crate::error::StoreError;
use crate::workspace::pack_archive;

type Files = BTreeMap<Utf8PathBuf, Vec<u8>>;

/// A data store held in memory, for tests and demos.
///
/// Uploads of chosen paths and refreshes can be made to fail, to exercise
/// the error paths of a reconstruction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    datasets: Mutex<BTreeMap<String, Files>>,
    refreshes: Mutex<HashMap<String, usize>>,
    failing_uploads: Mutex<BTreeSet<Utf8PathBuf>>,
    failing_refresh: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset<'a, I>(self, dataset_id: &str, files: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        for (path, data) in files {
            self.insert_file(dataset_id, path, data);
        }
        self.datasets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(dataset_id.to_string())
            .or_default();
        self
    }

    pub fn insert_file(&self, dataset_id: &str, path: impl Into<Utf8PathBuf>, data: &[u8]) {
        self.datasets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(dataset_id.to_string())
            .or_default()
            .insert(path.into(), data.to_vec());
    }

    pub fn file(&self, dataset_id: &str, path: impl AsRef<Utf8Path>) -> Option<Vec<u8>> {
        self.datasets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(dataset_id)?
            .get(path.as_ref())
            .cloned()
    }

    /// How many times `dataset_id` was refreshed.
    pub fn refresh_count(&self, dataset_id: &str) -> usize {
        self.refreshes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(dataset_id)
            .copied()
            .unwrap_or_default()
    }

    /// Makes every upload of `path` fail.
    pub fn fail_upload(&self, path: impl Into<Utf8PathBuf>) {
        self.failing_uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.into());
    }

    pub fn fail_refresh(&self, fail: bool) {
        *self.failing_refresh.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }
}

impl DataStore for MemoryStore {
    fn list_datasets(&self) -> Result<Vec<String>, StoreError> {
        let datasets = self.datasets.lock().unwrap_or_else(|e| e.into_inner());
        Ok(datasets.keys().cloned().collect())
    }

    fn dataset_info(&self, dataset_id: &str) -> Result<DatasetInfo, StoreError> {
        let datasets = self.datasets.lock().unwrap_or_else(|e| e.into_inner());
        let files = datasets
            .get(dataset_id)
            .ok_or_else(|| StoreError::NotFound(dataset_id.to_string()))?;

        Ok(DatasetInfo {
            id: dataset_id.to_string(),
            metadata: serde_json::json!({ "files": files.len() }),
        })
    }

    fn fetch_config(&self, dataset_id: &str) -> Result<Option<String>, StoreError> {
        let datasets = self.datasets.lock().unwrap_or_else(|e| e.into_inner());
        let files = datasets
            .get(dataset_id)
            .ok_or_else(|| StoreError::NotFound(dataset_id.to_string()))?;

        Ok(files
            .get(Utf8Path::new(crate::config::CONFIG_FILE_NAME))
            .map(|data| String::from_utf8_lossy(data).into_owned()))
    }

    fn fetch_archive(&self, dataset_id: &str) -> Result<Vec<u8>, StoreError> {
        let datasets = self.datasets.lock().unwrap_or_else(|e| e.into_inner());
        let files = datasets
            .get(dataset_id)
            .ok_or_else(|| StoreError::NotFound(dataset_id.to_string()))?;

        Ok(pack_archive(
            dataset_id,
            files.iter().map(|(path, data)| (path.as_path(), data.as_slice())),
        )?)
    }

    fn post_file(&self, dataset_id: &str, path: &Utf8Path, data: &[u8]) -> Result<(), StoreError> {
        if self
            .failing_uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
        {
            return Err(StoreError::Status {
                url: format!("memory://{dataset_id}/{path}"),
                status: 500,
                body: "upload rejected".into(),
            });
        }

        let mut datasets = self.datasets.lock().unwrap_or_else(|e| e.into_inner());
        let files = datasets
            .get_mut(dataset_id)
            .ok_or_else(|| StoreError::NotFound(dataset_id.to_string()))?;
        files.insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn refresh(&self, dataset_id: &str) -> Result<(), StoreError> {
        if *self.failing_refresh.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(StoreError::Status {
                url: format!("memory://refresh/{dataset_id}"),
                status: 503,
                body: "refresh unavailable".into(),
            });
        }

        *self
            .refreshes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(dataset_id.to_string())
            .or_default() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkAreas;

    #[test]
    fn test_config_presence() {
        let store = MemoryStore::new()
            .with_dataset("fresh", [("images/0.jpg", b"0".as_slice())])
            .with_dataset("done", [("pipeline.toml", b"[Colmap]\n".as_slice())]);

        assert_eq!(store.list_datasets().unwrap(), ["done", "fresh"]);
        assert_eq!(store.fetch_config("fresh").unwrap(), None);
        assert_eq!(store.fetch_config("done").unwrap().as_deref(), Some("[Colmap]\n"));
        assert!(matches!(
            store.fetch_config("missing"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_archive_unpacks_into_work_area() {
        let store = MemoryStore::new().with_dataset("plant", [("images/0.jpg", b"0".as_slice())]);
        let dir = tempfile::tempdir().unwrap();
        let areas = WorkAreas::new(Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap());
        let area = areas.area("s", "plant");

        area.unpack(&store.fetch_archive("plant").unwrap()).unwrap();

        assert!(area.dataset_path().join("images/0.jpg").is_file());
    }

    #[test]
    fn test_failures() {
        let store = MemoryStore::new().with_dataset("plant", [("metadata.json", b"{}".as_slice())]);
        store.fail_upload("bad.txt");
        store.fail_refresh(true);

        assert!(store.post_file("plant", Utf8Path::new("good.txt"), b"").is_ok());
        assert!(store.post_file("plant", Utf8Path::new("bad.txt"), b"").is_err());
        assert!(store.refresh("plant").is_err());
        assert_eq!(store.refresh_count("plant"), 0);

        store.fail_refresh(false);
        store.refresh("plant").unwrap();
        assert_eq!(store.refresh_count("plant"), 1);
    }
}
