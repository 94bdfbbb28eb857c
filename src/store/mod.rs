//! Access to the remote dataset store.
//!
//! The dashboard never owns datasets. It reads their configuration and
//! archives from a store, and sends reconstruction results back to it.

mod memory;
mod rest;

use std::fmt;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::config::CONFIG_FILE_NAME;
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use rest::RestStore;

/// Where to reach a data store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreAddress {
    pub host: String,
    pub port: u16,
}

impl StoreAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL of the store, `http` unless the host carries a scheme.
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.contains("://") {
            format!("{host}:{}", self.port)
        } else {
            format!("http://{host}:{}", self.port)
        }
    }
}

impl Default for StoreAddress {
    fn default() -> Self {
        Self::new("127.0.0.1", 5000)
    }
}

impl fmt::Display for StoreAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Summary of one dataset as reported by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub trait DataStore: Send + Sync {
    /// Identifiers of every dataset, sorted.
    fn list_datasets(&self) -> Result<Vec<String>, StoreError>;

    fn dataset_info(&self, dataset_id: &str) -> Result<DatasetInfo, StoreError>;

    /// The configuration stored with the dataset, `None` when the dataset
    /// was never reconstructed.
    fn fetch_config(&self, dataset_id: &str) -> Result<Option<String>, StoreError>;

    /// A ZIP archive of the dataset tree.
    fn fetch_archive(&self, dataset_id: &str) -> Result<Vec<u8>, StoreError>;

    /// Stores one file, `path` being relative to the dataset directory.
    fn post_file(&self, dataset_id: &str, path: &Utf8Path, data: &[u8]) -> Result<(), StoreError>;

    /// Stores the pipeline configuration next to the dataset.
    fn post_config(&self, dataset_id: &str, text: &str) -> Result<(), StoreError> {
        self.post_file(dataset_id, Utf8Path::new(CONFIG_FILE_NAME), text.as_bytes())
    }

    /// Asks the store to rescan the dataset after files changed.
    fn refresh(&self, dataset_id: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(StoreAddress::new("db", 5000).base_url(), "http://db:5000");
        assert_eq!(
            StoreAddress::new("https://db.example.org/", 443).base_url(),
            "https://db.example.org:443"
        );
    }
}
