use std::time::Duration;

use camino::Utf8Path;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};

use super::{DataStore, DatasetInfo, StoreAddress};
use crate::config::CONFIG_FILE_NAME;
use crate::error::StoreError;

/// Archives of large scans take a while to build on the store side.
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Data store reached over its REST API.
#[derive(Clone)]
pub struct RestStore {
    client: Client,
    base: String,
}

impl std::fmt::Debug for RestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestStore").field("base", &self.base).finish()
    }
}

impl RestStore {
    pub fn new(address: &StoreAddress) -> Result<Self, StoreError> {
        Self::with_timeout(address, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(address: &StoreAddress, timeout: Duration) -> Result<Self, StoreError> {
        let base = address.base_url();
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("plantdash/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| StoreError::Http {
                url: base.clone(),
                source,
            })?;

        Ok(Self { client, base })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    fn get(&self, path: &str) -> Result<(String, Response), StoreError> {
        let url = self.url(path);
        tracing::debug!(%url, "GET");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|source| StoreError::Http {
                url: url.clone(),
                source,
            })?;
        Ok((url, response))
    }

    fn bytes(url: &str, response: Response) -> Result<Vec<u8>, StoreError> {
        let status = response.status();
        let body = response.bytes().map_err(|source| StoreError::Http {
            url: url.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(StoreError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(body.to_vec())
    }
}

impl DataStore for RestStore {
    fn list_datasets(&self) -> Result<Vec<String>, StoreError> {
        let (url, response) = self.get("scans")?;
        let mut ids: Vec<String> = serde_json::from_slice(&Self::bytes(&url, response)?)?;
        ids.sort();
        Ok(ids)
    }

    fn dataset_info(&self, dataset_id: &str) -> Result<DatasetInfo, StoreError> {
        let (url, response) = self.get(&format!("scans/{dataset_id}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(dataset_id.to_string()));
        }

        let metadata = serde_json::from_slice(&Self::bytes(&url, response)?)?;
        Ok(DatasetInfo {
            id: dataset_id.to_string(),
            metadata,
        })
    }

    fn fetch_config(&self, dataset_id: &str) -> Result<Option<String>, StoreError> {
        let (url, response) = self.get(&format!("files/{dataset_id}/{CONFIG_FILE_NAME}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = Self::bytes(&url, response)?;
        Ok(Some(String::from_utf8_lossy(&body).into_owned()))
    }

    fn fetch_archive(&self, dataset_id: &str) -> Result<Vec<u8>, StoreError> {
        let (url, response) = self.get(&format!("archive/{dataset_id}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(dataset_id.to_string()));
        }
        Self::bytes(&url, response)
    }

    fn post_file(&self, dataset_id: &str, path: &Utf8Path, data: &[u8]) -> Result<(), StoreError> {
        let url = self.url(&format!("files/{dataset_id}"));
        let name = path.file_name().unwrap_or(path.as_str());

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Disposition", format!("attachment; filename={name}"))
            .header("X-File-Path", path.as_str())
            .body(data.to_vec())
            .send()
            .map_err(|source| StoreError::Http {
                url: url.clone(),
                source,
            })?;

        if response.status() != StatusCode::CREATED {
            let status = response.status().as_u16();
            return Err(StoreError::Status {
                url,
                status,
                body: response.text().unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn refresh(&self, dataset_id: &str) -> Result<(), StoreError> {
        let (url, response) = self.get(&format!("refresh?scan_id={dataset_id}"))?;
        Self::bytes(&url, response).map(drop)
    }
}
