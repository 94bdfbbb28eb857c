//! Dashboard settings.
//!
//! Settings come from an optional TOML file, then the `REST_API_URL` and
//! `REST_API_PORT` environment variables override the store address. The
//! command line has the last word.
//!
//! ```toml
//! work_root = "/data/plantdash"
//!
//! [store]
//! host = "127.0.0.1"
//! port = 5000
//!
//! [server]
//! bind = "127.0.0.1:8000"
//!
//! [jobs]
//! workers = 2
//! keep_finished = 500
//!
//! [runner]
//! program = "romi_run_task"
//! args = ["{task}", "{dataset}", "--config", "{config}"]
//!
//! [libraries]
//! plant3dvision = "0.14.0"
//! ```

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::SettingsError;
use crate::jobs::KEEP_FINISHED;
use crate::runner::RunnerSettings;
use crate::store::StoreAddress;

pub const ENV_STORE_HOST: &str = "REST_API_URL";
pub const ENV_STORE_PORT: &str = "REST_API_PORT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store: StoreAddress,
    pub server: ServerSettings,
    pub jobs: JobSettings,
    /// Working areas of sessions and jobs are created below this directory.
    pub work_root: Utf8PathBuf,
    /// Daily server logs go there when set.
    pub log_dir: Option<Utf8PathBuf>,
    pub runner: RunnerSettings,
    /// Installed library versions, stamped into configurations of new runs.
    pub libraries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    pub workers: usize,
    /// Finished job records remembered for status queries.
    pub keep_finished: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            keep_finished: KEEP_FINISHED,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let work_root = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
            .join("plantdash");

        Self {
            store: StoreAddress::default(),
            server: ServerSettings::default(),
            jobs: JobSettings::default(),
            work_root,
            log_dir: None,
            runner: RunnerSettings::default(),
            libraries: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Reads the settings file, if any, and applies environment overrides.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self, SettingsError> {
        let mut settings = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| SettingsError::Read {
                    path: path.to_string(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };

        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), SettingsError> {
        if let Some(host) = var(ENV_STORE_HOST).filter(|v| !v.is_empty()) {
            self.store.host = host;
        }

        if let Some(port) = var(ENV_STORE_PORT).filter(|v| !v.is_empty()) {
            self.store.port = port.trim().parse().map_err(|_| SettingsError::Env {
                key: ENV_STORE_PORT,
                value: port.clone(),
            })?;
        }

        Ok(())
    }

    /// Library versions recorded with new runs, the dashboard included.
    pub fn installed_libraries(&self) -> BTreeMap<String, String> {
        let mut libraries = self.libraries.clone();
        libraries
            .entry(env!("CARGO_PKG_NAME").to_string())
            .or_insert_with(|| env!("CARGO_PKG_VERSION").to_string());
        libraries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings =
            Settings::from_toml("[store]\nhost = \"db\"\n[jobs]\nworkers = 4\n").unwrap();

        assert_eq!(settings.store, StoreAddress::new("db", 5000));
        assert_eq!(settings.jobs.workers, 4);
        assert_eq!(settings.jobs.keep_finished, KEEP_FINISHED);
        assert_eq!(settings.server, ServerSettings::default());
        assert_eq!(settings.runner, RunnerSettings::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings
            .apply_env(|key| match key {
                ENV_STORE_HOST => Some("plantdb".into()),
                ENV_STORE_PORT => Some("5001".into()),
                _ => None,
            })
            .unwrap();

        assert_eq!(settings.store, StoreAddress::new("plantdb", 5001));

        let err = settings
            .apply_env(|key| (key == ENV_STORE_PORT).then(|| "http".into()))
            .unwrap_err();
        assert!(matches!(err, SettingsError::Env { key: ENV_STORE_PORT, .. }));
    }

    #[test]
    fn test_installed_libraries() {
        let settings =
            Settings::from_toml("[libraries]\nplant3dvision = \"0.14\"\n").unwrap();
        let libraries = settings.installed_libraries();

        assert_eq!(libraries["plant3dvision"], "0.14");
        assert_eq!(libraries["plantdash"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_missing_file() {
        let err = Settings::load(Some(Utf8Path::new("/nonexistent/plantdash.toml"))).unwrap_err();
        assert!(matches!(err, SettingsError::Read { .. }));
    }
}
