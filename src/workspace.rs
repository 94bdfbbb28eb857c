//! Local working copies of datasets.
//!
//! A reconstruction runs against a local copy of the dataset, laid out as a
//! tiny file database the task runner understands:
//!
//! ```text
//! <root>/<dataset>-<owner>/        database directory
//! <root>/<dataset>-<owner>/romidb  marker file
//! <root>/<dataset>-<owner>/lock    left behind by the runner, removed before runs
//! <root>/<dataset>-<owner>/logs/   per-run logs, never uploaded
//! <root>/<dataset>-<owner>/<dataset>/
//! ```
//!
//! The owner is the session (or the batch job) that uses the copy, so two
//! users working on the same dataset never share a directory.

use std::fs;
use std::io::{self, Cursor, Write};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Marks a directory as a file database for the task runner.
pub const MARKER_FILE_NAME: &str = "romidb";

/// Lock file the task runner may leave behind after an abort.
pub const LOCK_FILE_NAME: &str = "lock";

const LOGS_DIR: &str = "logs";

/// Hands out working areas below a common root directory.
#[derive(Debug, Clone)]
pub struct WorkAreas {
    root: Utf8PathBuf,
}

impl WorkAreas {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn area(&self, owner: &str, dataset_id: &str) -> WorkArea {
        WorkArea {
            db: self.root.join(format!("{dataset_id}-{owner}")),
            dataset_id: dataset_id.to_string(),
        }
    }
}

/// State of a local copy, as found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LocalCopy {
    Missing,
    /// The copy was empty and has been deleted.
    Removed,
    Present {
        folders: Vec<String>,
        files: Vec<String>,
    },
}

/// A file of the local copy, for browsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalFile {
    /// Path relative to the dataset directory.
    pub key: Utf8PathBuf,
    pub size: u64,
    /// Days since the last modification.
    pub modified: f64,
}

#[derive(Debug, Clone)]
pub struct WorkArea {
    db: Utf8PathBuf,
    dataset_id: String,
}

impl WorkArea {
    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn db_path(&self) -> &Utf8Path {
        &self.db
    }

    pub fn dataset_path(&self) -> Utf8PathBuf {
        self.db.join(&self.dataset_id)
    }

    pub fn lock_path(&self) -> Utf8PathBuf {
        self.db.join(LOCK_FILE_NAME)
    }

    /// Path of the log file of a run of `task`, always inside the area.
    pub fn log_path(&self, task: &str) -> Utf8PathBuf {
        self.db.join(LOGS_DIR).join(format!("{}.log", file_stem(task)))
    }

    pub fn exists(&self) -> bool {
        self.dataset_path().is_dir()
    }

    /// Creates the database directory, its marker and the dataset directory.
    pub fn create(&self) -> io::Result<()> {
        fs::create_dir_all(self.dataset_path())?;
        fs::create_dir_all(self.db.join(LOGS_DIR))?;
        fs::File::create(self.db.join(MARKER_FILE_NAME))?;
        Ok(())
    }

    /// Replaces the local copy with the content of a dataset archive.
    ///
    /// The archive is a ZIP file. Entries may be rooted at the dataset
    /// directory name or at the dataset content itself.
    pub fn unpack(&self, archive: &[u8]) -> io::Result<()> {
        let mut archive = ZipArchive::new(Cursor::new(archive)).map_err(io::Error::other)?;

        let dataset = self.dataset_path();
        if dataset.is_dir() {
            fs::remove_dir_all(&dataset)?;
        }
        self.create()?;

        let prefix = format!("{}/", self.dataset_id);
        let rooted = archive.file_names().all(|name| name.starts_with(&prefix));
        let target = if rooted { self.db.clone() } else { dataset.clone() };
        archive.extract(&target).map_err(io::Error::other)?;

        tracing::debug!(path = %dataset, entries = archive.len(), "unpacked dataset archive");
        Ok(())
    }

    /// Removes a stale runner lock. Returns whether one was found.
    pub fn remove_lock(&self) -> io::Result<bool> {
        let lock = self.lock_path();
        if lock.exists() {
            fs::remove_file(&lock)?;
            tracing::info!(path = %lock, "removed stale lock file");
            return Ok(true);
        }
        Ok(false)
    }

    /// Looks at the local copy, deleting it when it turns out empty.
    pub fn inspect(&self) -> io::Result<LocalCopy> {
        let dataset = self.dataset_path();
        if !dataset.is_dir() {
            return Ok(LocalCopy::Missing);
        }

        let mut folders = Vec::new();
        let mut files = Vec::new();
        for entry in dataset.read_dir_utf8()? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                folders.push(entry.file_name().to_string());
            } else {
                files.push(entry.file_name().to_string());
            }
        }

        if folders.is_empty() && files.is_empty() {
            self.remove()?;
            tracing::info!(dataset = %self.dataset_id, "removed empty local copy");
            return Ok(LocalCopy::Removed);
        }

        folders.sort();
        files.sort();
        Ok(LocalCopy::Present { folders, files })
    }

    /// Every file of the local copy, sorted by path.
    pub fn files(&self) -> io::Result<Vec<LocalFile>> {
        let dataset = self.dataset_path();
        if !dataset.is_dir() {
            return Ok(Vec::new());
        }

        let pattern = format!("{}/**/*", glob::Pattern::escape(dataset.as_str()));
        let now = SystemTime::now();
        let mut found = Vec::new();

        for path in glob::glob(&pattern).map_err(io::Error::other)? {
            let path = path.map_err(io::Error::from)?;
            let path = Utf8PathBuf::try_from(path).map_err(|e| e.into_io_error())?;

            let meta = fs::metadata(&path)?;
            if !meta.is_file() {
                continue;
            }

            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .map(|age| age.as_secs_f64() / (24.0 * 60.0 * 60.0))
                .unwrap_or_default();

            found.push(LocalFile {
                key: path
                    .strip_prefix(&dataset)
                    .map(Utf8Path::to_path_buf)
                    .unwrap_or(path.clone()),
                size: meta.len(),
                modified: age,
            });
        }

        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    /// Deletes the whole working area. Returns whether it existed.
    pub fn remove(&self) -> io::Result<bool> {
        if self.db.is_dir() {
            fs::remove_dir_all(&self.db)?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Turns a task name into something usable as a single path component.
pub fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();

    let trimmed = stem.trim_start_matches('.');
    if !trimmed.is_empty() && trimmed.len() == stem.len() {
        return stem;
    }
    format!("_{trimmed}")
}

/// Packs files into a dataset archive as served by the store, entries
/// rooted at the dataset directory name.
pub fn pack_archive<'a, I>(dataset_id: &str, files: I) -> io::Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a Utf8Path, &'a [u8])>,
{
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (path, data) in files {
        let name = Utf8Path::new(dataset_id).join(path);
        writer
            .start_file(name.as_str(), options)
            .map_err(io::Error::other)?;
        writer.write_all(data)?;
    }

    Ok(writer.finish().map_err(io::Error::other)?.into_inner())
}
