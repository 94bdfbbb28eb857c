use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

/// Placeholder used when a library is known on one side only.
pub const UNKNOWN: &str = "Unknown";

/// One library of the comparison table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionRow {
    pub library: String,
    pub previous: String,
    pub current: String,
}

impl VersionRow {
    pub fn is_same(&self) -> bool {
        self.previous == self.current
    }
}

/// Libraries used by a previous run compared with the installed ones, one
/// row per library known on either side, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionTable {
    pub rows: Vec<VersionRow>,
}

impl VersionTable {
    pub fn compare(
        previous: &BTreeMap<String, String>,
        current: &BTreeMap<String, String>,
    ) -> Self {
        let libraries: BTreeSet<&String> = previous.keys().chain(current.keys()).collect();

        let rows = libraries
            .into_iter()
            .map(|library| VersionRow {
                library: library.clone(),
                previous: previous.get(library).cloned().unwrap_or(UNKNOWN.into()),
                current: current.get(library).cloned().unwrap_or(UNKNOWN.into()),
            })
            .collect();

        Self { rows }
    }

    /// Whether every library has the same version on both sides.
    pub fn is_identical(&self) -> bool {
        self.rows.iter().all(VersionRow::is_same)
    }
}
