use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a reconstruction session stands.
///
/// ```text
/// Idle → ConfigLoaded → ConflictDetected → ModeChosen ─┐
///                     ↘ NoConflict ────────────────────┤
///                                                      ↓
///   Importing → [Cleaning] → Running → Uploading → Refreshing → Done
///       ↓                      ↓   ↘       ↓
///     Failed                Failed  Cancelled  Failed
/// ```
///
/// `Done`, `Failed` and `Cancelled` are pre-run states, a new run starts
/// from any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    Idle,
    ConfigLoaded,
    ConflictDetected,
    NoConflict,
    ModeChosen,
    Importing,
    Cleaning,
    Running,
    Uploading,
    Refreshing,
    Done,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// Stages a run goes through, in order. Cleaning is skipped unless the
    /// run mode asks for it.
    pub const RUN_PATH: [WorkflowState; 6] = [
        Self::Importing,
        Self::Cleaning,
        Self::Running,
        Self::Uploading,
        Self::Refreshing,
        Self::Done,
    ];

    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        use WorkflowState::*;

        matches!(
            (self, next),
            (Idle, ConfigLoaded)
                | (ConfigLoaded, ConflictDetected | NoConflict)
                | (ConflictDetected | ModeChosen, ModeChosen)
                | (NoConflict | ModeChosen | Done | Failed | Cancelled, Importing)
                | (Importing, Cleaning | Running | Failed)
                | (Cleaning, Running)
                | (Running, Uploading | Failed | Cancelled)
                | (Uploading, Refreshing | Failed)
                | (Refreshing, Done)
        )
    }

    /// A run is in flight.
    pub fn is_active(self) -> bool {
        use WorkflowState::*;
        matches!(self, Importing | Cleaning | Running | Uploading | Refreshing)
    }

    /// A run may be started from here.
    pub fn can_run(self) -> bool {
        self.can_transition_to(WorkflowState::Importing)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What happens to the outputs of a previous reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Skip datasets that were already reconstructed. Batch runs only.
    Avoid,
    /// Keep previous outputs, the runner only computes what is missing.
    Append,
    /// Wipe previous outputs before running.
    Clean,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Avoid => "avoid",
            Self::Append => "append",
            Self::Clean => "clean",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "avoid" => Ok(Self::Avoid),
            "append" => Ok(Self::Append),
            "clean" | "new" => Ok(Self::Clean),
            other => Err(format!("unknown run mode '{other}', expected avoid, append or clean")),
        }
    }
}

/// Answer of the user when a dataset was already reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictChoice {
    New,
    Append,
}

impl From<ConflictChoice> for RunMode {
    fn from(choice: ConflictChoice) -> Self {
        match choice {
            ConflictChoice::New => RunMode::Clean,
            ConflictChoice::Append => RunMode::Append,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkflowState::*;

    #[test]
    fn test_run_path_is_valid() {
        for pair in WorkflowState::RUN_PATH.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Importing.can_transition_to(Running));
    }

    #[test]
    fn test_failed_and_cancelled_sources() {
        let all = [
            Idle,
            ConfigLoaded,
            ConflictDetected,
            NoConflict,
            ModeChosen,
            Importing,
            Cleaning,
            Running,
            Uploading,
            Refreshing,
            Done,
            Failed,
            Cancelled,
        ];

        let failed: Vec<_> = all.into_iter().filter(|s| s.can_transition_to(Failed)).collect();
        assert_eq!(failed, [Importing, Running, Uploading]);

        let cancelled: Vec<_> = all
            .into_iter()
            .filter(|s| s.can_transition_to(Cancelled))
            .collect();
        assert_eq!(cancelled, [Running]);
    }

    #[test]
    fn test_conflict_requires_mode() {
        assert!(!ConflictDetected.can_run());
        assert!(ModeChosen.can_run());
        assert!(NoConflict.can_run());
        assert!(Done.can_run() && Failed.can_run() && Cancelled.can_run());
        assert!(!Running.can_run());
    }

    #[test]
    fn test_modes() {
        assert_eq!("new".parse::<RunMode>().unwrap(), RunMode::Clean);
        assert_eq!("Append".parse::<RunMode>().unwrap(), RunMode::Append);
        assert!("later".parse::<RunMode>().is_err());
        assert_eq!(RunMode::from(ConflictChoice::New), RunMode::Clean);
    }
}
