//! Reconstruction of one dataset, from opening it to uploading the results.
//!
//! A [`ReconstructionSession`] lives on the dispatcher and walks the state
//! machine as the user interacts with it. The long running part of a run,
//! [`reconstruct`], executes on the job pool, and the session catches up with
//! it through [`ReconstructionSession::reconcile`] whenever its status is
//! polled.

mod run;
mod session;
mod state;

pub use run::{
    CLEAN_TASK, RunContext, RunLog, RunPlan, RunReport, RunState, clean_local, reconstruct,
    upload, upload_local,
};
pub use session::{ReconstructionSession, SessionStatus};
pub use state::{ConflictChoice, RunMode, WorkflowState};
