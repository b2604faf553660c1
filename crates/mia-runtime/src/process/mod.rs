//! Backend process supervision.
//!
//! - [`ProcessSupervisor`]: spawns, monitors and (through the shutdown
//!   coordinator) terminates the single backend process
//! - [`Launcher`] / [`BackendChild`]: OS seam, [`TokioLauncher`] by default
//! - [`BackendProcess`] / [`BackendState`]: the supervised record

mod error;
mod launcher;
mod output;
mod state;
mod supervisor;

pub use error::SupervisorError;
pub use launcher::{
    BackendChild, BackendOutput, LaunchSpec, Launcher, TokioLauncher, ENV_BACKEND_PORT, ENV_MODE,
    ENV_WORKING_DIR,
};
pub use state::{BackendProcess, BackendState, InvalidTransition};
pub use supervisor::{ExitDisposition, ExitNotice, ProcessSupervisor};

pub(crate) use supervisor::ProcessSignal;
