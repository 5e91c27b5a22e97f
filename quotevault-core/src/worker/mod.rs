//! Background workers: cancellation, lifecycle and supervision.

pub mod cancel;
pub mod restart;
pub mod state;
pub mod supervisor;

pub use cancel::{CancelHook, CancelToken};
pub use restart::{RestartConfig, RestartPolicy};
pub use state::{StopKind, WorkerKey, WorkerRole, WorkerState};
pub use supervisor::{ShutdownReport, SupervisorConfig, SupervisorError, WorkerSupervisor};
