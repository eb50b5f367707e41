//! Coordinator-driven routine dispatch for SPMD process groups.
//!
//! Every member of the group builds the same id table from its own copy of
//! the program. The coordinator (rank 0) runs the driver; each call to a
//! `#[parallel]` routine broadcasts that routine's id first, and every worker
//! runs the same routine from its own table.

// `#[parallel]` expands to `::lockstep::` paths, including inside this crate's tests
extern crate self as lockstep;

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod comm; // Group communication seam and the in-process group
pub mod dispatch; // Context, dispatch wrapper and worker loop
pub mod logging;
pub mod registry; // Function table construction
pub mod scan; // Module sources and the scanner
pub mod session; // Lifecycle and role branch

// Re-exports for convenience
pub use crate::core::config::{SessionConfig, SessionConfigBuilder, DEFAULT_MARKER};
pub use crate::core::errors::{CommError, Diagnostic, LockstepError, Result};
pub use comm::{
    Communicator, CommunicatorExt, LocalCommunicator, LocalGroup, Rank, Role, COORDINATOR_RANK,
};
pub use dispatch::{dispatch_loop, Context, DispatchId, SENTINEL};
pub use logging::init_tracing;
pub use registry::{
    BuildReport, FunctionTable, FunctionTableBuilder, ParallelRoutine, RoutineDecl,
    PARALLEL_ROUTINES,
};
pub use scan::{
    Export, FsSource, InMemorySource, LinkedSource, ModulePath, ModuleSource, ScanEvent, Scanner,
};
pub use session::{verify_table, Session, SessionBuilder, SessionState, SessionSummary};

pub use lockstep_macros::parallel;

#[doc(hidden)]
pub mod __private {
    pub use anyhow;
    pub use linkme;
}
