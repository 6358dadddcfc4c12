//! Sandbox module for isolated execution environments.
//!
//! This module provides the value-typed [`Session`], the [`Runtime`] trait
//! that backs it, and two runtimes: [`DockerRuntime`] for container
//! isolation and [`LocalRuntime`] for host processes.

mod docker;
mod local;
mod runtime;
mod session;
mod snapshot;

pub use docker::DockerRuntime;
pub use local::LocalRuntime;
pub use runtime::{CommandOutput, ExecRequest, Runtime, TIMEOUT_EXIT_CODE};
pub use session::{OverlayEntry, Session, SessionHandle, SessionOptions};
pub use snapshot::{normalize_path, Snapshot};

pub(crate) use runtime::{run_checked, run_process};
pub(crate) use snapshot::set_executable;
