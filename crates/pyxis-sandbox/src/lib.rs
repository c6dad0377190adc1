//! Pyxis sandbox - the interpreter container and its wire protocol.
//!
//! The sandbox is a single long-lived, network-isolated, resource-capped
//! container hosting a Python interpreter. This crate provides:
//!
//! - [`detect_runtime`]: probing for `podman`/`docker`, including bringing
//!   up the podman machine on platforms that need one
//! - [`ContainerSandbox`]: rendering the interior bootstrap, building the
//!   locked-down `run` command line, owning the container process, and
//!   shutting the runtime down after an idle period
//! - [`wire`]: the newline-delimited JSON frames exchanged with the
//!   interpreter (`execute`, `stdout`, `stderr`, `rpc_request`,
//!   `rpc_response`, `execution_done`)

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod container;
mod entrypoint;
mod error;
mod runtime;
pub mod wire;

pub use container::{ContainerSandbox, ExecutionResult, LaunchSpec};
pub use entrypoint::{render_bootstrap, BOOTSTRAP_FILENAME, IPC_MOUNT_TARGET, PROJECTS_MOUNT_TARGET};
pub use error::SandboxError;
pub use runtime::detect_runtime;
pub use wire::UpcallHandler;
