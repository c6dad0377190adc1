//! Pyxis core - shared foundation for the sandbox bridge.
//!
//! This crate provides:
//! - Bridge settings resolved from the process environment
//! - Identifier sanitization for sandbox-facing aliases
//! - Persistent state directory layout (`~/MCPs` by default)
//!
//! Everything here is deliberately free of async and protocol concerns so
//! the higher layers (config discovery, upstream sessions, the sandbox
//! supervisor) can share it without dependency cycles.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod dirs;
pub mod ident;
pub mod settings;

pub use dirs::StateDir;
pub use ident::sanitize_identifier;
pub use settings::{BridgeSettings, OutputMode};
