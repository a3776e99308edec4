//! Core QEMU backend driver: process supervision, QMP transport, the
//! block-device/snapshot model, migration-based save/restore, and the
//! command dispatcher that exposes all of it to a parent process.
//!
//! This crate never initializes a `tracing` subscriber itself — the
//! embedding binary (e.g. `qemu-backend-child`) owns that, same as the
//! teacher's binary/library split.

pub mod block;
pub mod config;
pub mod driver;
pub mod error;
pub mod procstat;
pub mod qmp;
pub mod snapshot;
pub mod supervisor;

pub use driver::{BackendDriver, DriverStatus, PowerAction};
pub use error::{DriverError, Result};
