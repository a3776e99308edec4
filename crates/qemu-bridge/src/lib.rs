//! Parent-side proxy for the QEMU backend driver core: owns the backend
//! child process and marshals commands across the duplex JSON-RPC pipe
//! described in spec §6.

pub mod bridge;
pub mod protocol;

pub use bridge::DriverBridge;
pub use protocol::{CommandFrame, ResponseBody, ResponseFrame};
