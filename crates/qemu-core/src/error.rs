use std::time::Duration;

/// Error taxonomy for the QEMU backend driver core.
///
/// Mirrors the propagation policy in the design: `Qmp` is fatal when the
/// caller passed `fatal: true` to [`crate::qmp::QmpTransport::call`],
/// otherwise the caller inspects the response itself (used by the
/// `blockdev-snapshot-sync` → `device` fallback). Every other variant is
/// always fatal to the operation in progress.
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    /// Invalid `VmConfig`: unknown boot source, missing firmware, reserved
    /// characters in an id, etc. Always raised before a QEMU process exists.
    #[error("invalid vm configuration: {0}")]
    Config(String),

    /// The QEMU binary could not be found or `exec` failed.
    #[error("failed to spawn qemu: {0}")]
    Spawn(String),

    /// The QMP socket closed unexpectedly. The driver marks QEMU as dead and
    /// refuses further commands until restarted.
    #[error("qmp socket disconnected")]
    Disconnected,

    /// A line read from the QMP socket did not parse as JSON, or parsed but
    /// matched none of the three message shapes in the QMP spec.
    #[error("malformed qmp message: {0}")]
    Protocol(String),

    /// QEMU returned `{"error": {...}}` for a request issued with
    /// `fatal: true`.
    #[error("qmp error [{class}]: {desc}")]
    Qmp { class: String, desc: String },

    /// A polling loop (migration, balloon settle, incoming-migration wait)
    /// exceeded its configured budget.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A capability gate rejected the operation (e.g. NVMe + snapshots).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The process supervisor escalated to SIGKILL and the child still had
    /// not been reaped within the second escalation window.
    #[error("qemu process did not stop within the escalation window")]
    StillRunning,

    /// Overlay creation, fifo creation, or other filesystem operation
    /// failed outside of process spawn.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A value read back from persisted state (the serialized block device
    /// model, a PID file) failed to parse.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
