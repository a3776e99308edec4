//! Snapshot Engine (spec §4.4) — save/restore VM state via live QMP
//! migration to a file, with balloon settling and status-wait loops.
//!
//! Per Design Note 9(c) ("coroutine-style control flow ... model each step
//! as a state with explicit transitions"), `save_snapshot` and the
//! `prepare_load`/`complete_load` split below are a sequence of explicit,
//! independently cancellable steps rather than one long blocking call —
//! the Backend Driver composes them and owns the re-exec in between.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;

use crate::block::{BlockDeviceModel, DiskFormat, Snapshot};
use crate::error::{DriverError, Result};
use crate::qmp::{CallOptions, CallOutcome, QmpTransport};

/// Tunables mirroring the source's environment-variable knobs.
#[derive(Debug, Clone)]
pub struct SnapshotEngineConfig {
    /// `QEMU_MAX_MIGRATION_TIME`, default 240s.
    pub max_migration_time: Duration,
    /// Wall-clock budget to leave the `migrate*` status after an incoming
    /// migration, default 300s.
    pub incoming_migration_timeout: Duration,
    pub migrate_poll_interval: Duration,
    pub compress_level: u32,
    pub compress_threads: u32,
    pub max_bandwidth_bytes: u64,
    /// Balloon settle budget: iterations × interval, default 5 × 1s.
    pub balloon_settle_iterations: u32,
    pub balloon_settle_interval: Duration,
}

impl Default for SnapshotEngineConfig {
    fn default() -> Self {
        Self {
            max_migration_time: Duration::from_secs(240),
            incoming_migration_timeout: Duration::from_secs(300),
            migrate_poll_interval: Duration::from_millis(500),
            compress_level: 1,
            compress_threads: 4,
            max_bandwidth_bytes: 0,
            balloon_settle_iterations: 5,
            balloon_settle_interval: Duration::from_secs(1),
        }
    }
}

pub struct SnapshotEngine {
    config: SnapshotEngineConfig,
}

impl SnapshotEngine {
    pub fn new(config: SnapshotEngineConfig) -> Self {
        Self { config }
    }

    /// Capability gate per spec §4.4: snapshots are unsupported when any
    /// drive is modeled on an `nvme` controller. Checked up front, before
    /// any QMP command is issued.
    pub fn can_handle_snapshots(&self, model: &BlockDeviceModel) -> bool {
        model.can_handle_snapshots()
    }

    /// Full save sequence (spec §4.4 steps 1-9).
    pub async fn save_snapshot(
        &self,
        qmp: &QmpTransport,
        model: &mut BlockDeviceModel,
        name: &str,
        ram_mib: u64,
        balloon_target_mib: Option<u64>,
    ) -> Result<Snapshot> {
        if !self.can_handle_snapshots(model) {
            return Err(DriverError::Unsupported("snapshots unsupported: an nvme drive is attached".into()));
        }

        let was_running = query_status(qmp).await? == "running";

        if was_running {
            if let Some(target_mib) = balloon_target_mib {
                self.settle_balloon(qmp, target_mib * 1024 * 1024).await;
            }
            call(qmp, "stop", None, true).await?;
        }

        // Console snapshots are an external collaborator outside this
        // crate's scope (spec §1); the caller is expected to have already
        // captured them before invoking save_snapshot.

        let snapshot = self.sync_block_overlays(qmp, model, name).await?;

        self.enable_migration_capabilities(qmp).await?;
        call(
            qmp,
            "migrate-set-parameters",
            Some(json!({
                "compress-level": self.config.compress_level,
                "compress-threads": self.config.compress_threads,
                "max-bandwidth": self.config.max_bandwidth_bytes,
            })),
            true,
        )
        .await?;

        std::fs::create_dir_all(snapshot.ram_file.parent().unwrap_or_else(|| Path::new(".")))?;
        let file = std::fs::File::create(&snapshot.ram_file)?;
        let fd_name = format!("snap-{}", snapshot.sequence_number);
        {
            use std::os::unix::io::AsRawFd;
            qmp.call_with_fd(
                "getfd",
                Some(json!({ "fdname": fd_name })),
                CallOptions { fatal: true, timeout: None },
                file.as_raw_fd(),
            )
            .await?;
        }
        drop(file); // our copy; QEMU now holds its own via SCM_RIGHTS.

        call(qmp, "migrate", Some(json!({ "uri": format!("fd:{fd_name}") })), true).await?;
        self.poll_outgoing_migration(qmp).await?;

        wait_while_status(qmp, |s| s == "paused" || s == "finish-migrate", Duration::from_secs(30)).await?;

        if was_running {
            call(qmp, "cont", None, true).await?;
            self.settle_balloon(qmp, ram_mib * 1024 * 1024).await;
        }

        Ok(snapshot)
    }

    /// Steps 3-4 of load (spec §4.4): tear-down/re-exec is the driver's
    /// job; this only truncates the Block Device Model's overlay chain so
    /// the subsequent re-exec sees the reverted chain.
    pub fn prepare_load<'a>(&self, model: &'a mut BlockDeviceModel, name: &str) -> Result<&'a Snapshot> {
        let sequence_number = model
            .snapshots()
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.sequence_number)
            .ok_or_else(|| DriverError::Config(format!("no such snapshot: {name}")))?;
        model.revert_to(sequence_number)?;
        model
            .snapshots()
            .iter()
            .find(|s| s.sequence_number == sequence_number)
            .ok_or_else(|| DriverError::Config(format!("no such snapshot: {name}")))
    }

    /// Steps 6-9 of load: QMP handshake already completed by
    /// [`QmpTransport::connect`] against the freshly re-exec'd QEMU
    /// (started with `-S`); this finishes the incoming migration.
    ///
    /// The source uses `exec:cat <file>` rather than `fd:` for incoming
    /// migration, citing a QEMU bug with fd-based incoming migration —
    /// preserved exactly per Design Note 9, Open Question (a).
    pub async fn complete_load(&self, qmp: &QmpTransport, ram_file: &Path, ram_mib: u64) -> Result<()> {
        self.enable_migration_capabilities(qmp).await?;
        call(
            qmp,
            "migrate-incoming",
            Some(json!({ "uri": format!("exec:cat {}", ram_file.display()) })),
            true,
        )
        .await?;

        wait_while_status(qmp, |s| s.contains("migrate"), self.config.incoming_migration_timeout).await?;

        call(qmp, "cont", None, true).await?;
        self.settle_balloon(qmp, ram_mib * 1024 * 1024).await;
        Ok(())
    }

    /// Copy a named block node (`hd<N>` or `pflash-vars`) out as a
    /// standalone file (spec §4.4). Exactly one drive must match the
    /// selector. When `format` differs from the live node's own on-disk
    /// format, the copy runs through `qemu-img convert` rather than a
    /// byte-for-byte copy. Auto-loading state when none is loaded is the
    /// caller's job — that needs a QMP-capable driver handle this engine
    /// does not hold.
    pub fn extract_assets(
        &self,
        model: &BlockDeviceModel,
        selector: &str,
        name: &str,
        dest_dir: &Path,
        format: DiskFormat,
    ) -> Result<PathBuf> {
        let matches: Vec<_> = model.drives().filter(|d| d.id == selector || d.node_name == selector).collect();
        let drive = match matches.as_slice() {
            [] => return Err(DriverError::Config(format!("no drive matches selector {selector}"))),
            [drive] => *drive,
            _ => return Err(DriverError::Config(format!("selector {selector} matches more than one drive"))),
        };

        let live_node = model
            .live_node_for(&drive.id)
            .ok_or_else(|| DriverError::Config(format!("drive {} has no live node", drive.id)))?;
        let source = model
            .file_for_node(live_node)
            .ok_or_else(|| DriverError::Config(format!("node {live_node} has no backing file on disk")))?;

        std::fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(name);

        if format == drive.format {
            std::fs::copy(source, &dest)?;
        } else {
            convert_image(source, &dest, format)?;
        }
        Ok(dest)
    }

    async fn sync_block_overlays(&self, qmp: &QmpTransport, model: &mut BlockDeviceModel, name: &str) -> Result<Snapshot> {
        let snapshot = model.begin_snapshot(name)?;
        for (drive_id, overlay_node) in &snapshot.block_overlays {
            // identifier is the node that was live *before* this overlay
            // was layered on top of it.
            let identifier = model
                .backing_node_of(overlay_node)
                .ok_or_else(|| DriverError::Config(format!("overlay {overlay_node} has no backing node")))?
                .to_string();
            let overlay_path = model.basedir().join(format!("{drive_id}-{}.qcow2", snapshot.sequence_number));

            let args = json!({
                "node-name": identifier,
                "snapshot-file": overlay_path.to_string_lossy(),
                "snapshot-node-name": overlay_node,
                "format": "qcow2",
                "mode": "absolute-paths",
            });
            let outcome = call_non_fatal(qmp, "blockdev-snapshot-sync", Some(args)).await?;
            if !outcome.is_success() {
                tracing::warn!(%drive_id, "blockdev-snapshot-sync with node-name failed, retrying with device");
                let retry_args = json!({
                    "device": identifier,
                    "snapshot-file": overlay_path.to_string_lossy(),
                    "snapshot-node-name": overlay_node,
                    "format": "qcow2",
                    "mode": "absolute-paths",
                });
                call(qmp, "blockdev-snapshot-sync", Some(retry_args), true).await?;
            }
        }
        Ok(snapshot)
    }

    async fn enable_migration_capabilities(&self, qmp: &QmpTransport) -> Result<()> {
        call(
            qmp,
            "migrate-set-capabilities",
            Some(json!({
                "capabilities": [
                    { "capability": "compress", "state": true },
                    { "capability": "events", "state": true },
                ]
            })),
            true,
        )
        .await?;
        Ok(())
    }

    async fn poll_outgoing_migration(&self, qmp: &QmpTransport) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.max_migration_time;
        loop {
            let outcome = call(qmp, "query-migrate", None, true).await?;
            let value = outcome.into_value().unwrap_or(serde_json::Value::Null);
            let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
            let ram = value.get("ram");
            tracing::info!(
                status = %status,
                total = ?ram.and_then(|r| r.get("total")),
                remaining = ?ram.and_then(|r| r.get("remaining")),
                "migration progress"
            );

            if status == "completed" {
                return Ok(());
            }
            if status == "failed" {
                call(qmp, "migrate_cancel", None, false).await.ok();
                return Err(DriverError::Qmp { class: "GenericError".into(), desc: "migration failed".into() });
            }
            if tokio::time::Instant::now() >= deadline {
                call(qmp, "migrate_cancel", None, false).await.ok();
                return Err(DriverError::Timeout(self.config.max_migration_time));
            }
            tokio::time::sleep(self.config.migrate_poll_interval).await;
        }
    }

    /// Best-effort: inflate/deflate toward `target_bytes`, polling
    /// `query-balloon` until `actual` stops decreasing or the settle
    /// budget is exhausted. Never fails the caller — only logged.
    async fn settle_balloon(&self, qmp: &QmpTransport, target_bytes: u64) {
        if call(qmp, "balloon", Some(json!({ "value": target_bytes })), false).await.is_err() {
            tracing::warn!("balloon request failed, continuing without balloon settle");
            return;
        }

        let mut last_actual: Option<u64> = None;
        for _ in 0..self.config.balloon_settle_iterations {
            tokio::time::sleep(self.config.balloon_settle_interval).await;
            let outcome = match call(qmp, "query-balloon", None, false).await {
                Ok(o) => o,
                Err(_) => return,
            };
            let Some(value) = outcome.into_value() else { return };
            let actual = value.get("actual").and_then(|v| v.as_u64());
            if let (Some(prev), Some(cur)) = (last_actual, actual) {
                if cur >= prev {
                    break;
                }
            }
            last_actual = actual;
        }
    }
}

/// Shell out to `qemu-img convert` for a cross-format asset extraction;
/// same-format extraction is a plain `std::fs::copy` (see `extract_assets`).
pub(crate) fn convert_image(source: &Path, dest: &Path, format: DiskFormat) -> Result<()> {
    let format_str = match format {
        DiskFormat::Qcow2 => "qcow2",
        DiskFormat::Raw => "raw",
    };
    let status = std::process::Command::new("qemu-img")
        .args(["convert", "-O", format_str])
        .arg(source)
        .arg(dest)
        .status()
        .map_err(|e| DriverError::Spawn(format!("qemu-img convert: {e}")))?;
    if !status.success() {
        return Err(DriverError::Spawn(format!("qemu-img convert exited with {status}")));
    }
    Ok(())
}

async fn query_status(qmp: &QmpTransport) -> Result<String> {
    let outcome = call(qmp, "query-status", None, true).await?;
    let value = outcome.into_value().unwrap_or(serde_json::Value::Null);
    Ok(value.get("status").and_then(|v| v.as_str()).unwrap_or("unknown").to_string())
}

async fn wait_while_status(qmp: &QmpTransport, matches: impl Fn(&str) -> bool, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = query_status(qmp).await?;
        if !matches(&status) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DriverError::Timeout(timeout));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn call(qmp: &QmpTransport, execute: &str, arguments: Option<serde_json::Value>, fatal: bool) -> Result<CallOutcome> {
    qmp.call(execute, arguments, CallOptions { fatal, timeout: None }).await
}

async fn call_non_fatal(qmp: &QmpTransport, execute: &str, arguments: Option<serde_json::Value>) -> Result<CallOutcome> {
    qmp.call(execute, arguments, CallOptions { fatal: false, timeout: None }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Media;

    #[test]
    fn extract_assets_requires_single_match() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("base.qcow2");
        std::fs::write(&source, b"fake qcow2 contents").unwrap();
        let mut model = BlockDeviceModel::new(dir.path());
        model.add_controller("scsi0", "virtio-scsi-pci").unwrap();
        model.add_drive("hd0", Media::Disk, &source, DiskFormat::Qcow2, 1024).unwrap();
        model.attach("hd0", "scsi0").unwrap();

        let engine = SnapshotEngine::new(SnapshotEngineConfig::default());
        let dest_dir = dir.path().join("out");
        assert!(engine.extract_assets(&model, "hd0", "hd0.qcow2", &dest_dir, DiskFormat::Qcow2).is_ok());
        assert!(dest_dir.join("hd0.qcow2").exists());
        assert!(engine.extract_assets(&model, "hd99", "x.qcow2", &dest_dir, DiskFormat::Qcow2).is_err());
    }

    #[test]
    fn prepare_load_rejects_unknown_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = BlockDeviceModel::new(dir.path());
        let engine = SnapshotEngine::new(SnapshotEngineConfig::default());
        assert!(engine.prepare_load(&mut model, "nope").is_err());
    }
}
