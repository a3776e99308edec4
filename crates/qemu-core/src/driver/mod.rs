//! Backend Driver (spec §4.5) — the command dispatcher hosted inside the
//! backend child process. Translates the high-level commands in the
//! command table to QMP flows over the other five components.
//!
//! `DriverStatus` is this crate's own local state machine, gating commands
//! before a QMP round-trip is even attempted — grounded in the teacher's
//! `InstanceState`/`InstanceStatus` pattern (`katana-core::instance::state`)
//! of tracking lifecycle locally rather than re-deriving it from QEMU on
//! every call.

pub mod argv;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::block::{BlockDeviceModel, DiskFormat};
use crate::config::{RuntimeFlags, VmConfig};
use crate::error::{DriverError, Result};
use crate::procstat::{self, CpuStat};
use crate::qmp::messages::EventBody;
use crate::qmp::{CallOptions, CallOutcome, QmpTransport};
use crate::snapshot::{SnapshotEngine, SnapshotEngineConfig};
use crate::supervisor::{ProcessSupervisor, SpawnOptions, Supervised};

use argv::ArgvContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverStatus {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Dead { reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum PowerAction {
    Acpi,
    Reset,
    Off,
}

/// Which node `extract_assets` (spec §4.4/§4.5) pulls out: a numbered disk
/// (`hdd_num`) or the firmware's pflash vars image (`pflash_vars`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetSelector {
    Disk(u32),
    PflashVars,
}

const DEFAULT_VNC_POLL_INTERVAL: Duration = Duration::from_millis(200);
const FROZEN_VNC_POLL_INTERVAL: Duration = Duration::from_millis(1000);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BackendDriver {
    qemu_binary: String,
    basedir: PathBuf,
    config: VmConfig,
    runtime_flags: RuntimeFlags,
    model: BlockDeviceModel,
    status: DriverStatus,
    supervisor: ProcessSupervisor,
    snapshot_engine: SnapshotEngine,
    supervised: Option<Supervised>,
    qmp: Option<QmpTransport>,
    events: Option<mpsc::UnboundedReceiver<EventBody>>,
    vnc_poll_interval: Duration,
    balloon_target_mib: Option<u64>,
}

impl BackendDriver {
    pub fn new(qemu_binary: impl Into<String>, basedir: impl Into<PathBuf>, config: VmConfig) -> Self {
        let basedir = basedir.into();
        Self {
            qemu_binary: qemu_binary.into(),
            model: BlockDeviceModel::new(basedir.clone()),
            basedir,
            config,
            runtime_flags: RuntimeFlags::default(),
            status: DriverStatus::NotStarted,
            supervisor: ProcessSupervisor::new(),
            snapshot_engine: SnapshotEngine::new(SnapshotEngineConfig::default()),
            supervised: None,
            qmp: None,
            events: None,
            vnc_poll_interval: DEFAULT_VNC_POLL_INTERVAL,
            balloon_target_mib: None,
        }
    }

    pub fn status(&self) -> &DriverStatus {
        &self.status
    }

    pub fn vnc_poll_interval(&self) -> Duration {
        self.vnc_poll_interval
    }

    pub fn model(&self) -> &BlockDeviceModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut BlockDeviceModel {
        &mut self.model
    }

    /// Load a previously persisted Block Device Model, e.g. when
    /// reconstructing a driver after a restart with no live QEMU process.
    pub fn load_persisted_model(&mut self, value: serde_json::Value) -> Result<()> {
        self.model = BlockDeviceModel::from_map(value)?;
        Ok(())
    }

    // ---- start_vm / stop_vm ------------------------------------------

    pub async fn start_vm(&mut self, resume_snapshot: Option<&str>, delayed_start: bool) -> Result<()> {
        if !matches!(self.status, DriverStatus::NotStarted | DriverStatus::Stopped) {
            return Err(DriverError::Config("vm already started".into()));
        }
        self.status = DriverStatus::Starting;

        let snapshots_supported = self.snapshot_engine.can_handle_snapshots(&self.model);
        self.runtime_flags = self.config.freeze(snapshots_supported)?;

        if let Some(name) = resume_snapshot {
            self.snapshot_engine.prepare_load(&mut self.model, name)?;
        }

        self.spawn_and_connect().await?;

        if !delayed_start {
            self.qmp_call_fatal("cont", None).await?;
        }

        if let Some(name) = resume_snapshot {
            let ram_file = self.basedir.join("vm-snapshots").join(name);
            self.snapshot_engine.complete_load(self.qmp.as_ref().expect("just connected"), &ram_file, self.config.ram_mib).await?;
        }

        std::fs::write(self.basedir.join("backend.run"), json!({"backend": "qemu"}).to_string())?;
        self.status = DriverStatus::Running;
        Ok(())
    }

    pub async fn stop_vm(&mut self) -> Result<()> {
        self.status = DriverStatus::Stopping;

        if let Some(qmp) = &self.qmp {
            let _ = qmp.call("quit", None, CallOptions { fatal: false, timeout: Some(Duration::from_secs(5)) }).await;
        }
        if let Some(supervised) = self.supervised.take() {
            self.supervisor.stop(&supervised, GRACEFUL_STOP_TIMEOUT).await?;
        }
        self.qmp = None;
        self.events = None;

        let _ = std::fs::remove_file(self.basedir.join("backend.run"));
        std::fs::write(self.basedir.join("block-device-model.json"), self.model.to_map()?.to_string())?;

        self.status = DriverStatus::Stopped;
        Ok(())
    }

    // ---- power / eject -------------------------------------------------

    pub async fn power(&mut self, action: PowerAction) -> Result<()> {
        let cmd = match action {
            PowerAction::Acpi => "system_powerdown",
            PowerAction::Reset => "system_reset",
            PowerAction::Off => "quit",
        };
        self.qmp_call_fatal(cmd, None).await?;
        if matches!(action, PowerAction::Off) {
            self.status = DriverStatus::Stopping;
        }
        Ok(())
    }

    pub async fn eject_cd(&mut self) -> Result<()> {
        self.qmp_call_fatal("eject", Some(json!({ "device": "cd0" }))).await?;
        Ok(())
    }

    // ---- snapshots ------------------------------------------------------

    pub async fn save_snapshot(&mut self, name: &str) -> Result<()> {
        if !self.snapshot_engine.can_handle_snapshots(&self.model) {
            return Err(DriverError::Unsupported("snapshots unsupported: an nvme drive is attached".into()));
        }
        let qmp = self.qmp.clone().ok_or(DriverError::Disconnected)?;
        self.snapshot_engine
            .save_snapshot(&qmp, &mut self.model, name, self.config.ram_mib, self.balloon_target_mib)
            .await?;
        Ok(())
    }

    pub async fn load_snapshot(&mut self, name: &str) -> Result<()> {
        if !self.snapshot_engine.can_handle_snapshots(&self.model) {
            return Err(DriverError::Unsupported("snapshots unsupported: an nvme drive is attached".into()));
        }

        let status = self.query_status().await.unwrap_or_default();
        if status == "running" {
            self.qmp_call_fatal("stop", None).await?;
        }

        // Tear down the current QEMU process without touching tap/VLAN
        // allocations (`stop_only_qemu`, spec §5) — we only ever hold a
        // process handle here, so a plain supervisor stop already
        // satisfies that: no network resources are modeled or released.
        if let Some(supervised) = self.supervised.take() {
            self.supervisor.stop(&supervised, GRACEFUL_STOP_TIMEOUT).await?;
        }
        self.qmp = None;
        self.events = None;

        self.snapshot_engine.prepare_load(&mut self.model, name)?;
        self.spawn_and_connect().await?;

        let ram_file = self.basedir.join("vm-snapshots").join(name);
        self.snapshot_engine
            .complete_load(self.qmp.as_ref().expect("just connected"), &ram_file, self.config.ram_mib)
            .await?;
        Ok(())
    }

    /// Extract a named block node as a standalone file (spec §4.4/§4.5).
    /// If no state is currently loaded, the persisted Block Device Model
    /// written by `stop_vm` is loaded first so the selector can still be
    /// resolved against a stopped VM.
    pub fn extract_assets(
        &mut self,
        selector: AssetSelector,
        name: &str,
        dest_dir: &std::path::Path,
        format: DiskFormat,
    ) -> Result<PathBuf> {
        if self.status == DriverStatus::NotStarted {
            let state_path = self.basedir.join("block-device-model.json");
            if state_path.is_file() {
                let raw = std::fs::read_to_string(&state_path)?;
                let value = serde_json::from_str(&raw).map_err(|e| DriverError::Config(format!("corrupt block-device-model.json: {e}")))?;
                self.load_persisted_model(value)?;
            }
        }

        match selector {
            AssetSelector::Disk(hdd_num) => {
                let drive_id = format!("hd{hdd_num}");
                self.snapshot_engine.extract_assets(&self.model, &drive_id, name, dest_dir, format)
            }
            AssetSelector::PflashVars => {
                let source = self
                    .runtime_flags
                    .ovmf_vars_path
                    .clone()
                    .ok_or_else(|| DriverError::Config("no pflash vars image for this vm".into()))?;
                std::fs::create_dir_all(dest_dir)?;
                let dest = dest_dir.join(name);
                if format == DiskFormat::Raw {
                    std::fs::copy(&source, &dest)?;
                } else {
                    crate::snapshot::convert_image(&source, &dest, format)?;
                }
                Ok(dest)
            }
        }
    }

    // ---- audio capture ----------------------------------------------------

    pub async fn start_audiocapture(&mut self, filename: &str) -> Result<()> {
        self.hmc(&format!("wavcapture {filename} snd0 44100 16 2")).await
    }

    pub async fn stop_audiocapture(&mut self) -> Result<()> {
        self.hmc("stopcapture 0").await
    }

    async fn hmc(&self, command_line: &str) -> Result<()> {
        self.qmp_call_fatal("human-monitor-command", Some(json!({ "command-line": command_line }))).await?;
        Ok(())
    }

    // ---- status / freeze ---------------------------------------------------

    pub async fn cpu_stat(&self) -> Result<CpuStat> {
        let supervised = self.supervised.as_ref().ok_or(DriverError::Disconnected)?;
        procstat::cpu_stat(supervised.pid())
    }

    pub async fn is_shutdown(&self) -> Result<bool> {
        Ok(self.query_status().await? == "shutdown")
    }

    pub async fn freeze_vm(&mut self) -> Result<()> {
        self.qmp_call_fatal("stop", None).await?;
        self.vnc_poll_interval = FROZEN_VNC_POLL_INTERVAL;
        Ok(())
    }

    pub async fn cont_vm(&mut self) -> Result<()> {
        self.qmp_call_fatal("cont", None).await?;
        self.vnc_poll_interval = DEFAULT_VNC_POLL_INTERVAL;
        Ok(())
    }

    pub async fn mouse_hide(&mut self, border_offset: i32) -> Result<()> {
        self.hmc(&format!("mouse_move {border_offset} {border_offset}")).await
    }

    // ---- internals ------------------------------------------------------

    async fn spawn_and_connect(&mut self) -> Result<()> {
        let qmp_socket = self.basedir.join("qmp_socket");
        let serial0_log = self.basedir.join("serial0.log");
        let console_fifo_dir = self.basedir.clone();
        let _ = std::fs::remove_file(&qmp_socket);

        let ctx = ArgvContext {
            qemu_binary: &self.qemu_binary,
            qmp_socket: &qmp_socket,
            serial0_log: &serial0_log,
            console_fifo_dir: &console_fifo_dir,
            snapshots_supported: self.runtime_flags.only_migratable,
        };
        let argv = argv::build_argv(&self.config, &self.runtime_flags, &self.model, &ctx)?;

        let supervised = self
            .supervisor
            .spawn(SpawnOptions { argv, env: Vec::new(), pid_file: self.basedir.join("qemu.pid") })
            .await?;
        self.supervised = Some(supervised);

        // QEMU needs a moment to create the listening socket after spawn.
        let mut attempts = 0;
        loop {
            match QmpTransport::connect(&qmp_socket).await {
                Ok((qmp, events)) => {
                    self.qmp = Some(qmp);
                    self.events = Some(events);
                    return Ok(());
                }
                Err(DriverError::Io(_)) if attempts < 50 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn query_status(&self) -> Result<String> {
        let outcome = self.qmp_call_fatal("query-status", None).await?;
        let value = outcome.into_value().unwrap_or(serde_json::Value::Null);
        Ok(value.get("status").and_then(|v| v.as_str()).unwrap_or("unknown").to_string())
    }

    async fn qmp_call_fatal(&self, execute: &str, arguments: Option<serde_json::Value>) -> Result<CallOutcome> {
        let qmp = self.qmp.as_ref().ok_or(DriverError::Disconnected)?;
        qmp.call(execute, arguments, CallOptions { fatal: true, timeout: None }).await
    }
}
