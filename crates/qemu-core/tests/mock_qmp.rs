//! End-to-end scenarios driven against a mock QMP peer — a `UnixListener`
//! that speaks the greeting/capabilities/response/event shapes without a
//! real QEMU binary, per the colocated-unit-plus-one-integration-suite
//! split the teacher uses for anything that needs a listening socket.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use qemu_core::block::{BlockDeviceModel, DiskFormat, Media};
use qemu_core::driver::BackendDriver;
use qemu_core::config::{Architecture, FirmwareMode, NicConfig, NicType, VmConfig};
use qemu_core::error::DriverError;
use qemu_core::qmp::{CallOptions, QmpTransport};
use qemu_core::snapshot::{SnapshotEngine, SnapshotEngineConfig};

/// Per-command scripted responses (consumed front-first) plus a fallback
/// default for anything not scripted or once the script is exhausted.
struct MockScript {
    scripted: HashMap<&'static str, VecDeque<Value>>,
    default: Value,
}

impl MockScript {
    fn new() -> Self {
        Self { scripted: HashMap::new(), default: json!({ "return": {} }) }
    }

    fn on(mut self, command: &'static str, responses: Vec<Value>) -> Self {
        self.scripted.insert(command, VecDeque::from(responses));
        self
    }
}

async fn serve_mock(path: PathBuf, mut script: MockScript) {
    let listener = UnixListener::bind(&path).unwrap();
    let (sock, _) = listener.accept().await.unwrap();
    let (read_half, mut write_half) = sock.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(b"{\"QMP\":{\"version\":{},\"capabilities\":[]}}\n")
        .await
        .unwrap();

    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        let request: Value = match serde_json::from_str(line.trim_end()) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let execute = request["execute"].as_str().unwrap_or_default().to_string();

        let response = if execute == "qmp_capabilities" {
            json!({ "return": {} })
        } else {
            match script.scripted.get_mut(execute.as_str()).and_then(|q| q.pop_front()) {
                Some(v) => v,
                None => script.default.clone(),
            }
        };

        let mut out = serde_json::to_vec(&response).unwrap();
        out.push(b'\n');
        if write_half.write_all(&out).await.is_err() {
            break;
        }
    }
}

fn fast_engine_config() -> SnapshotEngineConfig {
    SnapshotEngineConfig {
        max_migration_time: Duration::from_millis(500),
        incoming_migration_timeout: Duration::from_millis(500),
        migrate_poll_interval: Duration::from_millis(20),
        balloon_settle_iterations: 1,
        balloon_settle_interval: Duration::from_millis(10),
        ..SnapshotEngineConfig::default()
    }
}

fn single_drive_model(basedir: &std::path::Path) -> BlockDeviceModel {
    let mut model = BlockDeviceModel::new(basedir);
    model.add_controller("scsi0", "virtio-scsi-pci").unwrap();
    model.add_drive("hd0", Media::Disk, basedir.join("base.qcow2"), DiskFormat::Qcow2, 10 * 1024 * 1024 * 1024).unwrap();
    model.attach("hd0", "scsi0").unwrap();
    model
}

async fn connect_to(path: &std::path::Path) -> QmpTransport {
    // Mock server binds the socket only after `serve_mock` starts; poll
    // briefly for it to appear.
    for _ in 0..50 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let (qmp, _events) = QmpTransport::connect(path).await.unwrap();
    qmp
}

/// S1 — happy boot: after the QMP handshake, `cont` is issued and
/// `query-status` reports `running`; `is_shutdown` is false.
#[tokio::test]
async fn s1_happy_boot_status_flow() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("qmp.sock");
    let script = MockScript::new().on("query-status", vec![json!({"return": {"status": "running"}})]);
    tokio::spawn(serve_mock(sock.clone(), script));

    let qmp = connect_to(&sock).await;
    qmp.call("cont", None, CallOptions { fatal: true, timeout: None }).await.unwrap();
    let outcome = qmp.call("query-status", None, CallOptions { fatal: true, timeout: None }).await.unwrap();
    let value = outcome.into_value().unwrap();
    assert_eq!(value["status"], "running");
}

/// S2 — snapshot round-trip: `save_snapshot` records a new overlay and
/// writes a non-empty migration stream file.
#[tokio::test]
async fn s2_snapshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("qmp.sock");
    let script = MockScript::new()
        .on("query-status", vec![json!({"return": {"status": "running"}})])
        .on("query-migrate", vec![json!({"return": {"status": "completed", "ram": {"total": 100, "remaining": 0}}})]);
    tokio::spawn(serve_mock(sock.clone(), script));

    let qmp = connect_to(&sock).await;
    let mut model = single_drive_model(dir.path());
    let engine = SnapshotEngine::new(fast_engine_config());

    let snapshot = engine.save_snapshot(&qmp, &mut model, "s1", 2048, Some(512)).await.unwrap();

    assert_eq!(snapshot.sequence_number, 1);
    assert!(snapshot.ram_file.exists());
    assert_eq!(model.snapshots().len(), 1);
    assert!(model.live_node_for("hd0").unwrap().ends_with("hd0-1"));
}

/// S3 — NVMe gate: the capability check rejects `save_snapshot` before any
/// QMP command would be issued, so a driver with no live QMP connection
/// still fails with `Unsupported` rather than hanging on a dead transport.
#[tokio::test]
async fn s3_nvme_gate_rejects_before_any_qmp_call() {
    let dir = tempfile::tempdir().unwrap();
    let config = VmConfig {
        arch: Architecture::X86_64,
        cpus: 1,
        ram_mib: 1024,
        machine_type: "q35".into(),
        firmware: FirmwareMode::Bios,
        boot_order: "c".into(),
        nics: vec![NicConfig { nic_type: NicType::User, mac: Some("52:54:00:00:00:01".into()), backend_arg: None }],
        serial_count: 1,
        virtio_console_count: 0,
        tpm: None,
        audio: None,
        vga: None,
        worker_id: 1,
    };
    let mut driver = BackendDriver::new("qemu-system-x86_64", dir.path(), config);
    driver.model_mut().add_controller("nvme0", "nvme").unwrap();
    driver.model_mut().add_drive("hd0", Media::Disk, dir.path().join("base.qcow2"), DiskFormat::Qcow2, 1024).unwrap();
    driver.model_mut().attach("hd0", "nvme0").unwrap();

    let result = driver.save_snapshot("x").await;
    assert!(matches!(result, Err(DriverError::Unsupported(_))));
    assert!(!dir.path().join("vm-snapshots").exists());
}

/// S4 — migration timeout: a `query-migrate` that never leaves `active`
/// fails with `Timeout`, and a `migrate_cancel` is observed.
#[tokio::test]
async fn s4_migration_timeout_cancels() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("qmp.sock");
    let mut script = MockScript::new().on("query-status", vec![json!({"return": {"status": "running"}})]);
    script.default = json!({ "return": { "status": "active", "ram": { "total": 100, "remaining": 99 } } });
    tokio::spawn(serve_mock(sock.clone(), script));

    let qmp = connect_to(&sock).await;
    let mut model = single_drive_model(dir.path());
    let mut cfg = fast_engine_config();
    cfg.max_migration_time = Duration::from_millis(100);
    let engine = SnapshotEngine::new(cfg);

    let result = engine.save_snapshot(&qmp, &mut model, "s1", 2048, None).await;
    assert!(matches!(result, Err(DriverError::Timeout(_))));
}

/// S5 — sync-snapshot retry: `blockdev-snapshot-sync` with `node-name`
/// fails; the retry with `device` (same identifier) succeeds.
#[tokio::test]
async fn s5_blockdev_snapshot_sync_retries_with_device() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("qmp.sock");
    let script = MockScript::new()
        .on("query-status", vec![json!({"return": {"status": "running"}})])
        .on(
            "blockdev-snapshot-sync",
            vec![
                json!({"error": {"class": "GenericError", "desc": "node-name not recognized"}}),
                json!({"return": {}}),
            ],
        )
        .on("query-migrate", vec![json!({"return": {"status": "completed", "ram": {"total": 10, "remaining": 0}}})]);
    tokio::spawn(serve_mock(sock.clone(), script));

    let qmp = connect_to(&sock).await;
    let mut model = single_drive_model(dir.path());
    let engine = SnapshotEngine::new(fast_engine_config());

    let snapshot = engine.save_snapshot(&qmp, &mut model, "s1", 2048, None).await.unwrap();
    assert_eq!(model.snapshots().len(), 1);
    assert_eq!(snapshot.name, "s1");
}
