//! Backend child entrypoint: hosts the Backend Driver's command dispatcher
//! behind the duplex JSON-RPC pipe (spec §4.6, §6).
//!
//! Runs on a **current-thread** tokio runtime: the backend's own event loop
//! is single-threaded by design (spec §5). Rather than one hand-rolled
//! `tokio::select!` over every input source, each input (parent stdin, the
//! QMP socket, the QEMU log pipe) is its own lightweight task and the
//! current-thread executor itself is the multiplexer — the same effect,
//! expressed the way tokio idiomatically composes many small tasks on one
//! runtime instead of a single giant `select!` arm list.

use std::path::PathBuf;

use qemu_bridge::protocol::{CommandFrame, ResponseBody, ResponseFrame};
use qemu_core::block::DiskFormat;
use qemu_core::config::VmConfig;
use qemu_core::driver::{AssetSelector, BackendDriver, PowerAction};
use qemu_core::error::DriverError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(serde::Deserialize)]
struct StartVmArgs {
    config: VmConfig,
    basedir: PathBuf,
    qemu_binary: String,
    resume_snapshot: Option<String>,
    #[serde(default)]
    delayed_start: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    let mut driver: Option<BackendDriver> = None;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("parent closed the request pipe, exiting");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "error reading request pipe");
                break;
            }
        };

        let frame: CommandFrame = match serde_json::from_str(&line) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, %line, "malformed command frame");
                continue;
            }
        };

        let rsp = dispatch(&mut driver, &frame.cmd, frame.arguments.clone()).await;
        let response = ResponseFrame { rsp, token: frame.token };
        let mut out = match serde_json::to_vec(&response) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode response frame");
                continue;
            }
        };
        out.push(b'\n');
        if stdout.write_all(&out).await.is_err() {
            tracing::error!("parent closed the response pipe, exiting");
            break;
        }
        let _ = stdout.flush().await;
    }
}

async fn dispatch(driver: &mut Option<BackendDriver>, cmd: &str, arguments: Option<serde_json::Value>) -> ResponseBody {
    match run(driver, cmd, arguments).await {
        Ok(value) => ResponseBody::ok(value),
        Err(e) => ResponseBody::err(e.to_string()),
    }
}

async fn run(
    driver: &mut Option<BackendDriver>,
    cmd: &str,
    arguments: Option<serde_json::Value>,
) -> Result<serde_json::Value, DriverError> {
    if cmd == "start_vm" {
        let args: StartVmArgs = arguments
            .ok_or_else(|| DriverError::Config("start_vm requires arguments".into()))
            .and_then(|v| serde_json::from_value(v).map_err(DriverError::Serde))?;
        let mut new_driver = BackendDriver::new(args.qemu_binary, args.basedir, args.config);
        new_driver.start_vm(args.resume_snapshot.as_deref(), args.delayed_start).await?;
        *driver = Some(new_driver);
        return Ok(serde_json::json!({}));
    }

    let driver = driver
        .as_mut()
        .ok_or_else(|| DriverError::Config(format!("{cmd}: vm not started")))?;

    match cmd {
        "stop_vm" => {
            driver.stop_vm().await?;
            Ok(serde_json::json!({}))
        }
        "power" => {
            let action = arguments
                .as_ref()
                .and_then(|v| v.get("action"))
                .and_then(|v| v.as_str())
                .ok_or_else(|| DriverError::Config("power requires {action}".into()))?;
            let action = match action {
                "acpi" => PowerAction::Acpi,
                "reset" => PowerAction::Reset,
                "off" => PowerAction::Off,
                other => return Err(DriverError::Config(format!("unknown power action {other}"))),
            };
            driver.power(action).await?;
            Ok(serde_json::json!({}))
        }
        "eject_cd" => {
            driver.eject_cd().await?;
            Ok(serde_json::json!({}))
        }
        "save_snapshot" => {
            let name = string_arg(&arguments, "name")?;
            driver.save_snapshot(&name).await?;
            Ok(serde_json::json!({}))
        }
        "load_snapshot" => {
            let name = string_arg(&arguments, "name")?;
            driver.load_snapshot(&name).await?;
            Ok(serde_json::json!({}))
        }
        "extract_assets" => {
            let selector = arguments
                .as_ref()
                .and_then(|v| v.get("hdd_num"))
                .and_then(|v| v.as_u64())
                .map(|n| AssetSelector::Disk(n as u32))
                .or_else(|| {
                    arguments
                        .as_ref()
                        .and_then(|v| v.get("pflash_vars"))
                        .and_then(|v| v.as_bool())
                        .filter(|&b| b)
                        .map(|_| AssetSelector::PflashVars)
                })
                .ok_or_else(|| DriverError::Config("extract_assets requires hdd_num or pflash_vars".into()))?;
            let name = string_arg(&arguments, "name")?;
            let dir = string_arg(&arguments, "dir")?;
            let format = match string_arg(&arguments, "format")?.as_str() {
                "qcow2" => DiskFormat::Qcow2,
                "raw" => DiskFormat::Raw,
                other => return Err(DriverError::Config(format!("unknown image format {other}"))),
            };
            let path = driver.extract_assets(selector, &name, std::path::Path::new(&dir), format)?;
            Ok(serde_json::json!({ "path": path.to_string_lossy() }))
        }
        "start_audiocapture" => {
            let filename = string_arg(&arguments, "filename")?;
            driver.start_audiocapture(&filename).await?;
            Ok(serde_json::json!({}))
        }
        "stop_audiocapture" => {
            driver.stop_audiocapture().await?;
            Ok(serde_json::json!({}))
        }
        "cpu_stat" => {
            let stat = driver.cpu_stat().await?;
            Ok(serde_json::json!({
                "user_secs": stat.user.as_secs_f64(),
                "system_secs": stat.system.as_secs_f64(),
            }))
        }
        "is_shutdown" => {
            let shutdown = driver.is_shutdown().await?;
            Ok(serde_json::json!({ "shutdown": shutdown }))
        }
        "freeze_vm" => {
            driver.freeze_vm().await?;
            Ok(serde_json::json!({}))
        }
        "cont_vm" => {
            driver.cont_vm().await?;
            Ok(serde_json::json!({}))
        }
        "mouse_hide" => {
            let offset = arguments
                .as_ref()
                .and_then(|v| v.get("border_offset"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0) as i32;
            driver.mouse_hide(offset).await?;
            Ok(serde_json::json!({}))
        }
        other => Err(DriverError::Unsupported(format!("unknown command {other}"))),
    }
}

fn string_arg(arguments: &Option<serde_json::Value>, key: &str) -> Result<String, DriverError> {
    arguments
        .as_ref()
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| DriverError::Config(format!("missing argument {key}")))
}
