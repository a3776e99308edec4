//! QEMU argv construction (spec §4.5). Grounded in the teacher's
//! `QemuConfig::to_qemu_args` — flat `args.push("-flag"); args.push(value)`
//! pairs, one section per concern, in machine-readable order.

use std::path::{Path, PathBuf};

use crate::block::BlockDeviceModel;
use crate::config::{Architecture, FirmwareMode, NicType, RuntimeFlags, VmConfig};
use crate::error::{DriverError, Result};

/// Paths and knobs the Backend Driver supplies that aren't part of
/// `VmConfig` itself (spec §6 persisted-state locations).
pub struct ArgvContext<'a> {
    pub qemu_binary: &'a str,
    pub qmp_socket: &'a Path,
    pub serial0_log: &'a Path,
    pub console_fifo_dir: &'a Path,
    pub snapshots_supported: bool,
}

/// Build the full QEMU argv (binary name included as argv[0]) for
/// `config`/`flags`/`model`, per the construction rules in spec §4.5.
pub fn build_argv(
    config: &VmConfig,
    flags: &RuntimeFlags,
    model: &BlockDeviceModel,
    ctx: &ArgvContext,
) -> Result<Vec<String>> {
    let mut argv = vec![ctx.qemu_binary.to_string()];

    push_machine_and_arch(&mut argv, config)?;
    push_firmware(&mut argv, config, flags)?;

    argv.push("-smp".to_string());
    argv.push(config.cpus.to_string());
    argv.push("-m".to_string());
    argv.push(format!("{}", config.ram_mib));

    argv.push("-boot".to_string());
    argv.push(format!("order={}", config.boot_order));

    // Startup gating: always start paused; the driver issues `cont` after
    // the QMP handshake unless delayed_start was requested.
    argv.push("-S".to_string());
    argv.push("-no-shutdown".to_string());

    if ctx.snapshots_supported {
        argv.push("-only-migratable".to_string());
    }

    push_networking(&mut argv, config, flags)?;
    push_consoles(&mut argv, config, ctx);
    push_tpm(&mut argv, config);
    push_audio(&mut argv, config);

    argv.extend(model.gen_cmdline());

    argv.push("-chardev".to_string());
    argv.push(format!("socket,id=qmp_socket,path={},server,nowait", ctx.qmp_socket.display()));
    argv.push("-qmp".to_string());
    argv.push("chardev:qmp_socket".to_string());

    Ok(argv)
}

fn push_machine_and_arch(argv: &mut Vec<String>, config: &VmConfig) -> Result<()> {
    argv.push("-machine".to_string());
    argv.push(config.machine_type.clone());

    match config.arch {
        Architecture::X86_64 => {}
        Architecture::Aarch64 | Architecture::Arm => {
            argv.push("-device".to_string());
            argv.push(config.vga.clone().unwrap_or_else(|| "virtio-gpu-pci".to_string()));
            argv.push("-usb".to_string());
            argv.push("-device".to_string());
            argv.push("usb-kbd".to_string());
            // No ISA FDC is ever emitted on this path; the default machine
            // definitions for these boards don't carry one either.
        }
        Architecture::Ppc64 => {
            let vga = config
                .vga
                .as_deref()
                .ok_or_else(|| DriverError::Config("ppc64 (OFW) requires an explicit vga mode".into()))?;
            if !matches!(vga, "std" | "virtio") {
                return Err(DriverError::Config(format!("unsupported vga mode for ppc64: {vga}")));
            }
            argv.push("-vga".to_string());
            argv.push(vga.to_string());
            argv.push("-global".to_string());
            argv.push("spapr-pci-host-bridge.pre-2.8-indexing=off".to_string());
        }
    }
    Ok(())
}

fn push_firmware(argv: &mut Vec<String>, config: &VmConfig, flags: &RuntimeFlags) -> Result<()> {
    match config.firmware {
        FirmwareMode::Bios => {}
        FirmwareMode::UefiSplit => {
            let code = flags.ovmf_code_path.as_ref().ok_or_else(|| DriverError::Config("missing resolved OVMF code path".into()))?;
            let vars = flags.ovmf_vars_path.as_ref().ok_or_else(|| DriverError::Config("missing resolved OVMF vars path".into()))?;
            push_pflash(argv, code, true);
            push_pflash(argv, vars, false);
        }
        FirmwareMode::UefiSingle => {
            let code = flags.ovmf_code_path.as_ref().ok_or_else(|| DriverError::Config("missing resolved OVMF code path".into()))?;
            push_pflash(argv, code, false);
        }
    }
    Ok(())
}

fn push_pflash(argv: &mut Vec<String>, path: &PathBuf, readonly: bool) {
    argv.push("-drive".to_string());
    let readonly_flag = if readonly { "on" } else { "off" };
    argv.push(format!("if=pflash,format=raw,readonly={},file={}", readonly_flag, path.display()));
}

fn push_networking(argv: &mut Vec<String>, config: &VmConfig, flags: &RuntimeFlags) -> Result<()> {
    let mut synthesized = flags.synthesized_macs.iter();
    for (idx, nic) in config.nics.iter().enumerate() {
        let netdev_id = format!("net{idx}");
        let backend = match nic.nic_type {
            NicType::User => format!("user,id={netdev_id}"),
            NicType::Tap => {
                let script = nic.backend_arg.as_deref().unwrap_or("no");
                format!("tap,id={netdev_id},script={script}")
            }
            NicType::Vde => {
                let sock = nic
                    .backend_arg
                    .as_deref()
                    .ok_or_else(|| DriverError::Config("vde nic requires a management socket path".into()))?;
                format!("vde,id={netdev_id},sock={sock}")
            }
        };
        argv.push("-netdev".to_string());
        argv.push(backend);

        let mac = nic.mac.clone().or_else(|| synthesized.next().cloned()).ok_or_else(|| {
            DriverError::Config(format!("nic {idx} has no mac and none was synthesized"))
        })?;
        argv.push("-device".to_string());
        argv.push(format!("virtio-net-pci,netdev={netdev_id},mac={mac}"));
    }
    Ok(())
}

fn push_consoles(argv: &mut Vec<String>, config: &VmConfig, ctx: &ArgvContext) {
    argv.push("-chardev".to_string());
    argv.push(format!("ringbuf,id=serial0,logfile={},logappend=on", ctx.serial0_log.display()));
    argv.push("-serial".to_string());
    argv.push("chardev:serial0".to_string());

    if config.virtio_console_count > 0 {
        argv.push("-device".to_string());
        argv.push("virtio-serial".to_string());
        for i in 0..config.virtio_console_count {
            let in_fifo = ctx.console_fifo_dir.join(format!("virtio{i}.in"));
            let out_fifo = ctx.console_fifo_dir.join(format!("virtio{i}.out"));
            let chardev_id = format!("virtcon{i}");
            argv.push("-chardev".to_string());
            argv.push(format!(
                "pipe,id={chardev_id},path={}",
                // qemu's `pipe` chardev wants the shared prefix; `.in`/`.out`
                // are appended by qemu itself.
                in_fifo.with_extension("").display()
            ));
            let _ = &out_fifo;
            argv.push("-device".to_string());
            argv.push(format!("virtconsole,chardev={chardev_id},id=console{i}"));
        }
    }
}

fn push_tpm(argv: &mut Vec<String>, config: &VmConfig) {
    if let Some(tpm) = &config.tpm {
        if tpm.enabled {
            argv.push("-chardev".to_string());
            argv.push("socket,id=chrtpm,path=swtpm-sock".to_string());
            argv.push("-tpmdev".to_string());
            argv.push("emulator,id=tpm0,chardev=chrtpm".to_string());
            argv.push("-device".to_string());
            argv.push("tpm-tis,tpmdev=tpm0".to_string());
        }
    }
}

fn push_audio(argv: &mut Vec<String>, config: &VmConfig) {
    if let Some(audio) = &config.audio {
        if audio.enabled {
            argv.push("-audiodev".to_string());
            argv.push(format!("{},id=snd0", audio.driver));
            argv.push("-device".to_string());
            argv.push("intel-hda".to_string());
            argv.push("-device".to_string());
            argv.push("hda-duplex,audiodev=snd0".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Architecture, FirmwareMode, NicConfig, NicType, VmConfig};

    fn base_config() -> VmConfig {
        VmConfig {
            arch: Architecture::X86_64,
            cpus: 2,
            ram_mib: 2048,
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
        }
    }

    fn base_ctx(tmp: &Path) -> (PathBuf, PathBuf, PathBuf) {
        (tmp.join("qmp.sock"), tmp.join("serial0.log"), tmp.to_path_buf())
    }

    #[test]
    fn argv_contains_required_flags() {
        let dir = tempfile::tempdir().unwrap();
        let config = base_config();
        let flags = config.freeze(true).unwrap();
        let model = BlockDeviceModel::new(dir.path());
        let (qmp, serial, fifo_dir) = base_ctx(dir.path());
        let ctx = ArgvContext {
            qemu_binary: "qemu-system-x86_64",
            qmp_socket: &qmp,
            serial0_log: &serial,
            console_fifo_dir: &fifo_dir,
            snapshots_supported: true,
        };
        let argv = build_argv(&config, &flags, &model, &ctx).unwrap();
        assert!(argv.contains(&"-S".to_string()));
        assert!(argv.contains(&"-only-migratable".to_string()));
        assert!(argv.iter().any(|a| a == "chardev:qmp_socket"));
    }

    #[test]
    fn ppc64_requires_known_vga_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config();
        config.arch = Architecture::Ppc64;
        config.vga = None;
        let flags = config.freeze(true).unwrap();
        let model = BlockDeviceModel::new(dir.path());
        let (qmp, serial, fifo_dir) = base_ctx(dir.path());
        let ctx = ArgvContext {
            qemu_binary: "qemu-system-ppc64",
            qmp_socket: &qmp,
            serial0_log: &serial,
            console_fifo_dir: &fifo_dir,
            snapshots_supported: false,
        };
        assert!(build_argv(&config, &flags, &model, &ctx).is_err());
    }

    #[test]
    fn argv_generation_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let config = base_config();
        let flags = config.freeze(true).unwrap();
        let model = BlockDeviceModel::new(dir.path());
        let (qmp, serial, fifo_dir) = base_ctx(dir.path());
        let ctx = ArgvContext {
            qemu_binary: "qemu-system-x86_64",
            qmp_socket: &qmp,
            serial0_log: &serial,
            console_fifo_dir: &fifo_dir,
            snapshots_supported: true,
        };
        let a = build_argv(&config, &flags, &model, &ctx).unwrap();
        let b = build_argv(&config, &flags, &model, &ctx).unwrap();
        assert_eq!(a, b);
    }
}
