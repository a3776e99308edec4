//! VM configuration, frozen at `start_vm`.
//!
//! Replaces the source's process-wide variables map (Design Note 9d): all
//! configuration needed to build a QEMU invocation lives in [`VmConfig`],
//! derived once and threaded explicitly through the driver. Anything the
//! source discovers at runtime (e.g. an OVMF firmware path) is re-expressed
//! here as an output of [`VmConfig::freeze`], not a later mutation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{DriverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    X86_64,
    Aarch64,
    Arm,
    Ppc64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareMode {
    Bios,
    UefiSplit,
    UefiSingle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NicType {
    User,
    Tap,
    Vde,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicConfig {
    pub nic_type: NicType,
    pub mac: Option<String>,
    /// Script path for `tap` mode, or management socket path for `vde`.
    pub backend_arg: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TpmConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub enabled: bool,
    pub driver: String,
}

/// Immutable-after-init VM description (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub arch: Architecture,
    pub cpus: u32,
    pub ram_mib: u64,
    pub machine_type: String,
    pub firmware: FirmwareMode,
    pub boot_order: String,
    pub nics: Vec<NicConfig>,
    pub serial_count: u32,
    pub virtio_console_count: u32,
    pub tpm: Option<TpmConfig>,
    pub audio: Option<AudioConfig>,
    pub vga: Option<String>,
    pub worker_id: u32,
}

/// Outputs discovered while freezing a [`VmConfig`] for boot — firmware
/// paths located on disk, synthesized MAC addresses, etc. Re-emitted to the
/// parent rather than stashed in a mutable global (Design Note 9d).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeFlags {
    pub ovmf_code_path: Option<PathBuf>,
    pub ovmf_vars_path: Option<PathBuf>,
    pub synthesized_macs: Vec<String>,
    pub only_migratable: bool,
}

/// Fixed candidate locations scanned for OVMF firmware on x86_64 UEFI boots.
const OVMF_CODE_CANDIDATES: &[&str] = &[
    "/usr/share/OVMF/OVMF_CODE.fd",
    "/usr/share/edk2/ovmf/OVMF_CODE.fd",
    "/usr/share/qemu/OVMF_CODE.fd",
    "/usr/share/ovmf/OVMF.fd",
];

impl VmConfig {
    /// Validate the configuration and resolve runtime-discovered paths
    /// (OVMF firmware, synthesized MACs). Called once from `start_vm`.
    pub fn freeze(&self, snapshots_supported: bool) -> Result<RuntimeFlags> {
        if self.cpus == 0 {
            return Err(DriverError::Config("cpus must be >= 1".into()));
        }
        if self.ram_mib == 0 {
            return Err(DriverError::Config("ram_mib must be >= 1".into()));
        }
        if self.boot_order.is_empty() {
            return Err(DriverError::Config("boot_order must not be empty".into()));
        }

        let mut flags = RuntimeFlags {
            only_migratable: snapshots_supported,
            ..Default::default()
        };

        if matches!(self.firmware, FirmwareMode::UefiSplit | FirmwareMode::UefiSingle) {
            if !matches!(self.arch, Architecture::X86_64) {
                return Err(DriverError::Config(
                    "uefi firmware scanning is only implemented for x86_64".into(),
                ));
            }
            let code = OVMF_CODE_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
                .ok_or_else(|| DriverError::Config("no OVMF firmware found".into()))?;
            let vars = PathBuf::from(code.to_string_lossy().replace("CODE", "VARS"));
            flags.ovmf_code_path = Some(code);
            if matches!(self.firmware, FirmwareMode::UefiSplit) {
                flags.ovmf_vars_path = Some(vars);
            }
        }

        for (idx, nic) in self.nics.iter().enumerate() {
            if nic.mac.is_none() {
                flags
                    .synthesized_macs
                    .push(synthesize_mac(self.worker_id, idx as u32));
            }
        }

        Ok(flags)
    }
}

/// Deterministic MAC synthesis from worker id + nic index, matching the
/// source's convention of deriving locally-administered MACs so multiple
/// concurrent workers never collide on the same host bridge.
fn synthesize_mac(worker_id: u32, nic_index: u32) -> String {
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        (worker_id >> 8) & 0xff,
        worker_id & 0xff,
        nic_index & 0xff
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> VmConfig {
        VmConfig {
            arch: Architecture::X86_64,
            cpus: 2,
            ram_mib: 2048,
            machine_type: "q35".into(),
            firmware: FirmwareMode::Bios,
            boot_order: "c".into(),
            nics: vec![NicConfig {
                nic_type: NicType::User,
                mac: None,
                backend_arg: None,
            }],
            serial_count: 1,
            virtio_console_count: 0,
            tpm: None,
            audio: None,
            vga: None,
            worker_id: 1,
        }
    }

    #[test]
    fn freeze_rejects_zero_cpus() {
        let mut cfg = base_config();
        cfg.cpus = 0;
        assert!(matches!(cfg.freeze(true), Err(DriverError::Config(_))));
    }

    #[test]
    fn freeze_synthesizes_missing_macs() {
        let cfg = base_config();
        let flags = cfg.freeze(true).unwrap();
        assert_eq!(flags.synthesized_macs.len(), 1);
        assert!(flags.synthesized_macs[0].starts_with("52:54:00:"));
    }

    #[test]
    fn freeze_propagates_only_migratable() {
        let cfg = base_config();
        assert!(cfg.freeze(true).unwrap().only_migratable);
        assert!(!cfg.freeze(false).unwrap().only_migratable);
    }

    #[test]
    fn freeze_rejects_uefi_on_non_x86() {
        let mut cfg = base_config();
        cfg.arch = Architecture::Aarch64;
        cfg.firmware = FirmwareMode::UefiSplit;
        assert!(cfg.freeze(true).is_err());
    }
}
