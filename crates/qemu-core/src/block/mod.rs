//! Block Device Model (spec §3, §4.3) — a declarative, serializable tree of
//! controllers, drives, and per-snapshot overlay files.
//!
//! Cyclic references (Drive ↔ DrivePath ↔ Controller) are resolved by
//! storing every node in an arena keyed by id and referencing by id rather
//! than by pointer, per Design Note 9(a); `to_map`/`from_map` therefore
//! fall out of `#[derive(Serialize, Deserialize)]` on the arena maps
//! themselves rather than needing a bespoke tree walk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Media {
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskFormat {
    Qcow2,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    WriteBack,
    WriteThrough,
    None,
    Unsafe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controller {
    pub id: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrivePath {
    pub id: String,
    pub controller: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub id: String,
    pub media: Media,
    pub node_name: String,
    pub source_file: PathBuf,
    pub format: DiskFormat,
    pub size_bytes: u64,
    pub bootindex: Option<u32>,
    pub cache: CachePolicy,
    pub serial: Option<String>,
    pub paths: Vec<DrivePath>,
}

/// Where an overlay's reads fall through to when missing locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backing {
    /// The drive's original source file.
    BaseFile,
    /// Another overlay, by node name.
    Overlay(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Overlay {
    pub node_name: String,
    pub file: PathBuf,
    pub backing: Backing,
    /// The snapshot sequence number that created this overlay (the model's
    /// own bookkeeping, not part of the qcow2 file itself). `0` marks the
    /// implicit overlay created by `add_drive` for a cdrom/read-only base,
    /// which predates any snapshot.
    pub sequence_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub sequence_number: u64,
    pub ram_file: PathBuf,
    /// drive id → overlay node-name that was the live head at save time.
    pub block_overlays: BTreeMap<String, String>,
}

/// The full model: arenas of controllers/drives keyed by id, every overlay
/// ever created (keyed by node name), the current live head per drive, and
/// the ordered snapshot list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDeviceModel {
    basedir: PathBuf,
    controllers: BTreeMap<String, Controller>,
    drives: BTreeMap<String, Drive>,
    overlays: BTreeMap<String, Overlay>,
    /// drive id → node name of its current live (writable) node.
    live_node: BTreeMap<String, String>,
    snapshots: Vec<Snapshot>,
}

impl BlockDeviceModel {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        Self {
            basedir: basedir.into(),
            controllers: BTreeMap::new(),
            drives: BTreeMap::new(),
            overlays: BTreeMap::new(),
            live_node: BTreeMap::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn add_controller(&mut self, id: impl Into<String>, model: impl Into<String>) -> Result<&Controller> {
        let id = id.into();
        if self.controllers.contains_key(&id) {
            return Err(DriverError::Config(format!("duplicate controller id {id}")));
        }
        self.controllers.insert(id.clone(), Controller { id: id.clone(), model: model.into() });
        Ok(self.controllers.get(&id).expect("just inserted"))
    }

    /// For `cdrom` and read-only base images the initial live node is a
    /// thin qcow2 overlay over the base, so guest writes never touch the
    /// shared base image (spec §4.3).
    pub fn add_drive(
        &mut self,
        id: impl Into<String>,
        media: Media,
        base_file: impl Into<PathBuf>,
        format: DiskFormat,
        size_bytes: u64,
    ) -> Result<&Drive> {
        let id = id.into();
        if self.drives.contains_key(&id) {
            return Err(DriverError::Config(format!("duplicate drive id {id}")));
        }
        let base_file = base_file.into();
        let base_node = format!("{id}-base");

        let needs_cow_base = matches!(media, Media::Cdrom) || format == DiskFormat::Raw;
        let live_node = if needs_cow_base {
            let overlay_node = format!("{id}-0");
            let overlay_path = self.overlay_path(&id, 0);
            self.overlays.insert(
                overlay_node.clone(),
                Overlay {
                    node_name: overlay_node.clone(),
                    file: overlay_path,
                    backing: Backing::BaseFile,
                    sequence_number: 0,
                },
            );
            overlay_node
        } else {
            base_node.clone()
        };

        let drive = Drive {
            id: id.clone(),
            media,
            node_name: base_node,
            source_file: base_file,
            format,
            size_bytes,
            bootindex: None,
            cache: CachePolicy::WriteBack,
            serial: None,
            paths: Vec::new(),
        };
        self.drives.insert(id.clone(), drive);
        self.live_node.insert(id.clone(), live_node);
        Ok(self.drives.get(&id).expect("just inserted"))
    }

    pub fn attach(&mut self, drive_id: &str, controller_id: &str) -> Result<DrivePath> {
        if !self.controllers.contains_key(controller_id) {
            return Err(DriverError::Config(format!("unknown controller {controller_id}")));
        }
        let drive = self
            .drives
            .get_mut(drive_id)
            .ok_or_else(|| DriverError::Config(format!("unknown drive {drive_id}")))?;
        let path = DrivePath {
            id: format!("{drive_id}-path{}", drive.paths.len()),
            controller: controller_id.to_string(),
        };
        drive.paths.push(path.clone());
        Ok(path)
    }

    /// Create a fresh qcow2 overlay over `drive_id`'s current live node and
    /// make it the new live node. The overlay filename is derived solely
    /// from drive id + sequence number, so the same snapshot name always
    /// produces the same file (spec §4.3 filename stability).
    pub fn add_overlay(&mut self, drive_id: &str, sequence_number: u64) -> Result<Overlay> {
        if sequence_number == 0 {
            return Err(DriverError::Config("sequence_number 0 is reserved for the implicit base overlay".into()));
        }
        if let Some(max) = self.max_sequence_number() {
            if sequence_number <= max {
                return Err(DriverError::Config(format!(
                    "snapshot sequence numbers must strictly increase (got {sequence_number}, have {max})"
                )));
            }
        }
        let current_live = self
            .live_node
            .get(drive_id)
            .cloned()
            .ok_or_else(|| DriverError::Config(format!("unknown drive {drive_id}")))?;

        let node_name = format!("{drive_id}-{sequence_number}");
        let file = self.overlay_path(drive_id, sequence_number);
        let overlay = Overlay {
            node_name: node_name.clone(),
            file,
            backing: Backing::Overlay(current_live),
            sequence_number,
        };
        self.overlays.insert(node_name.clone(), overlay.clone());
        self.live_node.insert(drive_id.to_string(), node_name);
        Ok(overlay)
    }

    /// Append a named snapshot: allocate the next sequence number, create
    /// one overlay per drive, and record the mapping. Returns the new
    /// [`Snapshot`]; callers (the Snapshot Engine) drive the matching
    /// `blockdev-snapshot-sync` QMP calls, one per returned overlay.
    pub fn begin_snapshot(&mut self, name: &str) -> Result<Snapshot> {
        let sequence_number = self.max_sequence_number().unwrap_or(0) + 1;
        let mut block_overlays = BTreeMap::new();
        let drive_ids: Vec<String> = self.drives.keys().cloned().collect();
        for drive_id in drive_ids {
            let overlay = self.add_overlay(&drive_id, sequence_number)?;
            block_overlays.insert(drive_id, overlay.node_name);
        }
        let snapshot = Snapshot {
            name: name.to_string(),
            sequence_number,
            ram_file: self.basedir.join("vm-snapshots").join(name),
            block_overlays,
        };
        self.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    /// Drop every overlay created at a sequence strictly greater than
    /// `snapshot.sequence_number`, deleting the underlying files, and
    /// truncate the snapshot list. Restores each drive's live node to the
    /// overlay (or base) it had at that snapshot.
    pub fn revert_to(&mut self, sequence_number: u64) -> Result<()> {
        if !self.snapshots.iter().any(|s| s.sequence_number == sequence_number) {
            return Err(DriverError::Config(format!("no snapshot with sequence {sequence_number}")));
        }

        let stale: Vec<String> = self
            .overlays
            .values()
            .filter(|o| o.sequence_number > sequence_number)
            .map(|o| o.node_name.clone())
            .collect();

        for node_name in &stale {
            if let Some(overlay) = self.overlays.remove(node_name) {
                if overlay.file.exists() {
                    std::fs::remove_file(&overlay.file)?;
                }
            }
        }

        let drive_ids: Vec<String> = self.drives.keys().cloned().collect();
        for drive_id in drive_ids {
            let head = self
                .overlays
                .values()
                .filter(|o| o.node_name.starts_with(&format!("{drive_id}-")) && o.sequence_number <= sequence_number)
                .max_by_key(|o| o.sequence_number)
                .map(|o| o.node_name.clone())
                .unwrap_or_else(|| format!("{drive_id}-base"));
            self.live_node.insert(drive_id, head);
        }

        self.snapshots.retain(|s| s.sequence_number <= sequence_number);
        Ok(())
    }

    pub fn live_node_for(&self, drive_id: &str) -> Option<&str> {
        self.live_node.get(drive_id).map(String::as_str)
    }

    /// The node name an overlay was layered on top of — another overlay's
    /// node name, or the drive's base node for the drive's first overlay.
    pub fn backing_node_of(&self, overlay_node: &str) -> Option<&str> {
        let overlay = self.overlays.get(overlay_node)?;
        match &overlay.backing {
            Backing::BaseFile => {
                let drive_id = overlay_node.rsplit_once('-').map(|(id, _)| id)?;
                self.drives.get(drive_id).map(|d| d.node_name.as_str())
            }
            Backing::Overlay(node) => Some(node.as_str()),
        }
    }

    pub fn drive(&self, drive_id: &str) -> Option<&Drive> {
        self.drives.get(drive_id)
    }

    /// Resolve the on-disk file backing a node name: a drive's own
    /// `source_file` if `node_name` is that drive's base node, or the
    /// matching overlay's file otherwise.
    pub fn file_for_node(&self, node_name: &str) -> Option<&Path> {
        if let Some(overlay) = self.overlays.get(node_name) {
            return Some(overlay.file.as_path());
        }
        self.drives
            .values()
            .find(|d| d.node_name == node_name)
            .map(|d| d.source_file.as_path())
    }

    pub fn drives(&self) -> impl Iterator<Item = &Drive> {
        self.drives.values()
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// True iff any drive is modeled on a `nvme` controller — NVMe devices
    /// cannot be migrated, so snapshots must be rejected up front (spec
    /// §4.4 compatibility gate).
    pub fn can_handle_snapshots(&self) -> bool {
        !self.drives.values().any(|d| {
            d.paths.iter().any(|p| {
                self.controllers
                    .get(&p.controller)
                    .map(|c| c.model == "nvme")
                    .unwrap_or(false)
            })
        })
    }

    /// Emit the full QEMU argv fragment for every controller and drive,
    /// deterministic given a fixed model (spec §8 round-trip property).
    pub fn gen_cmdline(&self) -> Vec<String> {
        let mut argv = Vec::new();
        for controller in self.controllers.values() {
            argv.push("-device".to_string());
            argv.push(format!("{},id={}", controller.model, controller.id));
        }
        for drive in self.drives.values() {
            argv.extend(self.gen_blockdev_chain(drive));
            if let Some(primary) = drive.paths.first() {
                argv.push("-device".to_string());
                argv.push(self.gen_device_line(drive, primary));
                for extra in &drive.paths[1..] {
                    argv.push("-device".to_string());
                    argv.push(self.gen_device_line(drive, extra));
                }
            }
        }
        argv
    }

    fn gen_blockdev_chain(&self, drive: &Drive) -> Vec<String> {
        let mut argv = Vec::new();
        let format_str = match drive.format {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        };
        argv.push("-blockdev".to_string());
        argv.push(format!(
            "driver={},node-name={},file.driver=file,file.filename={}",
            format_str,
            drive.node_name,
            drive.source_file.display(),
        ));

        let mut chain: Vec<&Overlay> = self
            .overlays
            .values()
            .filter(|o| o.node_name.starts_with(&format!("{}-", drive.id)))
            .collect();
        chain.sort_by_key(|o| o.sequence_number);
        for overlay in chain {
            if overlay.sequence_number > self.current_sequence_for(drive) {
                continue;
            }
            let backing_node = match &overlay.backing {
                Backing::BaseFile => drive.node_name.clone(),
                Backing::Overlay(node) => node.clone(),
            };
            argv.push("-blockdev".to_string());
            argv.push(format!(
                "driver=qcow2,node-name={},file.driver=file,file.filename={},backing={}",
                overlay.node_name,
                overlay.file.display(),
                backing_node,
            ));
        }
        argv
    }

    fn current_sequence_for(&self, drive: &Drive) -> u64 {
        self.live_node
            .get(&drive.id)
            .and_then(|node| self.overlays.get(node))
            .map(|o| o.sequence_number)
            .unwrap_or(u64::MAX)
    }

    fn gen_device_line(&self, drive: &Drive, path: &DrivePath) -> String {
        let live = self.live_node.get(&drive.id).cloned().unwrap_or_else(|| drive.node_name.clone());
        let media = match drive.media {
            Media::Disk => "disk",
            Media::Cdrom => "cdrom",
        };
        let mut line = format!("virtio-blk-pci,drive={live},bus={},media={media}", path.controller);
        if let Some(idx) = drive.bootindex {
            line.push_str(&format!(",bootindex={idx}"));
        }
        if let Some(serial) = &drive.serial {
            line.push_str(&format!(",serial={serial}"));
        }
        line
    }

    pub fn to_map(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(DriverError::Serde)
    }

    pub fn from_map(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(DriverError::Serde)
    }

    fn overlay_path(&self, drive_id: &str, sequence_number: u64) -> PathBuf {
        self.basedir.join(format!("{drive_id}-{sequence_number}.qcow2"))
    }

    fn max_sequence_number(&self) -> Option<u64> {
        self.overlays.values().map(|o| o.sequence_number).max()
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> BlockDeviceModel {
        let dir = tempfile::tempdir().unwrap();
        let mut model = BlockDeviceModel::new(dir.into_path());
        model.add_controller("scsi0", "virtio-scsi-pci").unwrap();
        model.add_drive("hd0", Media::Disk, "/images/base.qcow2", DiskFormat::Qcow2, 10 * 1024 * 1024 * 1024).unwrap();
        model.attach("hd0", "scsi0").unwrap();
        model
    }

    #[test]
    fn duplicate_controller_rejected() {
        let mut model = sample_model();
        assert!(model.add_controller("scsi0", "ahci").is_err());
    }

    #[test]
    fn attach_requires_existing_controller() {
        let mut model = sample_model();
        assert!(model.attach("hd0", "nope").is_err());
    }

    #[test]
    fn snapshot_sequence_numbers_strictly_increase() {
        let mut model = sample_model();
        let s1 = model.begin_snapshot("s1").unwrap();
        let s2 = model.begin_snapshot("s2").unwrap();
        assert_eq!(s1.sequence_number, 1);
        assert_eq!(s2.sequence_number, 2);
        assert!(model.add_overlay("hd0", 1).is_err());
    }

    #[test]
    fn overlay_filename_is_stable() {
        let mut model = sample_model();
        let s1 = model.begin_snapshot("s1").unwrap();
        let overlay = &model.overlays[&s1.block_overlays["hd0"]];
        assert_eq!(overlay.file, model.overlay_path("hd0", 1));
    }

    #[test]
    fn revert_to_drops_later_overlays() {
        let mut model = sample_model();
        model.begin_snapshot("s1").unwrap();
        model.begin_snapshot("s2").unwrap();
        assert_eq!(model.snapshots().len(), 2);
        model.revert_to(1).unwrap();
        assert_eq!(model.snapshots().len(), 1);
        assert!(model.live_node_for("hd0").unwrap().ends_with("hd0-1"));
    }

    #[test]
    fn to_map_from_map_round_trips() {
        let mut model = sample_model();
        model.begin_snapshot("s1").unwrap();
        let map = model.to_map().unwrap();
        let restored = BlockDeviceModel::from_map(map).unwrap();
        assert_eq!(restored.snapshots().len(), model.snapshots().len());
        assert_eq!(restored.live_node_for("hd0"), model.live_node_for("hd0"));
    }

    #[test]
    fn nvme_drive_disables_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = BlockDeviceModel::new(dir.into_path());
        model.add_controller("nvme0", "nvme").unwrap();
        model.add_drive("hd0", Media::Disk, "/images/base.qcow2", DiskFormat::Qcow2, 1024).unwrap();
        model.attach("hd0", "nvme0").unwrap();
        assert!(!model.can_handle_snapshots());
    }

    #[test]
    fn file_for_node_resolves_base_and_overlay() {
        let mut model = sample_model();
        assert_eq!(model.file_for_node("hd0-base"), Some(Path::new("/images/base.qcow2")));
        let s1 = model.begin_snapshot("s1").unwrap();
        let overlay_node = &s1.block_overlays["hd0"];
        assert_eq!(model.file_for_node(overlay_node), Some(model.overlay_path("hd0", 1).as_path()));
        assert!(model.file_for_node("no-such-node").is_none());
    }

    #[test]
    fn cmdline_generation_is_deterministic() {
        let model = sample_model();
        let a = model.gen_cmdline();
        let b = model.gen_cmdline();
        assert_eq!(a, b);
        assert!(a.contains(&"-device".to_string()));
    }
}
