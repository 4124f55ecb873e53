use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Broad category of a physical storage device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    UsbFlash,
    HardDrive,
    Optical,
    Raid,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::UsbFlash => "USB flash",
            DeviceKind::HardDrive => "hard drive",
            DeviceKind::Optical => "optical",
            DeviceKind::Raid => "RAID",
        };
        f.write_str(name)
    }
}

/// What a partition is used for in a provisioned live-system layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionRole {
    Boot,
    Exchange,
    Data,
    System,
    Unknown,
}

/// Labels the data partition is known by.
const DATA_LABELS: &[&str] = &["persistence", "live-rw", "home-rw"];

impl PartitionRole {
    /// Derives the role from the filesystem label and type.
    ///
    /// The mapping follows the layout conventions livestick writes itself: a
    /// FAT partition labelled `boot`/`efi` is the boot partition, a partition
    /// labelled `system` (or holding an ISO/squashfs image) is the system
    /// partition, a persistence label or a LUKS container is the data
    /// partition, and any other FAT/exFAT/NTFS partition is the exchange
    /// partition.
    pub fn derive(label: &str, fs_type: &str) -> Self {
        let label = label.trim();
        let fs_type = fs_type.trim().to_ascii_lowercase();
        let is_fat = matches!(fs_type.as_str(), "vfat" | "fat" | "fat16" | "fat32");

        if is_fat && (label.eq_ignore_ascii_case("boot") || label.eq_ignore_ascii_case("efi")) {
            return PartitionRole::Boot;
        }
        if label.eq_ignore_ascii_case("system") || matches!(fs_type.as_str(), "iso9660" | "squashfs")
        {
            return PartitionRole::System;
        }
        if DATA_LABELS.iter().any(|l| label.eq_ignore_ascii_case(l)) || fs_type == "crypto_luks" {
            return PartitionRole::Data;
        }
        if is_fat || matches!(fs_type.as_str(), "exfat" | "ntfs") {
            return PartitionRole::Exchange;
        }
        PartitionRole::Unknown
    }
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionRole::Boot => "boot",
            PartitionRole::Exchange => "exchange",
            PartitionRole::Data => "data",
            PartitionRole::System => "system",
            PartitionRole::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Unmounted,
    MountedReadOnly,
    MountedReadWrite,
    /// Mounted by the running live system below one of its internal mount
    /// roots. Such mounts are never released by the engine.
    MountedElsewhere,
}

impl MountState {
    pub fn is_mounted(self) -> bool {
        self != MountState::Unmounted
    }
}

/// One partition of a [`DeviceSnapshot`].
#[derive(Clone, Debug, Serialize)]
pub struct PartitionSnapshot {
    /// Kernel name of the partition (e.g. "sdb2").
    pub name: String,
    /// Partition number inside the device table.
    pub number: u32,
    pub role: PartitionRole,
    pub label: String,
    pub fs_type: String,
    /// Size in bytes.
    pub size: u64,
    pub mount_state: MountState,
    pub mount_point: Option<PathBuf>,
    /// Used bytes, when the filesystem could be inspected.
    pub used: Option<u64>,
    /// Set when the running system is booted from this data partition.
    pub active_persistence: bool,
}

impl PartitionSnapshot {
    pub fn path(&self) -> PathBuf {
        PathBuf::from("/dev").join(&self.name)
    }

    /// True when the engine must not unmount or modify this partition.
    pub fn in_use_by_running_system(&self) -> bool {
        self.active_persistence || self.mount_state == MountState::MountedElsewhere
    }
}

/// An immutable description of a block device at a point in time.
///
/// Snapshots are shared as `Arc<DeviceSnapshot>`; a device that changed is
/// represented by a new snapshot rather than an updated one.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceSnapshot {
    /// The system path to the device (e.g. `/dev/sdb`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g. "sdb").
    pub name: String,
    pub vendor: String,
    pub model: String,
    pub serial: String,
    pub revision: String,
    /// Total size in bytes.
    pub size: u64,
    pub kind: DeviceKind,
    pub removable: bool,
    /// Set when the running system was booted from this device.
    pub boot_device: bool,
    pub partitions: Vec<PartitionSnapshot>,
}

impl DeviceSnapshot {
    /// First partition carrying `role`, in table order.
    pub fn partition(&self, role: PartitionRole) -> Option<&PartitionSnapshot> {
        self.partitions.iter().find(|p| p.role == role)
    }

    pub fn exchange_partition(&self) -> Option<&PartitionSnapshot> {
        self.partition(PartitionRole::Exchange)
    }

    pub fn data_partition(&self) -> Option<&PartitionSnapshot> {
        self.partition(PartitionRole::Data)
    }

    pub fn system_partition(&self) -> Option<&PartitionSnapshot> {
        self.partition(PartitionRole::System)
    }

    pub fn mounted_partitions(&self) -> impl Iterator<Item = &PartitionSnapshot> {
        self.partitions.iter().filter(|p| p.mount_state.is_mounted())
    }

    /// Destructive phases ask for confirmation on anything that is not a
    /// removable flash device.
    pub fn needs_confirmation(&self) -> bool {
        !(self.removable && self.kind == DeviceKind::UsbFlash)
    }

    /// One-line human readable description.
    pub fn description(&self) -> String {
        let text = format!("{} {}", self.vendor.trim(), self.model.trim());
        let text = text.trim();
        if text.is_empty() {
            self.name.clone()
        } else {
            text.to_string()
        }
    }

    pub fn size_gb(&self) -> f64 {
        self.size as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for DeviceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match self.mounted_partitions().count() {
            0 => "[Not mounted]".to_string(),
            n => format!("[{n} mounted]"),
        };

        write!(
            f,
            "{:<15} {:<28} {:>7.1} GB {:<10} {}",
            self.path.display(),
            self.description(),
            self.size_gb(),
            self.kind,
            mount_info
        )
    }
}

/// Builds the device path of partition `number` on `device`.
///
/// Devices whose name ends in a digit (`nvme0n1`, `mmcblk0`) separate the
/// partition number with a `p`.
pub fn partition_path(device: &Path, number: u32) -> PathBuf {
    let name = device.to_string_lossy();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{name}p{number}"))
    } else {
        PathBuf::from(format!("{name}{number}"))
    }
}

/// Finds the parent device of a partition (e.g. `/dev/sda1` -> `/dev/sda`).
pub fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            if index > "/dev/".len() && path_str[index + 1..].chars().all(|c| c.is_ascii_digit())
            {
                return PathBuf::from(&path_str[..index]);
            }
        }
    }

    path.to_path_buf()
}
