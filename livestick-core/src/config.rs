//! Engine configuration.
//!
//! The configuration is resolved once (from defaults or a TOML file) and
//! handed to the engine as an immutable value. Nothing in the engine reads
//! preferences on its own.
use crate::credentials::UnlockMethodKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    Vfat,
    Exfat,
    Ntfs,
    Ext2,
    Ext3,
    Ext4,
}

impl Filesystem {
    /// The `mkfs` program creating this filesystem.
    pub fn mkfs(self) -> &'static str {
        match self {
            Filesystem::Vfat => "mkfs.vfat",
            Filesystem::Exfat => "mkfs.exfat",
            Filesystem::Ntfs => "mkfs.ntfs",
            Filesystem::Ext2 => "mkfs.ext2",
            Filesystem::Ext3 => "mkfs.ext3",
            Filesystem::Ext4 => "mkfs.ext4",
        }
    }

    /// Arguments for `mkfs` setting the volume label.
    pub fn label_args(self, label: &str) -> Vec<String> {
        let flag = if self == Filesystem::Vfat { "-n" } else { "-L" };
        let mut args = vec![flag.to_string(), label.to_string()];
        match self {
            Filesystem::Ntfs => args.push("--fast".into()),
            Filesystem::Ext2 | Filesystem::Ext3 | Filesystem::Ext4 => args.push("-F".into()),
            _ => {}
        }
        args
    }

    /// Maps an `lsblk` filesystem type back to a [`Filesystem`].
    pub fn from_fs_type(fs_type: &str) -> Option<Self> {
        match fs_type.to_ascii_lowercase().as_str() {
            "vfat" | "fat" | "fat16" | "fat32" => Some(Filesystem::Vfat),
            "exfat" => Some(Filesystem::Exfat),
            "ntfs" => Some(Filesystem::Ntfs),
            "ext2" => Some(Filesystem::Ext2),
            "ext3" => Some(Filesystem::Ext3),
            "ext4" => Some(Filesystem::Ext4),
            _ => None,
        }
    }

    /// MBR partition type id used in the partition table.
    pub fn mbr_type(self) -> &'static str {
        match self {
            Filesystem::Vfat => "c",
            Filesystem::Exfat | Filesystem::Ntfs => "7",
            Filesystem::Ext2 | Filesystem::Ext3 | Filesystem::Ext4 => "83",
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Filesystem::Vfat => "vfat",
            Filesystem::Exfat => "exfat",
            Filesystem::Ntfs => "ntfs",
            Filesystem::Ext2 => "ext2",
            Filesystem::Ext3 => "ext3",
            Filesystem::Ext4 => "ext4",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Labels {
    pub boot: String,
    pub system: String,
    pub exchange: String,
    pub data: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            boot: "boot".into(),
            system: "system".into(),
            exchange: "EXCHANGE".into(),
            data: "persistence".into(),
        }
    }
}

/// Which devices are offered for selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFilter {
    pub removable_only: bool,
    pub exclude_boot_device: bool,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            removable_only: true,
            exclude_boot_device: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Command producing the line-oriented device event stream.
    pub command: Vec<String>,
    /// Regular expression matching "device added" lines. Must have a `path`
    /// capture group.
    pub added_pattern: String,
    /// Regular expression matching "device removed" lines. Must have a `path`
    /// capture group.
    pub removed_pattern: String,
    /// Time to wait before probing a freshly added device, in milliseconds.
    pub settle_delay_ms: u64,
}

impl MonitorConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            command: ["udevadm", "monitor", "--kernel", "--subsystem-match=block"]
                .map(String::from)
                .to_vec(),
            added_pattern: r"^KERNEL\[[^\]]*\]\s+add\s+(?P<path>\S*/block/[^/\s]+)\s+\(block\)"
                .into(),
            removed_pattern:
                r"^KERNEL\[[^\]]*\]\s+remove\s+(?P<path>\S*/block/[^/\s]+)\s+\(block\)".into(),
            settle_delay_ms: 1500,
        }
    }
}

/// How the data partition's root is located.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutDetection {
    /// Older media keep everything below a sub-root directory; they are
    /// recognised by a missing `home` directory at the partition root.
    #[default]
    Auto,
    Flat,
    Subroot,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub layout: LayoutDetection,
    /// Name of the sub-root directory of the older layout.
    pub subroot: String,
    /// User whose home directory is rebuilt on reset.
    pub user: String,
    /// Template the home directory is rebuilt from.
    pub skeleton: PathBuf,
    /// Owner given to a rebuilt home directory.
    pub home_owner: Option<(u32, u32)>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            layout: LayoutDetection::Auto,
            subroot: "rw".into(),
            user: "user".into(),
            skeleton: PathBuf::from("/etc/skel"),
            home_owner: Some((1000, 1000)),
        }
    }
}

/// Everything the engine needs to know that is not specific to one batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub labels: Labels,
    pub exchange_fs: Filesystem,
    pub data_fs: Filesystem,
    pub unlock_method: UnlockMethodKind,
    pub devices: DeviceFilter,
    pub monitor: MonitorConfig,
    /// Mount roots used by the running live system. Partitions mounted below
    /// them are treated as in use.
    pub live_mount_roots: Vec<PathBuf>,
    pub persistence: PersistenceConfig,
    /// Bootloader installer; `{device}`, `{boot}` and `{system}` are replaced
    /// with the respective device paths.
    pub bootloader: Vec<String>,
    /// Where data is stashed while an upgrade rewrites the partition table.
    /// Defaults to the system temporary directory.
    pub staging_dir: Option<PathBuf>,
    /// Where partitions are mounted while the engine works on them.
    pub mount_dir: Option<PathBuf>,
    pub verify_writes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            labels: Labels::default(),
            exchange_fs: Filesystem::Vfat,
            data_fs: Filesystem::Ext4,
            unlock_method: UnlockMethodKind::NoPassword,
            devices: DeviceFilter::default(),
            monitor: MonitorConfig::default(),
            live_mount_roots: vec![PathBuf::from("/run/live"), PathBuf::from("/lib/live/mount")],
            persistence: PersistenceConfig::default(),
            bootloader: [
                "syslinux",
                "--install",
                "--directory",
                "/syslinux",
                "{boot}",
            ]
            .map(String::from)
            .to_vec(),
            staging_dir: None,
            mount_dir: None,
            verify_writes: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Loads a configuration file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn check(&self) -> Result<()> {
        if !matches!(self.exchange_fs, Filesystem::Vfat | Filesystem::Exfat | Filesystem::Ntfs) {
            return Err(Error::Config(format!(
                "{} is not usable for the exchange partition",
                self.exchange_fs
            )));
        }
        if !matches!(self.data_fs, Filesystem::Ext2 | Filesystem::Ext3 | Filesystem::Ext4) {
            return Err(Error::Config(format!(
                "{} is not usable for the data partition",
                self.data_fs
            )));
        }
        if self.monitor.command.is_empty() {
            return Err(Error::Config("monitor command must not be empty".into()));
        }
        if self.bootloader.is_empty() {
            return Err(Error::Config("bootloader command must not be empty".into()));
        }
        // Label limits of FAT volumes.
        if self.exchange_fs == Filesystem::Vfat && self.labels.exchange.len() > 11 {
            return Err(Error::Config(format!(
                "exchange label {:?} is longer than 11 characters",
                self.labels.exchange
            )));
        }
        Ok(())
    }
}
