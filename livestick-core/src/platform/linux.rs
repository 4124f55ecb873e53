use crate::config::{DeviceFilter, EngineConfig};
use crate::device::{
    DeviceKind, DeviceSnapshot, MountState, PartitionRole, PartitionSnapshot, parent_device_path,
};
use crate::error::Result;
use crate::platform::Prober;
use crate::storage::{MountEntry, parse_mounts};
use crate::tools::{SystemToolRunner, ToolRunner, args};
use serde::{Deserialize, Deserializer};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Kernel name prefixes of virtual block devices that are never offered.
const IGNORED_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "nbd"];

const LSBLK_COLUMNS: &str = "NAME,SIZE,TRAN,TYPE,LABEL,FSTYPE,MOUNTPOINT,FSUSED";

/// Helper to read a specific file below a `/sys/block/<device>` directory.
fn read_sys_file(device_dir: &Path, file: &str) -> io::Result<String> {
    fs::read_to_string(device_dir.join(file)).map(|s| s.trim().to_string())
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkNode>,
}

#[derive(Debug, Deserialize)]
struct LsblkNode {
    name: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    size: Option<u64>,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default, rename = "type")]
    node_type: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    fsused: Option<u64>,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

/// Older `lsblk` versions print numbers as strings, even with `--bytes`.
fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Finds the devices the running system was booted from: the parents of the
/// partitions mounted at `/` or below one of the live-system mount roots.
fn boot_devices(live_mount_roots: &[PathBuf]) -> Vec<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut found = Vec::new();
    for disk in disks.iter() {
        let mount = disk.mount_point();
        if mount != Path::new("/") && !live_mount_roots.iter().any(|r| mount.starts_with(r)) {
            continue;
        }
        let path = PathBuf::from("/dev/").join(disk.name());
        if !path.starts_with("/dev/") {
            continue;
        }
        let parent = parent_device_path(&path);
        if !found.contains(&parent) {
            found.push(parent);
        }
    }
    if found.is_empty() {
        debug!("could not determine the boot device");
    }
    found
}

fn device_kind(name: &str, transport: Option<&str>, removable: bool, rotational: bool) -> DeviceKind {
    if name.starts_with("sr") {
        DeviceKind::Optical
    } else if name.starts_with("md") {
        DeviceKind::Raid
    } else if (transport == Some("usb") || removable) && !rotational {
        DeviceKind::UsbFlash
    } else {
        DeviceKind::HardDrive
    }
}

/// Partition number from the trailing digits of a kernel name ("sdb2",
/// "mmcblk0p1").
fn partition_number(name: &str) -> u32 {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    name[name.len() - digits..].parse().unwrap_or(0)
}

/// Probes devices through `/sys/block`, `lsblk` and `/proc/mounts`.
pub struct SysfsProber {
    sys_block: PathBuf,
    proc_mounts: PathBuf,
    runner: Arc<dyn ToolRunner>,
    filter: DeviceFilter,
    live_mount_roots: Vec<PathBuf>,
    boot_devices: Vec<PathBuf>,
}

impl SysfsProber {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
            proc_mounts: PathBuf::from("/proc/mounts"),
            runner: Arc::new(SystemToolRunner),
            filter: config.devices,
            live_mount_roots: config.live_mount_roots.clone(),
            boot_devices: boot_devices(&config.live_mount_roots),
        }
    }

    /// Reads device attributes and mounts from other locations.
    pub fn with_paths(mut self, sys_block: PathBuf, proc_mounts: PathBuf) -> Self {
        self.sys_block = sys_block;
        self.proc_mounts = proc_mounts;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_boot_devices(mut self, boot_devices: Vec<PathBuf>) -> Self {
        self.boot_devices = boot_devices;
        self
    }

    fn lsblk(&self, device: &Path) -> Result<Option<LsblkNode>> {
        let output = self.runner.run(
            "lsblk",
            &args(["--json", "--bytes", "--output", LSBLK_COLUMNS])
                .into_iter()
                .chain([device.to_string_lossy().into_owned()])
                .collect::<Vec<_>>(),
            None,
        )?;
        let parsed: LsblkOutput = serde_json::from_str(&output)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(parsed.blockdevices.into_iter().next())
    }

    fn partition(&self, node: &LsblkNode, mounts: &[MountEntry]) -> PartitionSnapshot {
        // An opened LUKS container shows up as a child of the partition; its
        // mount counts as the partition's.
        let mut sources = vec![PathBuf::from("/dev").join(&node.name)];
        for child in &node.children {
            sources.push(PathBuf::from("/dev/mapper").join(&child.name));
            sources.push(PathBuf::from("/dev").join(&child.name));
        }
        let entry = mounts.iter().find(|m| sources.contains(&m.source));
        let lsblk_mount = node
            .mountpoint
            .as_deref()
            .or_else(|| node.children.iter().find_map(|c| c.mountpoint.as_deref()))
            .filter(|m| !m.is_empty())
            .map(PathBuf::from);
        let mount_point = entry.map(|m| m.target.clone()).or(lsblk_mount);

        let mount_state = match &mount_point {
            None => MountState::Unmounted,
            Some(point) if self.live_mount_roots.iter().any(|r| point.starts_with(r)) => {
                MountState::MountedElsewhere
            }
            Some(_) if entry.is_some_and(|m| m.read_only) => MountState::MountedReadOnly,
            Some(_) => MountState::MountedReadWrite,
        };

        let label = node.label.clone().unwrap_or_default();
        let fs_type = node.fstype.clone().unwrap_or_default();
        let role = PartitionRole::derive(&label, &fs_type);
        let used = node
            .fsused
            .or_else(|| node.children.iter().find_map(|c| c.fsused));

        PartitionSnapshot {
            number: partition_number(&node.name),
            name: node.name.clone(),
            role,
            label,
            fs_type,
            size: node.size.unwrap_or(0),
            active_persistence: role == PartitionRole::Data
                && mount_state == MountState::MountedElsewhere,
            mount_state,
            mount_point,
            used,
        }
    }
}

impl Prober for SysfsProber {
    fn probe(&self, name: &str) -> Result<Option<DeviceSnapshot>> {
        if IGNORED_PREFIXES.iter().any(|p| name.starts_with(p)) {
            return Ok(None);
        }
        let device_dir = self.sys_block.join(name);
        if !device_dir.exists() {
            return Ok(None);
        }

        let size_sectors = read_sys_file(&device_dir, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        // Empty card readers report a size of zero.
        if size_sectors == 0 {
            return Ok(None);
        }

        let path = PathBuf::from("/dev/").join(name);
        let boot_device = self.boot_devices.contains(&path);
        if boot_device && self.filter.exclude_boot_device {
            debug!(device = %name, "skipping boot device");
            return Ok(None);
        }

        let Some(node) = self.lsblk(&path)? else {
            return Ok(None);
        };
        let rotational = read_sys_file(&device_dir, "queue/rotational").is_ok_and(|s| s == "1");
        let usb = node.tran.as_deref() == Some("usb");
        let removable = usb || read_sys_file(&device_dir, "removable").is_ok_and(|s| s == "1");
        if self.filter.removable_only && !removable {
            return Ok(None);
        }

        let mounts = parse_mounts(&fs::read_to_string(&self.proc_mounts).unwrap_or_default());
        let partitions = node
            .children
            .iter()
            .filter(|c| c.node_type.as_deref() == Some("part"))
            .map(|c| self.partition(c, &mounts))
            .collect();

        let attr = |file: &str| read_sys_file(&device_dir, file).unwrap_or_default();
        Ok(Some(DeviceSnapshot {
            kind: device_kind(name, node.tran.as_deref(), removable, rotational),
            vendor: attr("device/vendor"),
            model: attr("device/model"),
            serial: attr("device/serial"),
            revision: attr("device/rev"),
            size: size_sectors * 512,
            path,
            name: name.to_string(),
            removable,
            boot_device,
            partitions,
        }))
    }

    fn device_names(&self) -> Result<Vec<String>> {
        Ok(fs::read_dir(&self.sys_block)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect())
    }
}

/// Scans the system for eligible devices under `config`'s device filter.
pub fn scan_devices(config: &EngineConfig) -> Result<Vec<DeviceSnapshot>> {
    SysfsProber::new(config).scan()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeLsblk;

    impl ToolRunner for FakeLsblk {
        fn run(&self, program: &str, args: &[String], _stdin: Option<&[u8]>) -> Result<String> {
            assert_eq!(program, "lsblk");
            let json = match args.last().map(String::as_str) {
                Some("/dev/sdb") => {
                    r#"{"blockdevices": [{"name": "sdb", "size": 8589934592, "tran": "usb", "type": "disk", "children": [
                        {"name": "sdb1", "size": "1048576000", "type": "part", "label": "EXCHANGE", "fstype": "vfat", "mountpoint": null},
                        {"name": "sdb2", "size": 104857600, "type": "part", "label": "boot", "fstype": "vfat", "mountpoint": "/run/live/medium"},
                        {"name": "sdb3", "size": 4404019200, "type": "part", "label": "system", "fstype": "ext4"},
                        {"name": "sdb4", "size": 2830106624, "type": "part", "fstype": "crypto_LUKS", "children": [
                            {"name": "luks-sdb4", "type": "crypt", "label": "persistence", "fstype": "ext4", "fsused": 1048576}
                        ]}
                    ]}]}"#
                }
                Some("/dev/sda") => {
                    r#"{"blockdevices": [{"name": "sda", "size": 500107862016, "tran": "sata", "type": "disk", "children": []}]}"#
                }
                _ => r#"{"blockdevices": []}"#,
            };
            Ok(json.to_string())
        }
    }

    fn fixture() -> (tempfile::TempDir, SysfsProber) {
        let dir = tempfile::tempdir().unwrap();
        let sys = dir.path().join("block");
        for (name, removable, size) in [("sdb", "1", "16777216"), ("sda", "0", "976773168"), ("loop0", "0", "1024"), ("sdc", "1", "0")] {
            fs::create_dir_all(sys.join(name).join("device")).unwrap();
            fs::create_dir_all(sys.join(name).join("queue")).unwrap();
            fs::write(sys.join(name).join("removable"), format!("{removable}\n")).unwrap();
            fs::write(sys.join(name).join("size"), format!("{size}\n")).unwrap();
            fs::write(sys.join(name).join("queue/rotational"), "0\n").unwrap();
        }
        fs::write(sys.join("sdb/device/vendor"), "Acme    \n").unwrap();
        fs::write(sys.join("sdb/device/model"), "Stick\n").unwrap();

        let mounts = dir.path().join("mounts");
        fs::write(
            &mounts,
            "/dev/sdb2 /run/live/medium vfat ro 0 0\n\
             /dev/mapper/luks-sdb4 /run/live/persistence/sdb4 ext4 rw 0 0\n",
        )
        .unwrap();

        let prober = SysfsProber::new(&EngineConfig::default())
            .with_paths(sys, mounts)
            .with_runner(Arc::new(FakeLsblk))
            .with_boot_devices(Vec::new());
        (dir, prober)
    }

    #[test]
    fn probes_partitions_and_mount_states() {
        let (_dir, prober) = fixture();
        let device = prober.probe("sdb").unwrap().unwrap();

        assert_eq!(device.path, PathBuf::from("/dev/sdb"));
        assert_eq!(device.size, 8 * 1024 * 1024 * 1024);
        assert_eq!(device.kind, DeviceKind::UsbFlash);
        assert_eq!(device.vendor, "Acme");
        assert!(device.removable);

        let roles: Vec<_> = device.partitions.iter().map(|p| p.role).collect();
        assert_eq!(
            roles,
            [
                PartitionRole::Exchange,
                PartitionRole::Boot,
                PartitionRole::System,
                PartitionRole::Data
            ]
        );
        let exchange = &device.partitions[0];
        assert_eq!(exchange.size, 1_048_576_000);
        assert_eq!(exchange.mount_state, MountState::Unmounted);
        assert_eq!(device.partitions[1].mount_state, MountState::MountedElsewhere);

        let data = &device.partitions[3];
        assert_eq!(data.number, 4);
        assert!(data.active_persistence);
        assert_eq!(data.used, Some(1_048_576));
        assert!(data.in_use_by_running_system());
    }

    #[test]
    fn filter_drops_fixed_and_virtual_devices() {
        let (_dir, prober) = fixture();
        assert!(prober.probe("sda").unwrap().is_none());
        assert!(prober.probe("loop0").unwrap().is_none());
        assert!(prober.probe("sdc").unwrap().is_none());
        assert!(prober.probe("sdz").unwrap().is_none());

        let names: Vec<_> = prober.scan().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["sdb"]);
    }

    #[test]
    fn boot_device_is_excluded() {
        let (_dir, prober) = fixture();
        let prober = prober.with_boot_devices(vec![PathBuf::from("/dev/sdb")]);
        assert!(prober.probe("sdb").unwrap().is_none());
    }

    #[test]
    fn fixed_disks_when_allowed() {
        let (_dir, mut prober) = fixture();
        prober.filter.removable_only = false;
        let device = prober.probe("sda").unwrap().unwrap();
        assert_eq!(device.kind, DeviceKind::HardDrive);
        assert!(device.needs_confirmation());
    }

    #[test]
    fn partition_numbers() {
        assert_eq!(partition_number("sdb12"), 12);
        assert_eq!(partition_number("mmcblk0p1"), 1);
        assert_eq!(partition_number("sdb"), 0);
    }
}
