//! Device-level operations used by the batch workflows.
//!
//! [`StorageOps`] is the seam between the workflows and the machine: the
//! workflows decide what to do, implementations do it. [`SystemStorage`]
//! drives the usual Linux tools; tests substitute their own implementation.
use crate::config::{EngineConfig, Filesystem};
use crate::credentials::UnlockMethod;
use crate::device::{DeviceSnapshot, PartitionRole, parent_device_path};
use crate::error::{Error, Result};
use crate::layout::PartitionPlan;
use crate::progress::CopyProgress;
use crate::tools::{ToolRunner, args};
use crate::write::{self, WriteOptions, WriteStage};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zeroize::Zeroizing;

pub trait StorageOps: Send + Sync {
    /// Whether the device is still attached.
    fn is_present(&self, device: &DeviceSnapshot) -> bool;

    /// Partitions of `device` mounted right now, as `(partition, mount point)`.
    fn mounted_partitions(&self, device: &DeviceSnapshot) -> Result<Vec<(PathBuf, PathBuf)>>;

    /// Unmounts a partition or mount point.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Mounts `partition` on a fresh directory and returns that directory.
    fn mount(&self, partition: &Path) -> Result<PathBuf>;

    /// Replaces the partition table of `device` with `plan`.
    fn write_table(&self, device: &Path, plan: &PartitionPlan) -> Result<()>;

    fn format(&self, partition: &Path, fs: Filesystem, label: &str) -> Result<()>;

    /// Creates an encrypted container on `partition` for `unlock`, opens it
    /// as `name` and returns the mapped device.
    fn create_encrypted(&self, partition: &Path, unlock: &UnlockMethod, name: &str)
    -> Result<PathBuf>;

    fn close_encrypted(&self, name: &str) -> Result<()>;

    /// Writes the system image onto `partition`.
    fn write_image(
        &self,
        image: &Path,
        partition: &Path,
        on_progress: &mut dyn FnMut(WriteStage, CopyProgress),
    ) -> Result<()>;

    /// Copies the content of directory `from` into directory `to`.
    fn copy_tree(
        &self,
        from: &Path,
        to: &Path,
        on_progress: &mut dyn FnMut(CopyProgress),
    ) -> Result<()>;

    fn install_bootloader(&self, device: &Path, boot: &Path, system: &Path) -> Result<()>;
}

/// Storage operations backed by the standard Linux tool set.
pub struct SystemStorage {
    runner: Arc<dyn ToolRunner>,
    config: Arc<EngineConfig>,
    /// Directories created by [`StorageOps::mount`], removed on unmount.
    mount_dirs: Mutex<Vec<PathBuf>>,
}

impl SystemStorage {
    pub fn new(runner: Arc<dyn ToolRunner>, config: Arc<EngineConfig>) -> Self {
        Self {
            runner,
            config,
            mount_dirs: Mutex::new(Vec::new()),
        }
    }

    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        self.runner.run(program, args, None)
    }

    /// `sfdisk` script for `plan` on an MBR table.
    pub fn table_script(&self, plan: &PartitionPlan) -> String {
        let mut script = String::from("label: dos\nunit: sectors\n\n");
        for part in plan.partitions() {
            let part_type = match part.role {
                PartitionRole::Exchange => self.config.exchange_fs.mbr_type(),
                PartitionRole::Boot => Filesystem::Vfat.mbr_type(),
                _ => "83",
            };
            let bootable = if part.role == PartitionRole::Boot {
                ", bootable"
            } else {
                ""
            };
            script.push_str(&format!(
                "start={}MiB, size={}MiB, type={part_type}{bootable}\n",
                part.start_mb, part.size_mb
            ));
        }
        script
    }
}

impl StorageOps for SystemStorage {
    fn is_present(&self, device: &DeviceSnapshot) -> bool {
        Path::new("/sys/block").join(&device.name).exists()
    }

    fn mounted_partitions(&self, device: &DeviceSnapshot) -> Result<Vec<(PathBuf, PathBuf)>> {
        let mounts = fs::read_to_string("/proc/mounts")?;
        Ok(parse_mounts(&mounts)
            .into_iter()
            .filter(|m| {
                m.source != device.path
                    && backing_devices(&m.source)
                        .iter()
                        .any(|p| parent_device_path(p) == device.path)
            })
            .map(|m| (m.source, m.target))
            .collect())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.run("umount", &[target.to_string_lossy().into_owned()])?;

        let mut dirs = self.mount_dirs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = dirs.iter().position(|d| d == target) {
            let dir = dirs.remove(pos);
            if let Err(e) = fs::remove_dir(&dir) {
                warn!(dir = %dir.display(), "could not remove mount directory: {e}");
            }
        }
        Ok(())
    }

    fn mount(&self, partition: &Path) -> Result<PathBuf> {
        let base = self
            .config
            .mount_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let dir = tempfile::Builder::new()
            .prefix("livestick-")
            .tempdir_in(base)?
            .keep();

        if let Err(e) = self.run(
            "mount",
            &[
                partition.to_string_lossy().into_owned(),
                dir.to_string_lossy().into_owned(),
            ],
        ) {
            let _ = fs::remove_dir(&dir);
            return Err(e);
        }

        debug!(partition = %partition.display(), dir = %dir.display(), "mounted");
        self.mount_dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(dir.clone());
        Ok(dir)
    }

    fn write_table(&self, device: &Path, plan: &PartitionPlan) -> Result<()> {
        let script = self.table_script(plan);
        info!(device = %device.display(), %plan, "writing partition table");
        self.runner.run(
            "sfdisk",
            &args(["--wipe", "always", "--wipe-partitions", "always"])
                .into_iter()
                .chain([device.to_string_lossy().into_owned()])
                .collect::<Vec<_>>(),
            Some(script.as_bytes()),
        )?;
        // Let the kernel pick up the new table before partitions are used.
        self.run("partprobe", &[device.to_string_lossy().into_owned()])?;
        self.run("udevadm", &args(["settle"]))?;
        Ok(())
    }

    fn format(&self, partition: &Path, fs: Filesystem, label: &str) -> Result<()> {
        let mut arguments = fs.label_args(label);
        arguments.push(partition.to_string_lossy().into_owned());
        self.run(fs.mkfs(), &arguments)?;
        Ok(())
    }

    fn create_encrypted(
        &self,
        partition: &Path,
        unlock: &UnlockMethod,
        name: &str,
    ) -> Result<PathBuf> {
        let keys = unlock.keys();
        let Some(primary) = keys.first() else {
            return Err(Error::PreconditionFailed(
                "encryption requested without a password".into(),
            ));
        };
        let partition_arg = partition.to_string_lossy().into_owned();

        self.runner.run(
            "cryptsetup",
            &args(["luksFormat", "--batch-mode", "--key-file=-"])
                .into_iter()
                .chain([partition_arg.clone()])
                .collect::<Vec<_>>(),
            Some(primary.expose().as_bytes()),
        )?;

        // Additional key slots: cryptsetup reads the existing and the new
        // passphrase as one line each.
        for extra in keys.iter().skip(1) {
            let input = Zeroizing::new(format!("{}\n{}\n", primary.expose(), extra.expose()));
            self.runner.run(
                "cryptsetup",
                &args(["luksAddKey", "--batch-mode"])
                    .into_iter()
                    .chain([partition_arg.clone()])
                    .collect::<Vec<_>>(),
                Some(input.as_bytes()),
            )?;
        }

        self.runner.run(
            "cryptsetup",
            &args(["open", "--key-file=-"])
                .into_iter()
                .chain([partition_arg, name.to_string()])
                .collect::<Vec<_>>(),
            Some(primary.expose().as_bytes()),
        )?;
        Ok(PathBuf::from("/dev/mapper").join(name))
    }

    fn close_encrypted(&self, name: &str) -> Result<()> {
        self.run("cryptsetup", &args(["close", name]))?;
        Ok(())
    }

    fn write_image(
        &self,
        image: &Path,
        partition: &Path,
        on_progress: &mut dyn FnMut(WriteStage, CopyProgress),
    ) -> Result<()> {
        let options = WriteOptions {
            verify: self.config.verify_writes,
            direct_io: true,
        };
        write::write_image(image, partition, options, on_progress)
    }

    fn copy_tree(
        &self,
        from: &Path,
        to: &Path,
        on_progress: &mut dyn FnMut(CopyProgress),
    ) -> Result<()> {
        copy_tree(from, to, on_progress)
    }

    fn install_bootloader(&self, device: &Path, boot: &Path, system: &Path) -> Result<()> {
        let (program, rest) = self
            .config
            .bootloader
            .split_first()
            .ok_or_else(|| Error::Config("bootloader command is empty".into()))?;
        let arguments: Vec<String> = rest
            .iter()
            .map(|arg| {
                arg.replace("{device}", &device.to_string_lossy())
                    .replace("{boot}", &boot.to_string_lossy())
                    .replace("{system}", &system.to_string_lossy())
            })
            .collect();
        self.run(program, &arguments)?;
        Ok(())
    }
}

/// Name of the device-mapper node `source` refers to, if it is one.
pub fn mapper_name(source: &Path) -> Option<&str> {
    if source.parent() != Some(Path::new("/dev/mapper")) {
        return None;
    }
    source.file_name()?.to_str()
}

/// The block devices a mount source lives on. Device-mapper nodes resolve
/// to the devices below them.
fn backing_devices(source: &Path) -> Vec<PathBuf> {
    if mapper_name(source).is_none() {
        return vec![source.to_path_buf()];
    }
    match fs::canonicalize(source) {
        Ok(node) => mapper_slaves(Path::new("/sys/block"), &node),
        Err(e) => {
            debug!(source = %source.display(), "cannot resolve mapping: {e}");
            Vec::new()
        }
    }
}

/// Devices listed in `<sys_block>/dm-N/slaves` for the mapping node `node`.
fn mapper_slaves(sys_block: &Path, node: &Path) -> Vec<PathBuf> {
    let Some(dm) = node.file_name() else {
        return Vec::new();
    };
    match fs::read_dir(sys_block.join(dm).join("slaves")) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| Path::new("/dev").join(entry.file_name()))
            .collect(),
        Err(e) => {
            debug!(node = %node.display(), "no slaves listed: {e}");
            Vec::new()
        }
    }
}

/// One line of `/proc/mounts`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fs_type: String,
    pub read_only: bool,
}

/// Parses the `/proc/mounts` format. Octal escapes (`\040` for a space) in
/// paths are decoded.
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or("");
            Some(MountEntry {
                source: PathBuf::from(unescape_mount_path(source)),
                target: PathBuf::from(unescape_mount_path(target)),
                fs_type: fs_type.to_string(),
                read_only: options.split(',').any(|o| o == "ro"),
            })
        })
        .collect()
}

fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u16, |acc, d| (acc << 3) | u16::from(d - b'0'));
                // Anything above \377 is not a byte; keep it as written.
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Copies all files and directories below `from` into `to`, reporting the
/// number of bytes copied. Symlinks are recreated, not followed.
pub fn copy_tree(from: &Path, to: &Path, on_progress: &mut dyn FnMut(CopyProgress)) -> Result<()> {
    let total = crate::source::tree_size(from)?;
    let progress = CopyProgress::start(total);
    let mut copied = 0;
    on_progress(progress);

    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link = fs::read_link(entry.path())?;
                if target.symlink_metadata().is_ok() {
                    fs::remove_file(&target)?;
                }
                std::os::unix::fs::symlink(link, &target)?;
            }
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            copied += fs::copy(entry.path(), &target)?;
            on_progress(progress.advance(copied));
        }
    }
    Ok(())
}
