//! User-data backup before an upgrade touches the data partition.
use crate::error::{Error, Result};
use crate::tools::ToolRunner;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Copies the content of a mounted data partition somewhere safe.
pub trait BackupOps: Send + Sync {
    fn backup(&self, source: &Path, destination: &Path) -> Result<()>;
}

/// Incremental backups with `rdiff-backup`.
pub struct RdiffBackup {
    runner: Arc<dyn ToolRunner>,
}

impl RdiffBackup {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self { runner }
    }
}

impl BackupOps for RdiffBackup {
    fn backup(&self, source: &Path, destination: &Path) -> Result<()> {
        info!(source = %source.display(), destination = %destination.display(), "backing up user data");
        self.runner.run(
            "rdiff-backup",
            &[
                "--exclude-other-filesystems".to_string(),
                source.to_string_lossy().into_owned(),
                destination.to_string_lossy().into_owned(),
            ],
            None,
        )?;
        Ok(())
    }
}

/// Pre-flight check of a backup destination: it must be an existing,
/// writable directory with at least `required` bytes free.
pub fn check_destination(destination: &Path, required: u64) -> Result<()> {
    if !destination.is_dir() {
        return Err(Error::PreconditionFailed(format!(
            "backup destination {} is not a directory",
            destination.display()
        )));
    }

    tempfile::tempfile_in(destination).map_err(|e| {
        Error::PreconditionFailed(format!(
            "backup destination {} is not writable: {e}",
            destination.display()
        ))
    })?;

    let available = free_space(destination)?;
    if available < required {
        return Err(Error::PreconditionFailed(format!(
            "backup destination {} has {available} bytes free, {required} needed",
            destination.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn free_space(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
fn free_space(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}
