//! Factory reset of a provisioned device.
use crate::batch::DeviceRun;
use crate::config::Filesystem;
use crate::credentials::UnlockMethod;
use crate::error::{Error, Result};
use crate::install::format_data;
use crate::persistence::{self, ClearOptions};
use crate::progress::Phase;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ExchangeReset {
    #[default]
    Keep,
    /// Reformat; `label` replaces the current label when given.
    Format { label: Option<String> },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum DataReset {
    #[default]
    Keep,
    /// Remove selected content, keeping `lost+found` and the persistence
    /// configuration.
    Clear(ClearOptions),
    /// Full wipe: a new filesystem, encrypted per the unlock method.
    Format,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetOptions {
    pub exchange: ExchangeReset,
    pub data: DataReset,
}

impl ResetOptions {
    pub fn formats_data(&self) -> bool {
        self.data == DataReset::Format
    }
}

pub(crate) fn run(run: &DeviceRun<'_>, options: &ResetOptions, unlock: &UnlockMethod) -> Result<()> {
    let result = reset(run, options, unlock);
    run.cleanup();

    // Nothing stays mounted, whatever happened above.
    let unmounted = if run.device.boot_device {
        Ok(())
    } else {
        unmount_remaining(run)
    };
    match (result, unmounted) {
        (Err(e), Err(unmount)) => {
            warn!(device = %run.device.name, "final unmount failed: {unmount}");
            Err(e)
        }
        (result, unmounted) => result.and(unmounted),
    }
}

fn reset(run: &DeviceRun<'_>, options: &ResetOptions, unlock: &UnlockMethod) -> Result<()> {
    let device = run.device;

    run.phase(Phase::Plan)?;
    let exchange = match &options.exchange {
        ExchangeReset::Keep => None,
        ExchangeReset::Format { label } => {
            let partition = device.exchange_partition().ok_or_else(|| {
                Error::PreconditionFailed(format!("{} has no exchange partition", device.path.display()))
            })?;
            let label = label
                .clone()
                .filter(|l| !l.is_empty())
                .or_else(|| Some(partition.label.clone()).filter(|l| !l.is_empty()))
                .unwrap_or_else(|| run.config.labels.exchange.clone());
            let fs = Filesystem::from_fs_type(&partition.fs_type).unwrap_or(run.config.exchange_fs);
            Some((partition, fs, label))
        }
    };
    let data = match options.data {
        DataReset::Keep => None,
        DataReset::Clear(_) | DataReset::Format => {
            let partition = device.data_partition().ok_or_else(|| {
                Error::PreconditionFailed(format!("{} has no data partition", device.path.display()))
            })?;
            if partition.active_persistence {
                return Err(Error::PreconditionFailed(format!(
                    "{} is the active persistence partition",
                    partition.path().display()
                )));
            }
            if matches!(options.data, DataReset::Clear(_))
                && partition.fs_type.eq_ignore_ascii_case("crypto_luks")
            {
                return Err(Error::PreconditionFailed(format!(
                    "{} is encrypted; only a full wipe is possible",
                    partition.path().display()
                )));
            }
            Some(partition)
        }
    };
    if exchange.is_none() && data.is_none() {
        run.message(Phase::Plan, "nothing to reset");
    }

    run.phase(Phase::Unmount)?;
    run.unmount_all()?;
    if exchange.is_none() && data.is_none() {
        return Ok(());
    }
    run.commit("Reset")?;

    if let Some((partition, fs, label)) = exchange {
        run.phase(Phase::Format)?;
        run.storage.format(&partition.path(), fs, &label)?;
    }

    if let Some(partition) = data {
        run.phase(Phase::ResetData)?;
        match options.data {
            DataReset::Clear(clear) => run.with_mounted(&partition.path(), |dir| {
                persistence::clear(dir, &run.config.persistence, clear)
            })?,
            DataReset::Format => {
                let target = format_data(run, &partition.path(), unlock)?;
                run.with_mounted(&target, persistence::write_persistence_conf)?;
                if unlock.is_encrypted() {
                    run.close_encrypted()?;
                }
            }
            DataReset::Keep => {}
        }
    }

    run.phase(Phase::Finalize)?;
    Ok(())
}

fn unmount_remaining(run: &DeviceRun<'_>) -> Result<()> {
    let mounted = run.storage.mounted_partitions(run.device)?;
    run.release_mounts(Phase::Finalize, mounted)
}
