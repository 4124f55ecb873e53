//! Fresh installation of the live system onto a device.
use crate::batch::DeviceRun;
use crate::config::Filesystem;
use crate::credentials::UnlockMethod;
use crate::device::PartitionRole;
use crate::error::{Error, Result};
use crate::layout::{self, MEGA, PartitionPlan, RejectionReason};
use crate::persistence;
use crate::progress::Phase;
use crate::source::SourceImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOptions {
    /// Size of the exchange partition; 0 for none.
    pub exchange_mb: u64,
    /// Copy the source's exchange payload onto the exchange partition.
    pub copy_exchange: bool,
    /// Copy the source's data payload onto the data partition.
    pub copy_data: bool,
}

pub(crate) fn run(
    run: &DeviceRun<'_>,
    source: &dyn SourceImage,
    options: &InstallOptions,
    unlock: &UnlockMethod,
) -> Result<()> {
    run.phase(Phase::Plan)?;
    let plan = layout::compute_install_plan(
        source.info(),
        run.device,
        options.exchange_mb,
        options.copy_exchange,
    )?;
    if options.copy_data {
        check_data_payload(source, &plan)?;
    }
    run.message(Phase::Plan, plan.to_string());

    run.phase(Phase::Unmount)?;
    run.unmount_all()?;
    run.commit("Install the live system onto")?;

    run.phase(Phase::Partition)?;
    run.storage.write_table(&run.device.path, &plan)?;

    run.phase(Phase::Format)?;
    let labels = &run.config.labels;
    let path_of = |role| plan.planned(role).map(|p| run.partition_path(p.number));
    let boot = path_of(PartitionRole::Boot).ok_or_else(|| missing("boot"))?;
    let system = path_of(PartitionRole::System).ok_or_else(|| missing("system"))?;
    let exchange = path_of(PartitionRole::Exchange);
    if let Some(exchange) = &exchange {
        run.storage
            .format(exchange, run.config.exchange_fs, &labels.exchange)?;
    }
    run.storage.format(&boot, Filesystem::Vfat, &labels.boot)?;
    let data = match path_of(PartitionRole::Data) {
        Some(partition) => Some(format_data(run, &partition, unlock)?),
        None => None,
    };

    run.phase(Phase::Copy)?;
    run.storage
        .write_image(source.system_image(), &system, &mut run.image_progress())?;
    if let (true, Some(payload), Some(exchange)) =
        (options.copy_exchange, source.exchange_dir(), &exchange)
    {
        copy_payload(run, payload, exchange)?;
    }
    if let Some(data) = &data {
        run.with_mounted(data, |dir| {
            persistence::write_persistence_conf(dir)?;
            match source.data_dir() {
                Some(payload) if options.copy_data => {
                    run.storage.copy_tree(payload, dir, &mut run.bytes(Phase::Copy))
                }
                _ => Ok(()),
            }
        })?;
    }

    run.phase(Phase::Bootloader)?;
    run.storage
        .install_bootloader(&run.device.path, &boot, &system)?;

    run.phase(Phase::Finalize)?;
    if data.is_some() && unlock.is_encrypted() {
        run.close_encrypted()?;
    }
    Ok(())
}

fn missing(role: &str) -> Error {
    Error::PreconditionFailed(format!("plan has no {role} partition"))
}

/// The data payload must fit onto the planned data partition.
fn check_data_payload(source: &dyn SourceImage, plan: &PartitionPlan) -> Result<()> {
    let used_mb = source.info().data_used.unwrap_or(0).div_ceil(MEGA);
    if used_mb > plan.data_mb {
        return Err(RejectionReason::PersistenceTooSmall {
            required_mb: used_mb,
            available_mb: plan.data_mb,
        }
        .into());
    }
    Ok(())
}

/// Creates the data filesystem, inside an encrypted container when the
/// unlock method asks for one. Returns the device holding the filesystem;
/// an encrypted container stays open.
pub(crate) fn format_data(
    run: &DeviceRun<'_>,
    partition: &Path,
    unlock: &UnlockMethod,
) -> Result<PathBuf> {
    let target = if unlock.is_encrypted() {
        run.message(Phase::Format, "creating encrypted container");
        run.create_encrypted(partition, unlock)?
    } else {
        partition.to_path_buf()
    };
    run.storage
        .format(&target, run.config.data_fs, &run.config.labels.data)?;
    Ok(target)
}

/// Copies a payload tree onto `partition`.
pub(crate) fn copy_payload(run: &DeviceRun<'_>, payload: &Path, partition: &Path) -> Result<()> {
    run.with_mounted(partition, |dir| {
        run.storage.copy_tree(payload, dir, &mut run.bytes(Phase::Copy))
    })
}
