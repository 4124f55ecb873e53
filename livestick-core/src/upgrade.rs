//! Upgrading the system of a previously provisioned device.
//!
//! The data partition survives an upgrade. When the table has to change
//! (exchange partition resized or removed, system partition grown) the
//! content of the exchange and data partitions is stashed in a staging
//! directory and restored after repartitioning.
use crate::backup;
use crate::batch::DeviceRun;
use crate::config::Filesystem;
use crate::device::{PartitionRole, PartitionSnapshot};
use crate::error::{Error, Result};
use crate::install::copy_payload;
use crate::layout::{self, PartitionPlan, RepartitionStrategy};
use crate::persistence::{self, ClearOptions, OverwriteList};
use crate::progress::Phase;
use crate::source::{SourceImage, tree_size};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{error, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeOptions {
    pub strategy: RepartitionStrategy,
    /// Back up the data partition here first. A destination failing the
    /// pre-flight check skips the backup.
    pub backup_to: Option<PathBuf>,
    /// Selectively reset the data partition.
    pub reset_data: Option<ClearOptions>,
    /// Files written onto the data partition after the system was replaced.
    pub overwrites: OverwriteList,
    /// Copy the source's exchange payload onto the exchange partition.
    pub copy_exchange: bool,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            strategy: RepartitionStrategy::Keep,
            backup_to: None,
            reset_data: None,
            overwrites: OverwriteList::default(),
            copy_exchange: false,
        }
    }
}

impl UpgradeOptions {
    /// Whether the data partition's current content has to fit the new plan.
    fn preserves_data(&self) -> bool {
        !matches!(
            self.reset_data,
            Some(ClearOptions {
                reset_system: true,
                reset_home: true
            })
        )
    }
}

fn is_encrypted(partition: &PartitionSnapshot) -> bool {
    partition.fs_type.eq_ignore_ascii_case("crypto_luks")
}

/// Where partitions live after the upgrade.
struct Targets {
    boot: PathBuf,
    system: PathBuf,
    exchange: Option<PathBuf>,
    data: Option<PathBuf>,
}

pub(crate) fn run(
    run: &DeviceRun<'_>,
    source: &dyn SourceImage,
    options: &UpgradeOptions,
) -> Result<()> {
    let device = run.device;

    run.phase(Phase::Plan)?;
    if device.system_partition().is_none() || device.partition(PartitionRole::Boot).is_none() {
        return Err(Error::PreconditionFailed(format!(
            "{} does not hold a live system",
            device.path.display()
        )));
    }
    let plan = layout::compute_upgrade_plan(
        source.info(),
        device,
        options.strategy,
        options.preserves_data(),
    )?;
    let repartition = layout::needs_repartition(device, &plan);
    let data = device.data_partition();
    if let Some(data) = data.filter(|d| is_encrypted(d)) {
        let touches_data = repartition
            || options.backup_to.is_some()
            || options.reset_data.is_some()
            || !options.overwrites.is_empty();
        if touches_data {
            return Err(Error::PreconditionFailed(format!(
                "{} is encrypted and cannot be changed during an upgrade",
                data.path().display()
            )));
        }
    }
    if data.is_some_and(|d| d.active_persistence) {
        return Err(Error::PreconditionFailed(format!(
            "{} is the active persistence partition",
            device.path.display()
        )));
    }
    run.message(
        Phase::Plan,
        if repartition {
            format!("{plan} (repartitioning)")
        } else {
            plan.to_string()
        },
    );

    run.phase(Phase::Unmount)?;
    run.unmount_all()?;

    if let (Some(destination), Some(data)) = (&options.backup_to, data) {
        run.phase(Phase::Backup)?;
        backup_data(run, destination, data)?;
    }

    run.commit("Upgrade the live system on")?;

    let targets = if repartition {
        let staging = stash(run, options)?;
        match repartition_and_restore(run, &plan, staging.path()) {
            Ok(targets) => targets,
            Err(e) => {
                // The device content is gone; the stash is the only copy left.
                let kept = staging.keep();
                error!(device = %run.device.name, stash = %kept.display(), "restoring stashed content failed: {e}");
                run.message(Phase::Format, format!("stashed content kept in {}", kept.display()));
                return Err(e);
            }
        }
    } else {
        run.phase(Phase::Format)?;
        let targets = current_targets(run)?;
        run.storage
            .format(&targets.boot, Filesystem::Vfat, &run.config.labels.boot)?;
        targets
    };

    if let (Some(clear), Some(data)) = (options.reset_data, &targets.data) {
        run.phase(Phase::ResetData)?;
        run.with_mounted(data, |dir| persistence::clear(dir, &run.config.persistence, clear))?;
    }

    run.phase(Phase::Copy)?;
    run.storage
        .write_image(source.system_image(), &targets.system, &mut run.image_progress())?;
    if let (true, Some(payload), Some(exchange)) =
        (options.copy_exchange, source.exchange_dir(), &targets.exchange)
    {
        copy_payload(run, payload, exchange)?;
    }

    if let (false, Some(data)) = (options.overwrites.is_empty(), &targets.data) {
        run.phase(Phase::Overwrite)?;
        let written = run.with_mounted(data, |dir| {
            let root = persistence::resolve_root(dir, &run.config.persistence);
            options.overwrites.apply(&root)
        })?;
        run.message(Phase::Overwrite, format!("{written} files written"));
    }

    run.phase(Phase::Bootloader)?;
    run.storage
        .install_bootloader(&device.path, &targets.boot, &targets.system)?;

    run.phase(Phase::Finalize)?;
    Ok(())
}

fn backup_data(run: &DeviceRun<'_>, destination: &Path, data: &PartitionSnapshot) -> Result<()> {
    let required = data.used.unwrap_or(data.size);
    if let Err(e) = backup::check_destination(destination, required) {
        warn!(device = %run.device.name, "skipping backup: {e}");
        run.message(Phase::Backup, format!("skipped: {e}"));
        return Ok(());
    }
    run.with_mounted(&data.path(), |dir| run.backup.backup(dir, destination))
}

fn current_targets(run: &DeviceRun<'_>) -> Result<Targets> {
    let required = |role| {
        run.current_partition(role).ok_or_else(|| {
            Error::PreconditionFailed(format!("{} has no {role} partition", run.device.path.display()))
        })
    };
    Ok(Targets {
        boot: required(PartitionRole::Boot)?,
        system: required(PartitionRole::System)?,
        exchange: run.current_partition(PartitionRole::Exchange),
        data: run.current_partition(PartitionRole::Data),
    })
}

/// Copies the exchange (unless it goes away) and data content into a new
/// staging directory. Data content that is reset completely is not kept;
/// the new data partition starts fresh.
fn stash(run: &DeviceRun<'_>, options: &UpgradeOptions) -> Result<TempDir> {
    run.phase(Phase::Stash)?;
    let device = run.device;
    let keep_exchange = options.strategy != RepartitionStrategy::Remove;
    let stashed: Vec<(&str, &PartitionSnapshot)> = [
        ("exchange", device.exchange_partition().filter(|_| keep_exchange)),
        ("data", device.data_partition().filter(|_| options.preserves_data())),
    ]
    .into_iter()
    .filter_map(|(name, partition)| partition.map(|p| (name, p)))
    .collect();

    let base = run
        .config
        .staging_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let required: u64 = stashed
        .iter()
        .map(|(_, p)| p.used.unwrap_or(p.size))
        .sum();
    backup::check_destination(&base, required)?;

    let staging = tempfile::Builder::new()
        .prefix("livestick-stash-")
        .tempdir_in(&base)?;
    for (name, partition) in stashed {
        let target = staging.path().join(name);
        std::fs::create_dir(&target)?;
        run.message(Phase::Stash, format!("stashing {name} partition"));
        run.with_mounted(&partition.path(), |dir| {
            run.storage.copy_tree(dir, &target, &mut run.bytes(Phase::Stash))
        })?;
    }
    Ok(staging)
}

fn repartition_and_restore(
    run: &DeviceRun<'_>,
    plan: &PartitionPlan,
    staging: &Path,
) -> Result<Targets> {
    run.phase(Phase::Partition)?;
    run.storage.write_table(&run.device.path, plan)?;

    run.phase(Phase::Format)?;
    let path_of = |role| plan.planned(role).map(|p| run.partition_path(p.number));
    let missing = |role: PartitionRole| Error::PreconditionFailed(format!("plan has no {role} partition"));
    let targets = Targets {
        boot: path_of(PartitionRole::Boot).ok_or_else(|| missing(PartitionRole::Boot))?,
        system: path_of(PartitionRole::System).ok_or_else(|| missing(PartitionRole::System))?,
        exchange: path_of(PartitionRole::Exchange),
        data: path_of(PartitionRole::Data),
    };

    let labels = &run.config.labels;
    if let Some(exchange) = &targets.exchange {
        let label = run
            .device
            .exchange_partition()
            .map(|p| p.label.as_str())
            .filter(|l| !l.is_empty())
            .unwrap_or(&labels.exchange);
        let fs = run
            .device
            .exchange_partition()
            .and_then(|p| Filesystem::from_fs_type(&p.fs_type))
            .unwrap_or(run.config.exchange_fs);
        run.storage.format(exchange, fs, label)?;
    }
    run.storage.format(&targets.boot, Filesystem::Vfat, &labels.boot)?;
    if let Some(data) = &targets.data {
        run.storage.format(data, run.config.data_fs, &labels.data)?;
    }

    for (name, partition) in [("exchange", &targets.exchange), ("data", &targets.data)] {
        let stashed = staging.join(name);
        let Some(partition) = partition else {
            continue;
        };
        let fresh_data = name == "data" && !stashed.is_dir();
        if !stashed.is_dir() && !fresh_data {
            continue;
        }
        run.with_mounted(partition, |dir| {
            if fresh_data {
                return persistence::write_persistence_conf(dir);
            }
            run.message(
                Phase::Format,
                format!("restoring {name} partition ({} bytes)", tree_size(&stashed)?),
            );
            run.storage.copy_tree(&stashed, dir, &mut run.bytes(Phase::Format))
        })?;
    }
    Ok(targets)
}
