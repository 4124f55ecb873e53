//! Partition layout calculation.
//!
//! Every function in this module is pure: the same source and device always
//! produce the same plan. Sizes cross the interface in whole mebibytes so the
//! resulting table matches the granularity of the partitioning tools.
use crate::device::{DeviceSnapshot, PartitionRole};
use crate::source::SourceInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One mebibyte.
pub const MEGA: u64 = 1024 * 1024;

/// Size of the boot partition.
pub const BOOT_PARTITION_MB: u64 = 100;

/// Safety margin added to the source system size, in percent.
pub const SYSTEM_ENLARGE_PERCENT: u64 = 5;

/// Space kept free in front of the first partition for the partition table
/// and alignment.
pub const TABLE_OVERHEAD_MB: u64 = 1;

/// Why no plan could be produced for a device.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("device is too small ({available_mb} MiB available, {required_mb} MiB required)")]
    TooSmall { required_mb: u64, available_mb: u64 },

    #[error("exchange payload should be copied but no exchange partition was requested")]
    NoExchangeRequested,

    #[error("device holds the source system")]
    DeviceIsSource,

    #[error(
        "data partition would be too small for its current content ({available_mb} MiB available, {required_mb} MiB used)"
    )]
    PersistenceTooSmall { required_mb: u64, available_mb: u64 },

    #[error(
        "exchange partition would be too small for its current content ({available_mb} MiB available, {required_mb} MiB used)"
    )]
    ExchangeTooSmall { required_mb: u64, available_mb: u64 },
}

/// What to do with the exchange partition during an upgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum RepartitionStrategy {
    Keep,
    Resize { exchange_mb: u64 },
    Remove,
}

/// Partition sizes for one target device, in mebibytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PartitionPlan {
    pub boot_mb: u64,
    pub system_mb: u64,
    /// 0 when the device gets no exchange partition.
    pub exchange_mb: u64,
    /// 0 when no data partition fits.
    pub data_mb: u64,
}

/// A partition of a plan with its position on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlannedPartition {
    pub number: u32,
    pub role: PartitionRole,
    pub start_mb: u64,
    pub size_mb: u64,
}

impl PartitionPlan {
    pub fn total_mb(&self) -> u64 {
        TABLE_OVERHEAD_MB + self.boot_mb + self.system_mb + self.exchange_mb + self.data_mb
    }

    pub fn has_exchange(&self) -> bool {
        self.exchange_mb > 0
    }

    pub fn has_data(&self) -> bool {
        self.data_mb > 0
    }

    /// The partitions in table order: `[exchange] boot system [data]`.
    ///
    /// The exchange partition comes first so that operating systems that only
    /// look at the first partition of removable media still find it.
    pub fn partitions(&self) -> Vec<PlannedPartition> {
        let sizes = [
            (PartitionRole::Exchange, self.exchange_mb),
            (PartitionRole::Boot, self.boot_mb),
            (PartitionRole::System, self.system_mb),
            (PartitionRole::Data, self.data_mb),
        ];

        let mut start_mb = TABLE_OVERHEAD_MB;
        let mut number = 0;
        let mut partitions = Vec::with_capacity(sizes.len());
        for (role, size_mb) in sizes {
            if size_mb == 0 {
                continue;
            }
            number += 1;
            partitions.push(PlannedPartition {
                number,
                role,
                start_mb,
                size_mb,
            });
            start_mb += size_mb;
        }
        partitions
    }

    /// The planned partition carrying `role`, if the plan has one.
    pub fn planned(&self, role: PartitionRole) -> Option<PlannedPartition> {
        self.partitions().into_iter().find(|p| p.role == role)
    }
}

impl fmt::Display for PartitionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "boot {} MiB, system {} MiB, exchange {} MiB, data {} MiB",
            self.boot_mb, self.system_mb, self.exchange_mb, self.data_mb
        )
    }
}

fn bytes_to_mb_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(MEGA)
}

/// Source size plus the enlargement margin, rounded up to whole MiB.
pub fn enlarged_system_mb(source_size: u64) -> u64 {
    let raw_mb = bytes_to_mb_ceil(source_size);
    (raw_mb * (100 + SYSTEM_ENLARGE_PERCENT)).div_ceil(100)
}

fn device_mb(device: &DeviceSnapshot) -> u64 {
    device.size / MEGA
}

fn is_source_device(source: &SourceInfo, device: &DeviceSnapshot) -> bool {
    source.device_name.as_deref() == Some(device.name.as_str())
}

/// Space left for exchange and data partitions once boot and system fit.
fn overhead_mb(device_mb: u64, boot_mb: u64, system_mb: u64) -> Result<u64, RejectionReason> {
    let required_mb = TABLE_OVERHEAD_MB + boot_mb + system_mb;
    device_mb
        .checked_sub(required_mb)
        .ok_or(RejectionReason::TooSmall {
            required_mb,
            available_mb: device_mb,
        })
}

/// Plans a fresh installation onto `device`.
///
/// `copy_exchange` states whether the source's exchange payload should be
/// copied; that needs an exchange partition.
pub fn compute_install_plan(
    source: &SourceInfo,
    device: &DeviceSnapshot,
    requested_exchange_mb: u64,
    copy_exchange: bool,
) -> Result<PartitionPlan, RejectionReason> {
    if is_source_device(source, device) {
        return Err(RejectionReason::DeviceIsSource);
    }

    let device_mb = device_mb(device);
    let boot_mb = BOOT_PARTITION_MB;
    let system_mb = enlarged_system_mb(source.system_size);
    let overhead = overhead_mb(device_mb, boot_mb, system_mb)?;

    if copy_exchange && requested_exchange_mb == 0 {
        return Err(RejectionReason::NoExchangeRequested);
    }
    if requested_exchange_mb > overhead {
        return Err(RejectionReason::TooSmall {
            required_mb: device_mb - overhead + requested_exchange_mb,
            available_mb: device_mb,
        });
    }

    Ok(PartitionPlan {
        boot_mb,
        system_mb,
        exchange_mb: requested_exchange_mb,
        data_mb: overhead - requested_exchange_mb,
    })
}

/// Plans an upgrade of a previously provisioned `device`.
///
/// With [`RepartitionStrategy::Keep`] the current boot, system and exchange
/// boundaries are kept as long as they are large enough for the new system.
/// When `preserve_data` is set the resulting data partition must still hold
/// the current data partition's used space. A resized exchange partition
/// always has to hold its current content.
pub fn compute_upgrade_plan(
    source: &SourceInfo,
    device: &DeviceSnapshot,
    strategy: RepartitionStrategy,
    preserve_data: bool,
) -> Result<PartitionPlan, RejectionReason> {
    if is_source_device(source, device) {
        return Err(RejectionReason::DeviceIsSource);
    }

    let device_mb = device_mb(device);
    let current_mb = |role| device.partition(role).map_or(0, |p| p.size / MEGA);
    let enlarged_mb = enlarged_system_mb(source.system_size);

    let (boot_mb, system_mb, exchange_mb) = match strategy {
        RepartitionStrategy::Keep => (
            BOOT_PARTITION_MB.max(current_mb(PartitionRole::Boot)),
            enlarged_mb.max(current_mb(PartitionRole::System)),
            current_mb(PartitionRole::Exchange),
        ),
        RepartitionStrategy::Resize { exchange_mb } => {
            (BOOT_PARTITION_MB, enlarged_mb, exchange_mb)
        }
        RepartitionStrategy::Remove => (BOOT_PARTITION_MB, enlarged_mb, 0),
    };

    let overhead = overhead_mb(device_mb, boot_mb, system_mb)?;
    if exchange_mb > overhead {
        return Err(RejectionReason::TooSmall {
            required_mb: device_mb - overhead + exchange_mb,
            available_mb: device_mb,
        });
    }
    let data_mb = overhead - exchange_mb;

    if let RepartitionStrategy::Resize { .. } = strategy {
        let used_mb = device
            .exchange_partition()
            .and_then(|p| p.used)
            .map_or(0, bytes_to_mb_ceil);
        if used_mb > exchange_mb {
            return Err(RejectionReason::ExchangeTooSmall {
                required_mb: used_mb,
                available_mb: exchange_mb,
            });
        }
    }

    if preserve_data {
        let used_mb = device
            .data_partition()
            .and_then(|p| p.used)
            .map_or(0, bytes_to_mb_ceil);
        if used_mb > data_mb {
            return Err(RejectionReason::PersistenceTooSmall {
                required_mb: used_mb,
                available_mb: data_mb,
            });
        }
    }

    Ok(PartitionPlan {
        boot_mb,
        system_mb,
        exchange_mb,
        data_mb,
    })
}

/// True when applying `plan` to `device` changes the partition table.
///
/// Upgrades that keep the current table only rewrite the system and boot
/// partitions in place.
pub fn needs_repartition(device: &DeviceSnapshot, plan: &PartitionPlan) -> bool {
    let current_mb = |role| device.partition(role).map_or(0, |p| p.size / MEGA);
    current_mb(PartitionRole::Boot) != plan.boot_mb
        || current_mb(PartitionRole::System) != plan.system_mb
        || current_mb(PartitionRole::Exchange) != plan.exchange_mb
        || device.data_partition().is_some() != plan.has_data()
}
