//! The core, UI-agnostic provisioning engine of `livestick`.
//!
//! `livestick-core` installs a live system onto storage devices, upgrades
//! previously provisioned devices and resets them. Any front end can drive
//! it: the `livestick` command-line tool is one, and a graphical interface
//! would use the same entry points.
//!
//! The library is structured into several key modules:
//! - [`device`]: immutable snapshots of block devices and their partitions.
//! - [`platform`]: discovering and probing devices on the running system.
//! - [`monitor`]: keeps the list of selectable devices current while devices
//!   come and go.
//! - [`layout`]: the pure partition layout calculator.
//! - [`credentials`]: unlock methods for the data partition and their rules.
//! - [`batch`]: runs install, upgrade and reset batches, one device after the
//!   other, and reports progress on a channel.
//! - [`report`]: per-device outcomes and the final batch report.
//!
//! ## Example: installing onto every removable device
//!
//! ```rust,no_run
//! use livestick_core::batch::{BatchJob, BatchRequest, Engine};
//! use livestick_core::config::EngineConfig;
//! use livestick_core::install::InstallOptions;
//! use livestick_core::source::LiveSource;
//! use livestick_core::{platform, Result};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let config = EngineConfig::default();
//!     let devices = platform::scan_devices(&config)?;
//!     let source = LiveSource::open(Path::new("/srv/livestick/current"), None)?;
//!
//!     let engine = Engine::system(config);
//!     let handle = engine.start(
//!         BatchRequest {
//!             job: BatchJob::Install(InstallOptions {
//!                 exchange_mb: 1000,
//!                 ..Default::default()
//!             }),
//!             source: Some(Arc::new(source)),
//!             devices: devices.into_iter().map(Arc::new).collect(),
//!             unlock_method: Default::default(),
//!             secrets: Default::default(),
//!         },
//!         // Fixed disks are never touched in this example.
//!         Arc::new(|_: &str| false),
//!     )?;
//!
//!     for event in handle.events().iter() {
//!         println!("{event:?}");
//!     }
//!     let report = handle.join()?;
//!     println!("{} of {} devices done", report.succeeded(), report.results.len());
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod batch;
pub mod config;
pub mod credentials;
pub mod device;
pub mod error;
pub mod install;
pub mod layout;
pub mod monitor;
pub mod persistence;
pub mod platform;
pub mod progress;
pub mod report;
pub mod reset;
pub mod source;
pub mod storage;
pub mod tools;
pub mod upgrade;
pub mod write;

pub use error::{Error, FailureKind, Result};
