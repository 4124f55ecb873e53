//! Batch execution of install, upgrade and reset operations.
//!
//! An [`Engine`] runs at most one batch at a time. A batch processes its
//! devices strictly in submission order on a worker thread and reports what
//! happens as [`BatchEvent`]s on a channel. A failing device never stops the
//! batch; only an invalid source does.
use crate::backup::{BackupOps, RdiffBackup};
use crate::config::EngineConfig;
use crate::credentials::{self, SecretInput, UnlockMethod, UnlockMethodKind};
use crate::device::{DeviceSnapshot, PartitionRole, partition_path};
use crate::error::{Error, Result};
use crate::install::{self, InstallOptions};
use crate::layout::{self, PartitionPlan, RejectionReason};
use crate::monitor::DeviceListUpdate;
use crate::progress::{CopyProgress, Phase, PhaseDetail};
use crate::report::{BatchReport, DeviceOperationResult, Outcome, ReportBuilder, ReportView};
use crate::reset::{self, ResetOptions};
use crate::source::SourceImage;
use crate::storage::{StorageOps, SystemStorage, mapper_name};
use crate::tools::SystemToolRunner;
use crate::upgrade::{self, UpgradeOptions};
use crate::write::WriteStage;
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Cancelled)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Pending => "pending",
            BatchState::Running => "running",
            BatchState::Completed => "completed",
            BatchState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Notifications emitted by a running batch.
#[derive(Clone, Debug)]
pub enum BatchEvent {
    StateChanged(BatchState),
    Progress {
        device_index: usize,
        phase: Phase,
        detail: PhaseDetail,
    },
    DeviceCompleted {
        device_index: usize,
        result: DeviceOperationResult,
    },
    Completed(BatchReport),
    /// The source became unusable; the batch ended without a report.
    Aborted(String),
}

/// Answers the confirmation asked before destroying data on anything but a
/// removable flash device.
pub trait Confirmer: Send + Sync {
    fn confirm_destructive_operation(&self, message: &str) -> bool;
}

impl<F> Confirmer for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn confirm_destructive_operation(&self, message: &str) -> bool {
        self(message)
    }
}

/// Receives everything a batch (and the device monitor) reports.
pub trait PresentationAdapter {
    fn on_device_list_changed(&mut self, _update: &DeviceListUpdate) {}

    fn on_state_changed(&mut self, _state: BatchState) {}

    fn on_batch_progress(&mut self, device_index: usize, phase: Phase, detail: &PhaseDetail);

    fn on_device_completed(&mut self, device_index: usize, result: &DeviceOperationResult);

    fn on_batch_completed(&mut self, report: &BatchReport);

    fn on_batch_aborted(&mut self, _reason: &str) {}
}

/// Cooperative cancellation shared between a batch and its controllers.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What a batch does to each device.
#[derive(Debug)]
pub enum BatchJob {
    Install(InstallOptions),
    Upgrade(UpgradeOptions),
    Reset(ResetOptions),
}

impl BatchJob {
    pub fn name(&self) -> &'static str {
        match self {
            BatchJob::Install(_) => "install",
            BatchJob::Upgrade(_) => "upgrade",
            BatchJob::Reset(_) => "reset",
        }
    }

    fn needs_source(&self) -> bool {
        !matches!(self, BatchJob::Reset(_))
    }

    /// Whether the job creates a data partition that the unlock method
    /// applies to.
    fn uses_unlock_method(&self) -> bool {
        match self {
            BatchJob::Install(_) => true,
            BatchJob::Upgrade(_) => false,
            BatchJob::Reset(options) => options.formats_data(),
        }
    }
}

/// Everything needed to start a batch.
pub struct BatchRequest {
    pub job: BatchJob,
    pub source: Option<Arc<dyn SourceImage>>,
    pub devices: Vec<Arc<DeviceSnapshot>>,
    pub unlock_method: UnlockMethodKind,
    /// Consumed at start; whatever the selected method does not need is
    /// wiped right away.
    pub secrets: SecretInput,
}

/// Runs batches against a set of storage and backup implementations.
pub struct Engine {
    storage: Arc<dyn StorageOps>,
    backup: Arc<dyn BackupOps>,
    config: Arc<EngineConfig>,
    busy: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        storage: Arc<dyn StorageOps>,
        backup: Arc<dyn BackupOps>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            storage,
            backup,
            config,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// An engine working on the real system through external tools.
    pub fn system(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let runner = Arc::new(SystemToolRunner);
        Self::new(
            Arc::new(SystemStorage::new(runner.clone(), Arc::clone(&config))),
            Arc::new(RdiffBackup::new(runner)),
            config,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Previews the install plan for one device.
    pub fn plan_install(
        &self,
        source: &dyn SourceImage,
        device: &DeviceSnapshot,
        exchange_mb: u64,
        copy_exchange: bool,
    ) -> std::result::Result<PartitionPlan, RejectionReason> {
        layout::compute_install_plan(source.info(), device, exchange_mb, copy_exchange)
    }

    /// Validates `request` and starts it on a worker thread.
    ///
    /// Credential validation errors, a missing source and an already running
    /// batch are reported here, before any device is touched.
    pub fn start(&self, request: BatchRequest, confirmer: Arc<dyn Confirmer>) -> Result<BatchHandle> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Busy);
        }
        let guard = BusyGuard(Arc::clone(&self.busy));

        let BatchRequest {
            job,
            source,
            devices,
            unlock_method,
            secrets,
        } = request;

        let unlock = if job.uses_unlock_method() {
            credentials::select(unlock_method, secrets)?
        } else {
            drop(secrets);
            UnlockMethod::NoPassword
        };
        if job.needs_source() && source.is_none() {
            return Err(Error::SourceInvalid(format!("{} needs a source", job.name())));
        }
        if let BatchJob::Upgrade(options) = &job {
            options.overwrites.check()?;
        }

        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let state = Arc::new(Mutex::new(BatchState::Pending));
        let builder = ReportBuilder::new();
        let view = builder.view();

        let worker = Worker {
            storage: Arc::clone(&self.storage),
            backup: Arc::clone(&self.backup),
            config: Arc::clone(&self.config),
            confirmer,
            cancel: cancel.clone(),
            events: tx,
            state: Arc::clone(&state),
            job,
            source,
            devices,
            unlock,
        };
        info!(job = worker.job.name(), devices = worker.devices.len(), "starting batch");
        let handle = thread::Builder::new()
            .name("livestick-batch".into())
            .spawn(move || {
                let _guard = guard;
                worker.run(builder)
            })?;

        Ok(BatchHandle {
            events: rx,
            cancel,
            state,
            view,
            worker: handle,
        })
    }
}

/// Releases the engine's busy flag, also when the worker panics.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Controls a running batch.
pub struct BatchHandle {
    events: Receiver<BatchEvent>,
    cancel: CancelToken,
    state: Arc<Mutex<BatchState>>,
    view: ReportView,
    worker: JoinHandle<Result<BatchReport>>,
}

impl BatchHandle {
    /// Requests cancellation. The device in progress finishes its current
    /// phase; once its destructive part started it runs to completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> BatchState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> &Receiver<BatchEvent> {
        &self.events
    }

    /// Results recorded so far.
    pub fn report_view(&self) -> ReportView {
        self.view.clone()
    }

    /// Waits for the batch to end.
    pub fn join(self) -> Result<BatchReport> {
        self.worker
            .join()
            .unwrap_or_else(|_| Err(Error::Io(io::Error::other("batch worker panicked"))))
    }

    /// Feeds every event to `adapter` until the batch ends.
    pub fn drive(self, adapter: &mut dyn PresentationAdapter) -> Result<BatchReport> {
        for event in self.events.iter() {
            match event {
                BatchEvent::StateChanged(state) => adapter.on_state_changed(state),
                BatchEvent::Progress {
                    device_index,
                    phase,
                    detail,
                } => adapter.on_batch_progress(device_index, phase, &detail),
                BatchEvent::DeviceCompleted {
                    device_index,
                    result,
                } => adapter.on_device_completed(device_index, &result),
                BatchEvent::Completed(report) => adapter.on_batch_completed(&report),
                BatchEvent::Aborted(reason) => adapter.on_batch_aborted(&reason),
            }
        }
        self.join()
    }
}

struct Worker {
    storage: Arc<dyn StorageOps>,
    backup: Arc<dyn BackupOps>,
    config: Arc<EngineConfig>,
    confirmer: Arc<dyn Confirmer>,
    cancel: CancelToken,
    events: Sender<BatchEvent>,
    state: Arc<Mutex<BatchState>>,
    job: BatchJob,
    source: Option<Arc<dyn SourceImage>>,
    devices: Vec<Arc<DeviceSnapshot>>,
    unlock: UnlockMethod,
}

impl Worker {
    fn send(&self, event: BatchEvent) {
        // The controller may have stopped listening; the batch goes on.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: BatchState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        self.send(BatchEvent::StateChanged(state));
    }

    fn run(mut self, builder: ReportBuilder) -> Result<BatchReport> {
        self.set_state(BatchState::Running);
        let result = self.run_devices(&builder);
        // Secrets never outlive the batch.
        self.unlock.clear();

        match result {
            Ok(state) => {
                self.set_state(state);
                let report = builder.finish(state);
                info!(
                    %state,
                    succeeded = report.succeeded(),
                    failed = report.failed(),
                    "batch finished"
                );
                self.send(BatchEvent::Completed(report.clone()));
                Ok(report)
            }
            Err(e) => {
                error!("batch aborted: {e}");
                self.send(BatchEvent::Aborted(e.to_string()));
                Err(e)
            }
        }
    }

    fn run_devices(&self, builder: &ReportBuilder) -> Result<BatchState> {
        for (index, device) in self.devices.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(device = %device.name, "batch cancelled, skipping device");
                self.complete(builder, index, device, Duration::ZERO, Outcome::Cancelled);
                continue;
            }
            if let Some(source) = &self.source {
                source.validate()?;
            }

            let started = Instant::now();
            let run = DeviceRun {
                index,
                device,
                storage: self.storage.as_ref(),
                backup: self.backup.as_ref(),
                config: &self.config,
                confirmer: self.confirmer.as_ref(),
                cancel: &self.cancel,
                events: &self.events,
                committed: RefCell::new(false),
                mounts: RefCell::new(Vec::new()),
                containers: RefCell::new(Vec::new()),
            };
            let result = self.run_device(&run);
            run.cleanup();

            match &result {
                Ok(()) => info!(device = %device.name, "device finished"),
                Err(Error::Cancelled) => info!(device = %device.name, "device skipped"),
                Err(e) => warn!(device = %device.name, kind = %e.kind(), "device failed: {e}"),
            }
            let outcome = Outcome::from_result(&result);
            self.complete(builder, index, device, started.elapsed(), outcome);
        }

        Ok(if self.cancel.is_cancelled() {
            BatchState::Cancelled
        } else {
            BatchState::Completed
        })
    }

    fn run_device(&self, run: &DeviceRun<'_>) -> Result<()> {
        match &self.job {
            BatchJob::Install(options) => {
                install::run(run, self.source()?, options, &self.unlock)
            }
            BatchJob::Upgrade(options) => upgrade::run(run, self.source()?, options),
            BatchJob::Reset(options) => reset::run(run, options, &self.unlock),
        }
    }

    fn source(&self) -> Result<&dyn SourceImage> {
        self.source
            .as_deref()
            .ok_or_else(|| Error::SourceInvalid("no source".into()))
    }

    fn complete(
        &self,
        builder: &ReportBuilder,
        index: usize,
        device: &Arc<DeviceSnapshot>,
        elapsed: Duration,
        outcome: Outcome,
    ) {
        let result = DeviceOperationResult {
            device: Arc::clone(device),
            elapsed,
            outcome,
        };
        builder.record(result.clone());
        self.send(BatchEvent::DeviceCompleted {
            device_index: index,
            result,
        });
    }
}

/// State and helpers shared by the per-device workflows.
pub(crate) struct DeviceRun<'a> {
    pub index: usize,
    pub device: &'a DeviceSnapshot,
    pub storage: &'a dyn StorageOps,
    pub backup: &'a dyn BackupOps,
    pub config: &'a EngineConfig,
    confirmer: &'a dyn Confirmer,
    cancel: &'a CancelToken,
    events: &'a Sender<BatchEvent>,
    /// Set once the destructive part started; cancellation is ignored after.
    committed: RefCell<bool>,
    mounts: RefCell<Vec<PathBuf>>,
    containers: RefCell<Vec<String>>,
}

impl DeviceRun<'_> {
    pub fn emit(&self, phase: Phase, detail: PhaseDetail) {
        let _ = self.events.send(BatchEvent::Progress {
            device_index: self.index,
            phase,
            detail,
        });
    }

    pub fn message(&self, phase: Phase, message: impl Into<String>) {
        self.emit(phase, PhaseDetail::Message(message.into()));
    }

    /// Progress callback for byte-counting operations of `phase`.
    pub fn bytes(&self, phase: Phase) -> impl FnMut(CopyProgress) + '_ {
        move |progress| self.emit(phase, PhaseDetail::Bytes(progress))
    }

    /// Progress callback for system image writes.
    pub fn image_progress(&self) -> impl FnMut(WriteStage, CopyProgress) + '_ {
        let mut stage = None;
        move |current, progress| {
            if stage != Some(current) {
                stage = Some(current);
                self.message(Phase::Copy, current.to_string());
            }
            self.emit(Phase::Copy, PhaseDetail::Bytes(progress));
        }
    }

    /// Enters `phase`: honours cancellation until the device is committed and
    /// makes sure the device is still attached.
    pub fn phase(&self, phase: Phase) -> Result<()> {
        if !*self.committed.borrow() {
            self.cancel.check()?;
        }
        if !self.storage.is_present(self.device) {
            return Err(Error::DeviceDisappeared(self.device.name.clone()));
        }
        info!(device = %self.device.name, %phase, "phase started");
        self.emit(phase, PhaseDetail::Started);
        Ok(())
    }

    /// Last point before data is destroyed. Devices that are not removable
    /// flash drives need the operator's confirmation.
    pub fn commit(&self, action: &str) -> Result<()> {
        self.cancel.check()?;
        if self.device.needs_confirmation() {
            let message = format!(
                "{action} {} ({}, {} {:.1} GB)? Existing data on it may be lost.",
                self.device.path.display(),
                self.device.description(),
                self.device.kind,
                self.device.size_gb()
            );
            if !self.confirmer.confirm_destructive_operation(&message) {
                info!(device = %self.device.name, "operation not confirmed");
                return Err(Error::Cancelled);
            }
        }
        *self.committed.borrow_mut() = true;
        Ok(())
    }

    /// Unmounts every mounted partition of the device. Partitions the running
    /// system depends on are never released.
    pub fn unmount_all(&self) -> Result<()> {
        if let Some(part) = self
            .device
            .partitions
            .iter()
            .find(|p| p.in_use_by_running_system())
        {
            return Err(Error::PreconditionFailed(format!(
                "{} is in use by the running system",
                part.path().display()
            )));
        }

        let mounted = self.storage.mounted_partitions(self.device)?;
        if let Some((partition, _)) = mounted.iter().find(|(_, target)| {
            self.config
                .live_mount_roots
                .iter()
                .any(|root| target.starts_with(root))
        }) {
            return Err(Error::PreconditionFailed(format!(
                "{} is in use by the running system",
                partition.display()
            )));
        }
        self.release_mounts(Phase::Unmount, mounted)
    }

    /// Unmounts `(partition, mount point)` pairs found on the device, then
    /// closes the encrypted mappings they were mounted from.
    pub fn release_mounts(&self, phase: Phase, mounted: Vec<(PathBuf, PathBuf)>) -> Result<()> {
        let mut mappings = Vec::new();
        for (partition, target) in &mounted {
            self.storage.unmount(target)?;
            self.message(phase, format!("unmounted {}", partition.display()));
            if let Some(name) = mapper_name(partition) {
                if !mappings.contains(&name) {
                    mappings.push(name);
                }
            }
        }
        for name in mappings {
            self.storage.close_encrypted(name)?;
            self.containers.borrow_mut().retain(|c| c != name);
            self.message(phase, format!("closed {name}"));
        }
        Ok(())
    }

    /// Device path of partition `number`.
    pub fn partition_path(&self, number: u32) -> PathBuf {
        partition_path(&self.device.path, number)
    }

    /// Device path of the current partition with `role`.
    pub fn current_partition(&self, role: PartitionRole) -> Option<PathBuf> {
        self.device.partition(role).map(|p| p.path())
    }

    /// Mounts `partition` for the rest of this device's workflow.
    pub fn mount(&self, partition: &Path) -> Result<PathBuf> {
        let dir = self.storage.mount(partition)?;
        self.mounts.borrow_mut().push(dir.clone());
        Ok(dir)
    }

    pub fn unmount(&self, dir: &Path) -> Result<()> {
        self.mounts.borrow_mut().retain(|d| d != dir);
        self.storage.unmount(dir)
    }

    /// Runs `f` with `partition` mounted, unmounting it afterwards.
    pub fn with_mounted<T>(&self, partition: &Path, f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        let dir = self.mount(partition)?;
        let result = f(&dir);
        let unmounted = self.unmount(&dir);
        let value = result?;
        unmounted?;
        Ok(value)
    }

    /// Name of the encrypted container opened on this device.
    pub fn container_name(&self) -> String {
        format!("livestick-{}", self.device.name)
    }

    pub fn create_encrypted(&self, partition: &Path, unlock: &UnlockMethod) -> Result<PathBuf> {
        let name = self.container_name();
        let mapped = self.storage.create_encrypted(partition, unlock, &name)?;
        self.containers.borrow_mut().push(name);
        Ok(mapped)
    }

    pub fn close_encrypted(&self) -> Result<()> {
        let name = self.container_name();
        self.containers.borrow_mut().retain(|c| *c != name);
        self.storage.close_encrypted(&name)
    }

    /// Releases everything a failed workflow left behind.
    pub fn cleanup(&self) {
        let mounts: Vec<_> = self.mounts.borrow_mut().drain(..).collect();
        for dir in mounts.iter().rev() {
            if let Err(e) = self.storage.unmount(dir) {
                warn!(device = %self.device.name, dir = %dir.display(), "cleanup unmount failed: {e}");
            }
        }
        let containers: Vec<_> = self.containers.borrow_mut().drain(..).collect();
        for name in containers {
            if let Err(e) = self.storage.close_encrypted(&name) {
                warn!(device = %self.device.name, container = %name, "cleanup close failed: {e}");
            }
        }
    }
}
