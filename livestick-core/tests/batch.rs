use livestick_core::backup::BackupOps;
use livestick_core::batch::{
    BatchEvent, BatchJob, BatchRequest, BatchState, Engine, PresentationAdapter,
};
use livestick_core::config::{EngineConfig, Filesystem};
use livestick_core::credentials::{Secret, SecretInput, UnlockMethod, UnlockMethodKind};
use livestick_core::device::{
    DeviceKind, DeviceSnapshot, MountState, PartitionRole, PartitionSnapshot,
};
use livestick_core::install::InstallOptions;
use livestick_core::layout::{MEGA, PartitionPlan, RepartitionStrategy};
use livestick_core::persistence::{ClearOptions, OverwriteEntry, OverwriteList};
use livestick_core::progress::{CopyProgress, Phase, PhaseDetail};
use livestick_core::report::{BatchReport, DeviceOperationResult, Outcome};
use livestick_core::reset::{DataReset, ExchangeReset, ResetOptions};
use livestick_core::source::{SourceImage, SourceInfo};
use livestick_core::storage::{self, StorageOps};
use livestick_core::upgrade::UpgradeOptions;
use livestick_core::write::WriteStage;
use livestick_core::{Error, FailureKind, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Storage that records every call. Partitions are "mounted" on directories
/// named after them, so content survives from one mount to the next.
///
/// `mounted` holds mounts made outside the workflow, as
/// `(device name, partition, mount point)`. With `automount` every freshly
/// formatted partition shows up there, the way a desktop session does it.
struct FakeStorage {
    root: TempDir,
    calls: Mutex<Vec<String>>,
    gone: Mutex<HashSet<String>>,
    fail_format: Option<PathBuf>,
    mounted: Mutex<Vec<(String, PathBuf, PathBuf)>>,
    automount: bool,
}

impl FakeStorage {
    fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            calls: Mutex::new(Vec::new()),
            gone: Mutex::new(HashSet::new()),
            fail_format: None,
            mounted: Mutex::new(Vec::new()),
            automount: false,
        }
    }

    fn mounted_elsewhere(&self, device: &str, partition: &str, target: &str) {
        self.mounted.lock().unwrap().push((
            device.to_string(),
            PathBuf::from(partition),
            PathBuf::from(target),
        ));
    }

    fn dir(&self, partition: &Path) -> PathBuf {
        self.root.path().join(partition.file_name().unwrap())
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, device: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.contains(device))
            .collect()
    }
}

impl StorageOps for FakeStorage {
    fn is_present(&self, device: &DeviceSnapshot) -> bool {
        !self.gone.lock().unwrap().contains(&device.name)
    }

    fn mounted_partitions(&self, device: &DeviceSnapshot) -> Result<Vec<(PathBuf, PathBuf)>> {
        Ok(self
            .mounted
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _, _)| *name == device.name)
            .map(|(_, partition, target)| (partition.clone(), target.clone()))
            .collect())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.record(format!("unmount {}", target.display()));
        self.mounted.lock().unwrap().retain(|(_, _, t)| t != target);
        Ok(())
    }

    fn mount(&self, partition: &Path) -> Result<PathBuf> {
        self.record(format!("mount {}", partition.display()));
        let dir = self.dir(partition);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn write_table(&self, device: &Path, plan: &PartitionPlan) -> Result<()> {
        self.record(format!("table {} {plan}", device.display()));
        Ok(())
    }

    fn format(&self, partition: &Path, filesystem: Filesystem, label: &str) -> Result<()> {
        self.record(format!("format {} {filesystem} {label}", partition.display()));
        if self.fail_format.as_deref() == Some(partition) {
            return Err(Error::ToolExecutionFailed {
                tool: filesystem.mkfs().into(),
                status: "exit code 1".into(),
                stderr: "device busy".into(),
            });
        }
        let dir = self.dir(partition);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        if self.automount {
            let device = partition
                .file_name()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches(|c: char| c.is_ascii_digit())
                .to_string();
            let target = PathBuf::from("/media/user").join(label);
            self.mounted.lock().unwrap().push((device, partition.to_path_buf(), target));
        }
        Ok(())
    }

    fn create_encrypted(
        &self,
        partition: &Path,
        unlock: &UnlockMethod,
        name: &str,
    ) -> Result<PathBuf> {
        self.record(format!(
            "luks {} {} keys",
            partition.display(),
            unlock.keys().len()
        ));
        Ok(PathBuf::from("/dev/mapper").join(name))
    }

    fn close_encrypted(&self, name: &str) -> Result<()> {
        self.record(format!("close {name}"));
        Ok(())
    }

    fn write_image(
        &self,
        image: &Path,
        partition: &Path,
        on_progress: &mut dyn FnMut(WriteStage, CopyProgress),
    ) -> Result<()> {
        self.record(format!("image {} {}", image.display(), partition.display()));
        let progress = CopyProgress::start(4096);
        on_progress(WriteStage::Write, progress.advance(4096));
        Ok(())
    }

    fn copy_tree(
        &self,
        from: &Path,
        to: &Path,
        on_progress: &mut dyn FnMut(CopyProgress),
    ) -> Result<()> {
        storage::copy_tree(from, to, on_progress)
    }

    fn install_bootloader(&self, device: &Path, boot: &Path, _system: &Path) -> Result<()> {
        self.record(format!("bootloader {} {}", device.display(), boot.display()));
        Ok(())
    }
}

#[derive(Default)]
struct FakeBackup {
    runs: AtomicUsize,
}

impl BackupOps for FakeBackup {
    fn backup(&self, _source: &Path, _destination: &Path) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A 4000 MiB system image that becomes invalid after `valid_checks`
/// validations.
struct FakeSource {
    info: SourceInfo,
    image: PathBuf,
    checks: AtomicUsize,
    valid_checks: usize,
}

impl FakeSource {
    fn new() -> Self {
        Self {
            info: SourceInfo {
                system_size: 4000 * MEGA,
                device_name: Some("sda".into()),
                has_exchange: false,
                data_used: None,
            },
            image: PathBuf::from("/srv/live/system.img"),
            checks: AtomicUsize::new(0),
            valid_checks: usize::MAX,
        }
    }
}

impl SourceImage for FakeSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn validate(&self) -> Result<()> {
        if self.checks.fetch_add(1, Ordering::SeqCst) >= self.valid_checks {
            return Err(Error::SourceInvalid("system image vanished".into()));
        }
        Ok(())
    }

    fn system_image(&self) -> &Path {
        &self.image
    }

    fn exchange_dir(&self) -> Option<&Path> {
        None
    }

    fn data_dir(&self) -> Option<&Path> {
        None
    }
}

fn device(name: &str, size_mb: u64, partitions: Vec<PartitionSnapshot>) -> Arc<DeviceSnapshot> {
    Arc::new(DeviceSnapshot {
        path: PathBuf::from("/dev").join(name),
        name: name.into(),
        vendor: "Acme".into(),
        model: "Stick".into(),
        serial: String::new(),
        revision: String::new(),
        size: size_mb * MEGA,
        kind: DeviceKind::UsbFlash,
        removable: true,
        boot_device: false,
        partitions,
    })
}

fn partition(device: &str, number: u32, role: PartitionRole, size_mb: u64) -> PartitionSnapshot {
    let (label, fs_type) = match role {
        PartitionRole::Exchange => ("EXCHANGE", "vfat"),
        PartitionRole::Boot => ("boot", "vfat"),
        PartitionRole::System => ("system", "ext4"),
        PartitionRole::Data => ("persistence", "ext4"),
        PartitionRole::Unknown => ("", ""),
    };
    PartitionSnapshot {
        name: format!("{device}{number}"),
        number,
        role,
        label: label.into(),
        fs_type: fs_type.into(),
        size: size_mb * MEGA,
        mount_state: MountState::Unmounted,
        mount_point: None,
        used: None,
        active_persistence: false,
    }
}

/// A device as written by an install with a 1000 MiB exchange partition.
fn provisioned(name: &str, data_used_mb: u64) -> Arc<DeviceSnapshot> {
    let mut data = partition(name, 4, PartitionRole::Data, 2699);
    data.used = Some(data_used_mb * MEGA);
    device(
        name,
        8000,
        vec![
            partition(name, 1, PartitionRole::Exchange, 1000),
            partition(name, 2, PartitionRole::Boot, 100),
            partition(name, 3, PartitionRole::System, 4200),
            data,
        ],
    )
}

fn install(exchange_mb: u64) -> BatchJob {
    BatchJob::Install(InstallOptions {
        exchange_mb,
        ..Default::default()
    })
}

fn request(job: BatchJob, devices: Vec<Arc<DeviceSnapshot>>) -> BatchRequest {
    BatchRequest {
        job,
        source: Some(Arc::new(FakeSource::new())),
        devices,
        unlock_method: UnlockMethodKind::NoPassword,
        secrets: SecretInput::default(),
    }
}

fn engine(storage: &Arc<FakeStorage>, config: EngineConfig) -> Engine {
    Engine::new(
        storage.clone(),
        Arc::new(FakeBackup::default()),
        Arc::new(config),
    )
}

fn always_yes() -> Arc<dyn livestick_core::batch::Confirmer> {
    Arc::new(|_: &str| true)
}

fn outcomes(report: &BatchReport) -> Vec<(String, Outcome)> {
    report
        .results
        .iter()
        .map(|r| (r.device.name.clone(), r.outcome.clone()))
        .collect()
}

fn failure_kind(outcome: &Outcome) -> Option<FailureKind> {
    match outcome {
        Outcome::Failed(reason) => Some(reason.kind),
        _ => None,
    }
}

#[test]
fn invalid_device_does_not_stop_the_batch() {
    let storage = Arc::new(FakeStorage::new());
    let engine = engine(&storage, EngineConfig::default());
    let devices = vec![
        device("sdb", 8000, Vec::new()),
        device("sdc", 4200, Vec::new()),
        device("sdd", 8000, Vec::new()),
        device("sde", 16000, Vec::new()),
    ];

    let report = engine
        .start(request(install(1000), devices), always_yes())
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(report.state, BatchState::Completed);
    let names: Vec<_> = report.results.iter().map(|r| r.device.name.as_str()).collect();
    assert_eq!(names, ["sdb", "sdc", "sdd", "sde"]);
    assert_eq!(report.succeeded(), 3);
    assert_eq!(failure_kind(&report.results[1].outcome), Some(FailureKind::PlanRejected));
    // A rejected plan has no side effects.
    assert!(storage.calls_for("sdc").is_empty());
    assert!(!engine.is_busy());
}

#[test]
fn install_partitions_formats_and_writes() {
    let storage = Arc::new(FakeStorage::new());
    let engine = engine(&storage, EngineConfig::default());

    let report = engine
        .start(request(install(1000), vec![device("sdb", 8000, Vec::new())]), always_yes())
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(report.succeeded(), 1);

    let calls = storage.calls();
    let expected_prefixes = [
        "table /dev/sdb boot 100 MiB, system 4200 MiB, exchange 1000 MiB, data 2699 MiB",
        "format /dev/sdb1 vfat EXCHANGE",
        "format /dev/sdb2 vfat boot",
        "format /dev/sdb4 ext4 persistence",
        "image /srv/live/system.img /dev/sdb3",
        "mount /dev/sdb4",
        "unmount",
        "bootloader /dev/sdb /dev/sdb2",
    ];
    assert_eq!(calls.len(), expected_prefixes.len(), "{calls:#?}");
    for (call, prefix) in calls.iter().zip(expected_prefixes) {
        assert!(call.starts_with(prefix), "{call} does not start with {prefix}");
    }
    assert!(storage.root.path().join("sdb4/persistence.conf").is_file());
}

#[test]
fn tool_failure_is_isolated() {
    let mut storage = FakeStorage::new();
    storage.fail_format = Some(PathBuf::from("/dev/sdc1"));
    let storage = Arc::new(storage);
    let engine = engine(&storage, EngineConfig::default());

    let devices = vec![device("sdc", 8000, Vec::new()), device("sdd", 8000, Vec::new())];
    let report = engine
        .start(request(install(0), devices), always_yes())
        .unwrap()
        .join()
        .unwrap();

    let outcomes = outcomes(&report);
    assert_eq!(failure_kind(&outcomes[0].1), Some(FailureKind::ToolExecutionFailed));
    assert_eq!(outcomes[1].1, Outcome::Success);
    // No retry of the failed step.
    let formats = storage
        .calls_for("/dev/sdc1")
        .into_iter()
        .filter(|c| c.starts_with("format"))
        .count();
    assert_eq!(formats, 1);
}

#[test]
fn vanished_device_is_reported() {
    let storage = Arc::new(FakeStorage::new());
    storage.gone.lock().unwrap().insert("sdc".into());
    let engine = engine(&storage, EngineConfig::default());

    let devices = vec![device("sdc", 8000, Vec::new()), device("sdd", 8000, Vec::new())];
    let report = engine
        .start(request(install(0), devices), always_yes())
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(
        failure_kind(&report.results[0].outcome),
        Some(FailureKind::DeviceDisappeared)
    );
    assert!(report.results[1].is_success());
}

#[test]
fn cancellation_waits_for_the_running_device() {
    let storage = Arc::new(FakeStorage::new());
    let engine = engine(&storage, EngineConfig::default());

    let (asked_tx, asked_rx) = mpsc::channel();
    let (answer_tx, answer_rx) = mpsc::channel::<bool>();
    let answer_rx = Mutex::new(answer_rx);
    let confirmer = Arc::new(move |_: &str| {
        asked_tx.send(()).unwrap();
        answer_rx.lock().unwrap().recv().unwrap()
    });

    let mut fixed = (*device("sda", 500_000, Vec::new())).clone();
    fixed.kind = DeviceKind::HardDrive;
    fixed.removable = false;
    let mut req = request(install(0), vec![
        Arc::new(fixed),
        device("sdb", 8000, Vec::new()),
        device("sdc", 8000, Vec::new()),
    ]);
    // The source lives elsewhere in this test.
    req.source = Some(Arc::new(FakeSource {
        info: SourceInfo {
            device_name: None,
            ..FakeSource::new().info
        },
        ..FakeSource::new()
    }));

    let handle = engine.start(req, confirmer).unwrap();
    asked_rx.recv().unwrap();

    // Only one batch at a time.
    let second = engine.start(request(install(0), Vec::new()), always_yes());
    assert!(matches!(second, Err(Error::Busy)));

    handle.cancel();
    answer_tx.send(true).unwrap();
    let report = handle.join().unwrap();

    assert_eq!(report.state, BatchState::Cancelled);
    let outcomes: Vec<_> = outcomes(&report).into_iter().map(|(_, o)| o).collect();
    assert_eq!(outcomes, [Outcome::Success, Outcome::Cancelled, Outcome::Cancelled]);
    assert!(storage.calls_for("sdb").is_empty());
    assert!(!engine.is_busy());
}

#[test]
fn declined_confirmation_skips_only_that_device() {
    let storage = Arc::new(FakeStorage::new());
    let engine = engine(&storage, EngineConfig::default());

    let mut fixed = (*device("sdf", 8000, Vec::new())).clone();
    fixed.kind = DeviceKind::HardDrive;
    let devices = vec![Arc::new(fixed), device("sdg", 8000, Vec::new())];

    let report = engine
        .start(request(install(0), devices), Arc::new(|_: &str| false))
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(report.state, BatchState::Completed);
    assert_eq!(report.results[0].outcome, Outcome::Cancelled);
    assert!(report.results[1].is_success());
    assert!(storage.calls_for("sdf").is_empty());
}

#[test]
fn invalid_credentials_block_the_batch() {
    let storage = Arc::new(FakeStorage::new());
    let engine = engine(&storage, EngineConfig::default());

    let mut req = request(install(0), vec![device("sdb", 8000, Vec::new())]);
    req.unlock_method = UnlockMethodKind::PersonalPassword;
    req.secrets = SecretInput {
        password: Secret::new("secret"),
        password_repeat: Secret::new("secreT"),
        ..Default::default()
    };

    let err = engine.start(req, always_yes()).err().unwrap();
    assert_eq!(err.kind(), FailureKind::Validation);
    assert!(storage.calls().is_empty());
    assert!(!engine.is_busy());
}

#[test]
fn encrypted_data_partition() {
    let storage = Arc::new(FakeStorage::new());
    let engine = engine(&storage, EngineConfig::default());

    let mut req = request(install(0), vec![device("sdb", 8000, Vec::new())]);
    req.unlock_method = UnlockMethodKind::MasterAndInitialPassword;
    req.secrets = SecretInput {
        master: Secret::new("master"),
        master_repeat: Secret::new("master"),
        initial: Secret::new("initial"),
        initial_repeat: Secret::new("initial"),
        ..Default::default()
    };

    let report = engine.start(req, always_yes()).unwrap().join().unwrap();
    assert!(report.results[0].is_success());

    let calls = storage.calls();
    assert!(calls.contains(&"luks /dev/sdb3 2 keys".to_string()), "{calls:#?}");
    assert!(calls.contains(&"format /dev/mapper/livestick-sdb ext4 persistence".to_string()));
    assert_eq!(calls.last().map(String::as_str), Some("close livestick-sdb"));
}

#[test]
fn invalid_source_aborts_without_report() {
    let storage = Arc::new(FakeStorage::new());
    let engine = engine(&storage, EngineConfig::default());

    let mut req = request(install(0), vec![
        device("sdb", 8000, Vec::new()),
        device("sdc", 8000, Vec::new()),
    ]);
    req.source = Some(Arc::new(FakeSource {
        valid_checks: 1,
        ..FakeSource::new()
    }));

    let handle = engine.start(req, always_yes()).unwrap();
    let events: Vec<_> = handle.events().iter().collect();
    let err = handle.join().unwrap_err();

    assert!(matches!(err, Error::SourceInvalid(_)));
    assert!(matches!(events.last(), Some(BatchEvent::Aborted(_))));
    assert!(!events.iter().any(|e| matches!(e, BatchEvent::Completed(_))));
    assert!(storage.calls_for("sdc").is_empty());
}

#[derive(Default)]
struct Recorder {
    phases: Vec<Phase>,
    states: Vec<BatchState>,
    completed: usize,
    bytes_seen: bool,
    report: Option<BatchReport>,
}

impl PresentationAdapter for Recorder {
    fn on_state_changed(&mut self, state: BatchState) {
        self.states.push(state);
    }

    fn on_batch_progress(&mut self, _device_index: usize, phase: Phase, detail: &PhaseDetail) {
        match detail {
            PhaseDetail::Started => self.phases.push(phase),
            PhaseDetail::Bytes(_) => self.bytes_seen = true,
            PhaseDetail::Message(_) => {}
        }
    }

    fn on_device_completed(&mut self, _device_index: usize, _result: &DeviceOperationResult) {
        self.completed += 1;
    }

    fn on_batch_completed(&mut self, report: &BatchReport) {
        self.report = Some(report.clone());
    }
}

#[test]
fn adapter_sees_phases_in_order() {
    let storage = Arc::new(FakeStorage::new());
    let engine = engine(&storage, EngineConfig::default());

    let mut recorder = Recorder::default();
    let report = engine
        .start(request(install(1000), vec![device("sdb", 8000, Vec::new())]), always_yes())
        .unwrap()
        .drive(&mut recorder)
        .unwrap();

    assert_eq!(
        recorder.phases,
        [
            Phase::Plan,
            Phase::Unmount,
            Phase::Partition,
            Phase::Format,
            Phase::Copy,
            Phase::Bootloader,
            Phase::Finalize
        ]
    );
    assert_eq!(recorder.states, [BatchState::Running, BatchState::Completed]);
    assert_eq!(recorder.completed, 1);
    assert!(recorder.bytes_seen);
    assert_eq!(recorder.report.unwrap().results.len(), report.results.len());
}

#[test]
fn upgrade_refuses_to_shrink_below_used_data() {
    let storage = Arc::new(FakeStorage::new());
    let engine = engine(&storage, EngineConfig::default());

    let job = BatchJob::Upgrade(UpgradeOptions {
        strategy: RepartitionStrategy::Resize { exchange_mb: 2000 },
        ..Default::default()
    });
    let report = engine
        .start(request(job, vec![provisioned("sdb", 2500)]), always_yes())
        .unwrap()
        .join()
        .unwrap();

    match &report.results[0].outcome {
        Outcome::Failed(reason) => {
            assert_eq!(reason.kind, FailureKind::PlanRejected);
            assert!(reason.message.contains("too small"), "{}", reason.message);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(storage.calls().is_empty());
}

#[test]
fn upgrade_in_place_applies_overwrites() {
    let storage = Arc::new(FakeStorage::new());
    let engine = engine(&storage, EngineConfig::default());
    fs::create_dir_all(storage.root.path().join("sdb4/home/user")).unwrap();

    let job = BatchJob::Upgrade(UpgradeOptions {
        overwrites: OverwriteList::new(vec![
            OverwriteEntry::new("/etc/hostname", "classroom-1"),
            OverwriteEntry::new("/etc/hostname", "ignored"),
        ]),
        ..Default::default()
    });
    let report = engine
        .start(request(job, vec![provisioned("sdb", 100)]), always_yes())
        .unwrap()
        .join()
        .unwrap();
    assert!(report.results[0].is_success(), "{:?}", report.results[0].outcome);

    let calls = storage.calls();
    assert!(!calls.iter().any(|c| c.starts_with("table")));
    assert!(calls.contains(&"format /dev/sdb2 vfat boot".to_string()));
    assert!(calls.contains(&"image /srv/live/system.img /dev/sdb3".to_string()));
    assert_eq!(
        fs::read_to_string(storage.root.path().join("sdb4/etc/hostname")).unwrap(),
        "classroom-1"
    );
    assert!(storage.root.path().join("sdb4/home/user").is_dir());
}

#[test]
fn upgrade_repartition_restores_data() {
    let storage = Arc::new(FakeStorage::new());
    let staging = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        staging_dir: Some(staging.path().to_path_buf()),
        ..EngineConfig::default()
    };
    let engine = engine(&storage, config);
    fs::create_dir_all(storage.root.path().join("sdb4/home/user")).unwrap();
    fs::write(storage.root.path().join("sdb4/home/user/notes.txt"), "keep me").unwrap();

    let job = BatchJob::Upgrade(UpgradeOptions {
        strategy: RepartitionStrategy::Remove,
        ..Default::default()
    });
    let report = engine
        .start(request(job, vec![provisioned("sdb", 1)]), always_yes())
        .unwrap()
        .join()
        .unwrap();
    assert!(report.results[0].is_success(), "{:?}", report.results[0].outcome);

    let calls = storage.calls();
    assert!(calls.iter().any(|c| c.starts_with("table /dev/sdb")));
    // Without exchange the data partition moves to number 3.
    assert!(calls.contains(&"format /dev/sdb3 ext4 persistence".to_string()));
    assert!(calls.contains(&"image /srv/live/system.img /dev/sdb2".to_string()));
    assert_eq!(
        fs::read_to_string(storage.root.path().join("sdb3/home/user/notes.txt")).unwrap(),
        "keep me"
    );
    // The stash is removed after a successful restore.
    assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
}

#[test]
fn reset_home_rebuilds_from_skeleton() {
    let storage = Arc::new(FakeStorage::new());
    let skeleton = tempfile::tempdir().unwrap();
    fs::write(skeleton.path().join(".profile"), "# profile").unwrap();
    let mut config = EngineConfig::default();
    config.persistence.skeleton = skeleton.path().to_path_buf();
    config.persistence.home_owner = None;
    let engine = engine(&storage, config);

    let data = storage.root.path().join("sdb4");
    fs::create_dir_all(data.join("lost+found")).unwrap();
    fs::create_dir_all(data.join("etc")).unwrap();
    fs::write(data.join("etc/hosts"), "127.0.0.1 localhost").unwrap();
    fs::write(data.join("persistence.conf"), "/ union\n").unwrap();
    fs::create_dir_all(data.join("home/user/Music")).unwrap();

    let job = BatchJob::Reset(ResetOptions {
        exchange: ExchangeReset::Format { label: None },
        data: DataReset::Clear(ClearOptions {
            reset_system: false,
            reset_home: true,
        }),
    });
    let report = engine
        .start(request(job, vec![provisioned("sdb", 1)]), always_yes())
        .unwrap()
        .join()
        .unwrap();
    assert!(report.results[0].is_success(), "{:?}", report.results[0].outcome);

    assert!(data.join("lost+found").is_dir());
    assert!(data.join("persistence.conf").is_file());
    assert_eq!(fs::read_to_string(data.join("etc/hosts")).unwrap(), "127.0.0.1 localhost");
    assert!(!data.join("home/user/Music").exists());
    assert!(data.join("home/user/.profile").is_file());
    assert!(storage.calls().contains(&"format /dev/sdb1 vfat EXCHANGE".to_string()));
}

#[test]
fn reset_refuses_active_persistence() {
    let storage = Arc::new(FakeStorage::new());
    let engine = engine(&storage, EngineConfig::default());

    let mut live = (*provisioned("sdb", 1)).clone();
    live.partitions[3].active_persistence = true;
    live.partitions[3].mount_state = MountState::MountedElsewhere;
    let job = BatchJob::Reset(ResetOptions {
        exchange: ExchangeReset::Keep,
        data: DataReset::Format,
    });

    let report = engine
        .start(request(job, vec![Arc::new(live)]), always_yes())
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(
        failure_kind(&report.results[0].outcome),
        Some(FailureKind::PreconditionFailed)
    );
    assert!(!storage.calls().iter().any(|c| c.starts_with("format")));
}

#[test]
fn upgrade_with_full_data_reset_starts_data_fresh() {
    let storage = Arc::new(FakeStorage::new());
    let staging = tempfile::tempdir().unwrap();
    let mut config = EngineConfig {
        staging_dir: Some(staging.path().to_path_buf()),
        ..EngineConfig::default()
    };
    let skeleton = tempfile::tempdir().unwrap();
    config.persistence.skeleton = skeleton.path().to_path_buf();
    config.persistence.home_owner = None;
    let engine = engine(&storage, config);
    let data = storage.root.path().join("sdb4");
    fs::create_dir_all(data.join("var/cache")).unwrap();
    fs::write(data.join("var/cache/big"), "2500 MiB worth").unwrap();

    // The smaller data partition cannot hold the old content, which is
    // dropped anyway.
    let job = BatchJob::Upgrade(UpgradeOptions {
        strategy: RepartitionStrategy::Resize { exchange_mb: 1500 },
        reset_data: Some(ClearOptions {
            reset_system: true,
            reset_home: true,
        }),
        ..Default::default()
    });
    let mut stick = (*provisioned("sdb", 2500)).clone();
    stick.partitions[0].used = Some(MEGA);
    let report = engine
        .start(request(job, vec![Arc::new(stick)]), always_yes())
        .unwrap()
        .join()
        .unwrap();
    assert!(report.results[0].is_success(), "{:?}", report.results[0].outcome);
    assert!(data.join("home/user").is_dir());

    let calls = storage.calls();
    let table = calls
        .iter()
        .position(|c| c.starts_with("table /dev/sdb"))
        .unwrap();
    assert!(calls[table].ends_with("data 2199 MiB"), "{}", calls[table]);
    assert!(calls[..table].contains(&"mount /dev/sdb1".to_string()));
    assert!(!calls[..table].contains(&"mount /dev/sdb4".to_string()), "{calls:#?}");
    assert!(data.join("persistence.conf").is_file());
    assert!(!data.join("var").exists());
    assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
}

#[test]
fn reset_unmounts_everything_after_a_failure() {
    let mut storage = FakeStorage::new();
    storage.fail_format = Some(PathBuf::from("/dev/sdb4"));
    storage.automount = true;
    let storage = Arc::new(storage);
    storage.mounted_elsewhere("sdb", "/dev/sdb1", "/media/user/EXCHANGE");
    let engine = engine(&storage, EngineConfig::default());

    let job = BatchJob::Reset(ResetOptions {
        exchange: ExchangeReset::Format { label: None },
        data: DataReset::Format,
    });
    let report = engine
        .start(request(job, vec![provisioned("sdb", 1)]), always_yes())
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(
        failure_kind(&report.results[0].outcome),
        Some(FailureKind::ToolExecutionFailed)
    );

    let calls = storage.calls();
    let exchange_format = calls
        .iter()
        .position(|c| c == "format /dev/sdb1 vfat EXCHANGE")
        .unwrap();
    let failed_format = calls
        .iter()
        .position(|c| c == "format /dev/sdb4 ext4 persistence")
        .unwrap();
    assert_eq!(calls[exchange_format - 1], "unmount /media/user/EXCHANGE");
    // The exchange partition was mounted again after formatting; the final
    // unmount still releases it.
    assert_eq!(&calls[failed_format + 1..], ["unmount /media/user/EXCHANGE"]);
    assert!(storage.mounted.lock().unwrap().is_empty());
}

#[test]
fn reset_leaves_the_boot_device_mounted() {
    let mut storage = FakeStorage::new();
    storage.automount = true;
    let storage = Arc::new(storage);
    let engine = engine(&storage, EngineConfig::default());

    let mut boot = (*provisioned("sdb", 1)).clone();
    boot.boot_device = true;
    let job = BatchJob::Reset(ResetOptions {
        exchange: ExchangeReset::Format { label: None },
        data: DataReset::Keep,
    });
    let report = engine
        .start(request(job, vec![Arc::new(boot)]), always_yes())
        .unwrap()
        .join()
        .unwrap();
    assert!(report.results[0].is_success(), "{:?}", report.results[0].outcome);

    assert_eq!(storage.calls(), ["format /dev/sdb1 vfat EXCHANGE"]);
    assert_eq!(storage.mounted.lock().unwrap().len(), 1);
}

#[test]
fn unlocked_data_partition_is_unmounted_and_closed() {
    let storage = Arc::new(FakeStorage::new());
    storage.mounted_elsewhere("sdb", "/dev/mapper/luks-sdb4", "/media/user/persistence");
    storage.mounted_elsewhere("sdb", "/dev/sdb1", "/media/user/EXCHANGE");
    let engine = engine(&storage, EngineConfig::default());

    let job = BatchJob::Reset(ResetOptions::default());
    let report = engine
        .start(request(job, vec![provisioned("sdb", 1)]), always_yes())
        .unwrap()
        .join()
        .unwrap();
    assert!(report.results[0].is_success(), "{:?}", report.results[0].outcome);

    assert_eq!(
        storage.calls(),
        [
            "unmount /media/user/persistence",
            "unmount /media/user/EXCHANGE",
            "close luks-sdb4"
        ]
    );
    assert!(storage.mounted.lock().unwrap().is_empty());
}
