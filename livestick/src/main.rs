mod ui;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use livestick_core::batch::{BatchJob, BatchRequest, CancelToken, Engine, PresentationAdapter};
use livestick_core::config::EngineConfig;
use livestick_core::credentials::{SecretInput, UnlockMethodKind};
use livestick_core::device::{DeviceSnapshot, parent_device_path};
use livestick_core::install::InstallOptions;
use livestick_core::layout::RepartitionStrategy;
use livestick_core::monitor::{DeviceMonitor, SelectionMode};
use livestick_core::persistence::{ClearOptions, OverwriteEntry, OverwriteList};
use livestick_core::platform::{self, SysfsProber};
use livestick_core::reset::{DataReset, ExchangeReset, ResetOptions};
use livestick_core::source::LiveSource;
use livestick_core::storage::parse_mounts;
use livestick_core::upgrade::UpgradeOptions;
use std::fs;
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ui::TerminalAdapter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

const DEFAULT_CONFIG: &str = "/etc/livestick/livestick.toml";

#[derive(Parser)]
#[command(name = "livestick")]
#[command(about = "Install, upgrade and reset live-system media in batches", version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print machine readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the devices available for selection
    List,
    /// Follow devices being plugged in and removed
    Watch {
        /// Selection context to show
        #[arg(value_enum, default_value_t = ModeArg::Install)]
        mode: ModeArg,
    },
    /// Show the partition layout an install would create on each device
    Plan {
        #[command(flatten)]
        source: SourceArgs,

        /// Size of the exchange partition in MiB
        #[arg(short, long, default_value_t = 0)]
        exchange_mb: u64,

        /// Plan for copying the exchange payload
        #[arg(long)]
        copy_exchange: bool,
    },
    /// Install the live system onto devices
    Install {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        targets: TargetArgs,

        /// Size of the exchange partition in MiB
        #[arg(short, long, default_value_t = 0)]
        exchange_mb: u64,

        /// Copy the source's exchange payload
        #[arg(long)]
        copy_exchange: bool,

        /// Copy the source's data payload
        #[arg(long)]
        copy_data: bool,

        /// How the data partition is unlocked; defaults to the configured method
        #[arg(short, long, value_enum)]
        unlock: Option<UnlockArg>,
    },
    /// Replace the system on previously provisioned devices, keeping their data
    Upgrade {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        targets: TargetArgs,

        /// Resize the exchange partition to this many MiB
        #[arg(long, value_name = "MB", conflicts_with = "remove_exchange")]
        resize_exchange: Option<u64>,

        /// Remove the exchange partition
        #[arg(long)]
        remove_exchange: bool,

        /// Back up the data partition into this directory first
        #[arg(long, value_name = "DIR")]
        backup_to: Option<PathBuf>,

        /// Remove everything but the home directory from the data partition
        #[arg(long)]
        reset_system: bool,

        /// Rebuild the home directory from the skeleton
        #[arg(long)]
        reset_home: bool,

        /// Write a file onto the data partition, as PATH=CONTENTS
        #[arg(long, value_name = "PATH=CONTENTS", value_parser = parse_overwrite)]
        overwrite: Vec<OverwriteEntry>,

        /// JSON file with a list of {"path", "contents"} entries to write
        #[arg(long, value_name = "FILE")]
        overwrites: Option<PathBuf>,

        /// Copy the source's exchange payload
        #[arg(long)]
        copy_exchange: bool,
    },
    /// Reset provisioned devices to a clean state
    Reset {
        #[command(flatten)]
        targets: TargetArgs,

        /// Reformat the exchange partition
        #[arg(long)]
        format_exchange: bool,

        /// New label for the reformatted exchange partition
        #[arg(long, requires = "format_exchange")]
        exchange_label: Option<String>,

        /// Remove everything but the home directory from the data partition
        #[arg(long, conflicts_with = "format_data")]
        clear_system: bool,

        /// Rebuild the home directory from the skeleton
        #[arg(long, conflicts_with = "format_data")]
        clear_home: bool,

        /// Wipe the data partition completely
        #[arg(long)]
        format_data: bool,

        /// How the wiped data partition is unlocked; defaults to the configured method
        #[arg(short, long, value_enum, requires = "format_data")]
        unlock: Option<UnlockArg>,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Directory holding system.img and the optional payload trees
    #[arg(short, long, value_name = "DIR")]
    source: PathBuf,
}

#[derive(Args)]
struct TargetArgs {
    /// Target devices by name or path; asks interactively when empty
    devices: Vec<String>,

    /// Use every available device
    #[arg(short, long, conflicts_with = "devices")]
    all: bool,

    /// Do not ask before starting (fixed disks are still confirmed)
    #[arg(short, long)]
    yes: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Install,
    Upgrade,
    Reset,
}

impl From<ModeArg> for SelectionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Install => SelectionMode::Install,
            ModeArg::Upgrade => SelectionMode::Upgrade,
            ModeArg::Reset => SelectionMode::Reset,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum UnlockArg {
    None,
    Personal,
    Master,
}

impl From<UnlockArg> for UnlockMethodKind {
    fn from(unlock: UnlockArg) -> Self {
        match unlock {
            UnlockArg::None => UnlockMethodKind::NoPassword,
            UnlockArg::Personal => UnlockMethodKind::PersonalPassword,
            UnlockArg::Master => UnlockMethodKind::MasterAndInitialPassword,
        }
    }
}

fn parse_overwrite(value: &str) -> Result<OverwriteEntry, String> {
    let (path, contents) = value
        .split_once('=')
        .ok_or_else(|| format!("expected PATH=CONTENTS, got `{value}`"))?;
    Ok(OverwriteEntry::new(path, contents))
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// By disabling it, we can have a cleaner exit when the user cancels the
/// operation, as the `ctrlc` handler will print its own message.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let original_termios = Termios::from_fd(fd).ok().and_then(|original| {
                let mut quiet = original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).ok().map(|()| original)
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

/// Routes Ctrl+C to whatever is running: a batch gets cancelled, anything
/// else just sees the flag.
#[derive(Clone, Default)]
struct Interrupt {
    triggered: Arc<AtomicBool>,
    batch: Arc<Mutex<Option<CancelToken>>>,
}

impl Interrupt {
    fn install() -> Result<Self> {
        let interrupt = Self::default();
        let handler = interrupt.clone();
        ctrlc::set_handler(move || {
            handler.triggered.store(true, Ordering::SeqCst);
            let batch = handler.batch.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(token) = batch.as_ref() {
                token.cancel();
                eprintln!(
                    "{} finishing the device in progress, skipping the rest.",
                    style("Cancelling:").yellow().bold()
                );
            }
        })?;
        Ok(interrupt)
    }

    fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    fn attach(&self, token: CancelToken) {
        if self.triggered() {
            token.cancel();
        }
        *self.batch.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Kernel name of the block device holding `path`, found through the mount
/// table.
fn source_device(path: &Path) -> Option<String> {
    let path = fs::canonicalize(path).ok()?;
    let mounts = fs::read_to_string("/proc/mounts").ok()?;
    let mount = parse_mounts(&mounts)
        .into_iter()
        .filter(|m| m.source.starts_with("/dev/") && path.starts_with(&m.target))
        .max_by_key(|m| m.target.as_os_str().len())?;
    // /dev/disk/by-* links resolve to the kernel node.
    let node = fs::canonicalize(&mount.source).unwrap_or(mount.source);
    let device = parent_device_path(&node);
    device.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn open_source(args: &SourceArgs) -> Result<LiveSource> {
    let device = source_device(&args.source);
    LiveSource::open(&args.source, device)
        .with_context(|| format!("cannot use {} as source", args.source.display()))
}

fn resolve_targets(
    config: &EngineConfig,
    args: &TargetArgs,
    mode: SelectionMode,
) -> Result<Vec<Arc<DeviceSnapshot>>> {
    let available = platform::scan_devices(config)?;
    if available.is_empty() {
        bail!("No devices available.");
    }

    let selected = if args.all {
        available.into_iter().map(Arc::new).collect()
    } else if args.devices.is_empty() {
        ui::select_devices(available, &format!("Select the devices to {mode}"))?
    } else {
        let mut selected = Vec::new();
        for wanted in &args.devices {
            let device = available
                .iter()
                .find(|d| d.name == *wanted || d.path == Path::new(wanted))
                .ok_or_else(|| anyhow!("{wanted} is not an available device"))?;
            selected.push(Arc::new(device.clone()));
        }
        selected
    };
    if selected.is_empty() {
        bail!("No devices selected.");
    }
    Ok(selected)
}

/// Shows what is about to happen and asks once for the whole batch.
fn confirm_batch(action: &str, devices: &[Arc<DeviceSnapshot>], yes: bool) -> Result<bool> {
    println!(
        "{} This will {action} {} device(s):",
        style("WARNING:").red().bold(),
        devices.len()
    );
    for device in devices {
        println!("  {}", style(device.to_string()).cyan());
    }
    println!();
    if yes {
        return Ok(true);
    }
    ui::confirm_operation("Are you sure you want to proceed?")
}

fn run_batch(
    engine: &Engine,
    interrupt: &Interrupt,
    request: BatchRequest,
    json: bool,
) -> Result<()> {
    let job = request.job.name();
    let devices: Vec<&str> = request.devices.iter().map(|d| d.name.as_str()).collect();
    info!(job, ?devices, "starting batch");

    let mut adapter = TerminalAdapter::new(&request.devices)?;
    let multi = adapter.multi();
    let confirmer = Arc::new(move |message: &str| {
        multi.suspend(|| ui::confirm_operation(message).unwrap_or(false))
    });

    let handle = engine.start(request, confirmer)?;
    interrupt.attach(handle.cancel_token());
    let report = handle.drive(&mut adapter);
    adapter.abandon();
    let report = report.inspect_err(|e| warn!(job, "batch aborted: {e}"))?;
    info!(
        job,
        state = ?report.state,
        succeeded = report.succeeded(),
        failed = report.failed(),
        "batch finished"
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    if report.failed() > 0 {
        bail!("{} of {} devices failed", report.failed(), report.results.len());
    }
    Ok(())
}

fn unlock_secrets(
    config: &EngineConfig,
    unlock: Option<UnlockArg>,
) -> Result<(UnlockMethodKind, SecretInput)> {
    let kind = unlock.map_or(config.unlock_method, UnlockMethodKind::from);
    Ok((kind, ui::prompt_secrets(kind)?))
}

fn watch(config: &EngineConfig, interrupt: &Interrupt, mode: SelectionMode) -> Result<()> {
    let prober = Arc::new(SysfsProber::new(config));
    let (monitor, updates) = DeviceMonitor::spawn(&config.monitor, prober)?;
    monitor.activate(mode)?;

    let mut adapter = TerminalAdapter::new(&[])?;
    println!("Watching for devices, press Ctrl+C to stop.");
    while !interrupt.triggered() {
        match updates.recv_timeout(Duration::from_millis(200)) {
            Ok(update) => adapter.on_device_list_changed(&update),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    monitor.shutdown();
    Ok(())
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();
    let interrupt = Interrupt::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = EngineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::List => {
            let devices = platform::scan_devices(&config)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No devices found.");
            } else {
                println!("Found {} devices:", devices.len());
                ui::print_devices(&devices);
            }
        }
        Commands::Watch { mode } => watch(&config, &interrupt, mode.into())?,
        Commands::Plan {
            source,
            exchange_mb,
            copy_exchange,
        } => {
            let source = open_source(&source)?;
            let engine = Engine::system(config.clone());
            let devices = platform::scan_devices(&config)?;
            let mut plans = Vec::new();
            for device in &devices {
                let plan = engine.plan_install(&source, device, exchange_mb, copy_exchange);
                if !cli.json {
                    match &plan {
                        Ok(plan) => println!("{:<15} {plan}", device.path.display()),
                        Err(reason) => println!(
                            "{:<15} {}",
                            device.path.display(),
                            style(format!("rejected: {reason}")).red()
                        ),
                    }
                }
                plans.push(serde_json::json!({
                    "device": device.name,
                    "plan": plan.as_ref().ok(),
                    "rejected": plan.as_ref().err().map(ToString::to_string),
                }));
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&plans)?);
            }
        }
        Commands::Install {
            source,
            targets,
            exchange_mb,
            copy_exchange,
            copy_data,
            unlock,
        } => {
            let source = open_source(&source)?;
            let devices = resolve_targets(&config, &targets, SelectionMode::Install)?;
            if !confirm_batch("erase all data on", &devices, targets.yes)? {
                println!("Install cancelled.");
                return Ok(());
            }
            let (unlock_method, secrets) = unlock_secrets(&config, unlock)?;

            let engine = Engine::system(config);
            let request = BatchRequest {
                job: BatchJob::Install(InstallOptions {
                    exchange_mb,
                    copy_exchange,
                    copy_data,
                }),
                source: Some(Arc::new(source)),
                devices,
                unlock_method,
                secrets,
            };
            run_batch(&engine, &interrupt, request, cli.json)?;
        }
        Commands::Upgrade {
            source,
            targets,
            resize_exchange,
            remove_exchange,
            backup_to,
            reset_system,
            reset_home,
            overwrite,
            overwrites,
            copy_exchange,
        } => {
            let source = open_source(&source)?;
            let mut list = match overwrites {
                Some(path) => {
                    let text = fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str::<OverwriteList>(&text)
                        .with_context(|| format!("parsing {}", path.display()))?
                }
                None => OverwriteList::default(),
            };
            for entry in overwrite {
                list.push(entry);
            }
            let strategy = match (resize_exchange, remove_exchange) {
                (_, true) => RepartitionStrategy::Remove,
                (Some(exchange_mb), false) => RepartitionStrategy::Resize { exchange_mb },
                (None, false) => RepartitionStrategy::Keep,
            };
            let options = UpgradeOptions {
                strategy,
                backup_to,
                reset_data: (reset_system || reset_home).then_some(ClearOptions {
                    reset_system,
                    reset_home,
                }),
                overwrites: list,
                copy_exchange,
            };

            let devices = resolve_targets(&config, &targets, SelectionMode::Upgrade)?;
            if !confirm_batch("upgrade the system on", &devices, targets.yes)? {
                println!("Upgrade cancelled.");
                return Ok(());
            }

            let engine = Engine::system(config);
            let request = BatchRequest {
                job: BatchJob::Upgrade(options),
                source: Some(Arc::new(source)),
                devices,
                unlock_method: UnlockMethodKind::NoPassword,
                secrets: SecretInput::default(),
            };
            run_batch(&engine, &interrupt, request, cli.json)?;
        }
        Commands::Reset {
            targets,
            format_exchange,
            exchange_label,
            clear_system,
            clear_home,
            format_data,
            unlock,
        } => {
            let options = ResetOptions {
                exchange: if format_exchange {
                    ExchangeReset::Format {
                        label: exchange_label,
                    }
                } else {
                    ExchangeReset::Keep
                },
                data: if format_data {
                    DataReset::Format
                } else if clear_system || clear_home {
                    DataReset::Clear(ClearOptions {
                        reset_system: clear_system,
                        reset_home: clear_home,
                    })
                } else {
                    DataReset::Keep
                },
            };

            let devices = resolve_targets(&config, &targets, SelectionMode::Reset)?;
            if !confirm_batch("reset", &devices, targets.yes)? {
                println!("Reset cancelled.");
                return Ok(());
            }
            let (unlock_method, secrets) = if options.formats_data() {
                unlock_secrets(&config, unlock)?
            } else {
                (UnlockMethodKind::NoPassword, SecretInput::default())
            };

            let engine = Engine::system(config);
            let request = BatchRequest {
                job: BatchJob::Reset(options),
                source: None,
                devices,
                unlock_method,
                secrets,
            };
            run_batch(&engine, &interrupt, request, cli.json)?;
        }
    }

    Ok(())
}
