//! Terminal presentation of device lists and batch progress.
use anyhow::Result;
use console::style;
use dialoguer::{Confirm, MultiSelect, Password, theme::ColorfulTheme};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use livestick_core::batch::{BatchState, PresentationAdapter};
use livestick_core::credentials::{Secret, SecretInput, UnlockMethodKind};
use livestick_core::device::DeviceSnapshot;
use livestick_core::monitor::{DeviceListUpdate, ListChange};
use livestick_core::progress::{Phase, PhaseDetail};
use livestick_core::report::{BatchReport, DeviceOperationResult, Outcome};
use std::sync::Arc;
use std::time::Duration;

/// Prints a device table in the same columns `list` uses.
pub fn print_devices<'a>(devices: impl IntoIterator<Item = &'a DeviceSnapshot>) {
    println!(
        "\n  {:<15} {:<28} {:>10} {:<10} {}",
        "DEVICE", "NAME", "SIZE", "TYPE", "STATE"
    );
    println!("  {:-<15} {:-<28} {:-<10} {:-<10} {:-<14}", "", "", "", "", "");
    for device in devices {
        println!("  {device}");
        for partition in &device.partitions {
            let label = if partition.label.is_empty() {
                "-"
            } else {
                partition.label.as_str()
            };
            println!(
                "      {:<11} {:<9} {:<12} {:>8.1} MiB",
                partition.name,
                partition.role,
                label,
                partition.size as f64 / (1024.0 * 1024.0)
            );
        }
    }
}

/// Presents a final "Yes/No" confirmation to the user.
pub fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Lets the user pick any number of devices.
pub fn select_devices(
    devices: Vec<DeviceSnapshot>,
    prompt: &str,
) -> Result<Vec<Arc<DeviceSnapshot>>> {
    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    let chosen = MultiSelect::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .interact()?;

    let mut devices: Vec<Option<DeviceSnapshot>> = devices.into_iter().map(Some).collect();
    Ok(chosen
        .into_iter()
        .filter_map(|index| devices.get_mut(index).and_then(Option::take))
        .map(Arc::new)
        .collect())
}

/// Asks for the passwords `kind` needs. Validation happens in the engine.
pub fn prompt_secrets(kind: UnlockMethodKind) -> Result<SecretInput> {
    let theme = ColorfulTheme::default();
    let ask = |prompt: &str| -> Result<Secret> {
        let value = Password::with_theme(&theme)
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()?;
        Ok(Secret::new(value))
    };

    let mut input = SecretInput::default();
    match kind {
        UnlockMethodKind::NoPassword => {}
        UnlockMethodKind::PersonalPassword => {
            input.password = ask("Password for the data partition")?;
            input.password_repeat = ask("Repeat the password")?;
        }
        UnlockMethodKind::MasterAndInitialPassword => {
            input.master = ask("Master password")?;
            input.master_repeat = ask("Repeat the master password")?;
            input.initial = ask("Initial user password")?;
            input.initial_repeat = ask("Repeat the initial user password")?;
        }
    }
    Ok(input)
}

fn describe_outcome(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Success => style("done").green().to_string(),
        Outcome::Failed(reason) => style(format!("failed ({}): {reason}", reason.kind))
            .red()
            .to_string(),
        Outcome::Cancelled => style("cancelled").yellow().to_string(),
    }
}

/// Renders batch events as one progress bar per device.
pub struct TerminalAdapter {
    multi: MultiProgress,
    bars: Vec<ProgressBar>,
    phase_style: ProgressStyle,
    bytes_style: ProgressStyle,
    done_style: ProgressStyle,
}

impl TerminalAdapter {
    pub fn new(devices: &[Arc<DeviceSnapshot>]) -> Result<Self> {
        let phase_style =
            ProgressStyle::default_spinner().template("{prefix:12} [{elapsed_precise}] {spinner} {msg}")?;
        let bytes_style = ProgressStyle::default_bar()
            .template(
                "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
            )?
            .progress_chars("■ ");
        let done_style = ProgressStyle::default_bar().template("{prefix:12} [{elapsed_precise}] {msg}")?;

        let multi = MultiProgress::new();
        let bars = devices
            .iter()
            .map(|device| {
                let bar = multi.add(ProgressBar::new(0));
                bar.set_style(phase_style.clone());
                bar.set_prefix(device.name.clone());
                bar.set_message("waiting");
                bar
            })
            .collect();

        Ok(Self {
            multi,
            bars,
            phase_style,
            bytes_style,
            done_style,
        })
    }

    /// Handle for printing or prompting without garbling the bars.
    pub fn multi(&self) -> MultiProgress {
        self.multi.clone()
    }

    fn println(&self, line: impl AsRef<str>) {
        if self.multi.println(line.as_ref()).is_err() {
            println!("{}", line.as_ref());
        }
    }

    /// Leaves the bars of devices that never finished in a final state.
    pub fn abandon(&self) {
        for bar in self.bars.iter().filter(|b| !b.is_finished()) {
            bar.abandon();
        }
    }
}

impl PresentationAdapter for TerminalAdapter {
    fn on_device_list_changed(&mut self, update: &DeviceListUpdate) {
        let mode = update
            .mode
            .map_or_else(|| "no mode".to_string(), |m| m.to_string());
        match &update.change {
            ListChange::Added(device) => {
                self.println(format!("{} [{mode}] {device}", style("+").green().bold()))
            }
            ListChange::Removed(name) => {
                self.println(format!("{} [{mode}] {name}", style("-").red().bold()))
            }
            ListChange::Reset => {
                self.println(format!(
                    "{} [{mode}] {} devices available",
                    style("*").cyan().bold(),
                    update.devices.len()
                ));
                for device in &update.devices {
                    self.println(format!("    {device}"));
                }
            }
        }
    }

    fn on_state_changed(&mut self, state: BatchState) {
        if state == BatchState::Cancelled {
            self.println(format!("{}", style("Batch cancelled.").yellow()));
        }
    }

    fn on_batch_progress(&mut self, device_index: usize, phase: Phase, detail: &PhaseDetail) {
        let Some(bar) = self.bars.get(device_index) else {
            return;
        };
        match detail {
            PhaseDetail::Started => {
                bar.set_style(self.phase_style.clone());
                bar.set_message(phase.to_string());
                bar.enable_steady_tick(Duration::from_millis(100));
            }
            PhaseDetail::Message(message) => bar.set_message(format!("{phase}: {message}")),
            PhaseDetail::Bytes(progress) => {
                if progress.total > 0 && bar.length() != Some(progress.total) {
                    bar.set_style(self.bytes_style.clone());
                    bar.set_length(progress.total);
                    bar.reset_eta();
                }
                bar.set_position(progress.done);
            }
        }
    }

    fn on_device_completed(&mut self, device_index: usize, result: &DeviceOperationResult) {
        if let Some(bar) = self.bars.get(device_index) {
            bar.set_style(self.done_style.clone());
            bar.finish_with_message(describe_outcome(&result.outcome));
        }
    }

    fn on_batch_completed(&mut self, report: &BatchReport) {
        self.abandon();
        self.println(format!(
            "\n{} of {} devices succeeded.",
            report.succeeded(),
            report.results.len()
        ));
        for result in &report.results {
            self.println(format!(
                "  {:<15} {:>6.0?}  {}",
                result.device.path.display(),
                result.elapsed,
                describe_outcome(&result.outcome)
            ));
        }
    }

    fn on_batch_aborted(&mut self, reason: &str) {
        self.abandon();
        self.println(format!("{} {reason}", style("Batch aborted:").red().bold()));
    }
}
