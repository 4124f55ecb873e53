//! Live tracking of attached devices.
//!
//! A [`DeviceMonitor`] reads a line-oriented device event stream (by default
//! `udevadm monitor`) on its own thread. Added devices are probed on separate
//! threads so a slow probe never holds up event reading; removed devices are
//! dropped from the list right away. Every change of the active selection
//! list is published as a [`DeviceListUpdate`] on a channel.
use crate::config::MonitorConfig;
use crate::device::DeviceSnapshot;
use crate::error::{Error, Result};
use crate::platform::Prober;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// One classified line of the event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device appeared; carries its bare kernel name.
    Added(String),
    Removed(String),
    Ignored,
}

/// Bare device identifier of an event path: its last component.
pub fn device_name_from_path(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Classifies event lines with the configured patterns.
#[derive(Clone, Debug)]
pub struct EventClassifier {
    added: Regex,
    removed: Regex,
}

impl EventClassifier {
    pub fn new(config: &MonitorConfig) -> Result<Self> {
        let compile = |pattern: &str| {
            let regex = Regex::new(pattern)
                .map_err(|e| Error::Config(format!("invalid monitor pattern: {e}")))?;
            if !regex.capture_names().any(|n| n == Some("path")) {
                return Err(Error::Config(format!(
                    "monitor pattern {pattern:?} has no `path` group"
                )));
            }
            Ok(regex)
        };
        Ok(Self {
            added: compile(&config.added_pattern)?,
            removed: compile(&config.removed_pattern)?,
        })
    }

    pub fn classify(&self, line: &str) -> DeviceEvent {
        let path = |regex: &Regex| {
            regex
                .captures(line)
                .and_then(|c| c.name("path"))
                .map(|m| device_name_from_path(m.as_str()))
        };
        if let Some(name) = path(&self.added) {
            DeviceEvent::Added(name)
        } else if let Some(name) = path(&self.removed) {
            DeviceEvent::Removed(name)
        } else {
            DeviceEvent::Ignored
        }
    }
}

/// The selection context currently shown to the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    Install,
    Upgrade,
    Reset,
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectionMode::Install => "install",
            SelectionMode::Upgrade => "upgrade",
            SelectionMode::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// What changed in the selection list.
#[derive(Clone, Debug)]
pub enum ListChange {
    Added(Arc<DeviceSnapshot>),
    Removed(String),
    /// The list was replaced as a whole (mode switch or rescan).
    Reset,
}

/// A change to the active selection list together with the resulting list.
#[derive(Clone, Debug)]
pub struct DeviceListUpdate {
    pub mode: Option<SelectionMode>,
    pub change: ListChange,
    pub devices: Vec<Arc<DeviceSnapshot>>,
}

#[derive(Default)]
struct State {
    mode: Option<SelectionMode>,
    devices: Vec<Arc<DeviceSnapshot>>,
    /// Latest add event per device name. A probe only lands in the list if
    /// its event is still the latest one for that device.
    expected: HashMap<String, u64>,
    next_event: u64,
    pending_probes: usize,
    /// Position of each device's latest removal in `removals`. A scan drops
    /// devices removed after it started.
    removed: HashMap<String, u64>,
    removals: u64,
}

struct Shared {
    state: Mutex<State>,
    probes_done: Condvar,
    prober: Arc<dyn Prober>,
    settle_delay: Duration,
    updates: Sender<DeviceListUpdate>,
    stopped: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &State, change: ListChange) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.updates.send(DeviceListUpdate {
            mode: state.mode,
            change,
            devices: state.devices.clone(),
        });
    }

    fn handle_event(self: &Arc<Self>, event: DeviceEvent) {
        match event {
            DeviceEvent::Added(name) => {
                let id = {
                    let mut state = self.lock();
                    let id = state.next_event;
                    state.next_event += 1;
                    state.expected.insert(name.clone(), id);
                    state.pending_probes += 1;
                    id
                };
                debug!(device = %name, "device added");
                let shared = Arc::clone(self);
                thread::spawn(move || shared.probe(name, id));
            }
            DeviceEvent::Removed(name) => {
                debug!(device = %name, "device removed");
                let mut state = self.lock();
                state.expected.remove(&name);
                let at = state.removals;
                state.removals += 1;
                state.removed.insert(name.clone(), at);
                let before = state.devices.len();
                state.devices.retain(|d| d.name != name);
                if state.devices.len() != before {
                    self.publish(&state, ListChange::Removed(name));
                }
            }
            DeviceEvent::Ignored => {}
        }
    }

    fn probe(&self, name: String, id: u64) {
        if !self.settle_delay.is_zero() {
            thread::sleep(self.settle_delay);
        }
        let result = if self.stopped.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            self.prober.probe(&name)
        };

        let mut state = self.lock();
        state.pending_probes -= 1;
        match result {
            Ok(Some(device)) if state.expected.get(&name) == Some(&id) => {
                if state.mode.is_some() {
                    let device = Arc::new(device);
                    state.devices.retain(|d| d.name != name);
                    state.devices.push(Arc::clone(&device));
                    info!(device = %name, "device available");
                    self.publish(&state, ListChange::Added(device));
                }
            }
            Ok(Some(_)) => trace!(device = %name, "discarding stale probe"),
            Ok(None) => debug!(device = %name, "device not eligible"),
            Err(e) => warn!(device = %name, "probe failed: {e}"),
        }
        drop(state);
        self.probes_done.notify_all();
    }
}

/// Keeps the list of selectable devices current.
///
/// Dropping the monitor shuts it down.
pub struct DeviceMonitor {
    shared: Arc<Shared>,
    classifier: EventClassifier,
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceMonitor {
    /// Starts the configured event command and listens to its output.
    pub fn spawn(
        config: &MonitorConfig,
        prober: Arc<dyn Prober>,
    ) -> Result<(Self, Receiver<DeviceListUpdate>)> {
        let (program, rest) = config
            .command
            .split_first()
            .ok_or_else(|| Error::Config("monitor command must not be empty".into()))?;
        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Config("monitor command has no output".into()));
        };
        info!(command = ?config.command, pid = child.id(), "device monitor started");

        let (monitor, updates) = Self::new(config, prober)?;
        *monitor.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        monitor.listen(stdout);
        Ok((monitor, updates))
    }

    /// Listens to an already open event stream. The stream must reach its
    /// end for [`DeviceMonitor::shutdown`] to return.
    pub fn from_reader<R>(
        config: &MonitorConfig,
        prober: Arc<dyn Prober>,
        reader: R,
    ) -> Result<(Self, Receiver<DeviceListUpdate>)>
    where
        R: Read + Send + 'static,
    {
        let (monitor, updates) = Self::new(config, prober)?;
        monitor.listen(reader);
        Ok((monitor, updates))
    }

    fn new(
        config: &MonitorConfig,
        prober: Arc<dyn Prober>,
    ) -> Result<(Self, Receiver<DeviceListUpdate>)> {
        let (tx, rx) = mpsc::channel();
        let monitor = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                probes_done: Condvar::new(),
                prober,
                settle_delay: config.settle_delay(),
                updates: tx,
                stopped: AtomicBool::new(false),
            }),
            classifier: EventClassifier::new(config)?,
            child: Mutex::new(None),
            reader: Mutex::new(None),
        };
        Ok((monitor, rx))
    }

    fn listen<R: Read + Send + 'static>(&self, reader: R) {
        let shared = Arc::clone(&self.shared);
        let classifier = self.classifier.clone();
        let handle = thread::spawn(move || {
            for line in BufReader::new(reader).lines() {
                if shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                match line {
                    Ok(line) => shared.handle_event(classifier.classify(&line)),
                    Err(e) => {
                        warn!("device event stream failed: {e}");
                        break;
                    }
                }
            }
            debug!("device event stream closed");
        });
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Feeds one event as if it had been read from the stream.
    pub fn handle_event(&self, event: DeviceEvent) {
        self.shared.handle_event(event);
    }

    /// Makes `mode` the active selection context and seeds it with a fresh
    /// scan.
    ///
    /// Events arriving during the scan win over its result: devices removed
    /// meanwhile are dropped, devices probed meanwhile are kept.
    pub fn activate(&self, mode: SelectionMode) -> Result<()> {
        let (removals, events) = {
            let state = self.shared.lock();
            (state.removals, state.next_event)
        };
        let scanned = self.shared.prober.scan()?;

        let mut state = self.shared.lock();
        let mut devices: Vec<Arc<DeviceSnapshot>> = scanned
            .into_iter()
            .filter(|d| {
                let gone = state.removed.get(&d.name).is_some_and(|&at| at >= removals);
                if gone {
                    debug!(device = %d.name, "removed during scan");
                }
                !gone
            })
            .map(Arc::new)
            .collect();
        let probed: Vec<Arc<DeviceSnapshot>> = state
            .devices
            .iter()
            .filter(|d| state.expected.get(&d.name).is_some_and(|&id| id >= events))
            .cloned()
            .collect();
        for device in probed {
            devices.retain(|d| d.name != device.name);
            devices.push(device);
        }
        state.mode = Some(mode);
        state.devices = devices;
        info!(%mode, devices = state.devices.len(), "selection context active");
        self.shared.publish(&state, ListChange::Reset);
        Ok(())
    }

    /// Leaves the current selection context; the list becomes empty.
    pub fn deactivate(&self) {
        let mut state = self.shared.lock();
        state.mode = None;
        state.devices.clear();
        self.shared.publish(&state, ListChange::Reset);
    }

    pub fn mode(&self) -> Option<SelectionMode> {
        self.shared.lock().mode
    }

    /// The current selection list.
    pub fn devices(&self) -> Vec<Arc<DeviceSnapshot>> {
        self.shared.lock().devices.clone()
    }

    /// Waits until no probe is running, or `timeout` passes. Returns whether
    /// all probes finished.
    pub fn wait_for_probes(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while state.pending_probes > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.shared.probes_done.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }

    /// Stops listening and terminates the event command. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let child = self.child.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill() {
                debug!("monitor command already exited: {e}");
            }
            let _ = child.wait();
        }

        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = reader {
            if handle.join().is_err() {
                warn!("device event reader panicked");
            }
        }
        info!("device monitor stopped");
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
