//! Progress values reported while a batch runs.
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// A step of a per-device workflow.
///
/// Install, upgrade and reset use different subsets of these phases, always
/// in the order they are declared here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Unmount,
    Backup,
    Stash,
    Partition,
    Format,
    ResetData,
    Copy,
    Overwrite,
    Bootloader,
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Plan => "plan",
            Phase::Unmount => "unmount",
            Phase::Backup => "backup",
            Phase::Stash => "stash",
            Phase::Partition => "partition",
            Phase::Format => "format",
            Phase::ResetData => "reset data",
            Phase::Copy => "copy",
            Phase::Overwrite => "overwrite",
            Phase::Bootloader => "bootloader",
            Phase::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// Byte-count progress of a long running copy.
#[derive(Clone, Copy, Debug)]
pub struct CopyProgress {
    pub done: u64,
    /// 0 when the total is not known in advance.
    pub total: u64,
    started: Instant,
}

impl CopyProgress {
    pub fn start(total: u64) -> Self {
        Self {
            done: 0,
            total,
            started: Instant::now(),
        }
    }

    /// The same copy after `done` bytes.
    pub fn advance(&self, done: u64) -> Self {
        Self { done, ..*self }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn fraction(&self) -> Option<f64> {
        (self.total > 0).then(|| self.done.min(self.total) as f64 / self.total as f64)
    }

    /// Remaining time extrapolated from the throughput so far.
    pub fn eta(&self) -> Option<Duration> {
        if self.total == 0 || self.done == 0 {
            return None;
        }
        let remaining = self.total.saturating_sub(self.done);
        let per_byte = self.elapsed().as_secs_f64() / self.done as f64;
        Some(Duration::from_secs_f64(per_byte * remaining as f64))
    }
}

/// What happened inside a phase.
#[derive(Clone, Debug)]
pub enum PhaseDetail {
    Started,
    Message(String),
    Bytes(CopyProgress),
}

impl fmt::Display for PhaseDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseDetail::Started => f.write_str("started"),
            PhaseDetail::Message(message) => f.write_str(message),
            PhaseDetail::Bytes(progress) => match progress.fraction() {
                Some(fraction) => write!(f, "{:.1}%", fraction * 100.0),
                None => write!(f, "{} bytes", progress.done),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_needs_a_known_total_and_some_progress() {
        let progress = CopyProgress::start(100);
        assert!(progress.eta().is_none());
        assert!(CopyProgress::start(0).advance(10).eta().is_none());

        let halfway = progress.advance(50);
        assert_eq!(halfway.fraction(), Some(0.5));
        assert!(halfway.eta().is_some());
        assert_eq!(progress.advance(100).eta(), Some(Duration::ZERO));
    }

    #[test]
    fn detail_shows_percentage() {
        let detail = PhaseDetail::Bytes(CopyProgress::start(200).advance(50));
        assert_eq!(detail.to_string(), "25.0%");
    }
}
