//! Per-device outcomes of a batch and the final report.
use crate::batch::BatchState;
use crate::device::DeviceSnapshot;
use crate::error::{Error, FailureKind};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&Error> for FailureReason {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed(FailureReason),
    /// The batch was cancelled before this device was processed.
    Cancelled,
}

impl Outcome {
    pub fn from_result(result: &crate::Result<()>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(Error::Cancelled) => Outcome::Cancelled,
            Err(e) => Outcome::Failed(e.into()),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Failed(reason) => write!(f, "failed: {reason}"),
            Outcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// One row of a [`BatchReport`].
#[derive(Clone, Debug, Serialize)]
pub struct DeviceOperationResult {
    pub device: Arc<DeviceSnapshot>,
    #[serde(rename = "elapsed_secs", serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub outcome: Outcome,
}

impl DeviceOperationResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// The final, immutable outcome of a batch: one result per submitted device,
/// in processing order.
#[derive(Clone, Debug, Serialize)]
pub struct BatchReport {
    pub state: BatchState,
    pub results: Vec<DeviceOperationResult>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed(_)))
            .count()
    }
}

/// Collects results while a batch runs. Results can only be appended.
#[derive(Debug, Default)]
pub struct ReportBuilder {
    results: Arc<RwLock<Vec<DeviceOperationResult>>>,
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: DeviceOperationResult) {
        self.results
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(result);
    }

    /// A read-only view that follows the builder.
    pub fn view(&self) -> ReportView {
        ReportView {
            results: Arc::clone(&self.results),
        }
    }

    pub fn finish(self, state: BatchState) -> BatchReport {
        let results = self.results.read().unwrap_or_else(|e| e.into_inner()).clone();
        BatchReport { state, results }
    }
}

/// Incremental view on a running batch's results.
#[derive(Clone, Debug)]
pub struct ReportView {
    results: Arc<RwLock<Vec<DeviceOperationResult>>>,
}

impl ReportView {
    pub fn results(&self) -> Vec<DeviceOperationResult> {
        self.results.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.results.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
