//! Error types shared by every part of the engine.
use crate::credentials::ValidationError;
use crate::layout::RejectionReason;
use serde::Serialize;
use std::fmt;
use std::process::ExitStatus;
use thiserror::Error;

/// Every failure the engine can produce.
///
/// The first six variants mirror how a batch treats a failure: plan rejections,
/// failed preconditions, tool failures and vanished devices are isolated to
/// the device they happened on, validation errors block a batch before any
/// device is touched, and `Cancelled` is not a failure at all.
#[derive(Debug, Error)]
pub enum Error {
    #[error("plan rejected: {0}")]
    PlanRejected(#[from] RejectionReason),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("`{tool}` failed ({status}): {stderr}")]
    ToolExecutionFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("device {0} disappeared")]
    DeviceDisappeared(String),

    #[error("credential validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("operation cancelled by user")]
    Cancelled,

    #[error("source image is invalid: {0}")]
    SourceInvalid(String),

    #[error("another batch operation is already running")]
    Busy,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn tool(tool: &str, status: ExitStatus, stderr: &[u8]) -> Self {
        let status = match status.code() {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        Error::ToolExecutionFailed {
            tool: tool.to_string(),
            status,
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }

    /// The report category this error falls into.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::PlanRejected(_) => FailureKind::PlanRejected,
            Error::PreconditionFailed(_) => FailureKind::PreconditionFailed,
            Error::ToolExecutionFailed { .. } => FailureKind::ToolExecutionFailed,
            Error::DeviceDisappeared(_) => FailureKind::DeviceDisappeared,
            Error::Validation(_) => FailureKind::Validation,
            Error::Cancelled => FailureKind::Cancelled,
            Error::SourceInvalid(_) => FailureKind::SourceInvalid,
            Error::Busy | Error::Config(_) | Error::Io(_) => FailureKind::Other,
        }
    }
}

/// Coarse classification of a failed device, as shown in a batch report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PlanRejected,
    PreconditionFailed,
    ToolExecutionFailed,
    DeviceDisappeared,
    Validation,
    Cancelled,
    SourceInvalid,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::PlanRejected => "plan rejected",
            FailureKind::PreconditionFailed => "precondition failed",
            FailureKind::ToolExecutionFailed => "tool failed",
            FailureKind::DeviceDisappeared => "device disappeared",
            FailureKind::Validation => "validation",
            FailureKind::Cancelled => "cancelled",
            FailureKind::SourceInvalid => "invalid source",
            FailureKind::Other => "error",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
