//! Runs external programs (partitioners, `mkfs`, `mount`, ...).
use crate::error::{Error, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

/// Executes external tools. Implementations must treat any non-zero exit as
/// [`Error::ToolExecutionFailed`].
pub trait ToolRunner: Send + Sync {
    /// Runs `program` with `args`, feeding `stdin` if given, and returns its
    /// standard output.
    fn run(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> Result<String>;
}

/// Runs tools as child processes of the current process.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    fn run(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> Result<String> {
        // Arguments are logged, stdin never: it carries secrets.
        debug!(program, ?args, "running tool");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ToolExecutionFailed {
                tool: program.to_string(),
                status: "not started".into(),
                stderr: e.to_string(),
            })?;

        // Dropping the pipe closes it so the tool sees end of input.
        let written = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => pipe.write_all(input),
            _ => Ok(()),
        };

        // The child is reaped even when feeding it failed.
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::tool(program, output.status, &output.stderr));
        }
        written?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Turns string literals into an argument vector.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
