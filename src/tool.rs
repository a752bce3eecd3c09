//! Invocation of external tools (`qemu-img`, `genisoimage`).
//!
//! Every call blocks the orchestrating task until the child exits. No timeout
//! is applied, so a hung tool blocks the caller indefinitely.

use crate::error::VemuError;
use crate::util::shell_join;

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The exact command line, as it would be typed into a shell.
    pub fn command_line(&self) -> String {
        shell_join(std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)))
    }
}

/// Captured result of a finished tool run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit code, `None` when the child was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn status_label(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "killed by signal".into(),
        }
    }
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait ToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, VemuError>;
}

/// Runs tools as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, VemuError> {
        tracing::debug!(command = %invocation.command_line(), "running external tool");

        let output = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .output()
            .await
            .map_err(|e| VemuError::Io {
                context: format!("running `{}`", invocation.command_line()),
                source: e,
            })?;

        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Turn a non-zero exit into `ExternalCommand`.
pub fn check_status(invocation: &ToolInvocation, output: &ToolOutput) -> Result<(), VemuError> {
    if output.success() {
        return Ok(());
    }
    Err(VemuError::ExternalCommand {
        command: invocation.command_line(),
        status: output.status_label(),
        stderr: output.stderr.trim().to_string(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_joins_program_and_args() {
        let inv = ToolInvocation::new("qemu-img").args(["create", "-f", "qcow2"]);
        assert_eq!(inv.command_line(), "qemu-img create -f qcow2");
    }

    #[test]
    fn check_status_reports_command_line() {
        let inv = ToolInvocation::new("genisoimage").args(["-o", "/tmp/x.iso"]);
        let out = ToolOutput {
            code: Some(2),
            stdout: String::new(),
            stderr: "no such file\n".into(),
        };
        let err = check_status(&inv, &out).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("genisoimage -o /tmp/x.iso"));
        assert!(msg.contains("exit code 2"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn signal_exit_is_not_success() {
        let out = ToolOutput {
            code: None,
            ..Default::default()
        };
        assert!(!out.success());
        assert_eq!(out.status_label(), "killed by signal");
    }

    #[tokio::test]
    async fn system_runner_captures_exit_code() {
        let inv = ToolInvocation::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let out = SystemRunner.run(&inv).await.unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }
}
