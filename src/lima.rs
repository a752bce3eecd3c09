//! Lima as an alternative backend.
//!
//! Each verb runs one `limactl` invocation to completion. A non-zero exit is
//! not an error here: it comes back in [`LimaOutcome`] together with every
//! output line, and the caller decides what to do with it.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

use crate::error::VemuError;
use crate::util::shell_join;

pub const DEFAULT_TEMPLATE: &str = "template://_images/ubuntu-24.04";

/// Optional sizing flags shared by `create` and `start`. `None` fields are
/// left to Lima's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimaOptions {
    pub cpus: Option<u32>,
    /// GiB
    pub memory: Option<u32>,
    pub arch: Option<String>,
    /// GiB
    pub disk: Option<u32>,
    /// `vz` or `qemu`
    pub vm_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimaOutcome {
    pub success: bool,
    /// Combined stdout and stderr, in arrival order.
    pub lines: Vec<String>,
    /// `-1` when the process was killed by a signal.
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
pub struct LimaBackend {
    binary: String,
    template: String,
}

impl Default for LimaBackend {
    fn default() -> Self {
        Self::new("limactl")
    }
}

impl LimaBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            template: DEFAULT_TEMPLATE.into(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    fn lifecycle_args(&self, verb: &str, name: &str, opts: &LimaOptions) -> Vec<String> {
        let mut args = vec![
            verb.to_string(),
            "-y".into(),
            "--log-format=json".into(),
            format!("--name={name}"),
        ];
        if let Some(cpus) = opts.cpus {
            args.push(format!("--cpus={cpus}"));
        }
        if let Some(memory) = opts.memory {
            args.push(format!("--memory={memory}"));
        }
        if let Some(arch) = &opts.arch {
            args.push(format!("--arch={arch}"));
        }
        if let Some(disk) = opts.disk {
            args.push(format!("--disk={disk}"));
        }
        if let Some(vm_type) = &opts.vm_type {
            args.push(format!("--vm-type={vm_type}"));
        }
        args.push(self.template.clone());
        args
    }

    pub fn create_args(&self, name: &str, opts: &LimaOptions) -> Vec<String> {
        self.lifecycle_args("create", name, opts)
    }

    /// `limactl start` with a template creates the instance and boots it.
    pub fn start_args(&self, name: &str, opts: &LimaOptions) -> Vec<String> {
        self.lifecycle_args("start", name, opts)
    }

    pub fn stop_args(&self, name: &str, force: bool) -> Vec<String> {
        removal_args("stop", name, force)
    }

    pub fn rm_args(&self, name: &str, force: bool) -> Vec<String> {
        removal_args("delete", name, force)
    }

    pub async fn create(&self, name: &str, opts: &LimaOptions) -> Result<LimaOutcome, VemuError> {
        self.run(self.create_args(name, opts)).await
    }

    pub async fn start(&self, name: &str, opts: &LimaOptions) -> Result<LimaOutcome, VemuError> {
        self.run(self.start_args(name, opts)).await
    }

    pub async fn stop(&self, name: &str, force: bool) -> Result<LimaOutcome, VemuError> {
        self.run(self.stop_args(name, force)).await
    }

    pub async fn rm(&self, name: &str, force: bool) -> Result<LimaOutcome, VemuError> {
        self.run(self.rm_args(name, force)).await
    }

    /// Spawn `limactl` and collect its output. Only a failure to spawn or
    /// wait is an `Err`.
    async fn run(&self, args: Vec<String>) -> Result<LimaOutcome, VemuError> {
        let command_line =
            shell_join(std::iter::once(self.binary.as_str()).chain(args.iter().map(String::as_str)));
        tracing::debug!(command = %command_line, "running limactl");

        let mut child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VemuError::Io {
                context: format!("spawning `{command_line}`"),
                source: e,
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            tracing::debug!(target: "limactl", "{line}");
            lines.push(line);
        }

        let status = child.wait().await.map_err(|e| VemuError::Io {
            context: format!("waiting for `{command_line}`"),
            source: e,
        })?;
        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            tracing::warn!(command = %command_line, exit_code, "limactl failed");
        }

        Ok(LimaOutcome {
            success: status.success(),
            lines,
            exit_code,
        })
    }
}

fn removal_args(verb: &str, name: &str, force: bool) -> Vec<String> {
    let mut args = vec![
        verb.to_string(),
        "--log-format=json".into(),
        name.to_string(),
    ];
    if force {
        args.push("--force".into());
    }
    args
}

/// Forward every line until EOF. Invalid UTF-8 is replaced, not fatal.
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut segments = BufReader::new(reader).split(b'\n');
    loop {
        match segments.next_segment().await {
            Ok(Some(mut raw)) => {
                if raw.last() == Some(&b'\r') {
                    raw.pop();
                }
                if tx.send(String::from_utf8_lossy(&raw).into_owned()).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "reading limactl output");
                break;
            }
        }
    }
}

/// `~/.lima/{name}/ssh.config`, written by Lima once the instance is up.
pub fn ssh_config_path(name: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".lima").join(name).join("ssh.config"))
}
