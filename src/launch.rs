//! What to do with an assembled hypervisor invocation.
//!
//! A [`LaunchPlan`] is built once by the VM and handed to an executor: either
//! replace the current process with the hypervisor, or write a script that
//! runs it later.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};

use crate::error::VemuError;
use crate::util::{shell_join, shell_quote};

/// Program, argv, working directory and extra environment for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchPlan {
    pub fn command_line(&self) -> String {
        shell_join(std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)))
    }

    /// Bash script running the plan, one argument pair per line.
    pub fn render_script(&self) -> String {
        let mut script = String::from("#!/usr/bin/env bash\nset -eux\n\n");
        script.push_str(&format!("cd {}\n", shell_quote(&self.working_dir.display().to_string())));
        for (key, value) in &self.env {
            script.push_str(&format!("export {key}={}\n", shell_quote(value)));
        }
        script.push('\n');

        script.push_str(&format!("{} \\\n", shell_quote(&self.program)));
        for pair in self.args.chunks(2) {
            let line: Vec<String> = pair.iter().map(|a| shell_quote(a)).collect();
            script.push_str(&format!("\t{} \\\n", line.join(" ")));
        }
        script.push_str(";\n");
        script
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The plan was rendered to a script at this path.
    ScriptWritten { path: PathBuf },
}

pub trait LaunchExecutor {
    /// True if a successful `execute` means the hypervisor is now running.
    fn replaces_process(&self) -> bool {
        false
    }

    fn execute(&self, plan: &LaunchPlan) -> Result<LaunchOutcome, VemuError>;
}

/// Replaces the current process image with the hypervisor. Only returns on error.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecExecutor;

impl LaunchExecutor for ExecExecutor {
    fn replaces_process(&self) -> bool {
        true
    }

    fn execute(&self, plan: &LaunchPlan) -> Result<LaunchOutcome, VemuError> {
        tracing::info!(command = %plan.command_line(), "exec hypervisor");
        let err = std::process::Command::new(&plan.program)
            .args(&plan.args)
            .current_dir(&plan.working_dir)
            .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .exec();
        Err(VemuError::Exec {
            command: plan.command_line(),
            source: err,
        })
    }
}

/// Writes the plan to an executable bash script.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    path: PathBuf,
}

impl ScriptExecutor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LaunchExecutor for ScriptExecutor {
    fn execute(&self, plan: &LaunchPlan) -> Result<LaunchOutcome, VemuError> {
        let io_err = |e| VemuError::Io {
            context: format!("writing launch script {}", self.path.display()),
            source: e,
        };
        std::fs::write(&self.path, plan.render_script()).map_err(io_err)?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o755))
            .map_err(io_err)?;
        tracing::info!(path = %self.path.display(), "wrote launch script");
        Ok(LaunchOutcome::ScriptWritten {
            path: self.path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> LaunchPlan {
        LaunchPlan {
            program: "/usr/bin/qemu-system-x86_64".into(),
            args: vec![
                "-m".into(),
                "3072".into(),
                "-cpu".into(),
                "host".into(),
                "-name".into(),
                "my vm".into(),
            ],
            working_dir: PathBuf::from("/r/vms/dev"),
            env: vec![],
        }
    }

    #[test]
    fn script_has_one_pair_per_line() {
        let script = plan().render_script();
        assert_eq!(
            script,
            "#!/usr/bin/env bash\nset -eux\n\ncd /r/vms/dev\n\n\
             /usr/bin/qemu-system-x86_64 \\\n\
             \t-m 3072 \\\n\
             \t-cpu host \\\n\
             \t-name 'my vm' \\\n\
             ;\n"
        );
    }

    #[test]
    fn script_exports_environment() {
        let mut plan = plan();
        plan.env.push(("QEMU_AUDIO_DRV".into(), "none".into()));
        assert!(plan.render_script().contains("export QEMU_AUDIO_DRV=none\n"));
    }

    #[test]
    fn odd_argument_count_keeps_last_alone() {
        let mut plan = plan();
        plan.args.push("-S".into());
        assert!(plan.render_script().contains("\t-S \\\n;\n"));
    }

    #[test]
    fn script_executor_writes_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sh");
        let executor = ScriptExecutor::new(&path);
        assert!(!executor.replaces_process());

        let outcome = executor.execute(&plan()).unwrap();
        assert_eq!(outcome, LaunchOutcome::ScriptWritten { path: path.clone() });
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("#!/usr/bin/env bash"));
    }

    #[test]
    fn exec_of_missing_binary_returns_error() {
        let mut plan = plan();
        plan.program = "/nonexistent/qemu".into();
        plan.working_dir = std::env::temp_dir();
        let err = ExecExecutor.execute(&plan).unwrap_err();
        match err {
            VemuError::Exec { command, .. } => assert!(command.starts_with("/nonexistent/qemu -m 3072")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
