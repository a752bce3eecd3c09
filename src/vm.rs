//! The VM lifecycle orchestrator.
//!
//! A `Vm` owns one working directory under the context root. It decides
//! which artifacts (seed disk, differential disk) are missing, creates them,
//! and assembles the hypervisor invocation. Two `Vm`s must never share a
//! working directory; nothing here checks that.

use std::path::PathBuf;

use crate::cloudinit::CloudConfigBuilder;
use crate::context::Context;
use crate::error::VemuError;
use crate::launch::{LaunchExecutor, LaunchOutcome, LaunchPlan};
use crate::network::NetworkCard;
use crate::overlay;
use crate::paths::{self, VmPaths};
use crate::qemu;
use crate::tool::{SystemRunner, ToolRunner};
use crate::vm_state::{self, Observed, VmState};

/// Host binaries and firmware the orchestrator drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTools {
    pub hypervisor: String,
    /// UEFI code image; empty means no pflash drive is attached.
    pub firmware: String,
    pub qemu_img: String,
    pub iso_tool: String,
    pub guest_support_dir: PathBuf,
}

impl Default for HostTools {
    fn default() -> Self {
        Self {
            hypervisor: "/usr/bin/qemu-system-x86_64".into(),
            firmware: "/usr/share/OVMF/OVMF_CODE_4M.fd".into(),
            qemu_img: "qemu-img".into(),
            iso_tool: "genisoimage".into(),
            guest_support_dir: paths::guest_support_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub name: String,
    pub arch: String,
    /// Logical base image name in the context registry.
    pub image: String,
    pub memory_mb: u64,
    pub cpu_count: u32,
    pub threads_per_core: u32,
    /// Only used when the differential disk is first created.
    pub disk_bytes: u64,
    pub guest_agent_enabled: bool,
    /// Emitted in insertion order.
    pub network_cards: Vec<NetworkCard>,
    pub tools: HostTools,
}

impl VmConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arch: "amd64".into(),
            image: "ubuntu".into(),
            memory_mb: 3072,
            cpu_count: 2,
            threads_per_core: 1,
            disk_bytes: 20 * 1024 * 1024 * 1024,
            guest_agent_enabled: true,
            network_cards: Vec::new(),
            tools: HostTools::default(),
        }
    }

    pub fn add_tap_netdev(&mut self, netdev_id: &str, mac: &str, host_tap: &str) {
        self.network_cards.push(NetworkCard::tap(netdev_id, mac, host_tap));
    }

    pub fn add_user_netdev(&mut self, netdev_id: &str, mac: &str) {
        self.network_cards.push(NetworkCard::user(netdev_id, mac));
    }
}

pub struct Vm<R: ToolRunner = SystemRunner> {
    config: VmConfig,
    context: Context,
    cloud_init: CloudConfigBuilder,
    paths: VmPaths,
    runner: R,
}

impl Vm<SystemRunner> {
    pub fn new(
        config: VmConfig,
        context: Context,
        cloud_init: Option<CloudConfigBuilder>,
    ) -> Result<Self, VemuError> {
        Self::with_runner(config, context, cloud_init, SystemRunner)
    }
}

impl<R: ToolRunner> Vm<R> {
    /// Creates the working directory. Without a builder, a default one for
    /// host `vemu-<name>` is used.
    pub fn with_runner(
        config: VmConfig,
        context: Context,
        cloud_init: Option<CloudConfigBuilder>,
        runner: R,
    ) -> Result<Self, VemuError> {
        let paths = VmPaths::new(context.path_for_vm(&config.name));
        let cloud_init =
            cloud_init.unwrap_or_else(|| CloudConfigBuilder::new(format!("vemu-{}", config.name), None));

        let vm = Self {
            config,
            context,
            cloud_init,
            paths,
            runner,
        };
        vm.ensure_working_dir()?;
        Ok(vm)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut VmConfig {
        &mut self.config
    }

    pub fn cloud_init(&self) -> &CloudConfigBuilder {
        &self.cloud_init
    }

    pub fn cloud_init_mut(&mut self) -> &mut CloudConfigBuilder {
        &mut self.cloud_init
    }

    pub fn paths(&self) -> &VmPaths {
        &self.paths
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// `ga.sock`, only when the guest agent is enabled.
    pub fn guest_agent_socket(&self) -> Option<PathBuf> {
        self.config
            .guest_agent_enabled
            .then(|| self.paths.guest_agent_socket())
    }

    pub fn seed_disk_present(&self) -> bool {
        self.paths.seed_disk().is_file()
    }

    pub fn differential_disk_present(&self) -> bool {
        self.paths.diffdisk().is_file()
    }

    pub fn is_prepared(&self) -> bool {
        self.seed_disk_present() && self.differential_disk_present()
    }

    fn ensure_working_dir(&self) -> Result<(), VemuError> {
        std::fs::create_dir_all(self.paths.dir()).map_err(|e| VemuError::Io {
            context: format!("creating VM directory {}", self.paths.dir().display()),
            source: e,
        })
    }

    /// Recorded state, corrected against what is actually on disk. A
    /// corrected record is written back.
    pub fn state(&self) -> Result<VmState, VemuError> {
        let recorded = vm_state::read_record(&self.paths.state_file());
        let observed = Observed {
            seed_disk: self.seed_disk_present(),
            diffdisk: self.differential_disk_present(),
            hypervisor_alive: vm_state::pid_alive(&self.paths.pid_file()),
        };
        let state = vm_state::reconcile(recorded, observed);
        if recorded != Some(state) {
            if recorded.is_some() {
                tracing::warn!(
                    vm = %self.config.name,
                    recorded = ?recorded,
                    actual = %state,
                    "state record out of date, reconciling"
                );
            }
            vm_state::write_record(&self.paths.state_file(), state)?;
        }
        Ok(state)
    }

    /// Delete the seed and differential disks so the next `prepare` starts
    /// from scratch. A no-op on an unprepared VM.
    pub async fn reset(&mut self) -> Result<(), VemuError> {
        let mut unlink = Vec::new();
        if self.seed_disk_present() {
            unlink.push(self.paths.seed_disk());
        }
        if self.differential_disk_present() {
            unlink.push(self.paths.diffdisk());
        }

        for path in &unlink {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::info!(path = %path.display(), "removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove"),
            }
        }

        if self.paths.state_file().exists() || !unlink.is_empty() {
            vm_state::write_record(&self.paths.state_file(), VmState::Unprepared)?;
        }
        Ok(())
    }

    /// Create whatever artifact is missing. Safe to repeat, and safe to
    /// resume after a crash that left only one of the two disks.
    pub async fn prepare(&mut self) -> Result<(), VemuError> {
        self.ensure_working_dir()?;

        if self.seed_disk_present() {
            tracing::debug!(vm = %self.config.name, "seed disk present, skipping");
        } else {
            self.create_seed_disk().await?;
        }

        if self.differential_disk_present() {
            tracing::debug!(vm = %self.config.name, "differential disk present, skipping");
        } else {
            self.create_differential_disk().await?;
        }

        vm_state::write_record(&self.paths.state_file(), VmState::Prepared)?;
        Ok(())
    }

    async fn create_seed_disk(&mut self) -> Result<(), VemuError> {
        self.cloud_init.set_guest_agent(self.config.guest_agent_enabled);
        if self.config.guest_agent_enabled {
            let support = self.config.tools.guest_support_dir.clone();
            if !self.cloud_init.included_files().contains(&support) {
                self.cloud_init.include_file(support);
            }
        }

        let seed = self.paths.seed_disk();
        self.cloud_init
            .author_seed_disk(&self.runner, &self.config.tools.iso_tool, &seed)
            .await?;

        let yaml_path = self.paths.cloud_init_yaml();
        let user_data = self.cloud_init.render_user_data()?;
        tokio::fs::write(&yaml_path, user_data)
            .await
            .map_err(|e| VemuError::Io {
                context: format!("writing {}", yaml_path.display()),
                source: e,
            })?;
        Ok(())
    }

    /// Create the qcow2 overlay on top of the resolved base image. An
    /// existing overlay is removed first.
    pub async fn create_differential_disk(&self) -> Result<(), VemuError> {
        let base = self
            .context
            .resolve_base_image(&self.config.image, &self.config.arch)?;
        let diffdisk = self.paths.diffdisk();

        if self.differential_disk_present() {
            tracing::warn!(path = %diffdisk.display(), "replacing existing differential disk");
            tokio::fs::remove_file(&diffdisk)
                .await
                .map_err(|e| VemuError::Io {
                    context: format!("removing {}", diffdisk.display()),
                    source: e,
                })?;
        }

        overlay::create_overlay(
            &self.runner,
            &self.config.tools.qemu_img,
            &base.path,
            &diffdisk,
            self.config.disk_bytes,
        )
        .await
    }

    pub fn build_hypervisor_arguments(&self) -> Vec<String> {
        qemu::hypervisor_args(&self.config, &self.paths)
    }

    pub fn launch_plan(&self) -> LaunchPlan {
        LaunchPlan {
            program: self.config.tools.hypervisor.clone(),
            args: self.build_hypervisor_arguments(),
            working_dir: self.paths.dir().to_path_buf(),
            env: Vec::new(),
        }
    }

    /// Prepare, then hand the plan to `executor`. With an exec executor this
    /// only returns on failure.
    pub async fn launch<E: LaunchExecutor>(
        &mut self,
        executor: &E,
    ) -> Result<LaunchOutcome, VemuError> {
        self.prepare().await?;
        let plan = self.launch_plan();
        if executor.replaces_process() {
            vm_state::write_record(&self.paths.state_file(), VmState::Running)?;
        }

        let result = executor.execute(&plan);
        if result.is_err() && executor.replaces_process() {
            vm_state::write_record(&self.paths.state_file(), VmState::Prepared)?;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::{ExecExecutor, ScriptExecutor};
    use crate::tool::testing::RecordingRunner;

    fn vm_in(root: &std::path::Path, runner: RecordingRunner) -> Vm<RecordingRunner> {
        let mut config = VmConfig::new("dev");
        config.add_user_netdev("net0", "52:54:00:00:00:01");
        Vm::with_runner(config, Context::new(root), None, runner).unwrap()
    }

    fn artifact_names(vm: &Vm<RecordingRunner>) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(vm.paths().dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn construction_creates_working_directory() {
        let root = tempfile::tempdir().unwrap();
        let vm = vm_in(root.path(), RecordingRunner::new());
        assert!(vm.paths().dir().is_dir());
        assert_eq!(vm.paths().dir(), root.path().join("vms").join("dev"));
        assert_eq!(vm.cloud_init().host_name(), "vemu-dev");
        assert!(!vm.is_prepared());
    }

    #[tokio::test]
    async fn prepare_creates_both_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let mut vm = vm_in(root.path(), RecordingRunner::new());

        vm.prepare().await.unwrap();

        assert!(vm.seed_disk_present());
        assert!(vm.differential_disk_present());
        assert!(vm.paths().cloud_init_yaml().is_file());
        assert_eq!(vm.runner().programs(), vec!["genisoimage", "qemu-img"]);
        assert_eq!(vm.state().unwrap(), VmState::Prepared);
    }

    #[tokio::test]
    async fn prepare_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut vm = vm_in(root.path(), RecordingRunner::new());

        vm.prepare().await.unwrap();
        let after_first = vm.runner().call_count();
        vm.prepare().await.unwrap();

        assert_eq!(vm.runner().call_count(), after_first);
    }

    #[tokio::test]
    async fn prepare_resumes_after_partial_crash() {
        let root = tempfile::tempdir().unwrap();
        let mut vm = vm_in(root.path(), RecordingRunner::new());
        vm.prepare().await.unwrap();
        std::fs::remove_file(vm.paths().diffdisk()).unwrap();

        vm.prepare().await.unwrap();

        assert_eq!(
            vm.runner().programs(),
            vec!["genisoimage", "qemu-img", "qemu-img"]
        );
        assert!(vm.is_prepared());
    }

    #[tokio::test]
    async fn prepare_recreates_only_missing_seed_disk() {
        let root = tempfile::tempdir().unwrap();
        let mut vm = vm_in(root.path(), RecordingRunner::new());
        vm.prepare().await.unwrap();
        std::fs::write(vm.paths().diffdisk(), b"guest writes").unwrap();
        std::fs::remove_file(vm.paths().seed_disk()).unwrap();

        vm.prepare().await.unwrap();

        assert_eq!(
            vm.runner().programs(),
            vec!["genisoimage", "qemu-img", "genisoimage"]
        );
        assert!(vm.is_prepared());
        assert_eq!(std::fs::read(vm.paths().diffdisk()).unwrap(), b"guest writes");
        assert_eq!(vm.state().unwrap(), VmState::Prepared);
    }

    #[tokio::test]
    async fn reset_then_prepare_reproduces_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let mut vm = vm_in(root.path(), RecordingRunner::new());
        vm.prepare().await.unwrap();
        let first = artifact_names(&vm);

        vm.reset().await.unwrap();
        assert!(!vm.seed_disk_present());
        assert!(!vm.differential_disk_present());
        assert_eq!(vm.state().unwrap(), VmState::Unprepared);

        vm.prepare().await.unwrap();
        assert_eq!(artifact_names(&vm), first);
        assert_eq!(vm.state().unwrap(), VmState::Prepared);
    }

    #[tokio::test]
    async fn reset_on_unprepared_vm_is_noop() {
        let root = tempfile::tempdir().unwrap();
        let mut vm = vm_in(root.path(), RecordingRunner::new());
        vm.reset().await.unwrap();
        vm.reset().await.unwrap();
        assert!(artifact_names(&vm).is_empty());
        assert_eq!(vm.runner().call_count(), 0);
    }

    #[tokio::test]
    async fn guest_agent_directory_is_bundled_once() {
        let root = tempfile::tempdir().unwrap();
        let mut vm = vm_in(root.path(), RecordingRunner::new());
        vm.prepare().await.unwrap();
        vm.reset().await.unwrap();
        vm.prepare().await.unwrap();

        let support = vm.config().tools.guest_support_dir.clone();
        assert_eq!(vm.cloud_init().included_files(), &[support.clone()]);
        let calls = vm.runner().calls.lock().unwrap();
        let iso_call = calls.iter().find(|c| c.program == "genisoimage").unwrap();
        assert_eq!(iso_call.args.last().unwrap(), &support.display().to_string());
    }

    #[tokio::test]
    async fn guest_agent_disabled_bundles_nothing() {
        let root = tempfile::tempdir().unwrap();
        let mut vm = vm_in(root.path(), RecordingRunner::new());
        vm.config_mut().guest_agent_enabled = false;
        vm.prepare().await.unwrap();

        assert!(vm.cloud_init().included_files().is_empty());
        assert!(vm.guest_agent_socket().is_none());
        let yaml = std::fs::read_to_string(vm.paths().cloud_init_yaml()).unwrap();
        assert!(!yaml.contains("ga_init.sh"));
    }

    #[tokio::test]
    async fn diffdisk_verification_failure_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let vm = vm_in(root.path(), RecordingRunner::lying());

        let err = vm.create_differential_disk().await.unwrap_err();
        assert!(matches!(err, VemuError::DiskCreationVerificationFailed { .. }));
    }

    #[tokio::test]
    async fn diffdisk_uses_resolved_base_image_and_size() {
        let root = tempfile::tempdir().unwrap();
        let mut vm = vm_in(root.path(), RecordingRunner::new());
        vm.config_mut().disk_bytes = 1024;
        vm.create_differential_disk().await.unwrap();

        let calls = vm.runner().calls.lock().unwrap();
        let base = root.path().join("base-images").join("ubuntu-amd64.img");
        assert_eq!(calls[0].args[6], base.display().to_string());
        assert_eq!(calls[0].args[7], vm.paths().diffdisk().display().to_string());
        assert_eq!(calls[0].args[8], "1024");
    }

    #[tokio::test]
    async fn existing_diffdisk_is_replaced() {
        let root = tempfile::tempdir().unwrap();
        let vm = vm_in(root.path(), RecordingRunner::new());
        std::fs::write(vm.paths().diffdisk(), b"stale").unwrap();

        vm.create_differential_disk().await.unwrap();

        assert_eq!(std::fs::read(vm.paths().diffdisk()).unwrap(), b"");
    }

    #[tokio::test]
    async fn unknown_arch_fails_before_any_tool_runs() {
        let root = tempfile::tempdir().unwrap();
        let mut vm = vm_in(root.path(), RecordingRunner::new());
        vm.config_mut().arch = "arm64".into();
        vm.config_mut().guest_agent_enabled = false;

        let err = vm.create_differential_disk().await.unwrap_err();
        assert!(matches!(err, VemuError::UnknownImage { .. }));
        assert_eq!(vm.runner().call_count(), 0);
    }

    #[test]
    fn build_arguments_is_pure() {
        let root = tempfile::tempdir().unwrap();
        let vm = vm_in(root.path(), RecordingRunner::new());
        let first = vm.build_hypervisor_arguments();
        let second = vm.build_hypervisor_arguments();
        assert_eq!(first, second);
        assert!(first.iter().any(|a| a.contains("user,id=net0")));
        assert!(artifact_names(&vm).is_empty());
    }

    #[tokio::test]
    async fn launch_to_script_prepares_and_writes_plan() {
        let root = tempfile::tempdir().unwrap();
        let mut vm = vm_in(root.path(), RecordingRunner::new());
        let script = vm.paths().run_script();

        let outcome = vm.launch(&ScriptExecutor::new(&script)).await.unwrap();

        assert_eq!(outcome, LaunchOutcome::ScriptWritten { path: script.clone() });
        assert!(vm.is_prepared());
        let text = std::fs::read_to_string(&script).unwrap();
        assert!(text.contains("/usr/bin/qemu-system-x86_64 \\\n"));
        assert!(text.contains("\t-m 3072 \\\n"));
        assert_eq!(vm.state().unwrap(), VmState::Prepared);
    }

    #[tokio::test]
    async fn failed_exec_leaves_vm_prepared() {
        let root = tempfile::tempdir().unwrap();
        let mut vm = vm_in(root.path(), RecordingRunner::new());
        vm.config_mut().tools.hypervisor = "/nonexistent/qemu-system-x86_64".into();

        let err = vm.launch(&ExecExecutor).await.unwrap_err();

        assert!(matches!(err, VemuError::Exec { .. }));
        assert_eq!(vm.state().unwrap(), VmState::Prepared);
    }

    #[test]
    fn launch_plan_runs_in_vm_dir() {
        let root = tempfile::tempdir().unwrap();
        let vm = vm_in(root.path(), RecordingRunner::new());
        let plan = vm.launch_plan();
        assert_eq!(plan.program, "/usr/bin/qemu-system-x86_64");
        assert_eq!(plan.working_dir, vm.paths().dir());
        assert_eq!(plan.args, vm.build_hypervisor_arguments());
    }
}
