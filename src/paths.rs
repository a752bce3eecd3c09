use std::path::{Path, PathBuf};

/// Default state root: `~/.vemu/`
pub fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".vemu")
}

/// Explicit root, else a non-empty `VEMU_ROOT`, else [`default_root`].
pub fn resolve_root(explicit: Option<&Path>, env_root: Option<&str>) -> PathBuf {
    if let Some(root) = explicit {
        return root.to_path_buf();
    }
    match env_root {
        Some(root) if !root.is_empty() => PathBuf::from(root),
        _ => default_root(),
    }
}

/// Copy of the guest-side support files in the source tree.
const SOURCE_GUEST_SUPPORT_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/guest-support");

const GUEST_AGENT_SCRIPT: &str = "ga_init.sh";

/// Where an installed `vemu` at `exe` keeps its guest-support files:
/// `{bin}/guest-support`, then `{prefix}/share/vemu/guest-support`.
pub fn guest_support_candidates(exe: &Path) -> Vec<PathBuf> {
    let Some(bin_dir) = exe.parent() else {
        return Vec::new();
    };
    let mut candidates = vec![bin_dir.join("guest-support")];
    if let Some(prefix) = bin_dir.parent() {
        candidates.push(prefix.join("share").join("vemu").join("guest-support"));
    }
    candidates
}

/// First candidate next to `exe` that holds the guest agent script, else
/// the source tree copy.
pub fn find_guest_support_dir(exe: Option<&Path>) -> PathBuf {
    exe.map(guest_support_candidates)
        .unwrap_or_default()
        .into_iter()
        .find(|dir| dir.join(GUEST_AGENT_SCRIPT).is_file())
        .unwrap_or_else(|| PathBuf::from(SOURCE_GUEST_SUPPORT_DIR))
}

/// Guest-support directory for the running binary.
pub fn guest_support_dir() -> PathBuf {
    let exe = std::env::current_exe().ok();
    find_guest_support_dir(exe.as_deref())
}

/// Per-VM file layout, rooted at the VM's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPaths {
    dir: PathBuf,
}

impl VmPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cloud-init seed ISO.
    pub fn seed_disk(&self) -> PathBuf {
        self.dir.join("cidata.iso")
    }

    /// qcow2 overlay backed by the base image.
    pub fn diffdisk(&self) -> PathBuf {
        self.dir.join("diffdisk")
    }

    /// Copy of the rendered user-data, for inspection.
    pub fn cloud_init_yaml(&self) -> PathBuf {
        self.dir.join("cloud-init.yaml")
    }

    pub fn serial_socket(&self) -> PathBuf {
        self.dir.join("serial.sock")
    }

    pub fn serial_log(&self) -> PathBuf {
        self.dir.join("serial.log")
    }

    pub fn serial_virtio_socket(&self) -> PathBuf {
        self.dir.join("serialv.sock")
    }

    pub fn serial_virtio_log(&self) -> PathBuf {
        self.dir.join("serialv.log")
    }

    pub fn qmp_socket(&self) -> PathBuf {
        self.dir.join("qmp.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("qemu.pid")
    }

    pub fn guest_agent_socket(&self) -> PathBuf {
        self.dir.join("ga.sock")
    }

    /// Persisted lifecycle record.
    pub fn state_file(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    /// Debug log written by the tracing file layer.
    pub fn log_file(&self) -> PathBuf {
        self.dir.join("vemu.log")
    }

    /// Default target for the rendered launch script.
    pub fn run_script(&self) -> PathBuf {
        self.dir.join("run.sh")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_in_vm_dir() {
        let p = VmPaths::new("/r/vms/dev");
        assert_eq!(p.seed_disk(), PathBuf::from("/r/vms/dev/cidata.iso"));
        assert_eq!(p.diffdisk(), PathBuf::from("/r/vms/dev/diffdisk"));
        assert_eq!(p.serial_virtio_log(), PathBuf::from("/r/vms/dev/serialv.log"));
        assert_eq!(p.pid_file(), PathBuf::from("/r/vms/dev/qemu.pid"));
        assert_eq!(p.guest_agent_socket(), PathBuf::from("/r/vms/dev/ga.sock"));
    }

    #[test]
    fn root_precedence() {
        let flag = PathBuf::from("/flag");
        assert_eq!(resolve_root(Some(&flag), Some("/env")), flag);
        assert_eq!(resolve_root(None, Some("/env")), PathBuf::from("/env"));
        assert_eq!(resolve_root(None, Some("")), default_root());
        assert!(resolve_root(None, None).ends_with(".vemu"));
    }

    #[test]
    fn guest_support_candidates_follow_install_prefix() {
        assert_eq!(
            guest_support_candidates(Path::new("/usr/local/bin/vemu")),
            vec![
                PathBuf::from("/usr/local/bin/guest-support"),
                PathBuf::from("/usr/local/share/vemu/guest-support"),
            ]
        );
    }

    #[test]
    fn installed_guest_support_wins_over_source_tree() {
        let prefix = tempfile::tempdir().unwrap();
        let installed = prefix.path().join("share/vemu/guest-support");
        std::fs::create_dir_all(&installed).unwrap();
        std::fs::write(installed.join("ga_init.sh"), "#!/bin/sh\n").unwrap();
        let exe = prefix.path().join("bin/vemu");

        assert_eq!(find_guest_support_dir(Some(&exe)), installed);
    }

    #[test]
    fn guest_support_falls_back_to_source_tree() {
        let prefix = tempfile::tempdir().unwrap();
        let exe = prefix.path().join("bin/vemu");
        let dir = find_guest_support_dir(Some(&exe));
        assert_eq!(dir, PathBuf::from(SOURCE_GUEST_SUPPORT_DIR));
        assert!(dir.join("ga_init.sh").is_file());
        assert_eq!(find_guest_support_dir(None), dir);
    }
}
