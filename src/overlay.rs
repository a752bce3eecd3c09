use std::path::Path;

use crate::error::VemuError;
use crate::tool::{ToolInvocation, ToolRunner, check_status};

/// `qemu-img create` invocation for a qcow2 overlay of `size_bytes` backed by `base_image`.
pub fn overlay_invocation(
    qemu_img: &str,
    base_image: &Path,
    overlay_path: &Path,
    size_bytes: u64,
) -> ToolInvocation {
    ToolInvocation::new(qemu_img)
        .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
        .arg(base_image.display().to_string())
        .arg(overlay_path.display().to_string())
        .arg(size_bytes.to_string())
}

/// Create a qcow2 overlay backed by the given base image, then confirm the
/// file is really there.
pub async fn create_overlay<R: ToolRunner>(
    runner: &R,
    qemu_img: &str,
    base_image: &Path,
    overlay_path: &Path,
    size_bytes: u64,
) -> Result<(), VemuError> {
    if let Some(parent) = overlay_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VemuError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    let invocation = overlay_invocation(qemu_img, base_image, overlay_path, size_bytes);
    let output = runner.run(&invocation).await?;
    check_status(&invocation, &output)?;

    if !overlay_path.is_file() {
        return Err(VemuError::DiskCreationVerificationFailed {
            path: overlay_path.display().to_string(),
            command: invocation.command_line(),
        });
    }

    tracing::info!(path = %overlay_path.display(), size_bytes, "created qcow2 overlay");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::testing::RecordingRunner;

    #[test]
    fn invocation_matches_qemu_img_syntax() {
        let inv = overlay_invocation(
            "qemu-img",
            Path::new("/b/ubuntu-amd64.img"),
            Path::new("/v/diffdisk"),
            21474836480,
        );
        assert_eq!(
            inv.command_line(),
            "qemu-img create -f qcow2 -F qcow2 -b /b/ubuntu-amd64.img /v/diffdisk 21474836480"
        );
    }

    #[tokio::test]
    async fn zero_exit_without_file_is_a_verification_failure() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = dir.path().join("diffdisk");
        let runner = RecordingRunner::lying();

        let err = create_overlay(&runner, "qemu-img", Path::new("/b/base.img"), &overlay, 1024)
            .await
            .unwrap_err();

        match err {
            VemuError::DiskCreationVerificationFailed { path, command } => {
                assert_eq!(path, overlay.display().to_string());
                assert!(command.starts_with("qemu-img create"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn non_zero_exit_is_external_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = dir.path().join("diffdisk");
        let runner = RecordingRunner::failing(1);

        let err = create_overlay(&runner, "qemu-img", Path::new("/b/base.img"), &overlay, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, VemuError::ExternalCommand { .. }));
    }

    #[tokio::test]
    async fn creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = dir.path().join("nested").join("diffdisk");
        let runner = RecordingRunner::new();

        create_overlay(&runner, "qemu-img", Path::new("/b/base.img"), &overlay, 1024)
            .await
            .unwrap();
        assert!(overlay.is_file());
        assert_eq!(runner.call_count(), 1);
    }
}
