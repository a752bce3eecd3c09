//! Base-image registry and the on-disk layout root.
//!
//! A `Context` is passed explicitly to everything that needs it; there is no
//! process-wide default instance.

use std::path::{Path, PathBuf};

use crate::error::VemuError;

/// One registry entry: a cloud image for a given logical name and architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    pub name: String,
    pub arch: String,
    pub url: String,
    pub digest: String,
}

/// A registry hit, with the local path the image is expected at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub path: PathBuf,
    pub url: String,
    pub digest: String,
}

struct Builtin {
    name: &'static str,
    arch: &'static str,
    url: &'static str,
    digest: &'static str,
}

const BUILTIN_IMAGES: &[Builtin] = &[
    Builtin {
        name: "ubuntu",
        arch: "amd64",
        url: "https://cloud-images.ubuntu.com/releases/noble/release-20250704/ubuntu-24.04-server-cloudimg-amd64.img",
        digest: "sha256:f1652d29d497fb7c623433705c9fca6525d1311b11294a0f495eed55c7639d1f",
    },
    Builtin {
        name: "ubuntu",
        arch: "aarch64",
        url: "https://cloud-images.ubuntu.com/releases/noble/release-20250704/ubuntu-24.04-server-cloudimg-arm64.img",
        digest: "sha256:bbecbb88100ee65497927ed0da247ba15af576a8855004182cf3c87265e25d35",
    },
];

/// The built-in image registry.
pub fn builtin_registry() -> Vec<BaseImage> {
    BUILTIN_IMAGES
        .iter()
        .map(|b| BaseImage {
            name: b.name.into(),
            arch: b.arch.into(),
            url: b.url.into(),
            digest: b.digest.into(),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Context {
    root: PathBuf,
    registry: Vec<BaseImage>,
}

impl Context {
    /// Context with the built-in registry.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_registry(root, builtin_registry())
    }

    pub fn with_registry(root: impl Into<PathBuf>, registry: Vec<BaseImage>) -> Self {
        Self {
            root: root.into(),
            registry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &[BaseImage] {
        &self.registry
    }

    /// `{root}/vms/{name}`. Does not create anything.
    pub fn path_for_vm(&self, name: &str) -> PathBuf {
        self.root.join("vms").join(name)
    }

    pub fn base_images_dir(&self) -> PathBuf {
        self.root.join("base-images")
    }

    /// Look up `(name, arch)` exactly. Architecture names are not normalized:
    /// `arm64` does not match an `aarch64` entry.
    pub fn resolve_base_image(&self, name: &str, arch: &str) -> Result<ResolvedImage, VemuError> {
        let image = self
            .registry
            .iter()
            .find(|img| img.name == name && img.arch == arch)
            .ok_or_else(|| VemuError::UnknownImage {
                name: name.to_string(),
                arch: arch.to_string(),
                known: self.known_images(),
            })?;

        Ok(ResolvedImage {
            path: self.base_images_dir().join(format!("{name}-{arch}.img")),
            url: image.url.clone(),
            digest: image.digest.clone(),
        })
    }

    fn known_images(&self) -> String {
        let known: Vec<String> = self
            .registry
            .iter()
            .map(|img| format!("{}/{}", img.name, img.arch))
            .collect();
        if known.is_empty() {
            "none".into()
        } else {
            known.join(", ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_builtin_ubuntu() {
        let ctx = Context::new("/var/vemu");
        let img = ctx.resolve_base_image("ubuntu", "amd64").unwrap();
        assert_eq!(img.path, PathBuf::from("/var/vemu/base-images/ubuntu-amd64.img"));
        assert!(img.url.ends_with("cloudimg-amd64.img"));
        assert!(img.digest.starts_with("sha256:"));
    }

    #[test]
    fn arch_names_are_not_normalized() {
        let ctx = Context::new("/var/vemu");
        let err = ctx.resolve_base_image("ubuntu", "arm64").unwrap_err();
        assert!(matches!(err, VemuError::UnknownImage { .. }));
        assert!(ctx.resolve_base_image("ubuntu", "aarch64").is_ok());
    }

    #[test]
    fn unknown_name_fails() {
        let ctx = Context::new("/var/vemu");
        let err = ctx.resolve_base_image("debian", "amd64").unwrap_err();
        match err {
            VemuError::UnknownImage { name, arch, known } => {
                assert_eq!(name, "debian");
                assert_eq!(arch, "amd64");
                assert!(known.contains("ubuntu/aarch64"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn custom_registry_replaces_builtin() {
        let ctx = Context::with_registry(
            "/r",
            vec![BaseImage {
                name: "alpine".into(),
                arch: "amd64".into(),
                url: "https://example.com/alpine.qcow2".into(),
                digest: "sha256:00".into(),
            }],
        );
        assert!(ctx.resolve_base_image("ubuntu", "amd64").is_err());
        assert!(ctx.resolve_base_image("alpine", "amd64").is_ok());
    }

    #[test]
    fn path_for_vm_is_pure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(dir.path());
        let vm_dir = ctx.path_for_vm("dev");
        assert_eq!(vm_dir, dir.path().join("vms").join("dev"));
        assert!(!vm_dir.exists());
    }
}
