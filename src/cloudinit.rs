use std::path::{Path, PathBuf};

use facet_value::{VArray, Value, value};

use crate::error::VemuError;
use crate::tool::{ToolInvocation, ToolRunner};

/// First uid handed out to users added without an explicit one.
pub const FIRST_UID: u32 = 1001;

/// ISO volume label the NoCloud datasource looks for.
pub const SEED_VOLUME_LABEL: &str = "cidata";

const BOOT_SCRIPT_PATH: &str = "/var/lib/cloud/scripts/per-boot/00-vemu.boot.sh";

/// Mounts the seed disk by label and hands over to the bundled guest-agent script.
const BOOT_SCRIPT: &str = r#"#!/bin/sh
set -eux
LIMA_CIDATA_MNT="/mnt/lima-cidata"
LIMA_CIDATA_DEV="/dev/disk/by-label/cidata"
mkdir -p -m 700 "${LIMA_CIDATA_MNT}"
mount -o ro,mode=0700,dmode=0700,overriderockperm,exec,uid=0 "${LIMA_CIDATA_DEV}" "${LIMA_CIDATA_MNT}"
export LIMA_CIDATA_MNT
cd $LIMA_CIDATA_MNT
exec "${LIMA_CIDATA_MNT}"/ga_init.sh
"#;

// Placeholders are substituted by cloud-init, not by us.
const FINAL_MESSAGE: &str = "\
cloud-init has finished
version: $version
timestamp: $timestamp
datasource: $datasource
uptime: $uptime
";

/// A user entry in the rendered `users:` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudUser {
    pub name: String,
    pub uid: u32,
    pub home_dir: String,
    pub shell: String,
    pub lock_password: bool,
    pub sudo: Option<String>,
    pub ssh_authorized_keys: Option<Vec<String>>,
}

impl CloudUser {
    fn to_value(&self) -> Value {
        let uid = self.uid.to_string();
        let mut user = value!({
            "name": (self.name.as_str()),
            "uid": (uid.as_str()),
            "homedir": (self.home_dir.as_str()),
            "shell": (self.shell.as_str()),
            "lock_passwd": (self.lock_password),
        });

        if let Some(obj) = user.as_object_mut() {
            if let Some(rule) = &self.sudo {
                obj.insert("sudo", Value::from(rule.as_str()));
            }
            if let Some(keys) = &self.ssh_authorized_keys {
                let keys = VArray::from_iter(keys.iter().map(|k| Value::from(k.as_str())));
                obj.insert("ssh_authorized_keys", Value::from(keys));
            }
        }
        user
    }
}

/// Accumulates users and extra files, then renders the NoCloud documents
/// and authors the seed ISO.
#[derive(Debug, Clone)]
pub struct CloudConfigBuilder {
    users: Vec<CloudUser>,
    host_name: String,
    instance_id: String,
    timezone: String,
    included_files: Vec<PathBuf>,
    guest_agent: bool,
    next_uid: u32,
}

impl CloudConfigBuilder {
    /// `instance_id` defaults to the host name.
    pub fn new(host_name: impl Into<String>, instance_id: Option<String>) -> Self {
        let host_name = host_name.into();
        Self {
            users: Vec::new(),
            instance_id: instance_id.unwrap_or_else(|| host_name.clone()),
            host_name,
            timezone: "Etc/UTC".into(),
            included_files: Vec::new(),
            guest_agent: false,
            next_uid: FIRST_UID,
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn users(&self) -> &[CloudUser] {
        &self.users
    }

    pub fn included_files(&self) -> &[PathBuf] {
        &self.included_files
    }

    pub fn set_timezone(&mut self, timezone: impl Into<String>) {
        self.timezone = timezone.into();
    }

    /// Embed the per-boot script that launches the guest agent from the seed disk.
    pub fn set_guest_agent(&mut self, enabled: bool) {
        self.guest_agent = enabled;
    }

    /// Append a user. Without an explicit `uid` the next counter value is used;
    /// the counter only ever moves forward.
    ///
    /// Duplicate names are kept as-is in the rendered document.
    pub fn add_user(
        &mut self,
        name: &str,
        sudoer: bool,
        ssh_keys: &[String],
        uid: Option<u32>,
    ) -> CloudUser {
        let uid = uid.unwrap_or_else(|| {
            let uid = self.next_uid;
            self.next_uid += 1;
            uid
        });

        if self.users.iter().any(|u| u.name == name) {
            tracing::warn!(user = name, "duplicate cloud-init user name");
        }

        let user = CloudUser {
            name: name.to_string(),
            uid,
            home_dir: format!("/home/{name}"),
            shell: "/bin/bash".into(),
            lock_password: true,
            sudo: sudoer.then(|| "ALL=(ALL) NOPASSWD:ALL".to_string()),
            ssh_authorized_keys: (!ssh_keys.is_empty()).then(|| ssh_keys.to_vec()),
        };
        self.users.push(user.clone());
        user
    }

    /// Bundle an extra file or directory into the seed disk. Not checked
    /// until authoring.
    pub fn include_file(&mut self, path: impl Into<PathBuf>) {
        self.included_files.push(path.into());
    }

    /// NoCloud meta-data: exactly `instance-id` and `local-hostname`.
    pub fn render_meta_data(&self) -> Result<String, VemuError> {
        for (key, value) in [("instance-id", &self.instance_id), ("local-hostname", &self.host_name)] {
            if value.is_empty() || value.chars().any(char::is_control) {
                return Err(VemuError::Render {
                    message: format!("meta-data: invalid {key} {value:?}"),
                });
            }
        }

        let meta = value!({
            "instance-id": (self.instance_id.as_str()),
            "local-hostname": (self.host_name.as_str()),
        });
        let yaml = facet_yaml::to_string(&meta).map_err(|e| VemuError::Render {
            message: format!("meta-data: {e}"),
        })?;
        Ok(yaml.strip_prefix("---\n").unwrap_or(&yaml).to_string())
    }

    pub fn render_user_data(&self) -> Result<String, VemuError> {
        let users = VArray::from_iter(self.users.iter().map(CloudUser::to_value));

        let mut config = value!({
            "growpart": {
                "mode": "auto",
                "devices": ["/"],
            },
            "timezone": (self.timezone.as_str()),
            "users": (Value::from(users)),
        });

        if let Some(obj) = config.as_object_mut() {
            if self.guest_agent {
                let boot_script = value!({
                    "content": (BOOT_SCRIPT),
                    "owner": "root:root",
                    "path": (BOOT_SCRIPT_PATH),
                    "permissions": "0755",
                });
                obj.insert("write_files", Value::from(VArray::from_iter([boot_script])));
            }
            obj.insert("final_message", Value::from(FINAL_MESSAGE));
        }

        let yaml = facet_yaml::to_string(&config).map_err(|e| VemuError::Render {
            message: format!("user-data: {e}"),
        })?;
        // cloud-init wants the magic comment on the very first line, not a
        // document separator.
        let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
        Ok(format!("#cloud-config\n{yaml}"))
    }

    /// Write both documents to a private staging directory and run the ISO
    /// tool to produce `output_path`. Staging is removed whatever the outcome.
    pub async fn author_seed_disk<R: ToolRunner>(
        &self,
        runner: &R,
        iso_tool: &str,
        output_path: &Path,
    ) -> Result<(), VemuError> {
        let user_data = self.render_user_data()?;
        let meta_data = self.render_meta_data()?;

        let staging = tempfile::Builder::new()
            .prefix("vemu-seed-")
            .tempdir()
            .map_err(|e| VemuError::Io {
                context: "creating seed staging directory".into(),
                source: e,
            })?;

        let result = self
            .author_in(staging.path(), runner, iso_tool, output_path, &user_data, &meta_data)
            .await;

        let staging_path = staging.path().to_path_buf();
        if let Err(e) = staging.close() {
            tracing::warn!(path = %staging_path.display(), error = %e, "failed to remove seed staging directory");
        }

        result
    }

    async fn author_in<R: ToolRunner>(
        &self,
        staging: &Path,
        runner: &R,
        iso_tool: &str,
        output_path: &Path,
        user_data: &str,
        meta_data: &str,
    ) -> Result<(), VemuError> {
        let ci_path = staging.join("cidata");
        tokio::fs::create_dir_all(&ci_path)
            .await
            .map_err(|e| VemuError::Io {
                context: format!("creating directory {}", ci_path.display()),
                source: e,
            })?;

        let user_data_path = ci_path.join("user-data");
        let meta_data_path = ci_path.join("meta-data");
        for (path, contents) in [(&user_data_path, user_data), (&meta_data_path, meta_data)] {
            tokio::fs::write(path, contents)
                .await
                .map_err(|e| VemuError::Io {
                    context: format!("writing {}", path.display()),
                    source: e,
                })?;
        }

        let invocation = ToolInvocation::new(iso_tool)
            .args(["-r", "-J", "-V", SEED_VOLUME_LABEL, "-input-charset", "utf-8", "-o"])
            .arg(output_path.display().to_string())
            .arg(user_data_path.display().to_string())
            .arg(meta_data_path.display().to_string())
            .args(self.included_files.iter().map(|p| p.display().to_string()));

        let output = runner.run(&invocation).await.map_err(|e| VemuError::SeedAuthoringFailed {
            command: invocation.command_line(),
            message: e.to_string(),
        })?;

        if !output.success() {
            return Err(VemuError::SeedAuthoringFailed {
                command: invocation.command_line(),
                message: format!("{}: {}", output.status_label(), output.stderr.trim()),
            });
        }

        if !output_path.is_file() {
            return Err(VemuError::SeedAuthoringFailed {
                command: invocation.command_line(),
                message: format!("expected seed disk at {}", output_path.display()),
            });
        }

        tracing::info!(path = %output_path.display(), "authored cloud-init seed disk");
        Ok(())
    }
}
