use std::path::{Path, PathBuf};

use facet::Facet;

use crate::cloudinit::CloudConfigBuilder;
use crate::error::VemuError;
use crate::network::NetworkCard;
use crate::util::parse_disk_size;
use crate::vm::{HostTools, VmConfig};

#[derive(Debug, Clone, Facet)]
pub struct Config {
    pub name: String,
    #[facet(default = "amd64")]
    pub arch: String,
    #[facet(default = "ubuntu")]
    pub image: String,
    #[facet(default = 3072)]
    pub memory_mb: u64,
    #[facet(default = 2)]
    pub cpus: u32,
    #[facet(default = 1)]
    pub threads_per_core: u32,
    #[facet(default = "20G")]
    pub disk: String,
    #[facet(default = true)]
    pub guest_agent: bool,
    #[facet(default)]
    pub hypervisor: HypervisorConfig,
    #[facet(default)]
    pub cloud_init: CloudInitConfig,
    #[facet(default)]
    pub users: Vec<UserConfig>,
    #[facet(default)]
    pub network: Vec<NetworkCardConfig>,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct HypervisorConfig {
    #[facet(default = "/usr/bin/qemu-system-x86_64")]
    pub binary: String,
    #[facet(default = "/usr/share/OVMF/OVMF_CODE_4M.fd")]
    pub firmware: String,
    #[facet(default = "qemu-img")]
    pub qemu_img: String,
    #[facet(default = "genisoimage")]
    pub iso_tool: String,
    /// Directory bundled into the seed disk when the guest agent is on.
    /// Empty means the copy installed next to the binary
    /// (`<bin>/guest-support` or `<prefix>/share/vemu/guest-support`),
    /// falling back to the source tree vemu was built from.
    #[facet(default)]
    pub guest_support_dir: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        let tools = HostTools::default();
        Self {
            binary: tools.hypervisor,
            firmware: tools.firmware,
            qemu_img: tools.qemu_img,
            iso_tool: tools.iso_tool,
            guest_support_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct CloudInitConfig {
    /// Defaults to `vemu-<name>`.
    #[facet(default)]
    pub hostname: String,
    /// Defaults to the hostname.
    #[facet(default)]
    pub instance_id: String,
    #[facet(default = "Etc/UTC")]
    pub timezone: String,
}

impl Default for CloudInitConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            instance_id: String::new(),
            timezone: "Etc/UTC".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct UserConfig {
    pub name: String,
    #[facet(default)]
    pub sudoer: bool,
    #[facet(default)]
    pub ssh_keys: Vec<String>,
    pub uid: Option<u32>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct NetworkCardConfig {
    pub mode: String,
    pub netdev: String,
    pub mac: String,
    pub tap: Option<String>,
}

impl Config {
    pub fn hostname(&self) -> String {
        if self.cloud_init.hostname.is_empty() {
            format!("vemu-{}", self.name.replace('_', "-"))
        } else {
            self.cloud_init.hostname.clone()
        }
    }

    /// Resolve the network list into the closed `NetworkCard` type, in order.
    pub fn network_cards(&self) -> Result<Vec<NetworkCard>, VemuError> {
        self.network
            .iter()
            .map(|n| NetworkCard::from_mode(&n.mode, &n.netdev, &n.mac, n.tap.as_deref()))
            .collect()
    }

    pub fn to_vm_config(&self) -> Result<VmConfig, VemuError> {
        let h = &self.hypervisor;
        let tools = HostTools {
            hypervisor: h.binary.clone(),
            firmware: h.firmware.clone(),
            qemu_img: h.qemu_img.clone(),
            iso_tool: h.iso_tool.clone(),
            guest_support_dir: if h.guest_support_dir.is_empty() {
                HostTools::default().guest_support_dir
            } else {
                PathBuf::from(&h.guest_support_dir)
            },
        };

        Ok(VmConfig {
            name: self.name.clone(),
            arch: self.arch.clone(),
            image: self.image.clone(),
            memory_mb: self.memory_mb,
            cpu_count: self.cpus,
            threads_per_core: self.threads_per_core,
            disk_bytes: parse_disk_size(&self.disk)?,
            guest_agent_enabled: self.guest_agent,
            network_cards: self.network_cards()?,
            tools,
        })
    }

    /// A cloud-config builder seeded with the configured identity and users.
    pub fn cloud_config(&self) -> CloudConfigBuilder {
        let instance_id = Some(self.cloud_init.instance_id.clone()).filter(|id| !id.is_empty());
        let mut builder = CloudConfigBuilder::new(self.hostname(), instance_id);
        builder.set_timezone(self.cloud_init.timezone.clone());
        for user in &self.users {
            builder.add_user(&user.name, user.sudoer, &user.ssh_keys, user.uid);
        }
        builder
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), VemuError> {
    validate_name(&config.name)?;

    if config.cpus < 1 {
        return Err(VemuError::Validation {
            message: "cpus must be at least 1".into(),
        });
    }
    if config.threads_per_core < 1 {
        return Err(VemuError::Validation {
            message: "threads_per_core must be at least 1".into(),
        });
    }
    if config.memory_mb < 256 {
        return Err(VemuError::Validation {
            message: "memory_mb must be at least 256".into(),
        });
    }

    let disk = parse_disk_size(&config.disk)?;
    if disk == 0 {
        return Err(VemuError::Validation {
            message: "disk must be larger than zero".into(),
        });
    }

    for (idx, user) in config.users.iter().enumerate() {
        if user.name.is_empty() {
            return Err(VemuError::Validation {
                message: format!("users[{idx}]: name must not be empty"),
            });
        }
    }

    let mut seen_netdevs = std::collections::HashSet::new();
    for (idx, card) in config.network.iter().enumerate() {
        if card.netdev.is_empty() || card.mac.is_empty() {
            return Err(VemuError::Validation {
                message: format!("network[{idx}]: netdev and mac are required"),
            });
        }
        if !seen_netdevs.insert(card.netdev.as_str()) {
            return Err(VemuError::Validation {
                message: format!("network[{idx}]: duplicate netdev '{}'", card.netdev),
            });
        }
    }

    // Unknown network modes are rejected here, before anything touches disk.
    config.network_cards()?;

    validate_hostname(&config.hostname())?;
    validate_instance_id(&config.cloud_init.instance_id)?;

    Ok(())
}

fn validate_name(name: &str) -> Result<(), VemuError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        if name.is_empty() {
            return Err(VemuError::Validation {
                message: "name must not be empty".into(),
            });
        }
        return Err(VemuError::Validation {
            message: format!("name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

/// RFC 1123: dot-separated labels of letters, digits and inner hyphens.
fn validate_hostname(hostname: &str) -> Result<(), VemuError> {
    let label_ok = |label: &str| {
        (1..=63).contains(&label.len())
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    };
    if hostname.len() > 253 || !hostname.split('.').all(label_ok) {
        return Err(VemuError::Validation {
            message: format!("cloud_init.hostname {hostname:?} is not a valid RFC 1123 host name"),
        });
    }
    Ok(())
}

/// Empty means "same as the hostname".
fn validate_instance_id(instance_id: &str) -> Result<(), VemuError> {
    let valid = instance_id.len() <= 128
        && instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(VemuError::Validation {
            message: format!(
                "cloud_init.instance_id {instance_id:?} must match [a-zA-Z0-9._-]{{0,128}}"
            ),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn parse_config(contents: &str, origin: &Path) -> Result<Config, VemuError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| VemuError::ConfigParse {
        path: origin.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config, VemuError> {
    let contents = std::fs::read_to_string(path).map_err(|source| VemuError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents, path)
}
