use crate::error::VemuError;

/// Private subnet handed to user-mode (slirp) networking.
pub const USER_NET_SUBNET: &str = "192.168.5.0/24";
/// First address the built-in DHCP server leases.
pub const USER_NET_DHCP_START: &str = "192.168.5.15";

/// A virtio NIC and the host-side backend it is wired to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCard {
    /// Bridged through an existing host tap interface.
    Tap {
        mac_address: String,
        netdev_id: String,
        host_tap: String,
    },
    /// User-mode networking inside the hypervisor process.
    User {
        mac_address: String,
        netdev_id: String,
    },
}

impl NetworkCard {
    pub fn tap(netdev_id: &str, mac_address: &str, host_tap: &str) -> Self {
        Self::Tap {
            mac_address: mac_address.into(),
            netdev_id: netdev_id.into(),
            host_tap: host_tap.into(),
        }
    }

    pub fn user(netdev_id: &str, mac_address: &str) -> Self {
        Self::User {
            mac_address: mac_address.into(),
            netdev_id: netdev_id.into(),
        }
    }

    /// Build a card from its textual tag. Unknown tags are rejected.
    pub fn from_mode(
        mode: &str,
        netdev_id: &str,
        mac_address: &str,
        host_tap: Option<&str>,
    ) -> Result<Self, VemuError> {
        match mode {
            "tap" => {
                let host_tap = host_tap.filter(|t| !t.is_empty()).ok_or_else(|| {
                    VemuError::Validation {
                        message: format!("tap network card '{netdev_id}' requires a host tap interface"),
                    }
                })?;
                Ok(Self::tap(netdev_id, mac_address, host_tap))
            }
            "user" => Ok(Self::user(netdev_id, mac_address)),
            other => Err(VemuError::UnsupportedNetworkMode {
                mode: other.to_string(),
            }),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Tap { .. } => "tap",
            Self::User { .. } => "user",
        }
    }

    pub fn netdev_id(&self) -> &str {
        match self {
            Self::Tap { netdev_id, .. } | Self::User { netdev_id, .. } => netdev_id,
        }
    }

    /// The `-device`/`-netdev` pair for this card.
    pub fn hypervisor_args(&self) -> Vec<String> {
        match self {
            Self::Tap {
                mac_address,
                netdev_id,
                host_tap,
            } => vec![
                "-device".into(),
                format!("virtio-net-pci,netdev={netdev_id},mac={mac_address}"),
                "-netdev".into(),
                format!("tap,id={netdev_id},ifname={host_tap},script=no,downscript=no"),
            ],
            Self::User {
                mac_address,
                netdev_id,
            } => vec![
                "-netdev".into(),
                format!(
                    "user,id={netdev_id},net={USER_NET_SUBNET},dhcpstart={USER_NET_DHCP_START}"
                ),
                "-device".into(),
                format!("virtio-net-pci,netdev={netdev_id},mac={mac_address}"),
            ],
        }
    }
}
