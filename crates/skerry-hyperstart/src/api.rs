//! Guest-side entities exchanged with the agent.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Protocol version spoken by this client.
pub const API_VERSION: u32 = 4244;

/// A pod: the guest-side context every container of a sandbox lives in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    /// Guest hostname.
    pub hostname: String,
    /// Tag of the host directory shared into the guest.
    pub share_dir: String,
    /// Interfaces to configure at boot.
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    /// Routes to install at boot.
    #[serde(default)]
    pub routes: Vec<Route>,
    /// DNS servers for the guest resolver.
    #[serde(default)]
    pub dns: Vec<String>,
}

/// A container inside a pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Container id, unique within the pod.
    pub id: String,
    /// Root filesystem path, relative to the shared directory.
    pub rootfs: String,
    /// Image (shared-directory subtree) backing the rootfs.
    pub image: String,
    /// Default working directory of the container's processes.
    #[serde(default)]
    pub workdir: String,
    /// Kernel parameters applied inside the container.
    #[serde(default)]
    pub sysctl: HashMap<String, String>,
    /// Primary process.
    pub process: Process,
    /// Reattach to a container that already runs in the guest.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub restore: bool,
}

/// A process inside a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Process {
    /// Process id, unique within the container.
    pub id: String,
    /// argv.
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` pairs.
    #[serde(default)]
    pub envs: Vec<String>,
    /// Working directory.
    pub workdir: String,
    /// Allocate a pseudo-terminal.
    #[serde(default)]
    pub terminal: bool,
    /// User name or uid.
    #[serde(default)]
    pub user: String,
    /// Group name or gid.
    #[serde(default)]
    pub group: String,
    /// Supplementary groups.
    #[serde(default)]
    pub additional_groups: Vec<String>,
}

/// A guest network interface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub device: String,
    pub ip_address: String,
    pub net_mask: String,
}

/// A routing rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination network, `default` for the default route.
    pub dest: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub device: String,
}

/// Output stream of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}
