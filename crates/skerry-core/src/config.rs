//! Runtime configuration.

use crate::error::CoreError;
use crate::resources::ResourceDefaults;
use std::path::PathBuf;

/// Default directory for container state and sandbox sockets.
pub const DEFAULT_ROOT: &str = "/run/skerry";

/// Default vsock port the guest agent listens on.
pub const DEFAULT_AGENT_PORT: u32 = 1024;

/// Settings shared by every command of one runtime invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// State root: `<root>/<id>/state.json` per container.
    pub root: PathBuf,
    /// vCPUs for a sandbox whose spec sets no CPU quota (default: 1).
    pub default_vcpus: u8,
    /// Memory in MiB for a sandbox whose spec sets no limit (default: 128).
    pub default_memory_mib: u32,
    /// Guest kernel image.
    pub kernel_path: PathBuf,
    /// Guest root filesystem carrying the agent.
    pub guest_image: PathBuf,
    /// Firecracker binary.
    pub firecracker_path: PathBuf,
    /// Kernel command line.
    pub boot_args: String,
    /// vsock port of the guest agent.
    pub agent_port: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let machine = skerry_vm::MachineConfig::default();
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            default_vcpus: machine.vcpu_count,
            default_memory_mib: machine.memory_mib,
            kernel_path: machine.kernel_path,
            guest_image: machine.root_drive.path_on_host,
            firecracker_path: machine.firecracker_path,
            boot_args: machine.boot_args,
            agent_port: DEFAULT_AGENT_PORT,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `SKERRY_*` environment variables.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let mut config = Self::default();
        if let Some(root) = lookup("SKERRY_ROOT") {
            config.root = PathBuf::from(root);
        }
        if let Some(cpus) = lookup("SKERRY_DEFAULT_CPUS") {
            config.default_vcpus = parse("SKERRY_DEFAULT_CPUS", &cpus)?;
        }
        if let Some(memory) = lookup("SKERRY_DEFAULT_MEMORY") {
            config.default_memory_mib = parse("SKERRY_DEFAULT_MEMORY", &memory)?;
        }
        if let Some(kernel) = lookup("SKERRY_KERNEL") {
            config.kernel_path = PathBuf::from(kernel);
        }
        if let Some(image) = lookup("SKERRY_GUEST_IMAGE") {
            config.guest_image = PathBuf::from(image);
        }
        if let Some(firecracker) = lookup("SKERRY_FIRECRACKER") {
            config.firecracker_path = PathBuf::from(firecracker);
        }
        if let Some(port) = lookup("SKERRY_AGENT_PORT") {
            config.agent_port = parse("SKERRY_AGENT_PORT", &port)?;
        }
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.root.as_os_str().is_empty() {
            return Err(CoreError::Config("root is required".into()));
        }
        if self.default_vcpus == 0 {
            return Err(CoreError::Config("default_vcpus must be > 0".into()));
        }
        if self.default_memory_mib == 0 {
            return Err(CoreError::Config("default_memory_mib must be > 0".into()));
        }
        if self.agent_port == 0 {
            return Err(CoreError::Config("agent_port must be > 0".into()));
        }
        Ok(())
    }

    /// Sizing used when a spec carries no limits.
    pub fn resource_defaults(&self) -> ResourceDefaults {
        ResourceDefaults {
            vcpus: self.default_vcpus,
            memory_mib: self.default_memory_mib,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, CoreError> {
    value
        .trim()
        .parse()
        .map_err(|_| CoreError::Config(format!("invalid value for {key}: {value:?}")))
}
