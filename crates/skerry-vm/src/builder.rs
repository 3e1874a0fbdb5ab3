//! Fluent construction of a sandbox VM launch.

use crate::config::{MachineConfig, VsockConfig};
use crate::error::Result;
use crate::VirtualMachine;
use std::path::PathBuf;

/// Collects a [`MachineConfig`] and launches the VMM.
///
/// # Example
///
/// ```no_run
/// use skerry_vm::VmBuilder;
///
/// # async fn example() -> skerry_vm::Result<()> {
/// let vm = VmBuilder::new()
///     .vcpus(2)
///     .memory_mib(512)
///     .kernel("/var/lib/skerry/vmlinux")
///     .rootfs("/var/lib/skerry/hyperstart.ext4")
///     .work_dir("/run/skerry/pod-1")
///     .build("pod-1")
///     .await?;
/// println!("VMM pid {}", vm.pid());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct VmBuilder {
    config: MachineConfig,
}

impl Default for VmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VmBuilder {
    pub fn new() -> Self {
        Self {
            config: MachineConfig::default(),
        }
    }

    pub fn vcpus(mut self, count: u8) -> Self {
        self.config.vcpu_count = count;
        self
    }

    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.memory_mib = mib;
        self
    }

    /// Guest kernel image.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    pub fn boot_args(mut self, args: impl Into<String>) -> Self {
        self.config.boot_args = args.into();
        self
    }

    /// Guest image booting the agent.
    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_drive.path_on_host = path.into();
        self
    }

    pub fn vsock_cid(mut self, cid: u32) -> Self {
        self.config.vsock.guest_cid = cid;
        self
    }

    pub fn firecracker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.firecracker_path = path.into();
        self
    }

    /// Directory of the API and vsock sockets.
    pub fn work_dir(mut self, path: impl Into<PathBuf>) -> Self {
        let dir = path.into();
        self.config.vsock = VsockConfig::in_dir(self.config.vsock.guest_cid, &dir);
        self.config.work_dir = dir;
        self
    }

    /// The collected configuration, without launching anything.
    pub fn build_config(self) -> MachineConfig {
        self.config
    }

    /// Validate, spawn and boot the VMM for sandbox `name`.
    pub async fn build(self, name: &str) -> Result<VirtualMachine> {
        VirtualMachine::create(name, self.config).await
    }
}
