//! What a sandbox VM is launched with.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the Firecracker API socket inside a VM's work directory.
pub const API_SOCKET_NAME: &str = "firecracker.socket";

/// Name of the host side of the vsock device inside a VM's work directory.
pub const VSOCK_SOCKET_NAME: &str = "v.sock";

/// Upper vCPU bound accepted by Firecracker.
const MAX_VCPUS: u8 = 32;

/// Lowest guest CID that is not reserved for the hypervisor or host.
const MIN_GUEST_CID: u32 = 3;

/// Launch parameters of one sandbox VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub memory_mib: u32,
    /// Guest kernel (uncompressed vmlinux).
    pub kernel_path: PathBuf,
    pub boot_args: String,
    /// Guest image that boots into the Hyperstart agent.
    pub root_drive: DriveConfig,
    /// Agent channel.
    pub vsock: VsockConfig,
    pub firecracker_path: PathBuf,
    /// Holds the API and vsock sockets; the sandbox directory.
    pub work_dir: PathBuf,
}

impl Default for MachineConfig {
    fn default() -> Self {
        let work_dir = PathBuf::from("/run/skerry/vm");
        Self {
            vcpu_count: 1,
            memory_mib: 128,
            kernel_path: PathBuf::from("/var/lib/skerry/vmlinux"),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".into(),
            root_drive: DriveConfig::default(),
            vsock: VsockConfig::in_dir(MIN_GUEST_CID, &work_dir),
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            work_dir,
        }
    }
}

impl MachineConfig {
    /// Reject configurations Firecracker would refuse at boot.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_VCPUS).contains(&self.vcpu_count) {
            return Err(VmError::Config(format!(
                "vcpu_count {} outside 1..={MAX_VCPUS}",
                self.vcpu_count
            )));
        }
        if self.memory_mib == 0 {
            return Err(VmError::Config("memory_mib must be > 0".into()));
        }
        if self.vsock.guest_cid < MIN_GUEST_CID {
            return Err(VmError::Config(format!(
                "guest cid {} is reserved",
                self.vsock.guest_cid
            )));
        }
        if self.kernel_path.as_os_str().is_empty() {
            return Err(VmError::Config("kernel_path is required".into()));
        }
        Ok(())
    }

    pub fn api_socket(&self) -> PathBuf {
        self.work_dir.join(API_SOCKET_NAME)
    }
}

/// A block device attached before boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            drive_id: "rootfs".into(),
            path_on_host: PathBuf::from("/var/lib/skerry/hyperstart.ext4"),
            is_root_device: true,
            is_read_only: true,
        }
    }
}

/// The virtio-vsock device. Host connections go through `uds_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsockConfig {
    pub guest_cid: u32,
    pub uds_path: PathBuf,
}

impl VsockConfig {
    /// Device with CID `cid` whose socket lives in `dir`.
    pub fn in_dir(cid: u32, dir: &Path) -> Self {
        Self {
            guest_cid: cid,
            uds_path: dir.join(VSOCK_SOCKET_NAME),
        }
    }
}
