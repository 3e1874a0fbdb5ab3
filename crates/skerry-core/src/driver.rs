//! Hypervisor seam of the sandbox factory.

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::resources::SandboxResources;
use crate::sandbox::SandboxRecord;
use async_trait::async_trait;
use skerry_hyperstart::{Hyperstart, JsonHyperstart};
use skerry_vm::{VirtualMachine, VmBuilder};
use std::path::PathBuf;
use std::sync::Arc;

/// What the factory asks a driver to boot.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub name: String,
    /// Sandbox directory; sockets go here.
    pub dir: PathBuf,
    pub resources: SandboxResources,
}

/// A booted VM with its agent connected.
pub struct Launched {
    pub vmm_pid: u32,
    pub api_socket: PathBuf,
    pub vsock_uds: PathBuf,
    pub agent: Arc<dyn Hyperstart>,
}

/// Launches, reaches and tears down sandbox VMs.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Boot a VM and connect to its agent.
    ///
    /// On error nothing launched by this call is left running.
    async fn launch(&self, request: LaunchRequest) -> Result<Launched>;

    /// Connect to the agent of a running sandbox.
    async fn connect(&self, record: &SandboxRecord) -> Result<Arc<dyn Hyperstart>>;

    /// Whether the sandbox VM is still running.
    fn is_alive(&self, record: &SandboxRecord) -> bool;

    /// Stop the VM and remove its sockets.
    async fn teardown(&self, record: &SandboxRecord) -> Result<()>;
}

/// Production driver: one Firecracker VMM per sandbox.
#[derive(Debug, Clone)]
pub struct FirecrackerDriver {
    config: RuntimeConfig,
}

impl FirecrackerDriver {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SandboxDriver for FirecrackerDriver {
    async fn launch(&self, request: LaunchRequest) -> Result<Launched> {
        let vm = VmBuilder::new()
            .vcpus(request.resources.vcpus)
            .memory_mib(request.resources.memory_mib)
            .kernel(&self.config.kernel_path)
            .boot_args(self.config.boot_args.clone())
            .rootfs(&self.config.guest_image)
            .firecracker_path(&self.config.firecracker_path)
            .work_dir(&request.dir)
            .build(&request.name)
            .await?;

        let agent = match JsonHyperstart::connect(vm.vsock_uds_path(), self.config.agent_port, 0).await {
            Ok(agent) => agent,
            Err(e) => {
                tracing::error!(sandbox = %request.name, pid = vm.pid(), error = %e, "Agent unreachable, killing VMM");
                if let Err(kill) = VirtualMachine::kill(vm.pid()) {
                    tracing::error!(sandbox = %request.name, error = %kill, "Failed to kill VMM");
                }
                return Err(e.into());
            }
        };

        Ok(Launched {
            vmm_pid: vm.pid(),
            api_socket: vm.socket_path(),
            vsock_uds: vm.vsock_uds_path().to_path_buf(),
            agent: Arc::new(agent),
        })
    }

    async fn connect(&self, record: &SandboxRecord) -> Result<Arc<dyn Hyperstart>> {
        let agent = JsonHyperstart::connect(
            &record.vsock_uds,
            self.config.agent_port,
            record.last_stream_seq,
        )
        .await?;
        let agent: Arc<dyn Hyperstart> = Arc::new(agent);
        Ok(agent)
    }

    fn is_alive(&self, record: &SandboxRecord) -> bool {
        VirtualMachine::is_alive(record.vmm_pid)
    }

    async fn teardown(&self, record: &SandboxRecord) -> Result<()> {
        VirtualMachine::kill(record.vmm_pid)?;
        for socket in [&record.api_socket, &record.vsock_uds] {
            match tokio::fs::remove_file(socket).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(sandbox = %record.name, pid = record.vmm_pid, "VM torn down");
        Ok(())
    }
}
