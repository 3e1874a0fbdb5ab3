//! VirtualMachine type - a Firecracker VMM process hosting one sandbox.

use crate::api;
use crate::config::MachineConfig;
use crate::error::{Result, VmError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

/// How long to wait for the VMM to create its API socket.
const API_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between API socket polls.
const API_SOCKET_POLL: Duration = Duration::from_millis(10);

/// Longest instance id Firecracker accepts.
const MAX_ID_LEN: usize = 64;

/// A booted MicroVM.
///
/// The VMM process is not tied to this handle's lifetime. Later runtime
/// invocations address it by pid via [`VirtualMachine::is_alive`] and
/// [`VirtualMachine::kill`].
#[derive(Debug)]
pub struct VirtualMachine {
    /// Sandbox name this VM hosts
    name: String,
    /// Configuration used to create this VM
    config: MachineConfig,
    /// Host pid of the Firecracker process
    pid: u32,
}

impl VirtualMachine {
    /// Spawn a VMM, configure it and boot the guest.
    ///
    /// This will:
    /// 1. Spawn Firecracker with its API socket in `config.work_dir`
    /// 2. Wait for the API socket to appear
    /// 3. Configure machine resources, boot source, root drive and vsock
    /// 4. Start the instance
    ///
    /// A VMM spawned by a failed call is killed before returning.
    pub async fn create(name: &str, config: MachineConfig) -> Result<Self> {
        config.validate()?;

        let start = Instant::now();
        let socket_path = config.api_socket();
        tracing::info!(
            sandbox = %name,
            vcpus = config.vcpu_count,
            memory_mib = config.memory_mib,
            "Launching VMM"
        );

        tokio::fs::create_dir_all(&config.work_dir).await?;
        // Stale sockets from a previous VMM would make Firecracker refuse to start
        remove_if_exists(&socket_path).await?;
        remove_if_exists(&config.vsock.uds_path).await?;

        let mut child = Command::new(&config.firecracker_path)
            .arg("--api-sock")
            .arg(&socket_path)
            .arg("--id")
            .arg(vmm_id(name))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| {
                VmError::Create(format!(
                    "failed to spawn {}: {e}",
                    config.firecracker_path.display()
                ))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| VmError::Create("VMM exited before reporting a pid".into()))?;
        tracing::debug!(sandbox = %name, pid, "VMM spawned");

        if let Err(e) = Self::configure_and_boot(&mut child, &config).await {
            tracing::error!(sandbox = %name, pid, error = %e, "VM boot failed, killing VMM");
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = remove_if_exists(&socket_path).await;
            let _ = remove_if_exists(&config.vsock.uds_path).await;
            return Err(e);
        }

        tracing::info!(
            sandbox = %name,
            pid,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "MicroVM started"
        );

        Ok(Self {
            name: name.to_string(),
            config,
            pid,
        })
    }

    async fn configure_and_boot(child: &mut Child, config: &MachineConfig) -> Result<()> {
        let socket_path = config.api_socket();
        wait_for_socket(child, &socket_path).await?;

        api::configure_machine(&socket_path, config.vcpu_count, config.memory_mib).await?;
        api::configure_boot_source(&socket_path, &config.kernel_path, &config.boot_args).await?;
        api::configure_drive(&socket_path, &config.root_drive).await?;
        // vsock must be configured before the instance starts
        api::configure_vsock(&socket_path, &config.vsock).await?;
        api::start_instance(&socket_path).await
    }

    /// Sandbox name this VM hosts.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host pid of the VMM process.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Get the configuration used to create this VM.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Path to the Firecracker API socket.
    pub fn socket_path(&self) -> PathBuf {
        self.config.api_socket()
    }

    /// Host side of the vsock device, used to reach the guest agent.
    pub fn vsock_uds_path(&self) -> &Path {
        &self.config.vsock.uds_path
    }

    /// Check whether the VMM with host pid `pid` is still running.
    pub fn is_alive(pid: u32) -> bool {
        // 0 and negative values address process groups
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw == 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None::<Signal>) {
            Ok(()) => true,
            // Exists but owned by someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Force kill the VMM with host pid `pid`.
    ///
    /// An already exited VMM is not an error.
    pub fn kill(pid: u32) -> Result<()> {
        let raw = i32::try_from(pid)
            .ok()
            .filter(|raw| *raw > 0)
            .ok_or_else(|| VmError::Stop(format!("pid {pid} out of range")))?;
        tracing::warn!(pid, "Force killing VMM");
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(VmError::Stop(format!("kill {pid} failed: {e}"))),
        }
    }
}

/// Firecracker instance id for sandbox `name`: at most 64 alphanumerics
/// and hyphens.
fn vmm_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(MAX_ID_LEN)
        .collect()
}

/// Poll until the VMM has created its API socket.
async fn wait_for_socket(child: &mut Child, socket_path: &Path) -> Result<()> {
    let start = Instant::now();
    loop {
        if tokio::fs::try_exists(socket_path).await.unwrap_or(false) {
            tracing::trace!(
                socket = %socket_path.display(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "API socket ready"
            );
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            return Err(VmError::Create(format!("VMM exited early: {status}")));
        }
        if start.elapsed() >= API_SOCKET_TIMEOUT {
            return Err(VmError::Timeout(API_SOCKET_TIMEOUT));
        }
        tokio::time::sleep(API_SOCKET_POLL).await;
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
