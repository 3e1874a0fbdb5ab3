//! Sandbox records and locked sandbox handles.

use crate::driver::SandboxDriver;
use crate::error::Result;
use crate::lock::SandboxLock;
use crate::state::{read_json, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skerry_hyperstart::Hyperstart;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the sandbox record inside its directory.
pub const RECORD_FILE: &str = "sandbox.json";

/// Persisted description of a running sandbox VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub name: String,
    /// Host pid of the Firecracker process.
    pub vmm_pid: u32,
    pub api_socket: PathBuf,
    /// Host side of the guest vsock device.
    pub vsock_uds: PathBuf,
    pub vcpus: u8,
    pub memory_mib: u32,
    /// Ids of the containers living in this sandbox.
    #[serde(default)]
    pub containers: Vec<String>,
    /// Stream high-water mark of the last agent connection.
    #[serde(default)]
    pub last_stream_seq: u64,
    pub created_at: DateTime<Utc>,
}

impl SandboxRecord {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(RECORD_FILE)
    }

    pub fn exists(dir: &Path) -> bool {
        Self::path(dir).is_file()
    }

    pub fn load(dir: &Path) -> Result<Self> {
        read_json(&Self::path(dir))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        write_json_atomic(&Self::path(dir), self)
    }
}

/// A sandbox held under its lock, with a connected guest agent.
///
/// Only the holder may mutate the sandbox. Dropping the handle releases
/// the lock without touching the VM; [`release`](Sandbox::release) also
/// saves the stream position for the next holder.
pub struct Sandbox {
    record: SandboxRecord,
    dir: PathBuf,
    agent: Arc<dyn Hyperstart>,
    lock: SandboxLock,
    created: bool,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("name", &self.record.name)
            .field("dir", &self.dir)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    pub(crate) fn new(
        record: SandboxRecord,
        dir: PathBuf,
        agent: Arc<dyn Hyperstart>,
        lock: SandboxLock,
        created: bool,
    ) -> Self {
        Self {
            record,
            dir,
            agent,
            lock,
            created,
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record(&self) -> &SandboxRecord {
        &self.record
    }

    /// Guest agent of this sandbox.
    pub fn agent(&self) -> &Arc<dyn Hyperstart> {
        &self.agent
    }

    /// True if this handle launched the VM rather than joining it.
    pub fn is_new(&self) -> bool {
        self.created
    }

    /// Record `id` as a member and persist the record.
    pub fn add_member(&mut self, id: &str) -> Result<()> {
        if self.record.containers.iter().any(|c| c == id) {
            return Ok(());
        }
        self.record.containers.push(id.to_string());
        if let Err(e) = self.record.save(&self.dir) {
            self.record.containers.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Drop `id` from the members and persist the record.
    pub fn remove_member(&mut self, id: &str) -> Result<()> {
        let before = self.record.containers.len();
        self.record.containers.retain(|c| c != id);
        if self.record.containers.len() == before {
            return Ok(());
        }
        self.record.save(&self.dir)
    }

    /// Save the stream position and release the lock. The VM keeps
    /// running and this handle's agent connection is dropped.
    pub fn release(mut self) {
        self.record.last_stream_seq = self.agent.last_stream_seq();
        if let Err(e) = self.record.save(&self.dir) {
            tracing::warn!(sandbox = %self.record.name, error = %e, "Failed to save sandbox record");
        }
        tracing::debug!(sandbox = %self.record.name, "Sandbox released");
    }

    /// Tear the sandbox down: stop the guest, kill the VM, remove its
    /// directory, then release the lock.
    ///
    /// Every step is attempted; failures are logged.
    pub async fn destroy(self, driver: &dyn SandboxDriver) {
        let name = self.record.name.clone();
        tracing::info!(sandbox = %name, pid = self.record.vmm_pid, "Destroying sandbox");

        if let Err(e) = self.agent.destroy_sandbox().await {
            tracing::warn!(sandbox = %name, error = %e, "Guest destroy failed");
        }
        self.agent.close().await;
        if let Err(e) = driver.teardown(&self.record).await {
            tracing::error!(sandbox = %name, error = %e, "VM teardown failed");
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(sandbox = %name, dir = %self.dir.display(), error = %e, "Failed to remove sandbox directory");
            }
        }
        drop(self.lock);
    }
}
