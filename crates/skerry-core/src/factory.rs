//! Creating and joining sandboxes under their lock.

use crate::driver::{LaunchRequest, SandboxDriver};
use crate::error::{CoreError, PreconditionError, Result};
use crate::lock::SandboxLock;
use crate::resources::SandboxResources;
use crate::sandbox::{Sandbox, SandboxRecord};
use crate::state::{validate_id, StateStore};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Hands out locked sandboxes.
#[derive(Clone)]
pub struct SandboxFactory {
    store: StateStore,
    driver: Arc<dyn SandboxDriver>,
}

impl SandboxFactory {
    pub fn new(store: StateStore, driver: Arc<dyn SandboxDriver>) -> Self {
        Self { store, driver }
    }

    pub fn driver(&self) -> &Arc<dyn SandboxDriver> {
        &self.driver
    }

    /// Directory of the sandbox called `name`.
    pub fn sandbox_dir(&self, name: &str) -> PathBuf {
        self.store.dir(name)
    }

    /// Launch a new sandbox called `name` and return it locked.
    ///
    /// Fails with [`PreconditionError::AlreadyExists`] if the name is taken,
    /// e.g. by a concurrent creator that got the lock first. Any later
    /// failure leaves no VM and no directory behind.
    pub async fn create_and_lock(&self, name: &str, resources: SandboxResources) -> Result<Sandbox> {
        validate_id(name)?;
        let start = Instant::now();
        let dir = self.sandbox_dir(name);

        let lock = SandboxLock::acquire(&dir)
            .await
            .map_err(|e| CoreError::Resource(format!("failed to lock sandbox {name}: {e}")))?;

        if SandboxRecord::exists(&dir) || self.store.exists(name) {
            tracing::debug!(sandbox = %name, "Sandbox name already taken");
            return Err(PreconditionError::AlreadyExists(name.to_string()).into());
        }

        tracing::info!(
            sandbox = %name,
            vcpus = resources.vcpus,
            memory_mib = resources.memory_mib,
            "Creating sandbox"
        );
        let request = LaunchRequest {
            name: name.to_string(),
            dir: dir.clone(),
            resources,
        };
        let launched = match self.driver.launch(request).await {
            Ok(launched) => launched,
            Err(e) => {
                tracing::error!(sandbox = %name, error = %e, "Sandbox launch failed");
                remove_dir(&dir).await;
                drop(lock);
                return Err(CoreError::Resource(format!(
                    "failed to launch sandbox {name}: {e}"
                )));
            }
        };

        let record = SandboxRecord {
            name: name.to_string(),
            vmm_pid: launched.vmm_pid,
            api_socket: launched.api_socket,
            vsock_uds: launched.vsock_uds,
            vcpus: resources.vcpus,
            memory_mib: resources.memory_mib,
            containers: Vec::new(),
            last_stream_seq: 0,
            created_at: Utc::now(),
        };
        if let Err(e) = record.save(&dir) {
            tracing::error!(sandbox = %name, error = %e, "Failed to persist sandbox record");
            launched.agent.close().await;
            if let Err(e) = self.driver.teardown(&record).await {
                tracing::error!(sandbox = %name, error = %e, "VM teardown failed");
            }
            remove_dir(&dir).await;
            drop(lock);
            return Err(CoreError::Resource(format!(
                "failed to persist sandbox {name}: {e}"
            )));
        }

        tracing::info!(
            sandbox = %name,
            pid = record.vmm_pid,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox created"
        );
        Ok(Sandbox::new(record, dir, launched.agent, lock, true))
    }

    /// Lock the existing sandbox `name` and connect to its agent.
    ///
    /// Waits behind any concurrent holder. Fails with
    /// [`CoreError::SandboxNotFound`] if there is no record or the VM is
    /// gone.
    pub async fn join(&self, name: &str) -> Result<Sandbox> {
        validate_id(name)?;
        let dir = self.sandbox_dir(name);
        if !SandboxRecord::exists(&dir) {
            return Err(CoreError::SandboxNotFound(name.to_string()));
        }

        let lock = SandboxLock::acquire(&dir)
            .await
            .map_err(|e| CoreError::Resource(format!("failed to lock sandbox {name}: {e}")))?;

        // The sandbox may have been torn down while we waited
        let record = match SandboxRecord::load(&dir) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(sandbox = %name, error = %e, "Sandbox record gone after locking");
                lock.discard();
                return Err(CoreError::SandboxNotFound(name.to_string()));
            }
        };
        if !self.driver.is_alive(&record) {
            tracing::warn!(sandbox = %name, pid = record.vmm_pid, "Sandbox VMM is not running");
            return Err(CoreError::SandboxNotFound(name.to_string()));
        }

        let agent = self.driver.connect(&record).await?;
        tracing::debug!(sandbox = %name, pid = record.vmm_pid, "Joined sandbox");
        Ok(Sandbox::new(record, dir, agent, lock, false))
    }
}

async fn remove_dir(dir: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::error!(dir = %dir.display(), error = %e, "Failed to remove sandbox directory");
        }
    }
}
