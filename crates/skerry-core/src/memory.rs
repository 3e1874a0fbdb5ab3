//! Sandbox driver without a hypervisor.
//!
//! Every "VM" is a [`MemoryHyperstart`] keyed by sandbox name with a
//! made-up pid. Used to exercise the factory and orchestrator in tests.

use crate::driver::{LaunchRequest, Launched, SandboxDriver};
use crate::error::{CoreError, Result};
use crate::sandbox::SandboxRecord;
use async_trait::async_trait;
use skerry_hyperstart::{Hyperstart, MemoryHyperstart};
use skerry_vm::{API_SOCKET_NAME, VSOCK_SOCKET_NAME};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// First pid handed out; far above anything a test host runs.
const FIRST_PID: u32 = 3_000_000;

#[derive(Default)]
struct Inner {
    next_pid: u32,
    guests: HashMap<String, Arc<MemoryHyperstart>>,
    alive: HashSet<u32>,
    launches: usize,
    torn_down: Vec<String>,
    fail_launch: Option<String>,
    launch_delay: Option<Duration>,
}

/// A [`SandboxDriver`] whose VMs live in memory.
#[derive(Default)]
pub struct MemoryDriver {
    inner: Mutex<Inner>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Guest of the sandbox called `name`, if one was launched.
    pub fn guest(&self, name: &str) -> Option<Arc<MemoryHyperstart>> {
        self.lock().guests.get(name).cloned()
    }

    /// Number of launch attempts, failed ones included.
    pub fn launches(&self) -> usize {
        self.lock().launches
    }

    /// Number of VMs currently running.
    pub fn running(&self) -> usize {
        self.lock().alive.len()
    }

    /// Names of torn down sandboxes, in order.
    pub fn torn_down(&self) -> Vec<String> {
        self.lock().torn_down.clone()
    }

    /// Make every later launch fail with `message`.
    pub fn fail_launches(&self, message: &str) {
        self.lock().fail_launch = Some(message.to_string());
    }

    /// Let launches succeed again.
    pub fn heal(&self) {
        self.lock().fail_launch = None;
    }

    /// Sleep this long inside every launch.
    pub fn set_launch_delay(&self, delay: Duration) {
        self.lock().launch_delay = Some(delay);
    }

    /// Simulate the VMM of `name` dying.
    pub fn crash(&self, name: &str, pid: u32) {
        let mut inner = self.lock();
        inner.alive.remove(&pid);
        inner.guests.remove(name);
    }
}

#[async_trait]
impl SandboxDriver for MemoryDriver {
    async fn launch(&self, request: LaunchRequest) -> Result<Launched> {
        let delay = {
            let mut inner = self.lock();
            inner.launches += 1;
            if let Some(message) = &inner.fail_launch {
                return Err(CoreError::Resource(message.clone()));
            }
            inner.launch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let guest = Arc::new(MemoryHyperstart::new());
        let mut inner = self.lock();
        let pid = FIRST_PID + inner.next_pid;
        inner.next_pid += 1;
        inner.alive.insert(pid);
        inner.guests.insert(request.name.clone(), guest.clone());
        tracing::debug!(sandbox = %request.name, pid, "Launched in-memory sandbox");

        Ok(Launched {
            vmm_pid: pid,
            api_socket: request.dir.join(API_SOCKET_NAME),
            vsock_uds: request.dir.join(VSOCK_SOCKET_NAME),
            agent: guest,
        })
    }

    async fn connect(&self, record: &SandboxRecord) -> Result<Arc<dyn Hyperstart>> {
        let guest: Arc<dyn Hyperstart> = self.guest(&record.name).ok_or_else(|| {
            CoreError::Agent(skerry_hyperstart::HyperstartError::Transport(format!(
                "no guest behind {}",
                record.vsock_uds.display()
            )))
        })?;
        Ok(guest)
    }

    fn is_alive(&self, record: &SandboxRecord) -> bool {
        self.lock().alive.contains(&record.vmm_pid)
    }

    async fn teardown(&self, record: &SandboxRecord) -> Result<()> {
        let mut inner = self.lock();
        inner.alive.remove(&record.vmm_pid);
        inner.guests.remove(&record.name);
        inner.torn_down.push(record.name.clone());
        Ok(())
    }
}
