//! # skerry-core
//!
//! Container creation for skerry: every pod runs in its own Firecracker
//! microVM, and containers of the same pod join the VM of the pod's first
//! container.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  skerry-core (host)                      │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │  Orchestrator   │────▶│  StateStore              │    │
//! │  │ create_container│     │  <root>/<id>/state.json  │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ SandboxFactory  │────▶│  SandboxDriver           │    │
//! │  │ create_and_lock │     │  (Firecracker / memory)  │    │
//! │  │ join            │     └──────────────────────────┘    │
//! │  └─────────────────┘                                     │
//! │           │ flock(<root>/<sandbox>/sandbox.lock)         │
//! │           ▼                                              │
//! │  ┌─────────────────┐                                     │
//! │  │    Sandbox      │──── Hyperstart (vsock) ────────────▶│ guest
//! │  └─────────────────┘                                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use skerry_core::{CreateOptions, FirecrackerDriver, Orchestrator, RuntimeConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RuntimeConfig::from_env()?;
//! let driver = Arc::new(FirecrackerDriver::new(config.clone()));
//! let orchestrator = Orchestrator::new(config, driver);
//!
//! let created = orchestrator
//!     .create_container(CreateOptions {
//!         bundle: "/bundles/web".into(),
//!         container_id: "web".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("{} runs in sandbox {}", created.state.id, created.sandbox);
//! # Ok(())
//! # }
//! ```

mod config;
mod driver;
mod error;
mod factory;
mod locator;
mod lock;
mod memory;
mod namespace;
mod orchestrator;
mod pod;
mod resources;
mod sandbox;
mod state;

pub use config::{RuntimeConfig, DEFAULT_AGENT_PORT, DEFAULT_ROOT};
pub use driver::{FirecrackerDriver, LaunchRequest, Launched, SandboxDriver};
pub use error::{
    CoreError, CreateError, ErrorKind, PreconditionError, ResolveError, Result, Stage,
};
pub use factory::SandboxFactory;
pub use locator::resolve_shared_sandbox;
pub use lock::{SandboxLock, LOCK_FILE};
pub use memory::MemoryDriver;
pub use namespace::NsPath;
pub use orchestrator::{CreateOptions, Created, Orchestrator, SPEC_CONFIG};
pub use pod::{
    container_for, pod_for, PodRole, CONTAINER_TYPE, CRIO_CONTAINER_TYPE, CRIO_SANDBOX_NAME,
    INIT_PROCESS, SANDBOX_NAME, SHARE_DIR,
};
pub use resources::{derive_resources, ResourceDefaults, SandboxResources};
pub use sandbox::{Sandbox, SandboxRecord, RECORD_FILE};
pub use state::{validate_id, State, StateStore, STATE_FILE};
