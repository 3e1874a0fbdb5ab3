//! The `create` operation.

use crate::config::RuntimeConfig;
use crate::driver::SandboxDriver;
use crate::error::{CoreError, CreateError, PreconditionError, ResolveError, Result, Stage};
use crate::factory::SandboxFactory;
use crate::locator::resolve_shared_sandbox;
use crate::pod::{container_for, pod_for, PodRole, INIT_PROCESS};
use crate::resources::derive_resources;
use crate::lock::SandboxLock;
use crate::sandbox::{Sandbox, SandboxRecord};
use crate::state::{validate_id, State, StateStore};
use chrono::Utc;
use oci_spec::runtime::{LinuxNamespace, LinuxNamespaceType, Spec};
use skerry_hyperstart::Signal;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// File name of the OCI configuration inside a bundle.
pub const SPEC_CONFIG: &str = "config.json";

/// Arguments of one create call.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub bundle: PathBuf,
    pub container_id: String,
    /// pty slave path for the container.
    pub console: Option<PathBuf>,
    /// Unix socket to send the pty master to.
    pub console_socket: Option<PathBuf>,
    /// Where to write the container pid.
    pub pid_file: Option<PathBuf>,
    /// The caller stays attached to the container's stdio.
    pub attach: bool,
}

/// Outcome of a successful create.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// The persisted state record.
    pub state: State,
    /// Sandbox the container lives in.
    pub sandbox: String,
    /// True if the sandbox was created by this call.
    pub new_sandbox: bool,
}

/// Creates containers, deciding whether each gets a new sandbox or joins
/// an existing one.
pub struct Orchestrator {
    config: RuntimeConfig,
    store: StateStore,
    factory: SandboxFactory,
    is_privileged: fn() -> bool,
}

impl Orchestrator {
    pub fn new(config: RuntimeConfig, driver: Arc<dyn SandboxDriver>) -> Self {
        let store = StateStore::new(config.root.clone());
        Self {
            factory: SandboxFactory::new(store.clone(), driver),
            store,
            config,
            is_privileged: || nix::unistd::geteuid().is_root(),
        }
    }

    /// Replace the effective-uid check.
    pub fn with_privilege_check(mut self, check: fn() -> bool) -> Self {
        self.is_privileged = check;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Create container `options.container_id` from its bundle.
    ///
    /// Either returns with the state record persisted, or fails leaving no
    /// new state record, no new sandbox and no lock held.
    pub async fn create_container(
        &self,
        options: CreateOptions,
    ) -> std::result::Result<Created, CreateError> {
        let start = Instant::now();
        let id = options.container_id.as_str();
        tracing::info!(container_id = %id, bundle = %options.bundle.display(), "Creating container");

        let (spec, bundle) =
            load_spec(&options.bundle).map_err(|e| CreateError::new(Stage::SpecLoad, e))?;

        if !(self.is_privileged)() {
            return Err(CreateError::new(Stage::PrivilegeCheck, PreconditionError::NotRoot));
        }

        self.check_id(id)
            .map_err(|e| CreateError::new(Stage::DuplicateId, e))?;

        check_console(&options, &spec)
            .map_err(|e| CreateError::new(Stage::ConsoleValidation, e))?;

        let shared = self
            .resolve_sandbox(&spec)
            .map_err(|e| CreateError::new(Stage::SandboxResolution, e))?;
        tracing::debug!(container_id = %id, shared = ?shared, "Sandbox resolved");

        let mut sandbox = match &shared {
            Some(name) => self.factory.join(name).await,
            None => self.new_sandbox(&spec, id).await,
        }
        .map_err(|e| CreateError::new(Stage::SandboxCreation, e))?;

        // A new sandbox already holds the lock of `<root>/<id>`; a joiner
        // claims it here, under the sandbox lock
        let claim = if sandbox.is_new() {
            None
        } else {
            match self.claim_member_id(id) {
                Ok(claim) => Some(claim),
                Err(e) => {
                    tracing::debug!(container_id = %id, sandbox = %sandbox.name(), error = %e, "Container id taken");
                    sandbox.release();
                    return Err(CreateError::new(Stage::DuplicateId, e));
                }
            }
        };

        let mut in_guest = false;
        let populated = self
            .populate(&mut sandbox, &spec, &options, &bundle, &mut in_guest)
            .await;
        match populated {
            Ok(state) => {
                let created = Created {
                    sandbox: sandbox.name().to_string(),
                    new_sandbox: sandbox.is_new(),
                    state,
                };
                if let Some(claim) = claim {
                    claim.discard();
                }
                sandbox.release();
                tracing::info!(
                    container_id = %id,
                    sandbox = %created.sandbox,
                    pid = created.state.pid,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Container created"
                );
                Ok(created)
            }
            Err(e) => {
                tracing::error!(container_id = %id, sandbox = %sandbox.name(), error = %e, "Container creation failed");
                if sandbox.is_new() {
                    sandbox.destroy(self.factory.driver().as_ref()).await;
                } else {
                    if in_guest {
                        self.rollback_member(&mut sandbox, id).await;
                    }
                    sandbox.release();
                }
                if let Some(claim) = claim {
                    claim.discard();
                }
                Err(CreateError::new(Stage::ContainerCreation, e))
            }
        }
    }

    fn check_id(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        if self.store.exists(id) {
            return Err(PreconditionError::AlreadyExists(id.to_string()).into());
        }
        Ok(())
    }

    /// Take the lock of `<root>/<id>` for a container joining an existing
    /// sandbox, and re-check the id while holding it.
    ///
    /// The lock is the one a new sandbox named `id` is created under, so a
    /// concurrent create of that sandbox and this join exclude each other.
    /// It is only tried: a holder means the id is being created elsewhere.
    fn claim_member_id(&self, id: &str) -> Result<SandboxLock> {
        let dir = self.store.dir(id);
        let Some(claim) = SandboxLock::try_acquire(&dir)? else {
            return Err(PreconditionError::AlreadyExists(id.to_string()).into());
        };
        if SandboxRecord::exists(&dir) {
            return Err(PreconditionError::AlreadyExists(id.to_string()).into());
        }
        if self.store.exists(id) {
            // A member's directory carries no lock file of its own
            claim.discard();
            return Err(PreconditionError::AlreadyExists(id.to_string()).into());
        }
        Ok(claim)
    }

    /// Name of the sandbox to join, or `None` for a new one.
    fn resolve_sandbox(&self, spec: &Spec) -> Result<Option<String>> {
        let namespaces: &[LinuxNamespace] = spec
            .linux()
            .as_ref()
            .and_then(|l| l.namespaces().as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();

        if namespaces
            .iter()
            .any(|ns| matches!(ns.typ(), LinuxNamespaceType::Mount) && shared_path(ns).is_some())
        {
            return Err(PreconditionError::UnsupportedSharing.into());
        }

        if let Some(role) = PodRole::from_spec(spec)? {
            return Ok(match role {
                PodRole::Sandbox => None,
                PodRole::Member(name) => Some(self.owner_of(&name)),
            });
        }

        let mut owners = BTreeSet::new();
        for ns in namespaces {
            if let Some(path) = shared_path(ns) {
                let found = resolve_shared_sandbox(&self.store, &path)?;
                owners.insert(self.owner_of(&found));
            }
        }
        if owners.len() > 1 {
            return Err(ResolveError::Ambiguous {
                sandboxes: owners.into_iter().collect(),
            }
            .into());
        }
        Ok(owners.into_iter().next())
    }

    /// Map a container name to the sandbox it lives in.
    fn owner_of(&self, name: &str) -> String {
        if !self.store.exists(name) {
            return name.to_string();
        }
        match self.store.load(name) {
            Ok(state) => state.owner().to_string(),
            Err(e) => {
                tracing::debug!(container_id = %name, error = %e, "Unreadable state, using name as sandbox");
                name.to_string()
            }
        }
    }

    async fn new_sandbox(&self, spec: &Spec, id: &str) -> Result<Sandbox> {
        let resources = derive_resources(spec, &self.config.resource_defaults());
        let sandbox = self.factory.create_and_lock(id, resources).await?;

        let pod = pod_for(spec, id);
        let started = sandbox.agent().start_sandbox(&pod).await;
        if let Err(e) = started {
            tracing::error!(sandbox = %id, error = %e, "Guest pod start failed");
            sandbox.destroy(self.factory.driver().as_ref()).await;
            return Err(e.into());
        }
        Ok(sandbox)
    }

    /// Start the container in the guest and persist it.
    ///
    /// `in_guest` is set once the guest has accepted the container.
    async fn populate(
        &self,
        sandbox: &mut Sandbox,
        spec: &Spec,
        options: &CreateOptions,
        bundle: &Path,
        in_guest: &mut bool,
    ) -> Result<State> {
        let id = options.container_id.as_str();
        let container = container_for(spec, id, bundle)?;
        sandbox.agent().new_container(&container).await?;
        *in_guest = true;

        sandbox.add_member(id)?;
        let state = State {
            id: id.to_string(),
            pid: sandbox.record().vmm_pid,
            sandbox: (!sandbox.is_new()).then(|| sandbox.name().to_string()),
            bundle: bundle.to_path_buf(),
            created: Utc::now(),
        };
        self.store.save(&state)?;

        if let Some(path) = &options.pid_file {
            write_pid_file(path, state.pid)?;
        }
        Ok(state)
    }

    /// Undo whatever `populate` did to a sandbox this call joined, once the
    /// guest has accepted the container.
    async fn rollback_member(&self, sandbox: &mut Sandbox, id: &str) {
        if let Err(e) = sandbox.agent().signal_process(id, INIT_PROCESS, Signal::SIGKILL).await {
            tracing::debug!(container_id = %id, error = %e, "No guest process to kill");
        }
        if let Err(e) = sandbox.remove_member(id) {
            tracing::error!(container_id = %id, sandbox = %sandbox.name(), error = %e, "Failed to drop sandbox member");
        }
        if let Err(e) = self.store.discard(id) {
            tracing::error!(container_id = %id, error = %e, "Failed to remove state record");
        }
    }
}

/// Load `<bundle>/config.json`. Returns the spec and the absolute bundle path.
fn load_spec(bundle: &Path) -> Result<(Spec, PathBuf)> {
    let bundle = std::fs::canonicalize(bundle)
        .map_err(|e| CoreError::Config(format!("bundle {}: {e}", bundle.display())))?;
    let spec = Spec::load(bundle.join(SPEC_CONFIG))
        .map_err(|e| CoreError::Config(format!("load config failed: {e}")))?;
    if spec.linux().is_none() {
        return Err(CoreError::Config("it is not linux container config".into()));
    }
    Ok((spec, bundle))
}

fn check_console(options: &CreateOptions, spec: &Spec) -> std::result::Result<(), PreconditionError> {
    let wants_console = options.console.is_some() || options.console_socket.is_some();
    if options.console.is_some() && options.console_socket.is_some() {
        return Err(PreconditionError::ConsoleConflict);
    }
    if wants_console && options.attach {
        return Err(PreconditionError::ConsoleWithAttach);
    }
    let terminal = spec
        .process()
        .as_ref()
        .and_then(|p| p.terminal().as_ref().copied())
        .unwrap_or(false);
    if wants_console && !terminal {
        return Err(PreconditionError::ConsoleWithoutTerminal);
    }
    Ok(())
}

fn shared_path(ns: &LinuxNamespace) -> Option<String> {
    ns.path()
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
}

fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    std::fs::write(path, pid.to_string())?;
    Ok(())
}
