//! Error types for skerry-core.

use skerry_hyperstart::HyperstartError;
use std::fmt;
use thiserror::Error;

/// Result type alias for skerry-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Coarse classification of a failure, for callers that only need to know
/// what went wrong in broad terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid bundle configuration.
    Config,
    /// The request cannot be honoured in the current host state.
    Precondition,
    /// A shared namespace or sandbox could not be resolved.
    Resolution,
    /// Creating, locking or persisting a sandbox failed.
    Resource,
    /// The guest agent rejected a call.
    Agent,
    /// The channel to the guest agent failed.
    Transport,
}

/// Errors that can occur while creating containers and sandboxes.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bundle configuration is missing or unusable
    #[error("config error: {0}")]
    Config(String),

    /// Request rejected before touching any sandbox
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// Shared namespace lookup failed
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// No live sandbox with this name
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    /// Sandbox creation, locking or persistence failed
    #[error("resource error: {0}")]
    Resource(String),

    /// Error from skerry-vm
    #[error("VM error: {0}")]
    Vm(#[from] skerry_vm::VmError),

    /// Error from the guest agent
    #[error(transparent)]
    Agent(#[from] HyperstartError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::Resolve(_) | Self::SandboxNotFound(_) => ErrorKind::Resolution,
            Self::Resource(_) | Self::Vm(_) | Self::Json(_) | Self::Io(_) => ErrorKind::Resource,
            Self::Agent(HyperstartError::Agent { .. }) => ErrorKind::Agent,
            Self::Agent(_) => ErrorKind::Transport,
        }
    }
}

/// Reasons a create request is refused up front.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("skerry should be run as root")]
    NotRoot,

    #[error("invalid container id: {0:?}")]
    InvalidId(String),

    #[error("container {0:?} exists")]
    AlreadyExists(String),

    #[error("only one of --console & --console-socket can be specified")]
    ConsoleConflict,

    #[error("--console[-socket] should be used on detached mode")]
    ConsoleWithAttach,

    #[error("--console[-socket] should be used on tty mode")]
    ConsoleWithoutTerminal,

    #[error("containers with a shared mount namespace are not supported")]
    UnsupportedSharing,
}

/// Failures of the shared-namespace lookup.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("malformed ns path: {0}")]
    MalformedPath(String),

    #[error("can't find container with pid {pid}")]
    NotFound { pid: u32 },

    #[error("namespace owned by more than one sandbox: {}", .sandboxes.join(", "))]
    Ambiguous { sandboxes: Vec<String> },

    #[error("failed to scan state root: {0}")]
    Io(#[from] std::io::Error),
}

/// Step of [`create_container`](crate::Orchestrator::create_container) that
/// failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SpecLoad,
    PrivilegeCheck,
    DuplicateId,
    ConsoleValidation,
    SandboxResolution,
    SandboxCreation,
    ContainerCreation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SpecLoad => "load spec",
            Self::PrivilegeCheck => "privilege check",
            Self::DuplicateId => "container id check",
            Self::ConsoleValidation => "console check",
            Self::SandboxResolution => "resolve sandbox",
            Self::SandboxCreation => "create sandbox",
            Self::ContainerCreation => "create container",
        };
        f.write_str(name)
    }
}

/// A failed create, tagged with the stage it failed in.
#[derive(Debug, Error)]
#[error("{stage}: {source}")]
pub struct CreateError {
    stage: Stage,
    #[source]
    source: CoreError,
}

impl CreateError {
    pub fn new(stage: Stage, source: impl Into<CoreError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    /// The underlying error.
    pub fn inner(&self) -> &CoreError {
        &self.source
    }
}
