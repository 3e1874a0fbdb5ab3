//! Error types for skerry-vm.

use thiserror::Error;

/// Result type alias for skerry-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur during VM operations.
#[derive(Debug, Error)]
pub enum VmError {
    /// Failed to spawn or configure the VMM
    #[error("failed to create VM: {0}")]
    Create(String),

    /// Failed to boot the guest
    #[error("failed to start VM: {0}")]
    Start(String),

    /// Failed to stop the VMM process
    #[error("failed to stop VM: {0}")]
    Stop(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Firecracker API rejected a request
    #[error("firecracker API error: {0}")]
    Api(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for operation
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}
