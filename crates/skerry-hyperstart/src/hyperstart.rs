//! The guest agent contract.

use crate::api::{Container, Pod, Process, Route};
use crate::error::Result;
use async_trait::async_trait;
use nix::sys::signal::Signal;

/// Control channel to the in-guest agent of one sandbox.
///
/// Lifecycle calls are request/response. Stream reads and writes for
/// different processes may run concurrently on the same client.
///
/// While the guest is paused every call except [`pause_sync`],
/// [`unpause`], [`close`], [`wait_process`] and the stream reads fails with
/// [`HyperstartError::Paused`](crate::HyperstartError::Paused).
///
/// [`pause_sync`]: Hyperstart::pause_sync
/// [`unpause`]: Hyperstart::unpause
/// [`close`]: Hyperstart::close
/// [`wait_process`]: Hyperstart::wait_process
#[async_trait]
pub trait Hyperstart: Send + Sync {
    /// Drop the channel. Pending and later calls fail with
    /// [`HyperstartError::Closed`](crate::HyperstartError::Closed).
    async fn close(&self);

    /// Highest stream sequence number delivered so far.
    fn last_stream_seq(&self) -> u64;

    /// Pause the guest. Returns once no gated call is in flight and the
    /// guest reports it is quiescent.
    async fn pause_sync(&self) -> Result<()>;

    /// Resume a paused guest.
    async fn unpause(&self) -> Result<()>;

    /// Protocol version of the guest agent.
    async fn api_version(&self) -> Result<u32>;

    /// Create a container and start its primary process.
    async fn new_container(&self, container: &Container) -> Result<()>;

    /// Re-attach to a container that is already running in the guest.
    async fn restore_container(&self, container: &Container) -> Result<()>;

    /// Start a secondary process in an existing container.
    async fn add_process(&self, container: &str, process: &Process) -> Result<()>;

    /// Deliver a signal to a process.
    async fn signal_process(&self, container: &str, process: &str, signal: Signal) -> Result<()>;

    /// Block until the process exits and return its exit code.
    ///
    /// There is no timeout. Callers race it against their own cancellation.
    async fn wait_process(&self, container: &str, process: &str) -> Result<i32>;

    /// Write to the process's stdin. Returns the number of bytes accepted.
    async fn write_stdin(&self, container: &str, process: &str, data: &[u8]) -> Result<usize>;

    /// Read from the process's stdout. Returns 0 at end of stream.
    async fn read_stdout(&self, container: &str, process: &str, buf: &mut [u8]) -> Result<usize>;

    /// Read from the process's stderr. Returns 0 at end of stream.
    async fn read_stderr(&self, container: &str, process: &str, buf: &mut [u8]) -> Result<usize>;

    /// Signal end of input to the process.
    async fn close_stdin(&self, container: &str, process: &str) -> Result<()>;

    /// Resize the process's pseudo-terminal.
    async fn tty_win_resize(&self, container: &str, process: &str, row: u16, col: u16)
        -> Result<()>;

    /// Initialize the guest pod context. Only the first call succeeds.
    async fn start_sandbox(&self, pod: &Pod) -> Result<()>;

    /// Terminate every container and the agent itself. Irreversible.
    async fn destroy_sandbox(&self) -> Result<()>;

    /// Write a file inside a container's filesystem.
    async fn write_file(&self, container: &str, path: &str, data: &[u8]) -> Result<()>;

    /// Read a file from a container's filesystem.
    async fn read_file(&self, container: &str, path: &str) -> Result<Vec<u8>>;

    /// Install routing rules.
    async fn add_route(&self, routes: &[Route]) -> Result<()>;

    /// Set the address of a guest interface.
    async fn update_interface(&self, device: &str, ip: &str, mask: &str) -> Result<()>;

    /// Online CPUs and memory hot-plugged by the host.
    async fn online_cpu_mem(&self) -> Result<()>;
}
