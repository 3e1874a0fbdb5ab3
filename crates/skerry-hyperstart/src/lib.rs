//! skerry-hyperstart: host side of the guest agent protocol.
//!
//! Every skerry sandbox VM runs a Hyperstart agent that manages the pod and
//! its containers from inside the guest. This crate defines the
//! [`Hyperstart`] contract and two implementations:
//!
//! - [`JsonHyperstart`]: multiplexed JSON-RPC over Firecracker's vsock socket
//! - [`MemoryHyperstart`]: guest state kept in process, for tests
//!
//! # Example
//!
//! ```no_run
//! use skerry_hyperstart::{Hyperstart, JsonHyperstart, Pod};
//! use std::path::Path;
//!
//! # async fn example() -> skerry_hyperstart::Result<()> {
//! let agent = JsonHyperstart::connect(Path::new("/run/skerry/pod/v.sock"), 1024, 0).await?;
//! agent.start_sandbox(&Pod { hostname: "pod".into(), ..Default::default() }).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod client;
mod error;
mod hyperstart;
mod memory;
pub mod protocol;
mod streams;

pub use api::{Container, Interface, Pod, Process, Route, StreamKind, API_VERSION};
pub use client::JsonHyperstart;
pub use error::{HyperstartError, Result};
pub use hyperstart::Hyperstart;
pub use memory::MemoryHyperstart;
pub use nix::sys::signal::Signal;
