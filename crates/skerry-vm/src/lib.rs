//! # skerry-vm
//!
//! MicroVM launch layer for skerry sandboxes.
//!
//! Spawns a Firecracker VMM per sandbox and configures it over its API
//! socket. The VMM outlives the process that launched it; later runtime
//! invocations address it by host pid.
//!
//! ## Quick Start
//!
//! ```no_run
//! use skerry_vm::{VirtualMachine, VmBuilder};
//!
//! # async fn example() -> skerry_vm::Result<()> {
//! let vm = VmBuilder::new()
//!     .vcpus(2)
//!     .memory_mib(256)
//!     .kernel("/var/lib/skerry/vmlinux")
//!     .rootfs("/var/lib/skerry/hyperstart.ext4")
//!     .work_dir("/run/skerry/pod-1")
//!     .build("pod-1")
//!     .await?;
//!
//! assert!(VirtualMachine::is_alive(vm.pid()));
//! VirtualMachine::kill(vm.pid())?;
//! # Ok(())
//! # }
//! ```

mod api;
mod builder;
mod config;
mod error;
mod machine;

pub use builder::VmBuilder;
pub use config::{DriveConfig, MachineConfig, VsockConfig, API_SOCKET_NAME, VSOCK_SOCKET_NAME};
pub use error::{Result, VmError};
pub use machine::VirtualMachine;
