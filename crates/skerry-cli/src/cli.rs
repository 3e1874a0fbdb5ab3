//! Command line surface.

use clap::{Args, Parser, Subcommand};
use skerry_core::{CreateOptions, RuntimeConfig};
use std::path::PathBuf;

/// OCI runtime that runs every pod in its own Firecracker microVM.
#[derive(Debug, Parser)]
#[command(name = "skerry", version, about)]
pub struct Cli {
    /// Root directory for container state
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// vCPUs of a sandbox whose spec sets no CPU quota
    #[arg(long, global = true, value_name = "N")]
    pub default_cpus: Option<u8>,

    /// Memory of a sandbox whose spec sets no limit, in MiB
    #[arg(long, global = true, value_name = "MIB")]
    pub default_memory: Option<u32>,

    /// Guest kernel image
    #[arg(long, global = true, value_name = "PATH")]
    pub kernel: Option<PathBuf>,

    /// Guest root filesystem carrying the agent
    #[arg(long, global = true, value_name = "PATH")]
    pub guest_image: Option<PathBuf>,

    /// Firecracker binary
    #[arg(long, global = true, value_name = "PATH")]
    pub firecracker: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a container
    Create(CreateArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Container id, unique under the root
    pub id: String,

    /// Bundle directory holding config.json
    #[arg(short, long, default_value = ".", value_name = "DIR")]
    pub bundle: PathBuf,

    /// pty slave path for the container
    #[arg(long, value_name = "PATH")]
    pub console: Option<PathBuf>,

    /// Unix socket to receive the pty master
    #[arg(long, value_name = "PATH")]
    pub console_socket: Option<PathBuf>,

    /// File to write the container pid to
    #[arg(long, value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// Accepted for runc compatibility; has no effect
    #[arg(long)]
    pub no_pivot: bool,
}

impl Cli {
    /// Override `config` with the flags given.
    pub fn apply(&self, config: &mut RuntimeConfig) {
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(cpus) = self.default_cpus {
            config.default_vcpus = cpus;
        }
        if let Some(memory) = self.default_memory {
            config.default_memory_mib = memory;
        }
        if let Some(kernel) = &self.kernel {
            config.kernel_path = kernel.clone();
        }
        if let Some(image) = &self.guest_image {
            config.guest_image = image.clone();
        }
        if let Some(firecracker) = &self.firecracker {
            config.firecracker_path = firecracker.clone();
        }
    }
}

impl From<CreateArgs> for CreateOptions {
    fn from(args: CreateArgs) -> Self {
        Self {
            bundle: args.bundle,
            container_id: args.id,
            console: args.console,
            console_socket: args.console_socket,
            pid_file: args.pid_file,
            attach: false,
        }
    }
}
