//! Pod grouping and guest-side descriptions of a bundle.

use crate::error::CoreError;
use oci_spec::runtime::Spec;
use skerry_hyperstart::{Container, Pod, Process};
use std::path::Path;

pub const CONTAINER_TYPE: &str = "ocid/container_type";
pub const SANDBOX_NAME: &str = "ocid/sandbox_name";
pub const CRIO_CONTAINER_TYPE: &str = "io.kubernetes.cri-o.ContainerType";
pub const CRIO_SANDBOX_NAME: &str = "io.kubernetes.cri-o.SandboxName";

/// Id of a container's primary process inside the guest.
pub const INIT_PROCESS: &str = "init";

/// Tag of the host directory shared into the guest.
pub const SHARE_DIR: &str = "share_dir";

/// Role a container plays in its pod, as declared by annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodRole {
    /// Owns a new sandbox.
    Sandbox,
    /// Joins the named sandbox.
    Member(String),
}

impl PodRole {
    /// Read the role from the spec annotations, if any is declared.
    pub fn from_spec(spec: &Spec) -> Result<Option<Self>, CoreError> {
        let Some(annotations) = spec.annotations().as_ref() else {
            return Ok(None);
        };
        let lookup = |key: &str, crio: &str| {
            annotations
                .get(key)
                .or_else(|| annotations.get(crio))
                .map(String::as_str)
        };

        let Some(kind) = lookup(CONTAINER_TYPE, CRIO_CONTAINER_TYPE) else {
            return Ok(None);
        };
        if kind != "container" {
            return Ok(Some(Self::Sandbox));
        }
        match lookup(SANDBOX_NAME, CRIO_SANDBOX_NAME) {
            Some(name) if !name.is_empty() => Ok(Some(Self::Member(name.to_string()))),
            _ => Err(CoreError::Config(format!(
                "container type annotation without {SANDBOX_NAME}"
            ))),
        }
    }
}

/// Guest pod context for a sandbox created from `spec`.
pub fn pod_for(spec: &Spec, sandbox: &str) -> Pod {
    let hostname = spec
        .hostname()
        .as_ref()
        .filter(|h| !h.is_empty())
        .cloned()
        .unwrap_or_else(|| sandbox.to_string());
    Pod {
        hostname,
        share_dir: SHARE_DIR.to_string(),
        ..Default::default()
    }
}

/// Guest container for container `id` of the bundle at `bundle`.
///
/// `image` is the host rootfs; the guest mounts it from the shared
/// directory and `rootfs` names the mount point below it.
pub fn container_for(spec: &Spec, id: &str, bundle: &Path) -> Result<Container, CoreError> {
    let process = spec
        .process()
        .as_ref()
        .ok_or_else(|| CoreError::Config("spec has no process".into()))?;

    let args = process.args().as_ref().cloned().unwrap_or_default();
    if args.is_empty() {
        return Err(CoreError::Config("process args must not be empty".into()));
    }

    let user = process.user();
    let additional_groups = user
        .additional_gids()
        .as_ref()
        .map(|gids| gids.iter().map(|g| g.to_string()).collect())
        .unwrap_or_default();

    let root = spec
        .root()
        .as_ref()
        .map(|r| r.path().clone())
        .unwrap_or_else(|| "rootfs".into());
    let image = if root.is_absolute() {
        root
    } else {
        bundle.join(root)
    };

    let sysctl = spec
        .linux()
        .as_ref()
        .and_then(|l| l.sysctl().as_ref())
        .cloned()
        .unwrap_or_default();

    let workdir = process.cwd().display().to_string();
    Ok(Container {
        id: id.to_string(),
        rootfs: "rootfs".to_string(),
        image: image.display().to_string(),
        workdir: workdir.clone(),
        sysctl,
        process: Process {
            id: INIT_PROCESS.to_string(),
            args,
            envs: process.env().as_ref().cloned().unwrap_or_default(),
            workdir,
            terminal: process.terminal().as_ref().copied().unwrap_or(false),
            user: user.uid().to_string(),
            group: user.gid().to_string(),
            additional_groups,
        },
        restore: false,
    })
}
