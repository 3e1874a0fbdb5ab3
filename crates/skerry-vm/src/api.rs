//! Firecracker API socket requests.
//!
//! Every pre-boot resource is configured with a `PUT` against the VMM's
//! Unix API socket. Machine and vsock bodies use the generated
//! `firepilot_models` types; the rest are small enough to build inline.

use crate::config::{DriveConfig, VsockConfig};
use crate::error::{Result, VmError};
use firepilot_models::models::{MachineConfiguration, Vsock};
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use serde_json::json;
use std::path::Path;

/// Send a `PUT` with a JSON body to the Firecracker API socket.
async fn put(socket_path: &Path, endpoint: &str, body: String) -> Result<()> {
    tracing::trace!(endpoint, body = %body, "Firecracker API request");

    let uri: hyper::Uri = Uri::new(socket_path, endpoint).into();

    let request = Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .map_err(|e| VmError::Config(format!("failed to build {endpoint} request: {e}")))?;

    let client = Client::unix();
    let response = client.request(request).await.map_err(|e| {
        tracing::error!(endpoint, error = %e, "Firecracker API request failed");
        VmError::Api(format!("{endpoint} request failed: {e}"))
    })?;

    let status = response.status();
    if !status.is_success() {
        let body_bytes = hyper::body::to_bytes(response.into_body())
            .await
            .unwrap_or_default();
        let body_str = String::from_utf8_lossy(&body_bytes);
        tracing::error!(endpoint, status = %status, body = %body_str, "Firecracker API rejected request");
        return Err(VmError::Api(format!(
            "{endpoint} failed with status {status}: {body_str}"
        )));
    }

    Ok(())
}

/// Configure vCPU and memory. Must be called before the instance starts.
pub async fn configure_machine(
    socket_path: &Path,
    vcpu_count: u8,
    mem_size_mib: u32,
) -> Result<()> {
    tracing::debug!(vcpu_count, mem_size_mib, "Configuring machine resources");

    let mem = i32::try_from(mem_size_mib)
        .map_err(|_| VmError::Config(format!("memory_mib {mem_size_mib} out of range")))?;
    let config = MachineConfiguration::new(mem, vcpu_count as i32);
    let body = serde_json::to_string(&config)
        .map_err(|e| VmError::Config(format!("failed to serialize machine config: {e}")))?;

    put(socket_path, "/machine-config", body).await
}

/// Configure the guest kernel and its command line.
pub async fn configure_boot_source(
    socket_path: &Path,
    kernel_path: &Path,
    boot_args: &str,
) -> Result<()> {
    tracing::debug!(kernel = %kernel_path.display(), "Configuring boot source");

    let body = json!({
        "kernel_image_path": kernel_path.to_string_lossy(),
        "boot_args": boot_args,
    });
    put(socket_path, "/boot-source", body.to_string()).await
}

/// Attach a block device.
pub async fn configure_drive(socket_path: &Path, drive: &DriveConfig) -> Result<()> {
    tracing::debug!(
        drive_id = %drive.drive_id,
        path = %drive.path_on_host.display(),
        "Configuring drive"
    );

    let body = json!({
        "drive_id": drive.drive_id,
        "path_on_host": drive.path_on_host.to_string_lossy(),
        "is_root_device": drive.is_root_device,
        "is_read_only": drive.is_read_only,
    });
    put(
        socket_path,
        &format!("/drives/{}", drive.drive_id),
        body.to_string(),
    )
    .await
}

/// Attach the vsock device used by the guest agent.
pub async fn configure_vsock(socket_path: &Path, config: &VsockConfig) -> Result<()> {
    tracing::debug!(
        cid = config.guest_cid,
        uds_path = %config.uds_path.display(),
        "Configuring vsock"
    );

    let vsock = Vsock::new(
        config.guest_cid as i32,
        config.uds_path.to_string_lossy().to_string(),
    );
    let body = serde_json::to_string(&vsock)
        .map_err(|e| VmError::Config(format!("failed to serialize vsock config: {e}")))?;

    put(socket_path, "/vsock", body).await
}

/// Boot the configured guest.
pub async fn start_instance(socket_path: &Path) -> Result<()> {
    tracing::debug!(socket = %socket_path.display(), "Starting instance");
    let body = json!({ "action_type": "InstanceStart" });
    put(socket_path, "/actions", body.to_string())
        .await
        .map_err(|e| VmError::Start(e.to_string()))
}
