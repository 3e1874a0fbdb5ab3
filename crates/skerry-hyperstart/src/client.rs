//! JSON-RPC client for the in-guest agent.
//!
//! One connection carries every call for a sandbox. Requests are tagged
//! with a unique id and a single reader task routes each response back to
//! its caller, so concurrent calls from different containers never see
//! each other's replies. The same reader feeds process output into the
//! per-process stream buffers.

use crate::api::{Container, Pod, Process, Route, StreamKind, API_VERSION};
use crate::error::{HyperstartError, Result};
use crate::hyperstart::Hyperstart;
use crate::protocol::{
    self, methods, Incoming, Notification, ReadFileResult, Request, Response, StreamFrame,
    VersionResult, WaitResult, WriteResult,
};
use crate::streams::{StreamKey, StreamTable};
use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::signal::Signal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;

/// Total time allowed for reaching the agent (includes retry time).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between connection retry attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

type Pending = HashMap<u64, oneshot::Sender<Result<Value>>>;

/// State shared between callers and the reader task.
struct Shared {
    writer: tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>,
    pending: Mutex<PendingTable>,
    next_id: AtomicU64,
    streams: StreamTable,
}

#[derive(Default)]
struct PendingTable {
    waiters: Pending,
    closed: Option<Shutdown>,
}

#[derive(Clone)]
enum Shutdown {
    /// `close` was called.
    Host,
    /// The guest side went away.
    Lost(String),
}

impl Shutdown {
    fn error(&self) -> HyperstartError {
        match self {
            Self::Host => HyperstartError::Closed,
            Self::Lost(reason) => HyperstartError::Transport(reason.clone()),
        }
    }
}

impl Shared {
    /// Send one request and wait for its response.
    async fn request<P: Serialize>(&self, method: &str, params: P) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| HyperstartError::Transport("pending table poisoned".into()))?;
            if let Some(shutdown) = &pending.closed {
                return Err(shutdown.error());
            }
            pending.waiters.insert(id, tx);
        }

        let frame = serde_json::to_string(&Request::new(id, method, params))?;
        tracing::debug!(method, id, "Sending agent request");
        tracing::trace!(request = %frame, "Agent request body");

        if let Err(e) = self.write_frame(&frame).await {
            tracing::warn!(method, id, error = %e, "Agent request write failed");
            self.forget(id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(HyperstartError::Transport("connection closed".into())),
        }
    }

    async fn write_frame(&self, frame: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.waiters.remove(&id);
        }
    }

    fn complete(&self, response: Response) {
        let waiter = match self.pending.lock() {
            Ok(mut pending) => pending.waiters.remove(&response.id),
            Err(_) => None,
        };
        let Some(waiter) = waiter else {
            tracing::warn!(id = response.id, "Response for unknown request");
            return;
        };

        let result = match response.error {
            Some(error) => {
                tracing::debug!(id = response.id, code = error.code, message = %error.message, "Agent error response");
                Err(HyperstartError::Agent {
                    code: error.code,
                    message: error.message,
                })
            }
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = waiter.send(result);
    }

    fn dispatch(&self, notification: Notification) {
        if notification.method != methods::STREAM {
            tracing::debug!(method = %notification.method, "Ignoring agent notification");
            return;
        }
        let frame: StreamFrame = match serde_json::from_value(notification.params) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed stream frame");
                return;
            }
        };
        let data = match frame.payload() {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                tracing::warn!(seq = frame.seq, error = %e, "Undecodable stream payload");
                return;
            }
        };
        tracing::trace!(
            container = %frame.container,
            process = %frame.process,
            stream = %frame.stream,
            seq = frame.seq,
            len = data.len(),
            eof = frame.eof,
            "Stream frame"
        );
        let key = StreamKey::new(&frame.container, &frame.process, frame.stream);
        self.streams.push(key, frame.seq, data, frame.eof);
    }

    /// Fail every pending call and end every stream.
    fn shutdown(&self, cause: Shutdown) {
        let (waiters, cause) = match self.pending.lock() {
            Ok(mut pending) => {
                let cause = pending.closed.get_or_insert(cause).clone();
                (std::mem::take(&mut pending.waiters), cause)
            }
            Err(_) => (HashMap::new(), cause),
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(cause.error()));
        }
        self.streams.close_all(&cause.error().to_string());
    }
}

/// Route every incoming frame until the guest hangs up.
async fn read_loop(shared: Arc<Shared>, mut reader: BufReader<OwnedReadHalf>) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                tracing::debug!("Agent closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Agent read error");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        tracing::trace!(frame = %trimmed, "Agent frame");

        match serde_json::from_str::<Incoming>(trimmed) {
            Ok(Incoming::Response(response)) => shared.complete(response),
            Ok(Incoming::Notification(notification)) => shared.dispatch(notification),
            Err(e) => tracing::warn!(error = %e, "Unparseable agent frame"),
        }
    }
    shared.shutdown(Shutdown::Lost("agent connection closed".into()));
}

/// [`Hyperstart`] over a newline-delimited JSON-RPC connection.
pub struct JsonHyperstart {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    gate: Arc<RwLock<()>>,
    paused: tokio::sync::Mutex<Option<OwnedRwLockWriteGuard<()>>>,
}

impl JsonHyperstart {
    /// Connect to the agent through Firecracker's vsock Unix socket.
    ///
    /// Performs the `CONNECT <port>` handshake, retrying for up to 10
    /// seconds while the guest boots. `last_stream_seq` is the high-water
    /// mark of a previous connection to the same guest (0 for a fresh one);
    /// the guest resumes output after it.
    pub async fn connect(vsock_path: &Path, port: u32, last_stream_seq: u64) -> Result<Self> {
        let start = Instant::now();
        tracing::debug!(path = %vsock_path.display(), port, "Connecting to agent");

        let mut attempts = 0u32;
        let stream = loop {
            attempts += 1;
            match Self::handshake(vsock_path, port).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if start.elapsed() >= CONNECT_TIMEOUT {
                        tracing::warn!(
                            path = %vsock_path.display(),
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            attempts,
                            "Agent connection timeout"
                        );
                        return Err(HyperstartError::Transport(format!(
                            "agent unreachable after {CONNECT_TIMEOUT:?}: {e}"
                        )));
                    }
                    tracing::trace!(error = %e, attempt = attempts, "Connection attempt failed, retrying...");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        };

        let (reader, writer) = stream;
        let client = Self::start(reader, writer, last_stream_seq).await?;
        tracing::info!(
            path = %vsock_path.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            attempts,
            "Connected to agent"
        );
        Ok(client)
    }

    /// Use an already established connection to the agent.
    pub async fn from_stream(stream: UnixStream, last_stream_seq: u64) -> Result<Self> {
        let (read_half, write_half) = stream.into_split();
        Self::start(BufReader::new(read_half), write_half, last_stream_seq).await
    }

    async fn handshake(
        vsock_path: &Path,
        port: u32,
    ) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let stream = UnixStream::connect(vsock_path)
            .await
            .map_err(|e| HyperstartError::Transport(format!("socket connect failed: {e}")))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("CONNECT {port}\n").as_bytes())
            .await?;
        write_half.flush().await?;

        let mut response = String::new();
        reader.read_line(&mut response).await?;
        if !response.starts_with("OK ") {
            tracing::debug!(response = %response.trim(), "Handshake failed");
            return Err(HyperstartError::Transport(format!(
                "handshake failed: {}",
                response.trim()
            )));
        }
        tracing::debug!(response = %response.trim(), "vsock handshake successful");
        Ok((reader, write_half))
    }

    async fn start(
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        last_stream_seq: u64,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(BufWriter::new(writer)),
            pending: Mutex::new(PendingTable::default()),
            next_id: AtomicU64::new(1),
            streams: StreamTable::with_last_seq(last_stream_seq),
        });
        let handle = tokio::spawn(read_loop(shared.clone(), reader));

        let client = Self {
            shared,
            reader: Mutex::new(Some(handle)),
            gate: Arc::new(RwLock::new(())),
            paused: tokio::sync::Mutex::new(None),
        };
        client
            .shared
            .request(
                methods::HELLO,
                json!({ "version": API_VERSION, "last_stream_seq": last_stream_seq }),
            )
            .await?;
        Ok(client)
    }

    /// A call that must not run while the guest is paused.
    async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        let _gate = self.gate.try_read().map_err(|_| HyperstartError::Paused)?;
        let value = self.shared.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// A gated call whose result carries nothing.
    async fn call_unit<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        let _gate = self.gate.try_read().map_err(|_| HyperstartError::Paused)?;
        self.shared.request(method, params).await.map(|_| ())
    }
}

impl Drop for JsonHyperstart {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl Hyperstart for JsonHyperstart {
    async fn close(&self) {
        let handle = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        self.shared.shutdown(Shutdown::Host);
        tracing::debug!("Agent client closed");
    }

    fn last_stream_seq(&self) -> u64 {
        self.shared.streams.last_seq()
    }

    async fn pause_sync(&self) -> Result<()> {
        let mut paused = self.paused.lock().await;
        if paused.is_some() {
            return Ok(());
        }
        // Waits for every in-flight gated call; new ones fail with Paused
        let guard = self.gate.clone().write_owned().await;
        self.shared.request(methods::PAUSE, json!({})).await?;
        *paused = Some(guard);
        tracing::info!(last_stream_seq = self.last_stream_seq(), "Guest paused");
        Ok(())
    }

    async fn unpause(&self) -> Result<()> {
        let mut paused = self.paused.lock().await;
        if paused.is_none() {
            return Ok(());
        }
        self.shared.request(methods::UNPAUSE, json!({})).await?;
        *paused = None;
        tracing::info!("Guest resumed");
        Ok(())
    }

    async fn api_version(&self) -> Result<u32> {
        let result: VersionResult = self.call(methods::VERSION, json!({})).await?;
        Ok(result.version)
    }

    async fn new_container(&self, container: &Container) -> Result<()> {
        tracing::debug!(container = %container.id, "Creating guest container");
        self.call_unit(methods::NEW_CONTAINER, container).await
    }

    async fn restore_container(&self, container: &Container) -> Result<()> {
        tracing::debug!(container = %container.id, "Restoring guest container");
        self.call_unit(methods::RESTORE_CONTAINER, container).await
    }

    async fn add_process(&self, container: &str, process: &Process) -> Result<()> {
        tracing::debug!(container, process = %process.id, "Adding guest process");
        self.call_unit(
            methods::ADD_PROCESS,
            json!({ "container": container, "process": process }),
        )
        .await
    }

    async fn signal_process(&self, container: &str, process: &str, signal: Signal) -> Result<()> {
        tracing::debug!(container, process, signal = %signal, "Signalling guest process");
        self.call_unit(
            methods::SIGNAL_PROCESS,
            json!({ "container": container, "process": process, "signal": signal as i32 }),
        )
        .await
    }

    async fn wait_process(&self, container: &str, process: &str) -> Result<i32> {
        // Not gated: a wait may legitimately span a pause
        let value = self
            .shared
            .request(
                methods::WAIT_PROCESS,
                json!({ "container": container, "process": process }),
            )
            .await?;
        let result: WaitResult = serde_json::from_value(value)?;
        tracing::debug!(container, process, exit_code = result.exit_code, "Guest process exited");
        Ok(result.exit_code)
    }

    async fn write_stdin(&self, container: &str, process: &str, data: &[u8]) -> Result<usize> {
        let result: WriteResult = self
            .call(
                methods::WRITE_STDIN,
                json!({
                    "container": container,
                    "process": process,
                    "data": protocol::encode(data),
                }),
            )
            .await?;
        Ok(result.written)
    }

    async fn read_stdout(&self, container: &str, process: &str, buf: &mut [u8]) -> Result<usize> {
        let key = StreamKey::new(container, process, StreamKind::Stdout);
        self.shared.streams.read(&key, buf).await
    }

    async fn read_stderr(&self, container: &str, process: &str, buf: &mut [u8]) -> Result<usize> {
        let key = StreamKey::new(container, process, StreamKind::Stderr);
        self.shared.streams.read(&key, buf).await
    }

    async fn close_stdin(&self, container: &str, process: &str) -> Result<()> {
        self.call_unit(
            methods::CLOSE_STDIN,
            json!({ "container": container, "process": process }),
        )
        .await
    }

    async fn tty_win_resize(
        &self,
        container: &str,
        process: &str,
        row: u16,
        col: u16,
    ) -> Result<()> {
        self.call_unit(
            methods::TTY_WIN_RESIZE,
            json!({ "container": container, "process": process, "row": row, "column": col }),
        )
        .await
    }

    async fn start_sandbox(&self, pod: &Pod) -> Result<()> {
        tracing::debug!(hostname = %pod.hostname, "Starting guest pod");
        self.call_unit(methods::START_SANDBOX, pod).await
    }

    async fn destroy_sandbox(&self) -> Result<()> {
        tracing::debug!("Destroying guest pod");
        self.call_unit(methods::DESTROY_SANDBOX, json!({})).await
    }

    async fn write_file(&self, container: &str, path: &str, data: &[u8]) -> Result<()> {
        tracing::debug!(container, path, len = data.len(), "Writing guest file");
        self.call_unit(
            methods::WRITE_FILE,
            json!({ "container": container, "path": path, "data": protocol::encode(data) }),
        )
        .await
    }

    async fn read_file(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        tracing::debug!(container, path, "Reading guest file");
        let result: ReadFileResult = self
            .call(
                methods::READ_FILE,
                json!({ "container": container, "path": path }),
            )
            .await?;
        protocol::decode(&result.data)
            .map_err(|e| HyperstartError::Transport(format!("undecodable file payload: {e}")))
    }

    async fn add_route(&self, routes: &[Route]) -> Result<()> {
        self.call_unit(methods::ADD_ROUTE, json!({ "routes": routes }))
            .await
    }

    async fn update_interface(&self, device: &str, ip: &str, mask: &str) -> Result<()> {
        self.call_unit(
            methods::UPDATE_INTERFACE,
            json!({ "device": device, "ip_address": ip, "net_mask": mask }),
        )
        .await
    }

    async fn online_cpu_mem(&self) -> Result<()> {
        self.call_unit(methods::ONLINE_CPU_MEM, json!({})).await
    }
}
