//! In-process guest agent.
//!
//! [`MemoryHyperstart`] keeps the whole guest state in memory, which makes
//! it a stand-in for a booted VM in tests and dry runs. Process output,
//! exits and failures are driven from the host through the hook methods.

use crate::api::{Container, Interface, Pod, Process, Route, StreamKind, API_VERSION};
use crate::error::{HyperstartError, Result};
use crate::hyperstart::Hyperstart;
use crate::protocol::{error_codes, methods};
use crate::streams::{StreamKey, StreamTable};
use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

type ProcessKey = (String, String);

struct GuestProcess {
    spec: Process,
    exit: watch::Sender<Option<i32>>,
    stdin: Vec<u8>,
    stdin_closed: bool,
    signals: Vec<Signal>,
    window: Option<(u16, u16)>,
}

impl GuestProcess {
    fn new(spec: Process) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            spec,
            exit,
            stdin: Vec::new(),
            stdin_closed: false,
            signals: Vec::new(),
            window: None,
        }
    }

    fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

#[derive(Default)]
struct GuestState {
    pod: Option<Pod>,
    destroyed: bool,
    closed: bool,
    paused: bool,
    containers: HashMap<String, Container>,
    processes: HashMap<ProcessKey, GuestProcess>,
    files: HashMap<(String, String), Vec<u8>>,
    routes: Vec<Route>,
    interfaces: Vec<Interface>,
    onlined: usize,
    next_seq: u64,
    held: Vec<(StreamKey, Bytes, bool)>,
    calls: Vec<String>,
    failures: HashMap<String, (i32, String)>,
}

impl GuestState {
    fn process(&mut self, container: &str, process: &str) -> Result<&mut GuestProcess> {
        self.processes
            .get_mut(&(container.to_string(), process.to_string()))
            .ok_or_else(|| {
                HyperstartError::agent(
                    error_codes::NOT_FOUND,
                    format!("no process {process} in container {container}"),
                )
            })
    }

    fn require_container(&self, container: &str) -> Result<()> {
        if self.containers.contains_key(container) {
            Ok(())
        } else {
            Err(HyperstartError::agent(
                error_codes::NOT_FOUND,
                format!("no container {container}"),
            ))
        }
    }
}

/// A [`Hyperstart`] with no guest behind it.
#[derive(Default)]
pub struct MemoryHyperstart {
    state: Mutex<GuestState>,
    streams: StreamTable,
}

impl MemoryHyperstart {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GuestState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record the call and reject it if the guest cannot serve it.
    fn enter(&self, method: &str, gated: bool) -> Result<MutexGuard<'_, GuestState>> {
        let mut state = self.lock();
        state.calls.push(method.to_string());
        if state.closed {
            return Err(HyperstartError::Closed);
        }
        if state.destroyed {
            return Err(HyperstartError::Transport("sandbox destroyed".into()));
        }
        if gated && state.paused {
            return Err(HyperstartError::Paused);
        }
        if let Some((code, message)) = state.failures.get(method) {
            return Err(HyperstartError::agent(*code, message.clone()));
        }
        Ok(state)
    }

    /// Deliver output now, or hold it while the guest is paused.
    fn emit(&self, state: &mut GuestState, key: StreamKey, data: Bytes, eof: bool) {
        if state.paused {
            state.held.push((key, data, eof));
            return;
        }
        state.next_seq += 1;
        self.streams.push(key, state.next_seq, data, eof);
    }

    fn end_process(&self, state: &mut GuestState, container: &str, process: &str, code: i32) {
        let key = (container.to_string(), process.to_string());
        let Some(running) = state.processes.get(&key) else {
            return;
        };
        if running.exited() {
            return;
        }
        running.exit.send_replace(Some(code));
        for kind in [StreamKind::Stdout, StreamKind::Stderr] {
            self.emit(
                state,
                StreamKey::new(container, process, kind),
                Bytes::new(),
                true,
            );
        }
    }

    // Host-side hooks

    /// Produce stdout for a process.
    pub fn emit_stdout(&self, container: &str, process: &str, data: &[u8]) {
        let mut state = self.lock();
        let key = StreamKey::new(container, process, StreamKind::Stdout);
        self.emit(&mut state, key, Bytes::copy_from_slice(data), false);
    }

    /// Produce stderr for a process.
    pub fn emit_stderr(&self, container: &str, process: &str, data: &[u8]) {
        let mut state = self.lock();
        let key = StreamKey::new(container, process, StreamKind::Stderr);
        self.emit(&mut state, key, Bytes::copy_from_slice(data), false);
    }

    /// Make a process exit with `code`. Its streams end after any output
    /// already produced.
    pub fn exit_process(&self, container: &str, process: &str, code: i32) {
        let mut state = self.lock();
        self.end_process(&mut state, container, process, code);
    }

    /// Make every later call of `method` fail with an agent error.
    pub fn fail_on(&self, method: &str, code: i32, message: &str) {
        self.lock()
            .failures
            .insert(method.to_string(), (code, message.to_string()));
    }

    /// Stop failing `method`.
    pub fn clear_failure(&self, method: &str) {
        self.lock().failures.remove(method);
    }

    // Introspection

    /// Bytes written to a process's stdin so far.
    pub fn stdin_of(&self, container: &str, process: &str) -> Option<Vec<u8>> {
        self.lock()
            .processes
            .get(&(container.to_string(), process.to_string()))
            .map(|p| p.stdin.clone())
    }

    /// Signals delivered to a process, in order.
    pub fn signals_of(&self, container: &str, process: &str) -> Vec<Signal> {
        self.lock()
            .processes
            .get(&(container.to_string(), process.to_string()))
            .map(|p| p.signals.clone())
            .unwrap_or_default()
    }

    /// Last terminal size set for a process.
    pub fn window_of(&self, container: &str, process: &str) -> Option<(u16, u16)> {
        self.lock()
            .processes
            .get(&(container.to_string(), process.to_string()))
            .and_then(|p| p.window)
    }

    /// Process spec as the guest received it.
    pub fn process_spec(&self, container: &str, process: &str) -> Option<Process> {
        self.lock()
            .processes
            .get(&(container.to_string(), process.to_string()))
            .map(|p| p.spec.clone())
    }

    /// Contents of a file inside a container.
    pub fn file(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .files
            .get(&(container.to_string(), path.to_string()))
            .cloned()
    }

    pub fn pod(&self) -> Option<Pod> {
        self.lock().pod.clone()
    }

    pub fn container(&self, id: &str) -> Option<Container> {
        self.lock().containers.get(id).cloned()
    }

    /// Ids of the containers in the guest, sorted.
    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn routes(&self) -> Vec<Route> {
        self.lock().routes.clone()
    }

    pub fn interfaces(&self) -> Vec<Interface> {
        self.lock().interfaces.clone()
    }

    /// Number of successful `online_cpu_mem` calls.
    pub fn onlined(&self) -> usize {
        self.lock().onlined
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Every method invoked so far, including rejected calls.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }
}

#[async_trait]
impl Hyperstart for MemoryHyperstart {
    async fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.processes.clear();
        drop(state);
        self.streams.close_all("client closed");
    }

    fn last_stream_seq(&self) -> u64 {
        self.streams.last_seq()
    }

    async fn pause_sync(&self) -> Result<()> {
        let mut state = self.enter(methods::PAUSE, false)?;
        state.paused = true;
        Ok(())
    }

    async fn unpause(&self) -> Result<()> {
        let mut state = self.enter(methods::UNPAUSE, false)?;
        if !state.paused {
            return Ok(());
        }
        state.paused = false;
        let held = std::mem::take(&mut state.held);
        for (key, data, eof) in held {
            self.emit(&mut state, key, data, eof);
        }
        Ok(())
    }

    async fn api_version(&self) -> Result<u32> {
        let _state = self.enter(methods::VERSION, true)?;
        Ok(API_VERSION)
    }

    async fn new_container(&self, container: &Container) -> Result<()> {
        let mut state = self.enter(methods::NEW_CONTAINER, true)?;
        if state.pod.is_none() {
            return Err(HyperstartError::agent(
                error_codes::INVALID_STATE,
                "sandbox not started",
            ));
        }
        if state.containers.contains_key(&container.id) {
            return Err(HyperstartError::agent(
                error_codes::ALREADY_EXISTS,
                format!("container {} already exists", container.id),
            ));
        }
        state.processes.insert(
            (container.id.clone(), container.process.id.clone()),
            GuestProcess::new(container.process.clone()),
        );
        state
            .containers
            .insert(container.id.clone(), container.clone());
        Ok(())
    }

    async fn restore_container(&self, container: &Container) -> Result<()> {
        let state = self.enter(methods::RESTORE_CONTAINER, true)?;
        state.require_container(&container.id)
    }

    async fn add_process(&self, container: &str, process: &Process) -> Result<()> {
        let mut state = self.enter(methods::ADD_PROCESS, true)?;
        state.require_container(container)?;
        let key = (container.to_string(), process.id.clone());
        if state.processes.contains_key(&key) {
            return Err(HyperstartError::agent(
                error_codes::ALREADY_EXISTS,
                format!("process {} already exists", process.id),
            ));
        }
        state.processes.insert(key, GuestProcess::new(process.clone()));
        Ok(())
    }

    async fn signal_process(&self, container: &str, process: &str, signal: Signal) -> Result<()> {
        let mut state = self.enter(methods::SIGNAL_PROCESS, true)?;
        state.process(container, process)?.signals.push(signal);
        if matches!(signal, Signal::SIGKILL | Signal::SIGTERM | Signal::SIGINT) {
            self.end_process(&mut state, container, process, 128 + signal as i32);
        }
        Ok(())
    }

    async fn wait_process(&self, container: &str, process: &str) -> Result<i32> {
        let mut rx = {
            let mut state = self.enter(methods::WAIT_PROCESS, false)?;
            state.process(container, process)?.exit.subscribe()
        };
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return Ok(code);
            }
            if rx.changed().await.is_err() {
                return match *rx.borrow() {
                    Some(code) => Ok(code),
                    None => Err(HyperstartError::Closed),
                };
            }
        }
    }

    async fn write_stdin(&self, container: &str, process: &str, data: &[u8]) -> Result<usize> {
        let mut state = self.enter(methods::WRITE_STDIN, true)?;
        let running = state.process(container, process)?;
        if running.stdin_closed || running.exited() {
            return Err(HyperstartError::agent(
                error_codes::INVALID_STATE,
                "stdin is closed",
            ));
        }
        running.stdin.extend_from_slice(data);
        Ok(data.len())
    }

    async fn read_stdout(&self, container: &str, process: &str, buf: &mut [u8]) -> Result<usize> {
        let key = StreamKey::new(container, process, StreamKind::Stdout);
        self.streams.read(&key, buf).await
    }

    async fn read_stderr(&self, container: &str, process: &str, buf: &mut [u8]) -> Result<usize> {
        let key = StreamKey::new(container, process, StreamKind::Stderr);
        self.streams.read(&key, buf).await
    }

    async fn close_stdin(&self, container: &str, process: &str) -> Result<()> {
        let mut state = self.enter(methods::CLOSE_STDIN, true)?;
        state.process(container, process)?.stdin_closed = true;
        Ok(())
    }

    async fn tty_win_resize(
        &self,
        container: &str,
        process: &str,
        row: u16,
        col: u16,
    ) -> Result<()> {
        let mut state = self.enter(methods::TTY_WIN_RESIZE, true)?;
        state.process(container, process)?.window = Some((row, col));
        Ok(())
    }

    async fn start_sandbox(&self, pod: &Pod) -> Result<()> {
        let mut state = self.enter(methods::START_SANDBOX, true)?;
        if state.pod.is_some() {
            return Err(HyperstartError::agent(
                error_codes::INVALID_STATE,
                "sandbox already started",
            ));
        }
        state.routes.extend(pod.routes.iter().cloned());
        state.interfaces.extend(pod.interfaces.iter().cloned());
        state.pod = Some(pod.clone());
        Ok(())
    }

    async fn destroy_sandbox(&self) -> Result<()> {
        let mut state = self.enter(methods::DESTROY_SANDBOX, true)?;
        let running: Vec<ProcessKey> = state
            .processes
            .iter()
            .filter(|(_, p)| !p.exited())
            .map(|(k, _)| k.clone())
            .collect();
        for (container, process) in running {
            self.end_process(
                &mut state,
                &container,
                &process,
                128 + Signal::SIGKILL as i32,
            );
        }
        state.destroyed = true;
        Ok(())
    }

    async fn write_file(&self, container: &str, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.enter(methods::WRITE_FILE, true)?;
        state.require_container(container)?;
        state
            .files
            .insert((container.to_string(), path.to_string()), data.to_vec());
        Ok(())
    }

    async fn read_file(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        let state = self.enter(methods::READ_FILE, true)?;
        state.require_container(container)?;
        state
            .files
            .get(&(container.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| HyperstartError::agent(error_codes::NOT_FOUND, format!("no file {path}")))
    }

    async fn add_route(&self, routes: &[Route]) -> Result<()> {
        let mut state = self.enter(methods::ADD_ROUTE, true)?;
        state.routes.extend(routes.iter().cloned());
        Ok(())
    }

    async fn update_interface(&self, device: &str, ip: &str, mask: &str) -> Result<()> {
        let mut state = self.enter(methods::UPDATE_INTERFACE, true)?;
        let iface = Interface {
            device: device.to_string(),
            ip_address: ip.to_string(),
            net_mask: mask.to_string(),
        };
        match state.interfaces.iter_mut().find(|i| i.device == device) {
            Some(existing) => *existing = iface,
            None => state.interfaces.push(iface),
        }
        Ok(())
    }

    async fn online_cpu_mem(&self) -> Result<()> {
        let mut state = self.enter(methods::ONLINE_CPU_MEM, true)?;
        state.onlined += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pod() -> Pod {
        Pod {
            hostname: "pod-1".into(),
            share_dir: "share".into(),
            ..Default::default()
        }
    }

    fn container(id: &str) -> Container {
        Container {
            id: id.into(),
            rootfs: "rootfs".into(),
            image: id.into(),
            process: Process {
                id: "init".into(),
                args: vec!["sh".into()],
                workdir: "/".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn started() -> MemoryHyperstart {
        let guest = MemoryHyperstart::new();
        guest.start_sandbox(&pod()).await.unwrap();
        guest
    }

    #[tokio::test]
    async fn test_second_start_sandbox_is_rejected() {
        let guest = started().await;
        let err = guest.start_sandbox(&pod()).await.unwrap_err();
        assert!(matches!(
            err,
            HyperstartError::Agent { code: error_codes::INVALID_STATE, .. }
        ));
        assert_eq!(guest.pod().unwrap().hostname, "pod-1");
    }

    #[tokio::test]
    async fn test_new_container_requires_started_pod() {
        let guest = MemoryHyperstart::new();
        let err = guest.new_container(&container("c1")).await.unwrap_err();
        assert!(err.is_agent());
        assert!(guest.container_ids().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_container_is_rejected() {
        let guest = started().await;
        guest.new_container(&container("c1")).await.unwrap();
        let err = guest.new_container(&container("c1")).await.unwrap_err();
        assert!(matches!(
            err,
            HyperstartError::Agent { code: error_codes::ALREADY_EXISTS, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_container_is_not_found() {
        let guest = started().await;
        let err = guest.wait_process("nope", "init").await.unwrap_err();
        assert!(matches!(
            err,
            HyperstartError::Agent { code: error_codes::NOT_FOUND, .. }
        ));
    }

    #[tokio::test]
    async fn test_output_and_exit() {
        let guest = started().await;
        guest.new_container(&container("c1")).await.unwrap();
        guest.emit_stdout("c1", "init", b"hi");
        guest.exit_process("c1", "init", 3);

        let mut buf = [0u8; 8];
        let n = guest.read_stdout("c1", "init", &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(guest.read_stdout("c1", "init", &mut buf).await.unwrap(), 0);
        assert_eq!(guest.read_stderr("c1", "init", &mut buf).await.unwrap(), 0);
        assert_eq!(guest.wait_process("c1", "init").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_sigkill_ends_process() {
        let guest = started().await;
        guest.new_container(&container("c1")).await.unwrap();

        let waiter = guest.wait_process("c1", "init");
        let (code, _) = tokio::join!(waiter, async {
            guest
                .signal_process("c1", "init", Signal::SIGKILL)
                .await
                .unwrap();
        });
        assert_eq!(code.unwrap(), 137);
        assert_eq!(guest.signals_of("c1", "init"), vec![Signal::SIGKILL]);
    }

    #[tokio::test]
    async fn test_paused_guest_rejects_gated_calls_and_holds_output() {
        let guest = started().await;
        guest.new_container(&container("c1")).await.unwrap();
        guest.pause_sync().await.unwrap();
        guest.pause_sync().await.unwrap();

        assert!(matches!(
            guest.write_stdin("c1", "init", b"x").await,
            Err(HyperstartError::Paused)
        ));
        guest.emit_stdout("c1", "init", b"late");
        assert_eq!(guest.last_stream_seq(), 0);

        guest.unpause().await.unwrap();
        assert_eq!(guest.last_stream_seq(), 1);
        let mut buf = [0u8; 8];
        let n = guest.read_stdout("c1", "init", &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");
        assert_eq!(guest.write_stdin("c1", "init", b"x").await.unwrap(), 1);
        assert_eq!(guest.stdin_of("c1", "init").unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_calls_after_destroy_are_transport_errors() {
        let guest = started().await;
        guest.new_container(&container("c1")).await.unwrap();
        guest.destroy_sandbox().await.unwrap();
        assert!(guest.is_destroyed());

        let err = guest.api_version().await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_close_fails_pending_wait() {
        let guest = Arc::new(started().await);
        guest.new_container(&container("c1")).await.unwrap();

        let waiter = tokio::spawn({
            let guest = guest.clone();
            async move { guest.wait_process("c1", "init").await }
        });
        tokio::task::yield_now().await;
        guest.close().await;

        assert!(matches!(waiter.await.unwrap(), Err(HyperstartError::Closed)));
        assert!(matches!(guest.api_version().await, Err(HyperstartError::Closed)));
    }

    #[tokio::test]
    async fn test_reads_after_close_do_not_block() {
        let guest = started().await;
        guest.new_container(&container("c1")).await.unwrap();
        guest.close().await;

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            guest.read_stdout("c1", "init", &mut buf),
        )
        .await
        .expect("read on a closed guest must not block");
        assert!(read.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let guest = started().await;
        guest.fail_on(methods::NEW_CONTAINER, error_codes::INTERNAL_ERROR, "boom");
        assert!(guest.new_container(&container("c1")).await.unwrap_err().is_agent());

        guest.clear_failure(methods::NEW_CONTAINER);
        guest.new_container(&container("c1")).await.unwrap();
        assert_eq!(
            guest.calls(),
            vec!["start_sandbox", "new_container", "new_container"]
        );
    }

    #[tokio::test]
    async fn test_files_are_per_container() {
        let guest = started().await;
        guest.new_container(&container("c1")).await.unwrap();
        guest.new_container(&container("c2")).await.unwrap();
        guest.write_file("c1", "/etc/hosts", b"127.0.0.1").await.unwrap();

        assert_eq!(guest.read_file("c1", "/etc/hosts").await.unwrap(), b"127.0.0.1");
        assert!(guest.read_file("c2", "/etc/hosts").await.is_err());
    }
}
