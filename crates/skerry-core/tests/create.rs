//! Container creation end to end against in-memory sandboxes.

use serde_json::{json, Value};
use skerry_core::{
    CreateError, CreateOptions, ErrorKind, MemoryDriver, Orchestrator, RuntimeConfig,
    SandboxLock, SandboxRecord, Stage, StateStore,
};
use skerry_hyperstart::protocol::methods;
use skerry_hyperstart::Hyperstart;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _dirs: (TempDir, TempDir),
    bundles: PathBuf,
    driver: Arc<MemoryDriver>,
    orchestrator: Arc<Orchestrator>,
}

impl Harness {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let bundles = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            root: root.path().join("run"),
            ..Default::default()
        };
        let driver = Arc::new(MemoryDriver::new());
        let orchestrator = Orchestrator::new(config, driver.clone()).with_privilege_check(|| true);
        Self {
            bundles: bundles.path().to_path_buf(),
            _dirs: (root, bundles),
            driver,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn store(&self) -> &StateStore {
        self.orchestrator.store()
    }

    /// Write `<bundles>/<name>/config.json`.
    fn bundle(&self, name: &str, spec: &Value) -> PathBuf {
        let dir = self.bundles.join(name);
        std::fs::create_dir_all(dir.join("rootfs")).unwrap();
        std::fs::write(dir.join("config.json"), spec.to_string()).unwrap();
        dir
    }

    fn options(&self, id: &str, spec: &Value) -> CreateOptions {
        CreateOptions {
            bundle: self.bundle(id, spec),
            container_id: id.to_string(),
            ..Default::default()
        }
    }

    async fn create(&self, id: &str, spec: &Value) -> Result<skerry_core::Created, CreateError> {
        self.orchestrator
            .create_container(self.options(id, spec))
            .await
    }

    fn record(&self, sandbox: &str) -> SandboxRecord {
        SandboxRecord::load(&self.store().dir(sandbox)).unwrap()
    }
}

fn spec() -> Value {
    json!({
        "ociVersion": "1.0.2",
        "root": { "path": "rootfs" },
        "hostname": "web",
        "process": {
            "terminal": false,
            "user": { "uid": 0, "gid": 0 },
            "args": ["sleep", "infinity"],
            "env": ["PATH=/usr/bin:/bin"],
            "cwd": "/",
        },
        "linux": {
            "namespaces": [{ "type": "pid" }, { "type": "network" }],
        },
    })
}

fn member_of(sandbox: &str) -> Value {
    let mut s = spec();
    s["annotations"] = json!({
        "ocid/container_type": "container",
        "ocid/sandbox_name": sandbox,
    });
    s
}

fn sharing(namespaces: Value) -> Value {
    let mut s = spec();
    s["linux"]["namespaces"] = namespaces;
    s
}

fn assert_failed(err: &CreateError, stage: Stage, kind: ErrorKind) {
    assert_eq!(err.stage(), stage, "{err}");
    assert_eq!(err.kind(), kind, "{err}");
}

#[tokio::test]
async fn test_create_new_sandbox() {
    let h = Harness::new();
    let pid_file = h.bundles.join("pod.pid");
    let mut options = h.options("pod", &spec());
    options.pid_file = Some(pid_file.clone());

    let created = h.orchestrator.create_container(options).await.unwrap();
    assert!(created.new_sandbox);
    assert_eq!(created.sandbox, "pod");
    assert_eq!(created.state.sandbox, None);

    let state = h.store().load("pod").unwrap();
    assert_eq!(state, created.state);
    assert_eq!(state.bundle, std::fs::canonicalize(h.bundles.join("pod")).unwrap());

    let record = h.record("pod");
    assert_eq!(record.vmm_pid, state.pid);
    assert_eq!(record.containers, vec!["pod"]);
    assert_eq!(std::fs::read_to_string(&pid_file).unwrap(), state.pid.to_string());

    let guest = h.driver.guest("pod").unwrap();
    assert_eq!(guest.pod().unwrap().hostname, "web");
    assert_eq!(guest.container_ids(), vec!["pod"]);
    assert_eq!(
        guest.process_spec("pod", "init").unwrap().args,
        vec!["sleep", "infinity"]
    );

    assert!(SandboxLock::try_acquire(&h.store().dir("pod")).unwrap().is_some());
}

#[tokio::test]
async fn test_sandbox_sized_from_limits() {
    let h = Harness::new();
    let mut s = spec();
    s["linux"]["resources"] = json!({
        "memory": { "limit": 256 * 1024 * 1024 },
        "cpu": { "quota": 150000, "period": 100000 },
    });
    h.create("pod", &s).await.unwrap();

    let record = h.record("pod");
    assert_eq!(record.vcpus, 2);
    assert_eq!(record.memory_mib, 256);
}

#[tokio::test]
async fn test_join_by_annotation() {
    let h = Harness::new();
    let pod = h.create("pod", &spec()).await.unwrap();
    let member = h.create("c1", &member_of("pod")).await.unwrap();

    assert!(!member.new_sandbox);
    assert_eq!(member.sandbox, "pod");
    assert_eq!(member.state.sandbox.as_deref(), Some("pod"));
    assert_eq!(member.state.pid, pod.state.pid);
    assert_eq!(h.driver.launches(), 1);
    assert_eq!(h.record("pod").containers, vec!["pod", "c1"]);
    assert_eq!(h.driver.guest("pod").unwrap().container_ids(), vec!["c1", "pod"]);
}

#[tokio::test]
async fn test_join_through_member_name() {
    let h = Harness::new();
    h.create("pod", &spec()).await.unwrap();
    h.create("c1", &member_of("pod")).await.unwrap();

    let c2 = h.create("c2", &member_of("c1")).await.unwrap();
    assert_eq!(c2.sandbox, "pod");
    assert_eq!(h.record("pod").containers, vec!["pod", "c1", "c2"]);
}

#[tokio::test]
async fn test_join_by_namespace_path() {
    let h = Harness::new();
    let pod = h.create("pod", &spec()).await.unwrap();
    let path = format!("/proc/{}/ns/net", pod.state.pid);

    let c1 = h
        .create("c1", &sharing(json!([{ "type": "network", "path": path }])))
        .await
        .unwrap();
    assert_eq!(c1.sandbox, "pod");
    assert_eq!(h.driver.launches(), 1);

    // Both records now carry the pid; they agree on the owner
    let c2 = h
        .create("c2", &sharing(json!([{ "type": "ipc", "path": path }])))
        .await
        .unwrap();
    assert_eq!(c2.sandbox, "pod");
}

#[tokio::test]
async fn test_annotation_role_sandbox_ignores_namespace_paths() {
    let h = Harness::new();
    let mut s = sharing(json!([{ "type": "network", "path": "/proc/1/ns/net" }]));
    s["annotations"] = json!({ "io.kubernetes.cri-o.ContainerType": "sandbox" });

    let created = h.create("pod", &s).await.unwrap();
    assert!(created.new_sandbox);
}

#[tokio::test]
async fn test_duplicate_id_rejected_before_launch() {
    let h = Harness::new();
    h.create("pod", &spec()).await.unwrap();

    let err = h.create("pod", &spec()).await.unwrap_err();
    assert_failed(&err, Stage::DuplicateId, ErrorKind::Precondition);
    assert_eq!(h.driver.launches(), 1);
}

#[tokio::test]
async fn test_invalid_id_rejected() {
    let h = Harness::new();
    let mut options = h.options("pod", &spec());
    options.container_id = "../pod".into();

    let err = h.orchestrator.create_container(options).await.unwrap_err();
    assert_failed(&err, Stage::DuplicateId, ErrorKind::Precondition);
}

#[tokio::test]
async fn test_shared_mount_namespace_rejected() {
    let h = Harness::new();
    let pod = h.create("pod", &spec()).await.unwrap();
    let path = format!("/proc/{}/ns/mnt", pod.state.pid);

    let err = h
        .create("c1", &sharing(json!([{ "type": "mount", "path": path }])))
        .await
        .unwrap_err();
    assert_failed(&err, Stage::SandboxResolution, ErrorKind::Precondition);
    assert!(!h.store().exists("c1"));
}

#[tokio::test]
async fn test_console_rules() {
    let h = Harness::new();
    let mut tty = spec();
    tty["process"]["terminal"] = json!(true);

    let mut both = h.options("c1", &tty);
    both.console = Some("/dev/pts/3".into());
    both.console_socket = Some("/run/console.sock".into());
    let err = h.orchestrator.create_container(both).await.unwrap_err();
    assert_failed(&err, Stage::ConsoleValidation, ErrorKind::Precondition);
    assert!(err.to_string().contains("only one of --console & --console-socket"));

    let mut attached = h.options("c2", &tty);
    attached.console = Some("/dev/pts/3".into());
    attached.attach = true;
    let err = h.orchestrator.create_container(attached).await.unwrap_err();
    assert!(err.to_string().contains("detached mode"), "{err}");

    let mut no_tty = h.options("c3", &spec());
    no_tty.console_socket = Some("/run/console.sock".into());
    let err = h.orchestrator.create_container(no_tty).await.unwrap_err();
    assert!(err.to_string().contains("tty mode"), "{err}");

    assert_eq!(h.driver.launches(), 0);

    let mut ok = h.options("c4", &tty);
    ok.console = Some("/dev/pts/3".into());
    h.orchestrator.create_container(ok).await.unwrap();
}

#[tokio::test]
async fn test_unprivileged_caller_rejected() {
    let root = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let orchestrator = Orchestrator::new(
        RuntimeConfig {
            root: root.path().to_path_buf(),
            ..Default::default()
        },
        h.driver.clone(),
    )
    .with_privilege_check(|| false);

    let err = orchestrator
        .create_container(h.options("pod", &spec()))
        .await
        .unwrap_err();
    assert_failed(&err, Stage::PrivilegeCheck, ErrorKind::Precondition);
    assert!(err.to_string().contains("root"));
}

#[tokio::test]
async fn test_bad_bundles() {
    let h = Harness::new();

    let mut not_linux = spec();
    not_linux.as_object_mut().unwrap().remove("linux");
    let err = h.create("c1", &not_linux).await.unwrap_err();
    assert_failed(&err, Stage::SpecLoad, ErrorKind::Config);

    let missing = CreateOptions {
        bundle: h.bundles.join("nowhere"),
        container_id: "c2".into(),
        ..Default::default()
    };
    let err = h.orchestrator.create_container(missing).await.unwrap_err();
    assert_failed(&err, Stage::SpecLoad, ErrorKind::Config);

    let dir = h.bundles.join("garbage");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.json"), "{ not json").unwrap();
    let garbage = CreateOptions {
        bundle: dir,
        container_id: "c3".into(),
        ..Default::default()
    };
    let err = h.orchestrator.create_container(garbage).await.unwrap_err();
    assert_failed(&err, Stage::SpecLoad, ErrorKind::Config);

    let mut member = member_of("pod");
    member["annotations"]
        .as_object_mut()
        .unwrap()
        .remove("ocid/sandbox_name");
    let err = h.create("c4", &member).await.unwrap_err();
    assert_failed(&err, Stage::SandboxResolution, ErrorKind::Config);
}

#[tokio::test]
async fn test_launch_failure_then_retry() {
    let h = Harness::new();
    h.driver.fail_launches("/dev/kvm: permission denied");

    let err = h.create("pod", &spec()).await.unwrap_err();
    assert_failed(&err, Stage::SandboxCreation, ErrorKind::Resource);
    assert!(err.to_string().contains("/dev/kvm"));
    assert!(!h.store().dir("pod").exists());

    h.driver.heal();
    h.create("pod", &spec()).await.unwrap();
    assert_eq!(h.driver.running(), 1);
}

#[tokio::test]
async fn test_failed_container_destroys_new_sandbox() {
    let h = Harness::new();
    let mut bad = spec();
    bad["process"]["args"] = json!([]);

    let err = h.create("pod", &bad).await.unwrap_err();
    assert_failed(&err, Stage::ContainerCreation, ErrorKind::Config);
    assert_eq!(h.driver.torn_down(), vec!["pod"]);
    assert_eq!(h.driver.running(), 0);
    assert!(!h.store().exists("pod"));
    assert!(!h.store().dir("pod").exists());

    h.create("pod", &spec()).await.unwrap();
    assert_eq!(h.driver.running(), 1);
}

#[tokio::test]
async fn test_failed_member_rolls_back() {
    let h = Harness::new();
    h.create("pod", &spec()).await.unwrap();
    let guest = h.driver.guest("pod").unwrap();
    guest.fail_on(methods::NEW_CONTAINER, -32603, "no space left on device");

    let err = h.create("c1", &member_of("pod")).await.unwrap_err();
    assert_failed(&err, Stage::ContainerCreation, ErrorKind::Agent);
    assert!(!h.store().exists("c1"));
    assert!(!h.store().dir("c1").exists());
    assert_eq!(h.record("pod").containers, vec!["pod"]);
    assert_eq!(h.driver.running(), 1);
    assert!(!guest.is_destroyed());
    assert!(!guest.calls().iter().any(|c| c == methods::SIGNAL_PROCESS));

    guest.clear_failure(methods::NEW_CONTAINER);
    h.create("c1", &member_of("pod")).await.unwrap();
    assert_eq!(h.record("pod").containers, vec!["pod", "c1"]);
}

#[tokio::test]
async fn test_join_missing_or_dead_sandbox() {
    let h = Harness::new();
    let err = h.create("c1", &member_of("pod")).await.unwrap_err();
    assert_failed(&err, Stage::SandboxCreation, ErrorKind::Resolution);

    let pod = h.create("pod", &spec()).await.unwrap();
    h.driver.crash("pod", pod.state.pid);
    let err = h.create("c1", &member_of("pod")).await.unwrap_err();
    assert_failed(&err, Stage::SandboxCreation, ErrorKind::Resolution);
    assert!(!h.store().exists("c1"));
}

#[tokio::test]
async fn test_namespace_path_resolution_errors() {
    let h = Harness::new();
    let a = h.create("pod-a", &spec()).await.unwrap();
    let b = h.create("pod-b", &spec()).await.unwrap();

    let err = h
        .create(
            "c1",
            &sharing(json!([
                { "type": "network", "path": format!("/proc/{}/ns/net", a.state.pid) },
                { "type": "ipc", "path": format!("/proc/{}/ns/ipc", b.state.pid) },
            ])),
        )
        .await
        .unwrap_err();
    assert_failed(&err, Stage::SandboxResolution, ErrorKind::Resolution);
    assert!(err.to_string().contains("pod-a"), "{err}");

    let err = h
        .create("c2", &sharing(json!([{ "type": "network", "path": "/proc/4/ns/net" }])))
        .await
        .unwrap_err();
    assert_failed(&err, Stage::SandboxResolution, ErrorKind::Resolution);

    let err = h
        .create("c3", &sharing(json!([{ "type": "network", "path": "/proc/x/ns/net" }])))
        .await
        .unwrap_err();
    assert_failed(&err, Stage::SandboxResolution, ErrorKind::Resolution);
    assert_eq!(h.driver.launches(), 2);
}

#[tokio::test]
async fn test_concurrent_creates_of_one_id() {
    let h = Harness::new();
    h.driver.set_launch_delay(Duration::from_millis(50));
    let options = h.options("pod", &spec());

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            let options = options.clone();
            tokio::spawn(async move { orchestrator.create_container(options).await })
        })
        .collect();
    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.kind(), ErrorKind::Precondition, "{err}");
    }
    assert_eq!(h.driver.running(), 1);
    assert_eq!(h.driver.launches(), 1);
    assert_eq!(h.record("pod").containers, vec!["pod"]);
}

#[tokio::test]
async fn test_concurrent_members_are_serialized() {
    let h = Harness::new();
    h.create("pod", &spec()).await.unwrap();

    let ids: Vec<String> = (0..5).map(|i| format!("c{i}")).collect();
    let tasks: Vec<_> = ids
        .iter()
        .map(|id| {
            let orchestrator = h.orchestrator.clone();
            let options = h.options(id, &member_of("pod"));
            tokio::spawn(async move { orchestrator.create_container(options).await })
        })
        .collect();
    for task in futures::future::join_all(tasks).await {
        assert_eq!(task.unwrap().unwrap().sandbox, "pod");
    }

    let mut members = h.record("pod").containers;
    members.sort();
    let mut expected = ids.clone();
    expected.push("pod".into());
    expected.sort();
    assert_eq!(members, expected);
    assert_eq!(h.driver.launches(), 1);
}

#[tokio::test]
async fn test_stream_position_survives_rejoin() {
    let h = Harness::new();
    h.create("pod", &spec()).await.unwrap();
    let guest = h.driver.guest("pod").unwrap();
    guest.emit_stdout("pod", "init", b"ready\n");

    let mut buf = [0u8; 16];
    let n = guest.read_stdout("pod", "init", &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ready\n");

    h.create("c1", &member_of("pod")).await.unwrap();
    assert_eq!(h.record("pod").last_stream_seq, guest.last_stream_seq());
    assert!(h.record("pod").last_stream_seq > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_members_with_one_id() {
    let h = Harness::new();
    h.create("pod", &spec()).await.unwrap();
    let options = h.options("c1", &member_of("pod"));

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            let options = options.clone();
            tokio::spawn(async move { orchestrator.create_container(options).await })
        })
        .collect();
    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_failed(err, Stage::DuplicateId, ErrorKind::Precondition);
    }

    // The winner's container is untouched by the loser
    let guest = h.driver.guest("pod").unwrap();
    assert!(h.store().exists("c1"));
    assert_eq!(h.store().load("c1").unwrap().sandbox.as_deref(), Some("pod"));
    assert!(guest.signals_of("c1", "init").is_empty());
    assert_eq!(h.record("pod").containers, vec!["pod", "c1"]);
    assert!(!h.store().dir("c1").join(skerry_core::LOCK_FILE).exists());
}

#[tokio::test]
async fn test_member_id_held_by_sandbox_create_is_rejected() {
    let h = Harness::new();
    h.create("pod", &spec()).await.unwrap();

    // Another create holds the lock of a new sandbox named c1
    let held = SandboxLock::acquire(&h.store().dir("c1")).await.unwrap();
    let err = h.create("c1", &member_of("pod")).await.unwrap_err();
    assert_failed(&err, Stage::DuplicateId, ErrorKind::Precondition);

    let guest = h.driver.guest("pod").unwrap();
    assert_eq!(guest.container_ids(), vec!["pod"]);
    assert_eq!(h.record("pod").containers, vec!["pod"]);
    assert!(!h.store().exists("c1"));
    drop(held);

    // The pod lock was released despite the failure
    h.create("c1", &member_of("pod")).await.unwrap();
    assert_eq!(guest.container_ids(), vec!["c1", "pod"]);
}

#[tokio::test]
async fn test_sandbox_create_after_member_of_same_id() {
    let h = Harness::new();
    h.create("pod", &spec()).await.unwrap();
    h.create("c1", &member_of("pod")).await.unwrap();

    let err = h.create("c1", &spec()).await.unwrap_err();
    assert_failed(&err, Stage::DuplicateId, ErrorKind::Precondition);
    assert_eq!(h.driver.launches(), 1);
    assert_eq!(h.store().load("c1").unwrap().sandbox.as_deref(), Some("pod"));
}
