//! JsonHyperstart against a scripted guest on the other end of a socket pair.

use serde_json::{json, Value};
use skerry_hyperstart::protocol::{self, error_codes};
use skerry_hyperstart::{Hyperstart, HyperstartError, JsonHyperstart};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};

struct Guest {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Guest {
    fn new(stream: UnixStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn recv(&mut self) -> Value {
        let line = self
            .lines
            .next_line()
            .await
            .unwrap()
            .expect("host closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    async fn send(&mut self, frame: Value) {
        let mut line = frame.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn reply(&mut self, request: &Value, result: Value) {
        self.send(json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }))
            .await;
    }

    async fn fail(&mut self, request: &Value, code: i32, message: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": { "code": code, "message": message },
        }))
        .await;
    }

    async fn stream(&mut self, process: &str, seq: u64, data: &[u8], eof: bool) {
        self.send(json!({
            "jsonrpc": "2.0",
            "method": "stream",
            "params": {
                "container": "c1",
                "process": process,
                "stream": "stdout",
                "seq": seq,
                "data": protocol::encode(data),
                "eof": eof,
            }
        }))
        .await;
    }

    /// Answer the hello request and return its params.
    async fn accept_hello(&mut self) -> Value {
        let hello = self.recv().await;
        assert_eq!(hello["method"], "hello");
        self.reply(&hello, json!({})).await;
        hello["params"].clone()
    }
}

async fn connected(last_stream_seq: u64) -> (JsonHyperstart, Guest) {
    let (host, guest) = UnixStream::pair().unwrap();
    let mut guest = Guest::new(guest);
    let (client, _) = tokio::join!(
        JsonHyperstart::from_stream(host, last_stream_seq),
        guest.accept_hello()
    );
    (client.unwrap(), guest)
}

#[tokio::test]
async fn test_hello_carries_resume_point() {
    let (host, guest) = UnixStream::pair().unwrap();
    let mut guest = Guest::new(guest);
    let (client, params) = tokio::join!(JsonHyperstart::from_stream(host, 42), guest.accept_hello());
    let client = client.unwrap();

    assert_eq!(params["last_stream_seq"], 42);
    assert_eq!(params["version"], skerry_hyperstart::API_VERSION);
    assert_eq!(client.last_stream_seq(), 42);
}

#[tokio::test]
async fn test_connect_performs_vsock_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let guest = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "CONNECT 1024");
        writer.write_all(b"OK 1073741824\n").await.unwrap();

        let hello: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(hello["method"], "hello");
        let reply = json!({ "jsonrpc": "2.0", "id": hello["id"], "result": {} });
        writer
            .write_all(format!("{reply}\n").as_bytes())
            .await
            .unwrap();
        // Hold the connection open until the host is done
        let _ = lines.next_line().await;
    });

    let client = JsonHyperstart::connect(&path, 1024, 0).await.unwrap();
    client.close().await;
    drop(client);
    guest.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_responses() {
    let (client, mut guest) = connected(0).await;
    let client = Arc::new(client);

    let a = tokio::spawn({
        let client = client.clone();
        async move { client.wait_process("c1", "a").await }
    });
    let b = tokio::spawn({
        let client = client.clone();
        async move { client.wait_process("c1", "b").await }
    });

    let first = guest.recv().await;
    let second = guest.recv().await;
    // Answer in reverse order of arrival
    for request in [&second, &first] {
        let code = if request["params"]["process"] == "a" { 1 } else { 2 };
        guest.reply(request, json!({ "exit_code": code })).await;
    }

    assert_eq!(a.await.unwrap().unwrap(), 1);
    assert_eq!(b.await.unwrap().unwrap(), 2);
}

#[tokio::test]
async fn test_agent_error_is_reported_with_code() {
    let (client, mut guest) = connected(0).await;

    let call = client.signal_process("nope", "init", skerry_hyperstart::Signal::SIGTERM);
    let serve = async {
        let request = guest.recv().await;
        assert_eq!(request["method"], "signal_process");
        assert_eq!(request["params"]["signal"], 15);
        guest.fail(&request, error_codes::NOT_FOUND, "no such container").await;
    };
    let (result, _) = tokio::join!(call, serve);

    match result.unwrap_err() {
        HyperstartError::Agent { code, message } => {
            assert_eq!(code, error_codes::NOT_FOUND);
            assert_eq!(message, "no such container");
        }
        other => panic!("expected agent error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_guest_hangup_fails_pending_and_later_calls() {
    let (client, mut guest) = connected(0).await;

    let call = client.api_version();
    let serve = async {
        let request = guest.recv().await;
        assert_eq!(request["method"], "version");
        drop(guest);
    };
    let (result, _) = tokio::join!(call, serve);
    assert!(result.unwrap_err().is_transport());

    let err = client.online_cpu_mem().await.unwrap_err();
    assert!(err.is_transport());

    // A stream the guest never wrote to ends with the channel too
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(
        Duration::from_secs(2),
        client.read_stdout("c1", "init", &mut buf),
    )
    .await
    .expect("read on a lost channel must not block");
    assert!(read.unwrap_err().is_transport());
}

#[tokio::test]
async fn test_reads_after_close_fail() {
    let (client, _guest) = connected(0).await;
    client.close().await;

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(
        Duration::from_secs(2),
        client.read_stderr("c1", "init", &mut buf),
    )
    .await
    .expect("read on a closed client must not block");
    assert!(read.unwrap_err().is_transport());
    assert!(matches!(
        client.online_cpu_mem().await,
        Err(HyperstartError::Closed)
    ));
}

#[tokio::test]
async fn test_stream_replays_are_dropped() {
    let (client, mut guest) = connected(0).await;

    guest.stream("init", 1, b"hel", false).await;
    guest.stream("init", 1, b"hel", false).await;
    guest.stream("init", 2, b"lo", false).await;
    guest.stream("init", 3, b"", true).await;

    let mut out = Vec::new();
    let mut buf = [0u8; 2];
    loop {
        let n = client.read_stdout("c1", "init", &mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert_eq!(out, b"hello");
    assert_eq!(client.last_stream_seq(), 3);
}

#[tokio::test]
async fn test_resumed_client_skips_delivered_frames() {
    let (client, mut guest) = connected(5).await;

    guest.stream("init", 4, b"old", false).await;
    guest.stream("init", 6, b"new", true).await;

    let mut buf = [0u8; 16];
    let n = client.read_stdout("c1", "init", &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"new");
    assert_eq!(client.last_stream_seq(), 6);
}

#[tokio::test]
async fn test_pause_waits_for_in_flight_calls() {
    let (client, mut guest) = connected(0).await;
    let client = Arc::new(client);

    let write = tokio::spawn({
        let client = client.clone();
        async move { client.write_file("c1", "/tmp/x", b"data").await }
    });
    let request = guest.recv().await;
    assert_eq!(request["method"], "write_file");
    assert_eq!(protocol::decode(request["params"]["data"].as_str().unwrap()).unwrap(), b"data");

    let pause = tokio::spawn({
        let client = client.clone();
        async move { client.pause_sync().await }
    });

    // No pause request while write_file is outstanding
    let early = tokio::time::timeout(Duration::from_millis(100), guest.recv()).await;
    assert!(early.is_err(), "pause sent before in-flight call completed");

    guest.reply(&request, json!({})).await;
    write.await.unwrap().unwrap();

    let request = guest.recv().await;
    assert_eq!(request["method"], "pause");
    guest.reply(&request, json!({})).await;
    pause.await.unwrap().unwrap();

    assert!(matches!(
        client.api_version().await,
        Err(HyperstartError::Paused)
    ));

    // A second pause is a no-op
    client.pause_sync().await.unwrap();

    let unpause = tokio::spawn({
        let client = client.clone();
        async move { client.unpause().await }
    });
    let request = guest.recv().await;
    assert_eq!(request["method"], "unpause");
    guest.reply(&request, json!({})).await;
    unpause.await.unwrap().unwrap();

    let version = tokio::spawn({
        let client = client.clone();
        async move { client.api_version().await }
    });
    let request = guest.recv().await;
    assert_eq!(request["method"], "version");
    guest.reply(&request, json!({ "version": 4244 })).await;
    assert_eq!(version.await.unwrap().unwrap(), 4244);
}

#[tokio::test]
async fn test_wait_is_not_blocked_by_pause() {
    let (client, mut guest) = connected(0).await;
    let client = Arc::new(client);

    let pause = tokio::spawn({
        let client = client.clone();
        async move { client.pause_sync().await }
    });
    let request = guest.recv().await;
    assert_eq!(request["method"], "pause");
    guest.reply(&request, json!({})).await;
    pause.await.unwrap().unwrap();

    let wait = tokio::spawn({
        let client = client.clone();
        async move { client.wait_process("c1", "init").await }
    });
    let request = guest.recv().await;
    assert_eq!(request["method"], "wait_process");
    guest.reply(&request, json!({ "exit_code": 0 })).await;
    assert_eq!(wait.await.unwrap().unwrap(), 0);
}
