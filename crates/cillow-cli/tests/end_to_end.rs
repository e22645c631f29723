//! End-to-end scenarios against a live broker with real interpreter workers.
//!
//! Each test binds a broker on a free port, connects a DEALER client, and
//! drives the wire protocol exactly as an external client would. The tests
//! spawn real worker subprocesses (this binary with the hidden `worker`
//! subcommand), so they are ignored by default.
//!
//! Run with: `cargo test -p cillow-cli --test end_to_end -- --ignored`

use std::path::PathBuf;
use std::time::Duration;

use cillow::protocol::{decode_frame, encode_request, Environment, Request, ResponseFrame};
use cillow::{broker, ErrorKind, ServerConfig};
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

const RECV_TIMEOUT: Duration = Duration::from_secs(60);

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind probe socket")
        .local_addr()
        .expect("local addr")
        .port()
}

fn test_config(port: u16, max_interpreters: usize, per_client: usize) -> ServerConfig {
    ServerConfig {
        port,
        max_interpreters,
        interpreters_per_client: per_client,
        worker_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_cillow"))),
        ..ServerConfig::default()
    }
}

struct TestBroker {
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    port: u16,
}

impl TestBroker {
    async fn start(config: ServerConfig) -> Self {
        let port = config.port;
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(broker::serve(config, async {
            let _ = shutdown_rx.await;
        }));
        // Give the router socket a moment to bind before clients connect.
        tokio::time::sleep(Duration::from_millis(300)).await;
        Self {
            shutdown: Some(shutdown_tx),
            handle,
            port,
        }
    }

    async fn client(&self) -> zeromq::DealerSocket {
        let mut socket = zeromq::DealerSocket::new();
        socket
            .connect(&format!("tcp://127.0.0.1:{}", self.port))
            .await
            .expect("connect dealer");
        socket
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let result = tokio::time::timeout(Duration::from_secs(30), self.handle)
            .await
            .expect("broker should stop within the grace period")
            .expect("broker task join");
        result.expect("broker exits cleanly");
    }
}

async fn send_request(socket: &mut zeromq::DealerSocket, request: &Request) {
    let payload = encode_request(request).expect("encode request");
    socket
        .send(ZmqMessage::from(payload))
        .await
        .expect("send request");
}

async fn recv_until_end(socket: &mut zeromq::DealerSocket) -> Vec<ResponseFrame> {
    let mut frames = Vec::new();
    loop {
        let message = tokio::time::timeout(RECV_TIMEOUT, socket.recv())
            .await
            .expect("response frame before timeout")
            .expect("socket recv");
        let parts = message.into_vec();
        let payload = parts.last().expect("payload part");
        let frame = decode_frame(payload).expect("decode frame");
        let is_end = frame.is_end();
        frames.push(frame);
        if is_end {
            return frames;
        }
    }
}

async fn run_code(socket: &mut zeromq::DealerSocket, source: &str) -> Vec<ResponseFrame> {
    run_code_in(socket, Environment::System, source).await
}

async fn run_code_in(
    socket: &mut zeromq::DealerSocket,
    env: Environment,
    source: &str,
) -> Vec<ResponseFrame> {
    send_request(
        socket,
        &Request::RunCode {
            env,
            source: source.to_string(),
        },
    )
    .await;
    recv_until_end(socket).await
}

// Scenario: hello world. One stdout chunk, a null result, exactly one End.
#[tokio::test]
#[ignore = "slow: spawns interpreter workers"]
async fn hello_world() {
    let broker = TestBroker::start(test_config(free_port(), 2, 1)).await;
    let mut client = broker.client().await;

    let frames = run_code(&mut client, "print('hi')").await;
    assert_eq!(
        frames,
        vec![
            ResponseFrame::stream("stdout", "hi\n"),
            ResponseFrame::Result {
                value: serde_json::Value::Null
            },
            ResponseFrame::End,
        ]
    );

    broker.stop().await;
}

// Scenario: expression value, and namespace persistence across requests on
// one interpreter.
#[tokio::test]
#[ignore = "slow: spawns interpreter workers"]
async fn expression_value_and_persistence() {
    let broker = TestBroker::start(test_config(free_port(), 2, 1)).await;
    let mut client = broker.client().await;

    let frames = run_code(&mut client, "x = 2\nx + 3").await;
    assert_eq!(
        frames,
        vec![
            ResponseFrame::Result {
                value: serde_json::json!(5)
            },
            ResponseFrame::End,
        ]
    );

    let frames = run_code(&mut client, "x * 10").await;
    assert_eq!(
        frames,
        vec![
            ResponseFrame::Result {
                value: serde_json::json!(20)
            },
            ResponseFrame::End,
        ]
    );

    broker.stop().await;
}

// Scenario: artifact capture through the worker's emit seam.
#[tokio::test]
#[ignore = "slow: spawns interpreter workers"]
async fn artifact_byte_stream() {
    let broker = TestBroker::start(test_config(free_port(), 2, 1)).await;
    let mut client = broker.client().await;

    let frames = run_code(
        &mut client,
        "import _cillow\n_cillow.emit('image', b'\\x89PNG', 'fig-1')",
    )
    .await;
    assert_eq!(
        frames,
        vec![
            ResponseFrame::ByteStream {
                stream: "image".to_string(),
                id: Some("fig-1".to_string()),
                bytes: b"\x89PNG".to_vec(),
            },
            ResponseFrame::Result {
                value: serde_json::Value::Null
            },
            ResponseFrame::End,
        ]
    );

    broker.stop().await;
}

// Scenario: quota refusal. With one interpreter per client, a second
// environment is refused without disturbing the first worker.
#[tokio::test]
#[ignore = "slow: spawns interpreter workers"]
async fn per_client_quota_refusal() {
    let broker = TestBroker::start(test_config(free_port(), 4, 1)).await;
    let mut client = broker.client().await;

    let frames = run_code(&mut client, "opened = True").await;
    assert_eq!(
        frames,
        vec![
            ResponseFrame::Result {
                value: serde_json::Value::Null
            },
            ResponseFrame::End
        ]
    );

    let other_env = tempdir_env();
    let frames = run_code_in(&mut client, other_env, "1").await;
    assert_eq!(frames.len(), 2);
    assert!(matches!(
        &frames[0],
        ResponseFrame::Exception(exc) if exc.kind == ErrorKind::PerClientQuotaExceeded
    ));
    assert!(frames[1].is_end());

    // The first worker is untouched: its namespace is still live.
    let frames = run_code(&mut client, "opened").await;
    assert_eq!(
        frames,
        vec![
            ResponseFrame::Result {
                value: serde_json::json!(true)
            },
            ResponseFrame::End,
        ]
    );

    broker.stop().await;
}

// Scenario: delete then re-run lands in a fresh namespace.
#[tokio::test]
#[ignore = "slow: spawns interpreter workers"]
async fn delete_interpreter_gives_fresh_namespace() {
    let broker = TestBroker::start(test_config(free_port(), 2, 1)).await;
    let mut client = broker.client().await;

    let frames = run_code(&mut client, "marker = 1").await;
    assert_eq!(
        frames,
        vec![
            ResponseFrame::Result {
                value: serde_json::Value::Null
            },
            ResponseFrame::End
        ]
    );

    send_request(
        &mut client,
        &Request::DeleteInterpreter {
            env: Environment::System,
        },
    )
    .await;
    let frames = recv_until_end(&mut client).await;
    assert_eq!(
        frames,
        vec![
            ResponseFrame::Result {
                value: serde_json::Value::Null
            },
            ResponseFrame::End
        ]
    );

    // Deleting an environment with no worker is UnknownEnvironment.
    send_request(
        &mut client,
        &Request::DeleteInterpreter {
            env: Environment::System,
        },
    )
    .await;
    let frames = recv_until_end(&mut client).await;
    assert!(matches!(
        &frames[0],
        ResponseFrame::Exception(exc) if exc.kind == ErrorKind::UnknownEnvironment
    ));

    let frames = run_code(&mut client, "marker").await;
    assert!(
        matches!(
            &frames[0],
            ResponseFrame::Exception(exc)
                if exc.kind == ErrorKind::UserCodeError && exc.message.starts_with("NameError")
        ),
        "fresh namespace expected: {frames:?}"
    );

    broker.stop().await;
}

// Scenario: clean client shutdown reclaims every worker the client held.
#[tokio::test]
#[ignore = "slow: spawns interpreter workers"]
async fn shutdown_client_reclaims_workers() {
    let broker = TestBroker::start(test_config(free_port(), 2, 1)).await;
    let mut client = broker.client().await;

    let frames = run_code(&mut client, "x = 1").await;
    assert_eq!(
        frames,
        vec![
            ResponseFrame::Result {
                value: serde_json::Value::Null
            },
            ResponseFrame::End
        ]
    );

    send_request(&mut client, &Request::ShutdownClient).await;
    let frames = recv_until_end(&mut client).await;
    assert_eq!(
        frames,
        vec![
            ResponseFrame::Result {
                value: serde_json::Value::Null
            },
            ResponseFrame::End
        ]
    );

    // A new request after shutdown spawns a fresh worker (fresh namespace).
    let frames = run_code(&mut client, "'x' in dir()").await;
    assert_eq!(
        frames,
        vec![
            ResponseFrame::Result {
                value: serde_json::json!(false)
            },
            ResponseFrame::End,
        ]
    );

    broker.stop().await;
}

fn tempdir_env() -> Environment {
    let dir = std::env::temp_dir().join(format!("cillow-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create env dir");
    Environment::parse(dir.to_str().expect("utf-8 temp path"))
}
