//! End-to-end tests driving real sockets: server lifecycle, all three
//! client flavors, error propagation and the parallelism policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};

use corerpc::protocol::{read_line, write_line, ArgSpec, MethodDoc};
use corerpc::pyon::{decode, Value};
use corerpc::{
    AsyncClient, BestEffortClient, Client, ClientConfig, ClientError, PackedException, Server,
    Target, TargetSelector, Targets,
};

fn test_object() -> Value {
    Value::list([
        Value::Int(5),
        Value::Float(2.1),
        Value::None,
        Value::Bool(true),
        Value::Bool(false),
        Value::dict([
            (Value::str("a"), Value::Int(5)),
            (Value::Int(2), Value::list([])),
        ]),
        Value::tuple([Value::Int(4), Value::Int(5)]),
        Value::tuple([Value::Int(10)]),
        Value::str("ab\nx\"'"),
    ])
}

struct Echo;

#[async_trait]
impl Target for Echo {
    fn docstring(&self) -> Option<String> {
        Some("Example target used by the test suite.".to_owned())
    }

    fn method_list(&self) -> Vec<String> {
        ["echo", "raise_value_error", "sleep_ms", "plus", "output_value"]
            .map(String::from)
            .to_vec()
    }

    fn document_method(&self, name: &str) -> Option<MethodDoc> {
        match name {
            "plus" => Some(MethodDoc {
                argspec: ArgSpec {
                    args: vec!["a".to_owned(), "b".to_owned()],
                    defaults: vec![Value::Int(0)],
                    varargs: None,
                    varkw: None,
                },
                doc: Some("Adds two numbers.".to_owned()),
            }),
            _ => None,
        }
    }

    async fn invoke(
        &self,
        name: &str,
        mut args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, PackedException> {
        match name {
            "echo" => Ok(args.pop().unwrap_or(Value::None)),
            "raise_value_error" => Err(PackedException::new("ValueError", "deliberate failure")),
            "sleep_ms" => {
                let ms = args
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| PackedException::new("TypeError", "sleep_ms wants an int"))?;
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                Ok(Value::None)
            }
            "plus" => {
                let a = args
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| PackedException::new("TypeError", "plus wants ints"))?;
                let b = args
                    .get(1)
                    .or_else(|| {
                        kwargs
                            .iter()
                            .find(|(k, _)| k == "b")
                            .map(|(_, v)| v)
                    })
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                Ok(Value::Int(a + b))
            }
            "output_value" => Ok(test_object()),
            other => Err(corerpc::target::unknown_method(other)),
        }
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn start_echo_server() -> (Server, u16) {
    init_logging();
    let mut targets = Targets::new();
    targets.add_instance("echo", Arc::new(Echo)).unwrap();
    let mut server = Server::new(targets)
        .with_description("test server")
        .with_builtin_terminate();
    server.start("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    (server, port)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocking_client_echo_and_remote_error() {
    let (mut server, port) = start_echo_server().await;

    tokio::task::spawn_blocking(move || {
        let mut client =
            Client::connect("127.0.0.1", port, TargetSelector::name("echo")).unwrap();
        assert_eq!(client.target_name(), "echo");
        assert_eq!(client.description(), Some("test server"));

        let obj = test_object();
        let back = client.call("echo", vec![obj.clone()], vec![]).unwrap();
        assert_eq!(back, obj);

        // a remote exception is not a transport failure
        match client.call("raise_value_error", vec![], vec![]) {
            Err(ClientError::Remote(e)) => {
                assert_eq!(e.class, "ValueError");
                assert_eq!(e.message, "deliberate failure");
            }
            other => panic!("expected remote error, got {:?}", other.map(|_| ())),
        }
        assert!(!client.is_closed());

        // unknown methods are rejected locally
        assert!(matches!(
            client.call("warp", vec![], vec![]),
            Err(ClientError::MethodNotFound(_))
        ));

        client.close().unwrap();
    })
    .await
    .unwrap();

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_client_echo() {
    let (mut server, port) = start_echo_server().await;

    let client = AsyncClient::connect("127.0.0.1", port, TargetSelector::name("echo"))
        .await
        .unwrap();
    let back = client
        .call(
            "plus",
            vec![Value::Int(2)],
            vec![("b".to_owned(), Value::Int(40))],
        )
        .await
        .unwrap();
    assert_eq!(back, Value::Int(42));

    let out = client.call("output_value", vec![], vec![]).await.unwrap();
    assert_eq!(out, test_object());

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_builtin_terminate() {
    let (mut server, port) = start_echo_server().await;

    let client = AsyncClient::connect("127.0.0.1", port, TargetSelector::Auto)
        .await
        .unwrap();
    // terminate is advertised, so the local method check passes; the server
    // closes without a response, which surfaces as a lost connection
    assert!(matches!(
        client.call("terminate", vec![], vec![]).await,
        Err(ClientError::ConnectionLost)
    ));

    tokio::time::timeout(Duration::from_secs(5), server.wait_terminate())
        .await
        .expect("terminate event not set");
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_method_list_document() {
    let (mut server, port) = start_echo_server().await;

    let client = AsyncClient::connect("127.0.0.1", port, TargetSelector::name("echo"))
        .await
        .unwrap();
    assert!(client.methods().contains(&"plus".to_owned()));
    assert!(client.methods().contains(&"terminate".to_owned()));

    let doc = client.get_rpc_method_list().await.unwrap();
    assert_eq!(
        doc.docstring.as_deref(),
        Some("Example target used by the test suite.")
    );
    let plus = doc
        .methods
        .iter()
        .find(|(name, _)| name == "plus")
        .map(|(_, doc)| doc)
        .expect("plus not documented");
    assert_eq!(plus.argspec.args, ["a", "b"]);
    assert_eq!(plus.argspec.defaults, [Value::Int(0)]);
    assert_eq!(plus.doc.as_deref(), Some("Adds two numbers."));
    assert!(doc.methods.iter().any(|(name, _)| name == "terminate"));

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_target_selection_errors() {
    let mut targets = Targets::new();
    targets.add_instance("alpha", Arc::new(Echo)).unwrap();
    targets.add_instance("beta", Arc::new(Echo)).unwrap();
    let mut server = Server::new(targets);
    server.start("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();

    assert!(matches!(
        AsyncClient::connect("127.0.0.1", port, TargetSelector::Auto).await,
        Err(ClientError::AmbiguousTarget(2))
    ));
    assert!(matches!(
        AsyncClient::connect("127.0.0.1", port, TargetSelector::name("gamma")).await,
        Err(ClientError::UnknownTarget(_))
    ));
    let client = AsyncClient::connect("127.0.0.1", port, TargetSelector::name("beta"))
        .await
        .unwrap();
    assert_eq!(client.target_name(), "beta");

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_best_effort_reconnects() {
    // reserve a port, then let the client fail against it first
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let config = ClientConfig {
        connect_timeout_ms: 1000,
        firstcon_timeout_ms: 200,
        retry_ms: 100,
    };
    let client = tokio::task::spawn_blocking(move || {
        let client =
            BestEffortClient::connect("127.0.0.1", port, TargetSelector::name("echo"), config);
        // unreachable server degrades to the None sentinel
        assert!(client.is_reconnecting());
        assert_eq!(
            client.call("echo", vec![Value::Int(1)], vec![]).unwrap(),
            None
        );
        client
    })
    .await
    .unwrap();

    let mut targets = Targets::new();
    targets.add_instance("echo", Arc::new(Echo)).unwrap();
    let mut server = Server::new(targets);
    server.start(&format!("127.0.0.1:{}", port)).await.unwrap();

    tokio::task::spawn_blocking(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match client.call("echo", vec![Value::Int(7)], vec![]).unwrap() {
                Some(ret) => {
                    assert_eq!(ret, Value::Int(7));
                    break;
                }
                None => {
                    assert!(Instant::now() < deadline, "client never reconnected");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
        client.close();
    })
    .await
    .unwrap();

    server.stop().await.unwrap();
}

async fn timed_parallel_sleeps(port: u16) -> Duration {
    let a = AsyncClient::connect("127.0.0.1", port, TargetSelector::name("echo"))
        .await
        .unwrap();
    let b = AsyncClient::connect("127.0.0.1", port, TargetSelector::name("echo"))
        .await
        .unwrap();
    let started = Instant::now();
    let (ra, rb) = tokio::join!(
        a.call("sleep_ms", vec![Value::Int(300)], vec![]),
        b.call("sleep_ms", vec![Value::Int(300)], vec![]),
    );
    ra.unwrap();
    rb.unwrap();
    let elapsed = started.elapsed();
    a.close().await.unwrap();
    b.close().await.unwrap();
    elapsed
}

#[tokio::test(flavor = "multi_thread")]
async fn test_calls_serialized_by_default() {
    let mut targets = Targets::new();
    targets.add_instance("echo", Arc::new(Echo)).unwrap();
    let mut server = Server::new(targets);
    server.start("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();

    let elapsed = timed_parallel_sleeps(port).await;
    assert!(
        elapsed >= Duration::from_millis(550),
        "calls overlapped: {:?}",
        elapsed
    );
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allow_parallel_overlaps_calls() {
    let mut targets = Targets::new();
    targets.add_instance("echo", Arc::new(Echo)).unwrap();
    let mut server = Server::new(targets).with_allow_parallel();
    server.start("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();

    let elapsed = timed_parallel_sleeps(port).await;
    assert!(
        elapsed < Duration::from_millis(550),
        "calls did not overlap: {:?}",
        elapsed
    );
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_method_list_waits_for_running_call() {
    let mut targets = Targets::new();
    targets.add_instance("echo", Arc::new(Echo)).unwrap();
    let mut server = Server::new(targets);
    server.start("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();

    let a = AsyncClient::connect("127.0.0.1", port, TargetSelector::name("echo"))
        .await
        .unwrap();
    let b = AsyncClient::connect("127.0.0.1", port, TargetSelector::name("echo"))
        .await
        .unwrap();

    let slow = tokio::spawn(async move {
        a.call("sleep_ms", vec![Value::Int(400)], vec![]).await.unwrap();
        a
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // introspection shares the serialization lock with calls
    let started = Instant::now();
    b.get_rpc_method_list().await.unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(200),
        "method list overlapped a running call: {:?}",
        started.elapsed()
    );

    let a = slow.await.unwrap();
    a.close().await.unwrap();
    b.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_best_effort_close_cancels_reconnect() {
    // reserve a port with nothing listening on it
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let config = ClientConfig {
        connect_timeout_ms: 1000,
        firstcon_timeout_ms: 100,
        retry_ms: 60_000,
    };
    tokio::task::spawn_blocking(move || {
        let client =
            BestEffortClient::connect("127.0.0.1", port, TargetSelector::name("echo"), config);
        assert!(client.is_reconnecting());
        // close must not wait out the retry interval
        let started = Instant::now();
        client.close();
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "close blocked on the retry interval: {:?}",
            started.elapsed()
        );
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inspect_server() {
    let (mut server, port) = start_echo_server().await;

    let ident = corerpc::network::inspect_server("127.0.0.1", port, &ClientConfig::default())
        .await
        .unwrap();
    assert_eq!(ident.targets, ["echo"]);
    assert_eq!(ident.description.as_deref(), Some("test server"));
    assert!(ident.features.iter().any(|f| f == "pyon_v2"));

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_target_closes_silently() {
    let (mut server, port) = start_echo_server().await;

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_line(&mut write_half, "corerpc 1").await.unwrap();
    read_line(&mut reader).await.unwrap().unwrap(); // identification
    write_line(&mut write_half, "ghost pyon_v2").await.unwrap();
    // no error line, just EOF
    assert!(read_line(&mut reader).await.unwrap().is_none());

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_banner_closes_silently() {
    let (mut server, port) = start_echo_server().await;

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // the server speaks only after a valid client banner; anything else
    // ends the connection without a reply
    write_line(&mut write_half, "GET / HTTP/1.1").await.unwrap();
    assert!(read_line(&mut reader).await.unwrap().is_none());

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_feature_closes_silently() {
    let (mut server, port) = start_echo_server().await;

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_line(&mut write_half, "corerpc 1").await.unwrap();
    read_line(&mut reader).await.unwrap().unwrap(); // identification
    // a feature token the server does not understand ends the session even
    // though a common encoding was also offered
    write_line(&mut write_half, "echo pyon_v2 mystery_token")
        .await
        .unwrap();
    assert!(read_line(&mut reader).await.unwrap().is_none());

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_feature_closes_silently() {
    let (mut server, port) = start_echo_server().await;

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_line(&mut write_half, "corerpc 1").await.unwrap();
    read_line(&mut reader).await.unwrap().unwrap(); // identification
    write_line(&mut write_half, "echo pyon_v1").await.unwrap();
    assert!(read_line(&mut reader).await.unwrap().is_none());

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_request_keeps_session() {
    let (mut server, port) = start_echo_server().await;

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_line(&mut write_half, "corerpc 1").await.unwrap();
    read_line(&mut reader).await.unwrap().unwrap(); // identification
    write_line(&mut write_half, "echo pyon_v2").await.unwrap();
    read_line(&mut reader).await.unwrap().unwrap(); // method list

    // garbage gets a failed response, not a dropped connection
    write_line(&mut write_half, "this is not a request").await.unwrap();
    let line = read_line(&mut reader).await.unwrap().unwrap();
    let response = decode(&line).unwrap();
    assert_eq!(response.get("status").unwrap(), &Value::str("failed"));

    // and the session still works afterwards
    write_line(
        &mut write_half,
        "{\"action\":\"call\",\"name\":\"echo\",\"args\":[11],\"kwargs\":{}}",
    )
    .await
    .unwrap();
    let line = read_line(&mut reader).await.unwrap().unwrap();
    let response = decode(&line).unwrap();
    assert_eq!(response.get("status").unwrap(), &Value::str("ok"));
    assert_eq!(response.get("ret").unwrap(), &Value::Int(11));

    write_half.shutdown().await.unwrap();
    server.stop().await.unwrap();
}
