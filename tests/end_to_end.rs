//! End-to-end call scenarios over real TCP connections.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{arith_service, slow_service, Args};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use zrpc::{dial, ClientError, Options, Server, ServiceBuilder, JSON_SELECTOR};

#[tokio::test]
async fn basic_unicast() {
    let addr = common::start_server_with(vec![arith_service()]).await;
    let client = dial(&addr, Options::default()).await.expect("dial");

    let sum: i64 = client
        .call("Arith.Sum", &Args { num1: 2, num2: 3 })
        .await
        .expect("call Arith.Sum");
    assert_eq!(sum, 5);
}

#[tokio::test]
async fn concurrent_multiplex() {
    let addr = common::start_server_with(vec![arith_service()]).await;
    let client = dial(&addr, Options::default()).await.expect("dial");

    let calls = (0..100i64).map(|i| {
        let client = client.clone();
        async move {
            let reply: i64 = client
                .call("Arith.Sum", &Args { num1: i, num2: i * i })
                .await
                .expect("concurrent call");
            assert_eq!(reply, i + i * i);
        }
    });
    futures::future::join_all(calls).await;
}

#[tokio::test]
async fn json_codec_end_to_end() {
    let addr = common::start_server_with(vec![arith_service()]).await;
    let client = dial(&addr, Options::with_codec(JSON_SELECTOR))
        .await
        .expect("dial with json codec");

    let product: i64 = client
        .call("Arith.Multiply", &Args { num1: 6, num2: 7 })
        .await
        .expect("call Arith.Multiply");
    assert_eq!(product, 42);
}

#[tokio::test]
async fn sequence_numbers_are_unique_and_increasing() {
    let addr = common::start_server_with(vec![arith_service()]).await;
    let client = dial(&addr, Options::default()).await.expect("dial");

    let mut handles = Vec::new();
    for i in 0..20i64 {
        let handle = client
            .go("Arith.Sum", &Args { num1: i, num2: 1 }, None)
            .await
            .expect("go");
        handles.push((i, handle));
    }
    let mut last_seq = 0;
    for (_, handle) in &handles {
        assert!(handle.seq() > last_seq, "seq not strictly increasing");
        last_seq = handle.seq();
    }
    for (i, handle) in handles {
        let reply: i64 = handle.recv().await.expect("recv");
        assert_eq!(reply, i + 1);
    }
}

#[tokio::test]
async fn dispatch_errors_are_kind_distinct() {
    let addr = common::start_server_with(vec![arith_service()]).await;
    let client = dial(&addr, Options::default()).await.expect("dial");
    let args = Args { num1: 1, num2: 1 };

    let err = client
        .call::<_, i64>("Nope.Sum", &args)
        .await
        .expect_err("unknown service");
    assert!(err.to_string().contains("can not find service"), "{err}");

    let err = client
        .call::<_, i64>("Arith.Cube", &args)
        .await
        .expect_err("unknown method");
    assert!(err.to_string().contains("can not find method"), "{err}");

    let err = client
        .call::<_, i64>("ArithSum", &args)
        .await
        .expect_err("malformed name");
    assert!(err.to_string().contains("service.method"), "{err}");

    // The connection survives every dispatch failure.
    let sum: i64 = client.call("Arith.Sum", &args).await.expect("call");
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn handler_errors_travel_verbatim() {
    let service = ServiceBuilder::named("Faulty", ())
        .method("Explode", |_unit: Arc<()>, _args: i64| async move {
            Err::<i64, anyhow::Error>(anyhow::anyhow!("the boiler burst"))
        })
        .build()
        .expect("build service");
    let addr = common::start_server_with(vec![service]).await;
    let client = dial(&addr, Options::default()).await.expect("dial");

    let err = client
        .call::<_, i64>("Faulty.Explode", &1i64)
        .await
        .expect_err("handler error");
    assert_eq!(err.to_string(), "the boiler burst");
}

#[tokio::test]
async fn duplicate_service_registration_is_rejected() {
    let server = Server::new();
    server.register(arith_service()).expect("first register");
    let err = server
        .register(arith_service())
        .expect_err("duplicate register");
    assert!(err.to_string().contains("already exists"), "{err}");
}

#[tokio::test]
async fn bad_magic_number_is_refused_but_server_keeps_accepting() {
    let addr = common::start_server_with(vec![arith_service()]).await;

    // Handshake with the wrong magic: the server must close silently.
    let mut stream = tokio::net::TcpStream::connect(&addr).await.expect("connect");
    stream
        .write_all(
            br#"{"MagicNumber":41,"CodecType":"application/postcard","ConnectTimeout":{"secs":10,"nanos":0}}
"#,
        )
        .await
        .expect("write bad preamble");
    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.expect("read");
    assert_eq!(n, 0, "expected the server to close the connection");

    // A well-behaved client still gets through.
    let client = dial(&addr, Options::default()).await.expect("dial");
    let sum: i64 = client
        .call("Arith.Sum", &Args { num1: 20, num2: 22 })
        .await
        .expect("call after rejection");
    assert_eq!(sum, 42);
}

#[tokio::test]
async fn close_terminates_every_pending_call() {
    let addr = common::start_server_with(vec![slow_service()]).await;
    let client = dial(&addr, Options::default()).await.expect("dial");

    let started = std::time::Instant::now();
    let mut calls = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client.call::<_, u64>("Slow.Sleep", &500u64).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.close().await.expect("close");

    for call in calls {
        let result = call.await.expect("join");
        assert!(result.is_err(), "pending call survived close");
    }
    assert!(
        started.elapsed() < Duration::from_millis(400),
        "termination waited for the slow handler"
    );
    assert_eq!(client.pending_calls(), 0);
    assert!(!client.is_available());

    // New work is refused once the client has shut down.
    let err = client
        .call::<_, u64>("Slow.Sleep", &1u64)
        .await
        .expect_err("call after close");
    assert!(matches!(err, ClientError::Shutdown));
}
