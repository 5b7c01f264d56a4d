//! Client-side deadlines, server-side handling budgets, and cancellation.

mod common;

use std::time::{Duration, Instant};

use common::slow_service;
use tokio_util::sync::CancellationToken;
use zrpc::{dial, CallOptions, ClientError, Options};

#[tokio::test]
async fn client_call_timeout() {
    let addr = common::start_server_with(vec![slow_service()]).await;
    let client = dial(&addr, Options::default()).await.expect("dial");

    let started = Instant::now();
    let err = client
        .call_opts::<_, u64>(
            "Slow.Sleep",
            &2000u64,
            CallOptions {
                timeout: Some(Duration::from_secs(1)),
                ..CallOptions::default()
            },
        )
        .await
        .expect_err("expected the deadline to fire");
    let elapsed = started.elapsed();
    assert!(err.to_string().contains("timeout"), "{err}");
    assert!(elapsed >= Duration::from_millis(900), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1600), "fired late: {elapsed:?}");

    // The pending entry was removed; the late reply is discarded quietly.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(client.pending_calls(), 0);
    assert!(client.is_available(), "late reply killed the connection");
}

#[tokio::test]
async fn call_without_deadline_waits_out_the_handler() {
    let addr = common::start_server_with(vec![slow_service()]).await;
    let client = dial(&addr, Options::default()).await.expect("dial");

    let reply: u64 = client.call("Slow.Sleep", &300u64).await.expect("call");
    assert_eq!(reply, 300);
}

#[tokio::test]
async fn server_handle_timeout() {
    let addr = common::start_server_with(vec![slow_service()]).await;
    let client = dial(&addr, Options::default()).await.expect("dial");

    let started = Instant::now();
    let err = client
        .call_opts::<_, u64>(
            "Slow.Sleep",
            &2000u64,
            CallOptions {
                handle_timeout: Some(Duration::from_secs(1)),
                ..CallOptions::default()
            },
        )
        .await
        .expect_err("expected the server budget to fire");
    let elapsed = started.elapsed();
    assert!(err.to_string().contains("handle request timeout"), "{err}");
    assert!(elapsed < Duration::from_millis(1600), "fired late: {elapsed:?}");
}

#[tokio::test]
async fn generous_server_budget_does_not_fire() {
    let addr = common::start_server_with(vec![slow_service()]).await;
    let client = dial(&addr, Options::default()).await.expect("dial");

    let reply: u64 = client
        .call_opts(
            "Slow.Sleep",
            &300u64,
            CallOptions {
                handle_timeout: Some(Duration::from_secs(2)),
                ..CallOptions::default()
            },
        )
        .await
        .expect("call within budget");
    assert_eq!(reply, 300);
}

#[tokio::test]
async fn cancellation_token_aborts_the_call() {
    let addr = common::start_server_with(vec![slow_service()]).await;
    let client = dial(&addr, Options::default()).await.expect("dial");

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        })
    };
    let started = Instant::now();
    let err = client
        .call_opts::<_, u64>(
            "Slow.Sleep",
            &2000u64,
            CallOptions {
                cancel: Some(cancel),
                ..CallOptions::default()
            },
        )
        .await
        .expect_err("expected cancellation");
    assert!(matches!(err, ClientError::Canceled), "{err}");
    assert!(started.elapsed() < Duration::from_millis(800));
    canceller.await.expect("join canceller");
    assert_eq!(client.pending_calls(), 0);
}
