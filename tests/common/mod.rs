//! Shared fixtures: arithmetic and deliberately slow services, plus server
//! startup helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use zrpc::{Server, Service, ServiceBuilder};

/// Argument pair for the arithmetic service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Args {
    pub num1: i64,
    pub num2: i64,
}

pub struct Arith;

/// `Arith.Sum` and `Arith.Multiply` over [`Args`].
pub fn arith_service() -> Service {
    ServiceBuilder::new(Arith)
        .method("Sum", |_arith: Arc<Arith>, args: Args| async move {
            Ok::<i64, anyhow::Error>(args.num1 + args.num2)
        })
        .method("Multiply", |_arith: Arc<Arith>, args: Args| async move {
            Ok::<i64, anyhow::Error>(args.num1 * args.num2)
        })
        .build()
        .expect("build Arith service")
}

/// An `Arith` whose `Sum` always fails, for broadcast error scenarios.
pub fn failing_arith_service(message: &str) -> Service {
    let message = message.to_string();
    ServiceBuilder::named("Arith", ())
        .method("Sum", move |_unit: Arc<()>, _args: Args| {
            let message = message.clone();
            async move { Err::<i64, anyhow::Error>(anyhow::anyhow!(message)) }
        })
        .build()
        .expect("build failing Arith service")
}

pub struct Slow;

/// `Slow.Sleep` sleeps for `millis` and echoes it back.
pub fn slow_service() -> Service {
    ServiceBuilder::new(Slow)
        .method("Sleep", |_slow: Arc<Slow>, millis: u64| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<u64, anyhow::Error>(millis)
        })
        .build()
        .expect("build Slow service")
}

/// Bind an ephemeral port, start the accept loop, and return the address.
pub async fn start_server(server: Arc<Server>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    tokio::spawn(server.accept(listener));
    addr
}

/// Start a fresh server with the given services registered.
pub async fn start_server_with(services: Vec<Service>) -> String {
    let server = Arc::new(Server::new());
    for service in services {
        server.register(service).expect("register service");
    }
    start_server(server).await
}
