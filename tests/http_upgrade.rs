//! CONNECT upgrade: RPC over a listener that speaks HTTP first.

mod common;

use std::sync::Arc;

use common::{arith_service, Args};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use zrpc::{xdial, Options, Server};

async fn start_http_server() -> String {
    let server = Arc::new(Server::new());
    server.register(arith_service()).expect("register");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    tokio::spawn(server.accept_http(listener));
    addr
}

#[tokio::test]
async fn calls_work_through_the_upgrade() {
    let addr = start_http_server().await;
    let client = xdial(&format!("http@{addr}"), Options::default())
        .await
        .expect("dial http");

    let sum: i64 = client
        .call("Arith.Sum", &Args { num1: 19, num2: 23 })
        .await
        .expect("call over upgraded stream");
    assert_eq!(sum, 42);
}

#[tokio::test]
async fn non_connect_methods_get_405() {
    let addr = start_http_server().await;
    let mut stream = TcpStream::connect(&addr).await.expect("connect");
    stream
        .write_all(b"GET /_zrpc_ HTTP/1.0\r\n\r\n")
        .await
        .expect("write request");
    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read");
    assert!(response.starts_with("HTTP/1.0 405"), "{response}");
    assert!(response.contains("Use CONNECT method"), "{response}");
}

#[tokio::test]
async fn unknown_paths_get_404() {
    let addr = start_http_server().await;
    let mut stream = TcpStream::connect(&addr).await.expect("connect");
    stream
        .write_all(b"CONNECT /elsewhere HTTP/1.0\r\n\r\n")
        .await
        .expect("write request");
    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read");
    assert!(response.starts_with("HTTP/1.0 404"), "{response}");
}

#[tokio::test]
async fn plain_tcp_dial_still_works_alongside() {
    // The same server type serves raw TCP elsewhere; the address tag picks
    // the transport.
    let tcp_addr = common::start_server_with(vec![arith_service()]).await;
    let client = xdial(&format!("tcp@{tcp_addr}"), Options::default())
        .await
        .expect("dial tcp");
    let product: i64 = client
        .call("Arith.Multiply", &Args { num1: 6, num2: 7 })
        .await
        .expect("call");
    assert_eq!(product, 42);
}
