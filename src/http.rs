//! HTTP `CONNECT` upgrade: reuse an HTTP listener for RPC connections.
//!
//! The exchange is deliberately minimal HTTP/1.0. The client sends a
//! `CONNECT` request for the RPC path, the server answers with a fixed 200
//! line and both sides then treat the stream as a raw RPC connection
//! starting with the usual option preamble. Responses are read byte by byte
//! so no codec bytes are ever buffered away.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

use crate::client::{connect_deadline, Client};
use crate::error::ClientError;
use crate::options::Options;
use crate::server::Server;

/// Path the RPC `CONNECT` endpoint is served under.
pub const DEFAULT_RPC_PATH: &str = "/_zrpc_";

/// Status line + blank line sent on a successful upgrade.
pub(crate) const CONNECTED_LINE: &str = "HTTP/1.0 200 Connection to zRPC Established\n\n";

const MAX_HEAD_SIZE: usize = 4096;

/// Dial an HTTP address, upgrade via `CONNECT`, then handshake as usual.
/// Subject to the same connect budget as a plain dial.
pub async fn dial_http(address: &str, options: Options) -> Result<Client, ClientError> {
    let timeout = options.connect_timeout;
    let address = address.to_string();
    let fut = async move {
        let mut stream = TcpStream::connect(&address)
            .await
            .map_err(|err| ClientError::Dial {
                message: err.to_string(),
            })?;
        http_connect(&mut stream).await?;
        Client::new(stream, options).await
    };
    connect_deadline(timeout, fut).await
}

/// Perform the client half of the upgrade exchange.
async fn http_connect(stream: &mut TcpStream) -> Result<(), ClientError> {
    let request = format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| ClientError::HttpConnect {
            message: err.to_string(),
        })?;
    let head = read_head(stream).await.map_err(|err| ClientError::HttpConnect {
        message: err.to_string(),
    })?;
    let status = head.lines().next().unwrap_or("");
    if status.contains("200") {
        Ok(())
    } else {
        Err(ClientError::HttpConnect {
            message: format!("unexpected response: {status}"),
        })
    }
}

/// Read an HTTP head (request or response) up to its blank line, one byte
/// at a time so nothing past the head is consumed.
async fn read_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized HTTP head",
            ));
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

impl Server {
    /// Accept HTTP connections and upgrade `CONNECT` requests on
    /// [`DEFAULT_RPC_PATH`] into RPC connections. Any other method gets 405,
    /// any other path 404.
    pub async fn accept_http(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted http connection");
                    tokio::spawn(Arc::clone(&self).serve_http_stream(stream));
                }
                Err(err) => {
                    error!(error = %err, "http accept failed");
                    return;
                }
            }
        }
    }

    async fn serve_http_stream(self: Arc<Self>, mut stream: TcpStream) {
        let head = match read_head(&mut stream).await {
            Ok(head) => head,
            Err(err) => {
                debug!(error = %err, "failed to read http request head");
                return;
            }
        };
        let mut request_line = head.lines().next().unwrap_or("").split_whitespace();
        let method = request_line.next().unwrap_or("");
        let path = request_line.next().unwrap_or("");
        if method != "CONNECT" {
            let _ = stream
                .write_all(
                    b"HTTP/1.0 405 Method Not Allowed\r\n\
                      Content-Type: text/plain; charset=utf-8\r\n\r\n\
                      Use CONNECT method\n",
                )
                .await;
            return;
        }
        if path != DEFAULT_RPC_PATH {
            let _ = stream.write_all(b"HTTP/1.0 404 Not Found\r\n\r\n").await;
            return;
        }
        if stream.write_all(CONNECTED_LINE.as_bytes()).await.is_err() {
            return;
        }
        self.serve_stream(stream).await;
    }
}
