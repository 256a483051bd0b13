//! HTTP bridge in front of the counter server.
//!
//! Strictly sequential: one HTTP connection is accepted, answered and closed
//! before the next is accepted. Every request is translated into line
//! protocol commands on a single, lazily (re)connected upstream connection.
//!
//! ```text
//! GET  /counter        -> GET              -> 200 {"value": n}
//! POST /counter/incr   -> INCR, GET        -> 200 {"value": n}
//! POST /counter/decr   -> DECR, GET        -> 200 {"value": n}
//! POST /counter/reset  -> RESET, GET       -> 200 {"value": n}
//! OPTIONS *                                -> 204 (CORS preflight)
//! anything else                            -> 404 {"error": "not found"}
//! ```

mod http;
mod upstream;

pub use upstream::{Upstream, UpstreamError};

use crate::config::BridgeConfig;
use http::{Request, Response, Route};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// HTTP listener plus its single upstream connection.
pub struct Bridge {
    listener: TcpListener,
    upstream: Upstream,
}

impl Bridge {
    pub async fn bind(config: &BridgeConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Ok(Self {
            listener,
            upstream: Upstream::new(config.upstream_host.clone(), config.upstream_port),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and answer HTTP requests one at a time, forever.
    pub async fn run(mut self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "HTTP bridge listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = handle_connection(stream, &mut self.upstream).await {
                        debug!(peer = %peer, error = %e, "HTTP connection error");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Read one request, answer it and close the stream.
pub async fn handle_connection<S>(stream: S, upstream: &mut Upstream) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    let response = match http::read_request(&mut stream).await? {
        Request::Empty => return Ok(()),
        Request::Malformed => Response::bad_request(),
        Request::Head(head) => {
            debug!(
                method = %head.method,
                path = %head.path,
                body_len = head.content_length,
                "HTTP request"
            );
            respond(http::route(&head.method, &head.path), upstream).await
        }
    };

    let stream = stream.get_mut();
    stream.write_all(&response.encode()).await?;
    stream.shutdown().await
}

async fn respond(route: Route, upstream: &mut Upstream) -> Response {
    let result = match route {
        Route::Value => upstream.value().await,
        Route::Mutate(command) => upstream.apply(command).await,
        Route::Preflight => return Response::preflight(),
        Route::NotFound => return Response::not_found(),
    };

    match result {
        Ok(value) => Response::value(value),
        Err(e) => {
            warn!(error = %e, "Upstream request failed");
            let msg = if e.is_unreachable() {
                "server unreachable"
            } else if matches!(e, UpstreamError::Rejected(_)) {
                "command failed"
            } else {
                "bad upstream reply"
            };
            Response::server_error(msg)
        }
    }
}

/// Bind the HTTP listener and serve until a fatal error.
pub async fn run(config: &BridgeConfig) -> io::Result<()> {
    info!(
        upstream = %format!("{}:{}", config.upstream_host, config.upstream_port),
        "Starting HTTP bridge"
    );
    Bridge::bind(config).await?.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::runtime::Server;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn spawn_counter_server(addr: &str) -> SocketAddr {
        let (host, port) = addr.rsplit_once(':').unwrap();
        let config = ServerConfig {
            host: host.to_string(),
            port: port.parse().unwrap(),
            ..ServerConfig::default()
        };
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();
        std::thread::spawn(move || server.run());
        addr
    }

    async fn spawn_bridge(upstream_port: u16) -> SocketAddr {
        let config = BridgeConfig {
            upstream_host: "127.0.0.1".to_string(),
            upstream_port,
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
        };
        let bridge = Bridge::bind(&config).await.unwrap();
        let addr = bridge.local_addr().unwrap();
        tokio::spawn(bridge.run());
        addr
    }

    struct HttpReply {
        status: u16,
        head: String,
        body: String,
    }

    impl HttpReply {
        fn json(&self) -> serde_json::Value {
            serde_json::from_str(&self.body).unwrap()
        }
    }

    async fn send(addr: SocketAddr, method: &str, path: &str) -> HttpReply {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8(raw).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        let status = head.split_whitespace().nth(1).unwrap().parse().unwrap();
        HttpReply {
            status,
            head: head.to_string(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_incr_decr_via_http() {
        let server = spawn_counter_server("127.0.0.1:0");
        let bridge = spawn_bridge(server.port()).await;

        for _ in 0..3 {
            let reply = send(bridge, "POST", "/counter/incr").await;
            assert_eq!(reply.status, 200);
        }
        let reply = send(bridge, "POST", "/counter/decr").await;
        assert_eq!(reply.json()["value"], 2);

        let reply = send(bridge, "GET", "/counter").await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.json()["value"], 2);
        assert!(reply.head.contains("Access-Control-Allow-Origin: *"));
        assert!(reply.head.contains("Connection: close"));
    }

    #[tokio::test]
    async fn test_reset_via_http() {
        let server = spawn_counter_server("127.0.0.1:0");
        let bridge = spawn_bridge(server.port()).await;

        send(bridge, "POST", "/counter/decr").await;
        let reply = send(bridge, "POST", "/counter/reset").await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.json()["value"], 0);
    }

    #[tokio::test]
    async fn test_preflight_and_not_found() {
        // No counter server needed: neither route touches upstream.
        let bridge = spawn_bridge(1).await;

        let reply = send(bridge, "OPTIONS", "/counter/incr").await;
        assert_eq!(reply.status, 204);
        assert!(reply.head.contains("Access-Control-Allow-Methods: GET, POST, OPTIONS"));
        assert!(reply.head.contains("Access-Control-Allow-Origin: *"));
        assert!(reply.body.is_empty());

        let reply = send(bridge, "GET", "/missing").await;
        assert_eq!(reply.status, 404);
        assert_eq!(reply.json()["error"], "not found");

        let reply = send(bridge, "PUT", "/counter").await;
        assert_eq!(reply.status, 404);
    }

    #[tokio::test]
    async fn test_unreachable_then_reconnect() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let bridge = spawn_bridge(port).await;

        let reply = send(bridge, "GET", "/counter").await;
        assert_eq!(reply.status, 500);
        assert_eq!(reply.json()["error"], "server unreachable");
        assert!(reply.head.contains("Access-Control-Allow-Origin: *"));

        // The bridge connects lazily on the next request once the server is up.
        spawn_counter_server(&format!("127.0.0.1:{port}"));
        let reply = send(bridge, "POST", "/counter/incr").await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.json()["value"], 1);
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let mock = tokio_test::io::Builder::new()
            .read(b"NONSENSE\r\n\r\n")
            .write(&Response::bad_request().encode())
            .build();
        let mut upstream = Upstream::new("127.0.0.1", 1);
        handle_connection(mock, &mut upstream).await.unwrap();
        assert!(!upstream.is_connected());
    }

    #[tokio::test]
    async fn test_not_found_over_mock_stream() {
        let mock = tokio_test::io::Builder::new()
            .read(b"DELETE /counter HTTP/1.1\r\n\r\n")
            .write(&Response::not_found().encode())
            .build();
        let mut upstream = Upstream::new("127.0.0.1", 1);
        handle_connection(mock, &mut upstream).await.unwrap();
    }
}
