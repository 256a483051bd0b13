//! Upstream connection to the counter server.
//!
//! At most one connection is held. It is opened on first use and dropped on
//! any I/O failure; the next command reconnects.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Longest reply line accepted from the counter server.
const MAX_REPLY_LEN: u64 = 256;

/// Upstream failures.
#[derive(Debug)]
pub enum UpstreamError {
    Connect(std::io::Error),
    Io(std::io::Error),
    /// Server closed the connection before a full reply line.
    Closed,
    /// `GET` answered with something that is not an integer.
    BadReply(String),
    /// A mutating command was answered with an error line.
    Rejected(String),
}

impl UpstreamError {
    /// Whether the counter server could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            UpstreamError::Connect(_) | UpstreamError::Io(_) | UpstreamError::Closed
        )
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Connect(e) => write!(f, "connect failed: {e}"),
            UpstreamError::Io(e) => write!(f, "I/O error: {e}"),
            UpstreamError::Closed => write!(f, "server closed connection"),
            UpstreamError::BadReply(reply) => write!(f, "unexpected reply '{reply}'"),
            UpstreamError::Rejected(reply) => write!(f, "command rejected: {reply}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Lazily connected line protocol client.
pub struct Upstream {
    host: String,
    port: u16,
    conn: Option<BufReader<TcpStream>>,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            conn: None,
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Send one command and read its one-line reply.
    ///
    /// Any failure drops the connection so the next call starts fresh.
    pub async fn command(&mut self, command: &str) -> Result<String, UpstreamError> {
        let result = self.exchange(command).await;
        if result.is_err() && self.conn.take().is_some() {
            debug!(host = %self.host, port = self.port, "Dropped upstream connection");
        }
        result
    }

    /// Current counter value.
    pub async fn value(&mut self) -> Result<i64, UpstreamError> {
        let reply = self.command("GET").await?;
        reply
            .trim()
            .parse()
            .map_err(|_| UpstreamError::BadReply(reply))
    }

    /// Run a mutating command, then read back the value.
    pub async fn apply(&mut self, command: &str) -> Result<i64, UpstreamError> {
        let reply = self.command(command).await?;
        if reply.starts_with("ERR") {
            return Err(UpstreamError::Rejected(reply));
        }
        self.value().await
    }

    async fn exchange(&mut self, command: &str) -> Result<String, UpstreamError> {
        if self.conn.is_none() {
            let stream = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(UpstreamError::Connect)?;
            debug!(host = %self.host, port = self.port, "Connected upstream");
            self.conn = Some(BufReader::new(stream));
        }
        let conn = self.conn.as_mut().ok_or(UpstreamError::Closed)?;

        conn.get_mut()
            .write_all(format!("{command}\n").as_bytes())
            .await
            .map_err(UpstreamError::Io)?;

        let mut line = Vec::with_capacity(32);
        let n = (&mut *conn)
            .take(MAX_REPLY_LEN)
            .read_until(b'\n', &mut line)
            .await
            .map_err(UpstreamError::Io)?;
        if n == 0 || line.last() != Some(&b'\n') {
            return Err(UpstreamError::Closed);
        }

        line.retain(|&b| b != b'\r' && b != b'\n');
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}
