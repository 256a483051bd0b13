//! Minimal HTTP/1.1 request reading, routing and response encoding.
//!
//! One request per connection: the request head is read, any declared body
//! is discarded, one response is written and the connection is closed.

use bytes::{BufMut, BytesMut};
use serde_json::json;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest request or header line accepted.
const MAX_LINE_LEN: u64 = 8192;

/// Most header lines read before giving up on the head.
const MAX_HEADERS: usize = 100;

/// Largest request body drained before responding.
const MAX_BODY_LEN: u64 = 64 * 1024;

/// Parsed request line plus the headers we care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub content_length: u64,
}

/// Result of reading a request.
#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    Head(RequestHead),
    /// Request line without a method and path.
    Malformed,
    /// Peer closed before sending anything.
    Empty,
}

/// Read the request head and drain its body.
pub async fn read_request<R>(reader: &mut R) -> io::Result<Request>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    if read_line(reader, &mut line).await? == 0 {
        return Ok(Request::Empty);
    }

    let (method, path) = {
        let request_line = String::from_utf8_lossy(&line);
        let mut parts = request_line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(method), Some(path)) => (method.to_string(), path.to_string()),
            _ => return Ok(Request::Malformed),
        }
    };

    let mut content_length: u64 = 0;
    for _ in 0..MAX_HEADERS {
        line.clear();
        if read_line(reader, &mut line).await? == 0 {
            break;
        }
        let header = String::from_utf8_lossy(&line);
        let header = header.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    if content_length > 0 {
        let mut body = (&mut *reader).take(content_length.min(MAX_BODY_LEN));
        tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
    }

    Ok(Request::Head(RequestHead {
        method,
        path,
        content_length,
    }))
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    (&mut *reader).take(MAX_LINE_LEN).read_until(b'\n', line).await
}

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `GET /counter`
    Value,
    /// `POST /counter/{incr,decr,reset}` with the upstream command.
    Mutate(&'static str),
    /// `OPTIONS` on any path.
    Preflight,
    NotFound,
}

/// Map method and path to a route. Both are matched exactly.
pub fn route(method: &str, path: &str) -> Route {
    match (method, path) {
        ("GET", "/counter") => Route::Value,
        ("POST", "/counter/incr") => Route::Mutate("INCR"),
        ("POST", "/counter/decr") => Route::Mutate("DECR"),
        ("POST", "/counter/reset") => Route::Mutate("RESET"),
        ("OPTIONS", _) => Route::Preflight,
        _ => Route::NotFound,
    }
}

/// An HTTP response with an optional JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: &'static str,
    pub body: Option<String>,
    preflight: bool,
}

impl Response {
    fn json(status: u16, reason: &'static str, value: serde_json::Value) -> Self {
        Self {
            status,
            reason,
            body: Some(format!("{value}\n")),
            preflight: false,
        }
    }

    /// `200 {"value": n}`
    pub fn value(n: i64) -> Self {
        Self::json(200, "OK", json!({ "value": n }))
    }

    /// `500 {"error": msg}`
    pub fn server_error(msg: &str) -> Self {
        Self::json(500, "Internal Server Error", json!({ "error": msg }))
    }

    pub fn not_found() -> Self {
        Self::json(404, "Not Found", json!({ "error": "not found" }))
    }

    pub fn bad_request() -> Self {
        Self::json(400, "Bad Request", json!({ "error": "bad request" }))
    }

    /// `204` answer to a CORS preflight.
    pub fn preflight() -> Self {
        Self {
            status: 204,
            reason: "No Content",
            body: None,
            preflight: true,
        }
    }

    /// Serialize status line, headers and body.
    pub fn encode(&self) -> BytesMut {
        let body = self.body.as_deref().unwrap_or("");
        let mut out = BytesMut::with_capacity(256 + body.len());

        out.put_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        if self.body.is_some() {
            out.put_slice(b"Content-Type: application/json\r\n");
        }
        if self.preflight {
            out.put_slice(b"Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n");
            out.put_slice(b"Access-Control-Allow-Headers: Content-Type\r\n");
        }
        out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        out.put_slice(b"Access-Control-Allow-Origin: *\r\n");
        out.put_slice(b"Connection: close\r\n\r\n");
        out.put_slice(body.as_bytes());
        out
    }
}
