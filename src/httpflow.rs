//! Minimal HTTP/1.x head parsing used on both sides of the splice: once
//! to route an ingress connection by `Host`, once to pair a response
//! with its request for the observability event.

use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_HEAD_BYTES: usize = 16 * 1024;
const READ_CHUNK: usize = 512;

#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub host: Option<String>,
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status_code: u16,
    pub content_length: Option<u64>,
}

#[derive(Debug)]
pub enum HeadParseError {
    Eof,
    TooLarge,
    Malformed,
    Io(std::io::Error),
}

impl From<std::io::Error> for HeadParseError {
    fn from(e: std::io::Error) -> Self {
        HeadParseError::Io(e)
    }
}

impl std::fmt::Display for HeadParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeadParseError::Eof => write!(f, "connection closed before a full head was read"),
            HeadParseError::TooLarge => write!(f, "head exceeded {} bytes", MAX_HEAD_BYTES),
            HeadParseError::Malformed => write!(f, "malformed HTTP head"),
            HeadParseError::Io(e) => write!(f, "{}", e),
        }
    }
}

/// Reads from `reader` until a full HTTP request head is parsed.
/// Deliberately indifferent to how many body bytes end up read along
/// with it -- whatever was physically read is still recorded by a
/// wrapping [`crate::replay::ReplayReader`] and will be replayed in full
/// to whoever adopts the stream next.
pub async fn read_request_head<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<RequestHead, HeadParseError> {
    let mut buf = Vec::with_capacity(1024);
    loop {
        let mut chunk = [0u8; READ_CHUNK];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HeadParseError::Eof);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_HEAD_BYTES {
            return Err(HeadParseError::TooLarge);
        }

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                let method = request.method.unwrap_or("").to_string();
                let path = request.path.unwrap_or("").to_string();
                let host = request
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("host"))
                    .map(|h| String::from_utf8_lossy(h.value).trim().to_string());
                return Ok(RequestHead { method, path, host });
            }
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Err(HeadParseError::Malformed),
        }
    }
}

/// Reads from `reader` until a full HTTP response head is parsed.
pub async fn read_response_head<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ResponseHead, HeadParseError> {
    let mut buf = Vec::with_capacity(1024);
    loop {
        let mut chunk = [0u8; READ_CHUNK];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HeadParseError::Eof);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_HEAD_BYTES {
            return Err(HeadParseError::TooLarge);
        }

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                let status_code = response.code.unwrap_or(0);
                let content_length = response
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|v| v.parse().ok());
                return Ok(ResponseHead {
                    status_code,
                    content_length,
                });
            }
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Err(HeadParseError::Malformed),
        }
    }
}

/// The first label of a `Host` header value, with its port (if any)
/// stripped, provided at least two dot-separated labels are present.
pub fn access_id_from_host(host: &str) -> Option<&str> {
    let host = host.split(':').next().unwrap_or(host);
    let mut labels = host.split('.');
    let first = labels.next()?;
    if labels.next().is_some() {
        Some(first)
    } else {
        None
    }
}

pub const BAD_REQUEST_RESPONSE: &[u8] =
    b"HTTP/1.0 400 Bad Request\r\nServer: webs.sh\r\nContent-Length: 12\r\n\r\nBad Request\n";

pub fn not_found_response(id: &str) -> Vec<u8> {
    let body = format!("Tunnel {} not found\n", id);
    format!(
        "HTTP/1.0 404 Not Found\r\nServer: webs.sh\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_access_id_from_multi_label_host() {
        assert_eq!(access_id_from_host("abcd1234.example.com"), Some("abcd1234"));
        assert_eq!(access_id_from_host("abcd1234.example.com:8080"), Some("abcd1234"));
    }

    #[test]
    fn rejects_host_without_a_dot() {
        assert_eq!(access_id_from_host("localhost"), None);
    }

    #[test]
    fn not_found_body_has_accurate_content_length() {
        let resp = not_found_response("nope");
        let text = String::from_utf8(resp).unwrap();
        assert!(text.starts_with("HTTP/1.0 404 Not Found"));
        assert!(text.contains("Content-Length: 22"));
        assert!(text.ends_with("Tunnel nope not found\n"));
    }

    #[tokio::test]
    async fn reads_request_head_across_partial_reads() {
        use std::collections::VecDeque;
        use std::pin::Pin;
        use std::task::{Context, Poll};

        struct Slow(VecDeque<u8>);
        impl AsyncRead for Slow {
            fn poll_read(
                mut self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &mut [u8],
            ) -> Poll<std::io::Result<usize>> {
                let n = buf.len().min(self.0.len()).min(3); // trickle 3 bytes at a time
                for slot in buf.iter_mut().take(n) {
                    *slot = self.0.pop_front().unwrap();
                }
                Poll::Ready(Ok(n))
            }
        }

        let raw = b"GET /path HTTP/1.1\r\nHost: abcd1234.example.com\r\n\r\n";
        let mut stream = Slow(raw.iter().copied().collect());
        let head = read_request_head(&mut stream).await.unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/path");
        assert_eq!(head.host.as_deref(), Some("abcd1234.example.com"));
    }
}
