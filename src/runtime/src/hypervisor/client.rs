//! Minimal HTTP/1.1 client for the hypervisor's unix control socket.
//!
//! The hypervisor serves a REST API on a unix socket with one request per
//! connection; a full HTTP stack buys nothing here, so this speaks just
//! enough of the protocol: request line + Content-Length framing.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use sandcastle_core::error::{FleetError, Result};

/// A parsed control-API response.
#[derive(Debug)]
pub(crate) struct ApiResponse {
    pub status: u16,
    pub body: Option<String>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issue one request against the control socket.
///
/// Connection failures and expired deadlines surface as
/// `HypervisorUnreachable`; HTTP-level errors are returned in the response
/// for the adapter to classify.
pub(crate) async fn request(
    socket_path: &Path,
    method: &str,
    uri: &str,
    body: Option<&str>,
    deadline: Duration,
) -> Result<ApiResponse> {
    tokio::time::timeout(deadline, exchange(socket_path, method, uri, body))
        .await
        .map_err(|_| {
            FleetError::HypervisorUnreachable(format!(
                "{} {} timed out after {:?}",
                method, uri, deadline
            ))
        })?
}

async fn exchange(
    socket_path: &Path,
    method: &str,
    uri: &str,
    body: Option<&str>,
) -> Result<ApiResponse> {
    let mut stream = UnixStream::connect(socket_path).await.map_err(|e| {
        FleetError::HypervisorUnreachable(format!(
            "connect {} failed: {}",
            socket_path.display(),
            e
        ))
    })?;

    let mut req = format!("{} {} HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n", method, uri);
    if let Some(body) = body {
        req.push_str("Content-Type: application/json\r\n");
        req.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    req.push_str("\r\n");
    if let Some(body) = body {
        req.push_str(body);
    }

    stream
        .write_all(req.as_bytes())
        .await
        .map_err(|e| FleetError::HypervisorUnreachable(format!("write failed: {}", e)))?;

    read_response(&mut stream).await
}

async fn read_response(stream: &mut UnixStream) -> Result<ApiResponse> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| FleetError::HypervisorUnreachable(format!("read failed: {}", e)))?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&raw);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let body_offset = header_end + 4;
            match content_length(&text[..header_end]) {
                Some(len) => {
                    if raw.len() >= body_offset + len {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    let text = String::from_utf8_lossy(&raw).into_owned();
    let status = parse_status(&text)?;

    let body = text.find("\r\n\r\n").and_then(|o| {
        let body = &text[o + 4..];
        content_length(&text[..o]).map(|len| body[..len.min(body.len())].to_string())
    });

    Ok(ApiResponse { status, body })
}

/// Extract the status code from "HTTP/1.1 NNN ...".
fn parse_status(response: &str) -> Result<u16> {
    let line = response
        .strip_prefix("HTTP/1.1 ")
        .ok_or_else(|| FleetError::HypervisorUnreachable("malformed response".to_string()))?;

    line.split_whitespace()
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| FleetError::HypervisorUnreachable("malformed status line".to_string()))
}

/// Extract Content-Length from the header block, if present.
fn content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::UnixListener;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("HTTP/1.1 200 OK\r\n").unwrap(), 200);
        assert_eq!(parse_status("HTTP/1.1 204 No Content\r\n").unwrap(), 204);
        assert_eq!(parse_status("HTTP/1.1 500 Internal Server Error\r\n").unwrap(), 500);
        assert!(parse_status("SPDY/1 200").is_err());
    }

    #[test]
    fn test_content_length() {
        let headers = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 42";
        assert_eq!(content_length(headers), Some(42));
        assert_eq!(content_length("HTTP/1.1 204 No Content"), None);
        // Case-insensitive per RFC 9110.
        assert_eq!(content_length("content-length: 7"), Some(7));
    }

    async fn serve_once(listener: UnixListener, response: &'static str) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf).await.unwrap();
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_with_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 200 OK\r\nContent-Length: 19\r\n\r\n{\"state\":\"Running\"}",
        ));

        let resp = request(&path, "GET", "/api/v1/vm.info", None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body.as_deref(), Some("{\"state\":\"Running\"}"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_no_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(serve_once(listener, "HTTP/1.1 204 No Content\r\n\r\n"));

        let resp = request(&path, "PUT", "/api/v1/vm.boot", None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.status, 204);
        assert!(resp.is_success());
        assert!(resp.body.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");

        let err = request(&path, "GET", "/api/v1/vmm.ping", None, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::HypervisorUnreachable(_)));
    }
}
