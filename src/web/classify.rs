//! First-request classification for unclassified connections

use super::parse::{end_of_headers, first_line, header_value};

/// What an incoming request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestClass {
    /// Multipart file upload
    Post { path: String },
    /// WebSocket upgrade carrying the client key
    WebSocket { key: String },
    /// Live MP3 stream
    Mp3 { path: String },
    /// Static file
    File { path: String },
    /// Anything else; the connection is closed
    Ignore,
}

/// Classify the first bytes received on a connection
///
/// Order matters: a POST is an upload whatever its headers say, and a GET
/// carrying `Sec-WebSocket-Key` is an upgrade whatever its path.
pub fn classify(request: &[u8]) -> RequestClass {
    let Some((line, _)) = first_line(request) else {
        return RequestClass::Ignore;
    };
    let Ok(line) = std::str::from_utf8(line) else {
        return RequestClass::Ignore;
    };
    let mut parts = line.split_ascii_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return RequestClass::Ignore;
    };

    if method == "POST" {
        return RequestClass::Post { path: path.to_string() };
    }
    if method != "GET" {
        return RequestClass::Ignore;
    }

    let headers = match end_of_headers(request) {
        Some(end) => &request[..end],
        None => request,
    };
    if let Some(key) = header_value(headers, "Sec-WebSocket-Key").filter(|k| !k.is_empty()) {
        return RequestClass::WebSocket { key: key.to_string() };
    }

    if path.ends_with(".mp3") {
        RequestClass::Mp3 { path: path.to_string() }
    } else {
        RequestClass::File { path: path.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_wins_over_path() {
        let req = b"GET /stream.mp3 HTTP/1.1\r\nHost: relay\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        assert_eq!(
            classify(req),
            RequestClass::WebSocket {
                key: "dGhlIHNhbXBsZSBub25jZQ==".into()
            }
        );
    }

    #[test]
    fn test_get_variants() {
        assert_eq!(
            classify(b"GET /live.mp3 HTTP/1.1\r\n\r\n"),
            RequestClass::Mp3 { path: "/live.mp3".into() }
        );
        assert_eq!(
            classify(b"GET / HTTP/1.1\r\n\r\n"),
            RequestClass::File { path: "/".into() }
        );
    }

    #[test]
    fn test_post_and_ignored() {
        assert_eq!(
            classify(b"POST /upload HTTP/1.1\r\n"),
            RequestClass::Post { path: "/upload".into() }
        );
        assert_eq!(classify(b"DELETE / HTTP/1.1\r\n\r\n"), RequestClass::Ignore);
        assert_eq!(classify(b"GET"), RequestClass::Ignore);
        assert_eq!(classify(b"\xff\xfe\r\n"), RequestClass::Ignore);
    }
}
