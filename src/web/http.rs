//! HTTP/1.1 responses: static files, stream headers and uploads
//!
//! Everything here runs inside the network loop on one connection at a
//! time. File bodies are pushed in fixed chunks; uploads wait for body
//! bytes in a small bounded number of retries.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use super::assets::default_asset;
use super::multipart::{BoundaryMatcher, UploadHead};
use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::network::Transport;
use crate::storage::Storage;

const NO_CACHE: &str = "Cache-Control: no-cache, no-store, must-revalidate\r\n\
                        Pragma: no-cache\r\n\
                        Expires: 0\r\n";

/// Largest upload head buffered while waiting for the part headers
const MAX_UPLOAD_HEAD: usize = 16 * 1024;

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// MIME type from the file extension
pub fn mime_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("htm") | Some("html") => "text/html",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("mp3") => "audio/mpeg",
        _ => "text/plain",
    }
}

/// Response header block; `len` of `None` means an endless body
pub fn response_header(status: u16, content_type: &str, len: Option<u64>) -> String {
    let mut header = format!("HTTP/1.1 {} {}\r\n", status, status_text(status));
    if let Some(len) = len {
        header.push_str(&format!("Content-Length: {}\r\n", len));
    }
    header.push_str(&format!("Content-Type: {}\r\n", content_type));
    header.push_str(NO_CACHE);
    header.push_str("\r\n");
    header
}

/// Send a complete response; returns whether every byte was written
pub fn send_response(transport: &mut dyn Transport, status: u16, content_type: &str, body: &[u8]) -> bool {
    let header = response_header(status, content_type, Some(body.len() as u64));
    transport.write_bytes(header.as_bytes()) == header.len()
        && (body.is_empty() || transport.write_bytes(body) == body.len())
}

/// Start an endless MP3 stream
pub fn send_stream_header(transport: &mut dyn Transport) -> bool {
    let header = response_header(200, "audio/mpeg", None);
    transport.write_bytes(header.as_bytes()) == header.len()
}

/// Map a request path onto the file to serve
///
/// `/` and the upload page have fixed targets. Unknown paths fall back to
/// the index page so captive-portal checks land on the UI; only the
/// favicon is allowed to 404. In kiosk mode every page request shows the
/// kiosk page while scripts and stylesheets still load normally.
pub fn resolve_path(request_path: &str, kiosk: bool, storage: &dyn Storage) -> String {
    let path = request_path.split(['?', '#']).next().unwrap_or("/");
    if kiosk && !(path.ends_with(".js") || path.ends_with(".css")) {
        return "/kiosk.html".to_string();
    }
    match path {
        "/" => "/index.html".to_string(),
        "/upload" | "/upload.html" => "/upload.html".to_string(),
        "/index.html" | "/favicon.ico" => path.to_string(),
        other if storage.exists(other) || default_asset(other).is_some() => other.to_string(),
        _ => "/index.html".to_string(),
    }
}

/// Serve a GET request; returns the response status
pub fn serve_file(
    transport: &mut dyn Transport,
    storage: &dyn Storage,
    request_path: &str,
    kiosk: bool,
    chunk: &mut [u8],
) -> u16 {
    let path = resolve_path(request_path, kiosk, storage);

    match storage.open(&path) {
        Ok(mut file) => {
            let header = response_header(200, mime_type(&path), Some(file.len));
            if transport.write_bytes(header.as_bytes()) != header.len() {
                tracing::debug!("Client {} went away before {}", transport.peer(), path);
                return 200;
            }
            match stream_body(transport, file.reader.as_mut(), chunk) {
                Ok(sent) if sent == file.len => {
                    tracing::debug!("Served {} ({} bytes) to {}", path, sent, transport.peer())
                }
                Ok(sent) => tracing::warn!("Sent {} of {} bytes of {} to {}", sent, file.len, path, transport.peer()),
                Err(e) => tracing::warn!("Failed reading {}: {}", path, e),
            }
            200
        }
        Err(_) => match default_asset(&path) {
            Some(body) => {
                send_response(transport, 200, mime_type(&path), body);
                tracing::debug!("Served built-in {} to {}", path, transport.peer());
                200
            }
            None => {
                tracing::debug!("{} not found for {}", path, transport.peer());
                send_response(transport, 404, "text/plain", b"File not found");
                404
            }
        },
    }
}

fn stream_body(transport: &mut dyn Transport, reader: &mut dyn Read, chunk: &mut [u8]) -> io::Result<u64> {
    let mut sent = 0u64;
    loop {
        let n = reader.read(chunk)?;
        if n == 0 {
            return Ok(sent);
        }
        let written = transport.write_bytes(&chunk[..n]);
        sent += written as u64;
        if written != n {
            return Ok(sent);
        }
    }
}

/// Read budget for one upload
///
/// Every wait uses up a retry whether or not bytes arrived. After a wait the
/// socket is drained for at most one more retry period, so an upload holds
/// the loop for no longer than `2 * retries * retry_delay`.
struct ReadBudget {
    waits_left: u32,
    delay: Duration,
    drain_until: Option<Instant>,
}

impl ReadBudget {
    fn new(limits: &UploadConfig) -> Self {
        Self {
            waits_left: limits.retries,
            delay: Duration::from_millis(limits.retry_delay_ms),
            drain_until: None,
        }
    }

    /// Next bytes from `transport`; `None` once the budget is spent
    fn next(&mut self, transport: &mut dyn Transport, chunk: &mut [u8]) -> Option<usize> {
        loop {
            if let Some(until) = self.drain_until {
                if Instant::now() < until {
                    match transport.read_available(chunk) {
                        Ok(0) => {}
                        Ok(n) => return Some(n),
                        Err(e) => tracing::debug!("Upload read from {} failed: {}", transport.peer(), e),
                    }
                }
                self.drain_until = None;
            }
            if self.waits_left == 0 {
                return None;
            }
            self.waits_left -= 1;
            thread::sleep(self.delay);
            self.drain_until = Some(Instant::now() + self.delay);
        }
    }
}

/// Result of a received upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub filename: String,
    pub bytes_written: u64,
    /// `false` when the body stopped arriving before the terminator
    pub complete: bool,
}

struct CountingWriter<'a> {
    inner: &'a mut dyn Write,
    count: u64,
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Receive a multipart upload that started with `first`
///
/// The destination is only created once the head parsed, so a malformed
/// request leaves nothing behind. A write failure removes the partial file.
/// Running out of retries while the body is still incomplete keeps whatever
/// was received.
pub fn receive_upload(
    transport: &mut dyn Transport,
    storage: &dyn Storage,
    first: &[u8],
    limits: &UploadConfig,
    chunk: &mut [u8],
) -> Result<UploadReport, UploadError> {
    let mut budget = ReadBudget::new(limits);

    let mut request = first.to_vec();
    let head = loop {
        match UploadHead::parse(&request, limits) {
            Ok(head) => break head,
            Err(e) if e.is_incomplete() && request.len() < MAX_UPLOAD_HEAD => match budget.next(transport, chunk) {
                Some(n) => request.extend_from_slice(&chunk[..n]),
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    };

    let mut file = storage.create(&head.filename).map_err(|source| UploadError::Storage {
        path: head.filename.clone(),
        source,
    })?;
    let body = &request[head.content_offset..];
    let copied = copy_body(transport, file.as_mut(), &head, body, &mut budget, chunk);
    drop(file);

    match copied {
        Ok((bytes_written, complete)) => Ok(UploadReport {
            filename: head.filename,
            bytes_written,
            complete,
        }),
        Err(source) => {
            if let Err(e) = storage.remove(&head.filename) {
                tracing::warn!("Cannot remove partial upload {}: {}", head.filename, e);
            }
            Err(UploadError::Storage {
                path: head.filename,
                source,
            })
        }
    }
}

/// Stream body bytes into `file` up to the terminator
///
/// Returns the bytes written and whether the terminator was seen.
fn copy_body(
    transport: &mut dyn Transport,
    file: &mut dyn Write,
    head: &UploadHead,
    first: &[u8],
    budget: &mut ReadBudget,
    chunk: &mut [u8],
) -> io::Result<(u64, bool)> {
    let mut out = CountingWriter { inner: file, count: 0 };
    let mut matcher = BoundaryMatcher::new(head.terminator.clone());
    let mut complete = matcher.feed(first, &mut out)?;

    while !complete {
        match budget.next(transport, chunk) {
            Some(n) => complete = matcher.feed(&chunk[..n], &mut out)?,
            None => {
                tracing::warn!(
                    "Upload of {} from {} timed out after {} bytes",
                    head.filename,
                    transport.peer(),
                    out.count
                );
                break;
            }
        }
    }

    out.flush()?;
    Ok((out.count, complete))
}
