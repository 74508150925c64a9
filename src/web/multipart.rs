//! Streaming `multipart/form-data` upload parsing
//!
//! The request head (HTTP headers, first delimiter and part headers) must
//! arrive before any content is written. After that the body is scanned by
//! a [`BoundaryMatcher`] which keeps its match state between reads, so the
//! closing delimiter may be split anywhere across network packets.

use std::io::{self, Write};

use super::parse::{end_of_headers, find, first_line, header_param, header_value};
use crate::config::UploadConfig;
use crate::error::UploadError;

/// Paths accepting uploads
const UPLOAD_PATHS: [&str; 3] = ["/", "/upload", "/upload.html"];

/// Everything learned from the head of an upload request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHead {
    /// Storage path of the destination file, starting with `/`
    pub filename: String,
    /// Byte sequence terminating the file content
    pub terminator: Vec<u8>,
    /// Offset of the first content byte in the request buffer
    pub content_offset: usize,
}

impl UploadHead {
    /// Parse the head of a buffered upload request
    ///
    /// Fails while the buffer does not yet hold the complete head; the
    /// caller may retry once more bytes have arrived.
    pub fn parse(request: &[u8], limits: &UploadConfig) -> Result<Self, UploadError> {
        let (line, _) = first_line(request).ok_or(UploadError::IncompleteHeaders)?;
        let path = std::str::from_utf8(line)
            .ok()
            .and_then(|l| l.split_ascii_whitespace().nth(1))
            .ok_or(UploadError::NotUploadPath)?;
        if !UPLOAD_PATHS.contains(&path) {
            return Err(UploadError::NotUploadPath);
        }

        let header_end = end_of_headers(request).ok_or(UploadError::IncompleteHeaders)?;
        let headers = &request[..header_end];
        let body = &request[header_end..];

        let delimiter = match header_value(headers, "Content-Type").and_then(|ct| header_param(ct, "boundary")) {
            Some(boundary) if !boundary.is_empty() => format!("--{}", boundary).into_bytes(),
            _ => first_line(body)
                .map(|(line, _)| line.to_vec())
                .filter(|line| !line.is_empty())
                .ok_or(UploadError::MissingBoundary)?,
        };
        if delimiter.len() > limits.max_boundary_length {
            return Err(UploadError::BoundaryTooLong(limits.max_boundary_length));
        }

        let part_start = find(body, &delimiter).ok_or(UploadError::MissingBoundary)? + delimiter.len();
        let part = &body[part_start..];
        let part_header_end = end_of_headers(part).ok_or(UploadError::IncompleteHeaders)?;
        let part_headers = &part[..part_header_end];

        let raw_name = header_value(part_headers, "Content-Disposition")
            .and_then(|cd| header_param(cd, "filename"))
            .ok_or(UploadError::MissingFilename)?;
        let filename = sanitize_filename(raw_name, limits.max_filename_length)?;

        let mut terminator = b"\r\n".to_vec();
        terminator.extend_from_slice(&delimiter);

        Ok(Self {
            filename,
            terminator,
            content_offset: header_end + part_start + part_header_end,
        })
    }
}

/// Reduce a client-supplied filename to a single storage path component
///
/// The length limit applies to the name as the client sent it, directories
/// included.
pub fn sanitize_filename(raw: &str, max_len: usize) -> Result<String, UploadError> {
    let raw = raw.trim();
    if raw.len() > max_len {
        return Err(UploadError::FilenameTooLong(max_len));
    }
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(UploadError::MissingFilename);
    }
    Ok(format!("/{}", name))
}

/// Scans body bytes for the terminator, forwarding everything before it
///
/// Bytes that might start the terminator are held back until they either
/// complete it or are proven to be content. On a partial mismatch the
/// cursor falls back to the longest terminator prefix that is still a
/// suffix of the held bytes, so overlapping near-matches never hide the
/// real terminator.
#[derive(Debug)]
pub struct BoundaryMatcher {
    pattern: Vec<u8>,
    fallback: Vec<usize>,
    matched: usize,
    complete: bool,
    pending: Vec<u8>,
}

impl BoundaryMatcher {
    pub fn new(pattern: impl Into<Vec<u8>>) -> Self {
        let pattern = pattern.into();
        assert!(!pattern.is_empty(), "terminator must not be empty");
        let fallback = prefix_function(&pattern);
        Self {
            pattern,
            fallback,
            matched: 0,
            complete: false,
            pending: Vec::new(),
        }
    }

    /// Whether the terminator has been seen
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Bytes currently held as a possible terminator prefix
    pub fn held(&self) -> usize {
        self.matched
    }

    /// Feed the next chunk of body bytes
    ///
    /// Content is written to `out`; anything after the terminator is
    /// discarded. Returns `true` once the terminator has been matched.
    pub fn feed(&mut self, input: &[u8], out: &mut dyn Write) -> io::Result<bool> {
        if self.complete {
            return Ok(true);
        }
        self.pending.clear();

        for &byte in input {
            loop {
                if byte == self.pattern[self.matched] {
                    self.matched += 1;
                    break;
                }
                if self.matched == 0 {
                    self.pending.push(byte);
                    break;
                }
                let keep = self.fallback[self.matched - 1];
                self.pending.extend_from_slice(&self.pattern[..self.matched - keep]);
                self.matched = keep;
            }
            if self.matched == self.pattern.len() {
                self.complete = true;
                break;
            }
        }

        out.write_all(&self.pending)?;
        Ok(self.complete)
    }
}

/// Classic KMP prefix function
fn prefix_function(pattern: &[u8]) -> Vec<usize> {
    let mut table = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}
