//! Byte-level helpers for HTTP header blocks

/// Position of `needle` in `haystack`
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Offset just past the first blank line
///
/// Counts line feeds and ignores carriage returns, so both `\r\n\r\n` and
/// `\n\n` terminate a header block.
pub fn end_of_headers(buf: &[u8]) -> Option<usize> {
    let mut newlines = 0;
    for (i, &b) in buf.iter().enumerate() {
        match b {
            b'\n' => {
                newlines += 1;
                if newlines == 2 {
                    return Some(i + 1);
                }
            }
            b'\r' => {}
            _ => newlines = 0,
        }
    }
    None
}

/// First line without its terminator, plus the offset after it
pub fn first_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let end = buf.iter().position(|&b| b == b'\n')?;
    let line = &buf[..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, end + 1))
}

/// Value of header `name` (case-insensitive) within a header block
pub fn header_value<'a>(headers: &'a [u8], name: &str) -> Option<&'a str> {
    headers.split(|&b| b == b'\n').find_map(|line| {
        let colon = line.iter().position(|&b| b == b':')?;
        let (key, value) = line.split_at(colon);
        if !trim(key).eq_ignore_ascii_case(name.as_bytes()) {
            return None;
        }
        std::str::from_utf8(trim(&value[1..])).ok()
    })
}

fn trim(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !last.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    bytes
}

/// Value of `param=` inside a header value, quotes removed
pub fn header_param<'a>(value: &'a str, param: &str) -> Option<&'a str> {
    value.split(';').find_map(|part| {
        let (key, val) = part.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(param) {
            Some(val.trim().trim_matches('"'))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_of_headers_variants() {
        assert_eq!(end_of_headers(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody"), Some(27));
        assert_eq!(end_of_headers(b"a\n\nb"), Some(3));
        assert_eq!(end_of_headers(b"a\r\nb\r\n"), None);
    }

    #[test]
    fn test_header_lookup() {
        let headers = b"GET / HTTP/1.1\r\nsec-websocket-key:  abc== \r\nContent-Type: multipart/form-data; boundary=\"XyZ\"\r\n";
        assert_eq!(header_value(headers, "Sec-WebSocket-Key"), Some("abc=="));
        let ct = header_value(headers, "content-type").unwrap();
        assert_eq!(header_param(ct, "boundary"), Some("XyZ"));
        assert_eq!(header_value(headers, "Missing"), None);
    }

    #[test]
    fn test_first_line_and_find() {
        let (line, next) = first_line(b"POST /upload HTTP/1.1\r\nHost").unwrap();
        assert_eq!(line, b"POST /upload HTTP/1.1");
        assert_eq!(next, 23);
        assert_eq!(find(b"abcabd", b"abd"), Some(3));
        assert_eq!(find(b"ab", b"abc"), None);
    }
}
