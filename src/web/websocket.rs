//! Minimal WebSocket server side: handshake, framing and settings messages
//!
//! Only what the control page needs is implemented. Client frames must be
//! masked and carry at most a 16-bit payload length; server frames are
//! always single unfragmented text frames.

use base64::{engine::general_purpose, Engine as _};
use sha1::{Digest, Sha1};
use std::ops::Range;

use crate::constants::WS_MAGIC_GUID;
use crate::error::FrameError;
use crate::network::{ConnectionKind, ConnectionTable};
use crate::settings::{parse_setting, DeviceCommand};

pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_CLOSE: u8 = 0x8;

/// `Sec-WebSocket-Accept` value for a client key
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_MAGIC_GUID.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

/// `101 Switching Protocols` response for a client key
pub fn handshake_response(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(client_key)
    )
}

/// A decoded client frame; the payload is unmasked in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    /// Payload position within the decoded buffer
    pub payload: Range<usize>,
    /// Bytes consumed by this frame
    pub len: usize,
}

/// Decode and unmask one client frame at the start of `buf`
pub fn decode_frame(buf: &mut [u8]) -> Result<Frame, FrameError> {
    if buf.len() < 6 {
        return Err(FrameError::TooShort(buf.len()));
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = buf[0] & 0x0F;
    if buf[1] & 0x80 == 0 {
        return Err(FrameError::Unmasked);
    }

    let (payload_len, mask_at) = match buf[1] & 0x7F {
        127 => return Err(FrameError::PayloadTooLarge),
        126 => {
            if buf.len() < 8 {
                return Err(FrameError::TooShort(buf.len()));
            }
            (usize::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        n => (usize::from(n), 2),
    };

    let start = mask_at + 4;
    let end = start + payload_len;
    if buf.len() < end {
        return Err(FrameError::Truncated {
            needed: end,
            available: buf.len(),
        });
    }

    let mask = [buf[mask_at], buf[mask_at + 1], buf[mask_at + 2], buf[mask_at + 3]];
    for (i, byte) in buf[start..end].iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    Ok(Frame {
        fin,
        opcode,
        payload: start..end,
        len: end,
    })
}

/// Encode an unmasked final text frame
///
/// Payloads beyond the 16-bit length form are truncated.
pub fn encode_text_frame(payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(usize::from(u16::MAX))];
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(0x80 | OPCODE_TEXT);
    if payload.len() < 126 {
        frame.push(payload.len() as u8);
    } else {
        frame.push(126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

/// Meaning of a decoded client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// `name value` update of a setting
    Setting { name: String, value: String },
    /// `$NAME` device command
    Command(DeviceCommand),
    /// `$NAME` nobody understands
    UnknownCommand(String),
    /// Close frame
    Close,
}

/// Interpret a frame payload; unsupported opcodes yield nothing
///
/// Lines whose name starts with `#` are comments in the stored settings
/// file, so they are dropped here rather than applied.
pub fn parse_message(opcode: u8, payload: &[u8]) -> Vec<WsMessage> {
    match opcode {
        OPCODE_CLOSE => vec![WsMessage::Close],
        OPCODE_TEXT => String::from_utf8_lossy(payload)
            .lines()
            .filter_map(parse_setting)
            .filter(|(name, _)| !name.starts_with('#'))
            .map(|(name, value)| {
                if name.starts_with('$') {
                    DeviceCommand::parse(name)
                        .map(WsMessage::Command)
                        .unwrap_or_else(|| WsMessage::UnknownCommand(name.to_string()))
                } else {
                    WsMessage::Setting {
                        name: name.to_string(),
                        value: value.to_string(),
                    }
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Messages decoded from one read, plus the error that stopped decoding
#[derive(Debug, Default)]
pub struct Decoded {
    pub messages: Vec<WsMessage>,
    pub error: Option<FrameError>,
}

/// Decode every frame in `buf`
///
/// Messages from frames before a malformed one are still returned so the
/// caller can act on them before closing.
pub fn decode_messages(buf: &mut [u8]) -> Decoded {
    let mut decoded = Decoded::default();
    let mut offset = 0;
    while offset < buf.len() {
        match decode_frame(&mut buf[offset..]) {
            Ok(frame) => {
                let payload = &buf[offset + frame.payload.start..offset + frame.payload.end];
                decoded.messages.extend(parse_message(frame.opcode, payload));
                offset += frame.len;
            }
            Err(e) => {
                decoded.error = Some(e);
                break;
            }
        }
    }
    decoded
}

/// Send `name value` to every WebSocket connection in the table
///
/// The connection that originated the change is checked out of the table
/// while it is handled, so it never receives its own echo.
pub fn broadcast_setting(table: &mut ConnectionTable, name: &str, value: &str) -> usize {
    let frame = encode_text_frame(format!("{} {}\n", name, value).as_bytes());
    let mut sent = 0;
    for (index, conn) in table.iter_mut() {
        if conn.kind != ConnectionKind::WebSocket {
            continue;
        }
        if conn.transport.write_bytes(&frame) == frame.len() {
            sent += 1;
        } else {
            tracing::debug!("WebSocket broadcast to slot {} ({}) failed", index, conn.transport.peer());
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mock::pipe;
    use std::time::Instant;

    fn masked(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut frame = vec![0x80 | opcode];
        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        frame
    }

    #[test]
    fn test_accept_key_vector() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        let response = handshake_response("dGhlIHNhbXBsZSBub25jZQ==");
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_decode_rfc_hello() {
        // Masked "Hello" from RFC 6455 section 5.7.
        let mut buf = vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let frame = decode_frame(&mut buf).unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OPCODE_TEXT);
        assert_eq!(frame.len, 11);
        assert_eq!(&buf[frame.payload], b"Hello");
    }

    #[test]
    fn test_decode_extended_length() {
        let payload = vec![b'a'; 300];
        let mut buf = masked(OPCODE_TEXT, &payload);
        let frame = decode_frame(&mut buf).unwrap();
        assert_eq!(frame.payload, 8..308);
        assert_eq!(&buf[frame.payload], &payload[..]);
    }

    #[test]
    fn test_decode_rejections() {
        assert_eq!(decode_frame(&mut [0x81, 0x80, 0, 0, 0]), Err(FrameError::TooShort(5)));
        assert_eq!(decode_frame(&mut [0x81, 0x05, 1, 2, 3, 4, 5]), Err(FrameError::Unmasked));
        assert_eq!(
            decode_frame(&mut [0x81, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(FrameError::PayloadTooLarge)
        );
        let mut short = masked(OPCODE_TEXT, b"abcdef");
        short.truncate(9);
        assert_eq!(
            decode_frame(&mut short),
            Err(FrameError::Truncated { needed: 12, available: 9 })
        );
    }

    #[test]
    fn test_encode_lengths() {
        assert_eq!(encode_text_frame(b"hi"), vec![0x81, 2, b'h', b'i']);
        let long = encode_text_frame(&[b'x'; 200]);
        assert_eq!(&long[..4], &[0x81, 126, 0, 200]);
        assert_eq!(long.len(), 204);
        assert_eq!(encode_text_frame(&vec![0u8; 70_000]).len(), 65_535 + 4);
    }

    #[test]
    fn test_messages_in_one_read() {
        let mut buf = masked(OPCODE_TEXT, b"listen_volume 0.75\n");
        buf.extend(masked(OPCODE_TEXT, b"$RESET"));
        buf.extend(masked(OPCODE_TEXT, b"$BOGUS"));
        buf.extend(masked(OPCODE_CLOSE, b""));
        let decoded = decode_messages(&mut buf);
        assert_eq!(decoded.error, None);
        assert_eq!(
            decoded.messages,
            vec![
                WsMessage::Setting {
                    name: "listen_volume".into(),
                    value: "0.75".into()
                },
                WsMessage::Command(DeviceCommand::Restart),
                WsMessage::UnknownCommand("$BOGUS".into()),
                WsMessage::Close,
            ]
        );
    }

    #[test]
    fn test_comment_names_are_not_settings() {
        let messages = parse_message(OPCODE_TEXT, b"#station jazz\n  #x 1\nbitrate 192\n");
        assert_eq!(
            messages,
            vec![WsMessage::Setting {
                name: "bitrate".into(),
                value: "192".into()
            }]
        );
    }

    #[test]
    fn test_malformed_tail_keeps_earlier_messages() {
        let mut buf = masked(OPCODE_TEXT, b"bitrate = 192");
        buf.extend_from_slice(&[0x81, 0x03, b'a', b'b', b'c', 0, 0]);
        let decoded = decode_messages(&mut buf);
        assert_eq!(decoded.messages.len(), 1);
        assert_eq!(decoded.error, Some(FrameError::Unmasked));
    }

    #[test]
    fn test_broadcast_reaches_websockets_only() {
        let now = Instant::now();
        let mut table = ConnectionTable::new(4);
        let (ws, ws_peer) = pipe("ws");
        let (http, http_peer) = pipe("http");
        let index = table.accept(Box::new(ws), now).unwrap();
        table.get_mut(index).unwrap().kind = ConnectionKind::WebSocket;
        table.accept(Box::new(http), now).unwrap();

        assert_eq!(broadcast_setting(&mut table, "listen_volume", "0.5"), 1);
        assert_eq!(ws_peer.take_output(), encode_text_frame(b"listen_volume 0.5\n"));
        assert!(http_peer.take_output().is_empty());
    }
}
