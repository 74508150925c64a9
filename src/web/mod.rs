//! Web control surface: HTTP files and uploads, WebSocket settings channel

pub mod assets;
pub mod classify;
pub mod http;
pub mod multipart;
mod parse;
pub mod websocket;

pub use classify::{classify, RequestClass};
pub use http::{receive_upload, send_stream_header, serve_file, UploadReport};
pub use multipart::{BoundaryMatcher, UploadHead};
pub use websocket::{accept_key, broadcast_setting, decode_frame, encode_text_frame, Frame, WsMessage};
