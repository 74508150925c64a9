//! # LAN Radio Relay
//!
//! Control-and-relay core of a network-attached MP3 encoder appliance.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            PRODUCER CONTEXT                               │
//! │   ┌──────────────────┐        ┌────────────────────────────────────────┐  │
//! │   │ Hardware encoder │ ─────▶ │ RingBuffer (audio::buffer)             │  │
//! │   │ (AudioProducer)  │        │ 12 x 4096 byte slots, reader lag of 2  │  │
//! │   └──────────────────┘        └───────────────────┬────────────────────┘  │
//! └───────────────────────────────────────────────────┼───────────────────────┘
//!                                                     │ poll_ready_slot()
//! ┌───────────────────────────────────────────────────┼───────────────────────┐
//! │                           NETWORK LOOP CONTEXT    ▼                       │
//! │  ┌─────────────────────────────────────────────────────────────────────┐  │
//! │  │                  Multiplexer (server::RelayServer)                  │  │
//! │  │  accept ─▶ ConnectionTable (30 slots) ─▶ per-slot state machine     │  │
//! │  └───────┬───────────────┬───────────────────┬────────────────┬────────┘  │
//! │          │ UNKNOWN       │ WEBSOCKET         │ MP3-LOCAL      │ MP3-ICE   │
//! │          ▼               ▼                   ▼                ▼           │
//! │  ┌──────────────┐ ┌──────────────┐   ┌──────────────┐  ┌──────────────┐   │
//! │  │ HTTP GET /   │ │ frames,      │   │ local        │  │ Icecast PUT  │   │
//! │  │ multipart    │ │ settings     │   │ listeners    │  │ relay        │   │
//! │  │ POST upload  │ │ broadcast    │   │              │  │ (IcyClient)  │   │
//! │  └──────────────┘ └──────┬───────┘   └──────────────┘  └──────────────┘   │
//! │                          │                                                │
//! │                          ▼                                                │
//! │               SettingsService ◀── ControlHandle (volume knob, switch)     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod server;
pub mod settings;
pub mod storage;
pub mod web;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Number of slots in the audio ring buffer
    pub const RING_SLOT_COUNT: usize = 12;

    /// Size of one ring buffer slot in bytes
    pub const RING_SLOT_SIZE: usize = 4096;

    /// Minimum slot distance between writer and reader
    pub const RING_READ_LAG: usize = 2;

    /// Capacity of the connection table
    pub const MAX_CONNECTIONS: usize = 30;

    /// Idle time after which an unclassified connection is evicted
    pub const IDLE_TIMEOUT_MS: u64 = 1000;

    /// Size of the per-tick request scratch buffer
    pub const MAX_PACKET_SIZE: usize = 2048;

    /// Chunk size used when streaming files to a client
    pub const FILE_CHUNK_SIZE: usize = 1024;

    /// Default HTTP port
    pub const DEFAULT_HTTP_PORT: u16 = 80;

    /// Number of extra waits for upload body bytes
    pub const UPLOAD_RETRIES: u32 = 4;

    /// Delay between upload body waits
    pub const UPLOAD_RETRY_DELAY_MS: u64 = 20;

    /// Longest accepted upload filename
    pub const MAX_FILENAME_LENGTH: usize = 32;

    /// Longest accepted multipart boundary
    pub const MAX_BOUNDARY_LENGTH: usize = 72;

    /// Number of polls for an Icecast login reply
    pub const ICY_REPLY_POLLS: u32 = 20;

    /// Delay between Icecast reply polls
    pub const ICY_POLL_DELAY_MS: u64 = 100;

    /// Fixed delay between relay reconnect attempts
    pub const RELAY_RECONNECT_DELAY_MS: u64 = 500;

    /// Time allowed for a listened stream's response header
    pub const LISTEN_HEADER_TIMEOUT_MS: u64 = 2000;

    /// Consecutive short audio writes before a connection is dropped
    pub const MAX_STALLED_SLOTS: u32 = 12;

    /// Icecast port used when the setting is absent
    pub const DEFAULT_ICECAST_PORT: u16 = 8000;

    /// Path of the persisted device settings inside storage
    pub const SETTINGS_PATH: &str = "/settings.txt";

    /// WebSocket handshake GUID (RFC 6455)
    pub const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
}
