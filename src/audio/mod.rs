//! Audio subsystem module

pub mod buffer;
pub mod producer;

pub use buffer::{create_ring_buffer, RingBuffer, RingReader, RingWriter};
pub use producer::{AudioSource, FileReplayProducer, PlaybackVolume};
