//! Audio producer collaborators
//!
//! The hardware encoder is external; the network loop only sees it through
//! [`AudioSource`] and the live-change path through [`PlaybackVolume`].
//! [`FileReplayProducer`] stands in for the encoder by streaming an MP3
//! file into the ring buffer at the configured bitrate, each producer
//! running in its own dedicated thread.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{RingReader, RingWriter};

/// Something the multiplexer can pull finished MP3 slots from
pub trait AudioSource: Send {
    /// Next whole slot ready for fan-out, if any
    fn poll_ready_slot(&mut self) -> Option<Bytes>;
}

impl AudioSource for RingReader {
    fn poll_ready_slot(&mut self) -> Option<Bytes> {
        self.next_ready_slot()
    }
}

/// Playback volume capability of the audio chip
pub trait PlaybackVolume: Send + Sync {
    /// Set volume, `0.0..=1.0`
    fn set_playback_volume(&self, level: f32);
}

/// Pacing interval of the replay thread
const REPLAY_TICK: Duration = Duration::from_millis(10);

/// Replays an MP3 byte stream into the ring buffer in a loop
pub struct FileReplayProducer {
    /// Encoded audio to replay
    data: Arc<[u8]>,

    /// Target bitrate in kbit/s
    bitrate_kbps: u32,

    /// Ring writer while idle; moved into the thread while running
    writer: Option<RingWriter>,

    /// Whether replay is running
    running: Arc<AtomicBool>,

    /// Replay thread handle; hands the writer back on exit
    thread_handle: Option<JoinHandle<RingWriter>>,

    /// Total bytes pushed into the ring
    bytes_produced: Arc<AtomicU64>,

    /// Last requested playback volume, stored as f32 bits
    volume_bits: AtomicU32,
}

impl FileReplayProducer {
    /// Create a replay producer for `data` at `bitrate_kbps`
    pub fn new(data: impl Into<Arc<[u8]>>, bitrate_kbps: u32, writer: RingWriter) -> Self {
        Self {
            data: data.into(),
            bitrate_kbps: bitrate_kbps.max(8),
            writer: Some(writer),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            bytes_produced: Arc::new(AtomicU64::new(0)),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    /// Start replaying
    pub fn start(&mut self) -> std::io::Result<()> {
        if self.running.load(Ordering::SeqCst) || self.data.is_empty() {
            return Ok(());
        }
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };

        let running = self.running.clone();
        let bytes_produced = self.bytes_produced.clone();
        let data = self.data.clone();
        let bytes_per_second = self.bitrate_kbps as u64 * 1000 / 8;

        running.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name("producer-replay".to_string())
            .spawn(move || {
                let start = Instant::now();
                let mut position = 0usize;
                let mut produced = 0u64;

                while running.load(Ordering::Relaxed) {
                    let due = start.elapsed().as_millis() as u64 * bytes_per_second / 1000;
                    while produced < due {
                        let want = ((due - produced) as usize).min(data.len() - position);
                        writer.write(&data[position..position + want]);
                        position = (position + want) % data.len();
                        produced += want as u64;
                    }
                    bytes_produced.store(produced, Ordering::Relaxed);
                    thread::sleep(REPLAY_TICK);
                }
                writer
            });

        match spawned {
            Ok(handle) => {
                self.thread_handle = Some(handle);
                tracing::info!(
                    "Replay producer started: {} bytes at {} kbit/s",
                    self.data.len(),
                    self.bitrate_kbps
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Stop replaying and reclaim the ring writer
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            match handle.join() {
                Ok(writer) => self.writer = Some(writer),
                Err(_) => tracing::error!("Replay producer thread panicked"),
            }
        }
    }

    /// Check if replay is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get total bytes produced
    pub fn bytes_produced(&self) -> u64 {
        self.bytes_produced.load(Ordering::Relaxed)
    }

    /// Last volume requested through [`PlaybackVolume`]
    pub fn playback_volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }
}

impl PlaybackVolume for FileReplayProducer {
    fn set_playback_volume(&self, level: f32) {
        let level = level.clamp(0.0, 1.0);
        self.volume_bits.store(level.to_bits(), Ordering::Relaxed);
        tracing::debug!("Replay producer volume set to {:.2}", level);
    }
}

impl Drop for FileReplayProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::create_ring_buffer;

    #[test]
    fn test_replay_fills_ring() {
        let (writer, mut reader) = create_ring_buffer(12, 64, 2);
        let mut producer = FileReplayProducer::new(vec![0x55u8; 100], 256, writer);
        producer.start().unwrap();
        assert!(producer.is_running());

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut slot = None;
        while slot.is_none() && Instant::now() < deadline {
            slot = reader.poll_ready_slot();
            thread::sleep(Duration::from_millis(5));
        }
        producer.stop();

        let slot = slot.expect("replay should complete slots");
        assert!(slot.iter().all(|&b| b == 0x55));
        assert!(producer.bytes_produced() >= 64 * 3);
        assert!(!producer.is_running());
    }

    #[test]
    fn test_volume_is_clamped() {
        let (writer, _reader) = create_ring_buffer(4, 8, 1);
        let producer = FileReplayProducer::new(vec![1u8; 8], 128, writer);
        producer.set_playback_volume(1.7);
        assert_eq!(producer.playback_volume(), 1.0);
        producer.set_playback_volume(0.25);
        assert_eq!(producer.playback_volume(), 0.25);
    }
}
