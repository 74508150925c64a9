//! Slot ring buffer between the encoder and the network loop
//!
//! The producer fills fixed-size slots one after another and never blocks.
//! The network loop pulls whole slots only once the writer is more than
//! `lag` slots ahead, so the slot being written is never handed out. A
//! reader that falls a full cycle behind silently loses audio: the writer
//! overwrites unread slots instead of stalling.

use bytes::Bytes;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Storage shared by the two halves of the ring
pub struct RingBuffer {
    /// Slot memory; each slot is locked only while it is copied or filled
    slots: Box<[Mutex<Box<[u8]>>]>,
    /// Fixed size of every slot
    slot_size: usize,
    /// Slot currently being written (the only shared index)
    write_index: Mutex<usize>,
    /// Minimum distance between writer and reader
    lag: usize,
    /// Slots completed by the writer
    slots_written: AtomicU64,
    /// Slots handed out by the reader
    slots_read: AtomicU64,
}

impl RingBuffer {
    /// Create ring storage with `slot_count` slots of `slot_size` bytes
    pub fn new(slot_count: usize, slot_size: usize, lag: usize) -> Self {
        assert!(slot_size > 0, "Slot size must be non-zero");
        assert!(lag + 1 < slot_count, "Lag must leave at least one readable slot");

        let slots = (0..slot_count)
            .map(|_| Mutex::new(vec![0u8; slot_size].into_boxed_slice()))
            .collect();

        Self {
            slots,
            slot_size,
            write_index: Mutex::new(0),
            lag,
            slots_written: AtomicU64::new(0),
            slots_read: AtomicU64::new(0),
        }
    }

    /// Split into the producer and consumer halves
    pub fn split(self) -> (RingWriter, RingReader) {
        let shared = Arc::new(self);
        (
            RingWriter {
                shared: shared.clone(),
                slot: 0,
                offset: 0,
            },
            RingReader {
                shared,
                read_index: 0,
            },
        )
    }

    /// Number of slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Bytes per slot
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    fn current_write_index(&self) -> usize {
        *self.write_index.lock()
    }

    /// Get statistics
    pub fn stats(&self) -> RingStats {
        RingStats {
            slot_count: self.slots.len(),
            slot_size: self.slot_size,
            slots_written: self.slots_written.load(Ordering::Relaxed),
            slots_read: self.slots_read.load(Ordering::Relaxed),
        }
    }
}

/// Create a ring buffer and return its two halves
pub fn create_ring_buffer(slot_count: usize, slot_size: usize, lag: usize) -> (RingWriter, RingReader) {
    RingBuffer::new(slot_count, slot_size, lag).split()
}

/// Producer half: owns the write offset
pub struct RingWriter {
    shared: Arc<RingBuffer>,
    /// Local copy of the write index; only this half ever changes it
    slot: usize,
    offset: usize,
}

impl RingWriter {
    /// Remaining space of the slot being filled
    ///
    /// Write into the returned region, drop the guard, then call
    /// [`advance_write`](Self::advance_write) with the number of bytes used.
    pub fn next_write_slot(&mut self) -> MappedMutexGuard<'_, [u8]> {
        let offset = self.offset;
        MutexGuard::map(self.shared.slots[self.slot].lock(), |slot| &mut slot[offset..])
    }

    /// Bytes left in the current slot
    pub fn remaining(&self) -> usize {
        self.shared.slot_size - self.offset
    }

    /// Commit `used` bytes; moves to the next slot once the current one is full
    pub fn advance_write(&mut self, used: usize) {
        self.offset = (self.offset + used).min(self.shared.slot_size);
        if self.offset >= self.shared.slot_size {
            let mut index = self.shared.write_index.lock();
            *index = (*index + 1) % self.shared.slots.len();
            self.slot = *index;
            drop(index);
            self.offset = 0;
            self.shared.slots_written.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy `data` into the ring, spilling across slots as needed
    pub fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let used = {
                let mut region = self.next_write_slot();
                let n = region.len().min(data.len());
                region[..n].copy_from_slice(&data[..n]);
                n
            };
            self.advance_write(used);
            data = &data[used..];
        }
    }

    /// Index of the slot being written
    pub fn slot_index(&self) -> usize {
        self.slot
    }

    /// Shared ring storage
    pub fn ring(&self) -> &RingBuffer {
        &self.shared
    }
}

/// Consumer half: owns the read index
pub struct RingReader {
    shared: Arc<RingBuffer>,
    read_index: usize,
}

impl RingReader {
    /// Slots between the writer and this reader, modulo the slot count
    pub fn distance(&self) -> usize {
        let n = self.shared.slots.len();
        (self.shared.current_write_index() + n - self.read_index) % n
    }

    /// Pull the next whole slot if the writer is far enough ahead
    pub fn next_ready_slot(&mut self) -> Option<Bytes> {
        if self.distance() <= self.shared.lag {
            return None;
        }

        let data = Bytes::copy_from_slice(&self.shared.slots[self.read_index].lock());
        self.read_index = (self.read_index + 1) % self.shared.slots.len();
        self.shared.slots_read.fetch_add(1, Ordering::Relaxed);
        Some(data)
    }

    /// Index of the next slot to hand out
    pub fn read_index(&self) -> usize {
        self.read_index
    }

    /// Shared ring storage
    pub fn ring(&self) -> &RingBuffer {
        &self.shared
    }
}

/// Ring buffer statistics
#[derive(Debug, Clone)]
pub struct RingStats {
    pub slot_count: usize,
    pub slot_size: usize,
    pub slots_written: u64,
    pub slots_read: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_nothing_ready_until_lag_exceeded() {
        let (mut writer, mut reader) = create_ring_buffer(12, 16, 2);

        // Two full slots and a partial third: distance is 2, not ready.
        writer.write(&[1u8; 16]);
        writer.write(&[2u8; 16]);
        writer.write(&[3u8; 8]);
        assert_eq!(reader.distance(), 2);
        assert!(reader.next_ready_slot().is_none());

        writer.write(&[3u8; 8]);
        assert_eq!(reader.distance(), 3);
        let slot = reader.next_ready_slot().unwrap();
        assert_eq!(&slot[..], &[1u8; 16]);
        assert!(reader.next_ready_slot().is_none());
    }

    #[test]
    fn test_slots_come_out_whole_and_in_order() {
        let (mut writer, mut reader) = create_ring_buffer(6, 8, 2);
        let data: Vec<u8> = (0..40).collect();
        writer.write(&data);

        // 5 complete slots written, writer sits in slot 5.
        let mut out = Vec::new();
        while let Some(slot) = reader.next_ready_slot() {
            assert_eq!(slot.len(), 8);
            out.extend_from_slice(&slot);
        }
        assert_eq!(out, data[..24].to_vec());
        assert_eq!(reader.read_index(), 3);
    }

    #[test]
    fn test_write_region_and_advance() {
        let (mut writer, _reader) = create_ring_buffer(4, 10, 1);
        {
            let mut region = writer.next_write_slot();
            assert_eq!(region.len(), 10);
            region[..4].copy_from_slice(b"abcd");
        }
        writer.advance_write(4);
        assert_eq!(writer.remaining(), 6);
        assert_eq!(writer.next_write_slot().len(), 6);

        writer.advance_write(6);
        assert_eq!(writer.slot_index(), 1);
        assert_eq!(writer.remaining(), 10);
        assert_eq!(writer.ring().stats().slots_written, 1);
    }

    #[test]
    fn test_writer_wraps_and_overwrites() {
        let (mut writer, mut reader) = create_ring_buffer(4, 4, 1);
        // Writer laps the idle reader: 4 slots written, index back to 0.
        writer.write(&[9u8; 16]);
        assert_eq!(writer.slot_index(), 0);
        assert_eq!(reader.distance(), 0);
        assert!(reader.next_ready_slot().is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(usize),
        Read,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![(1usize..40).prop_map(Op::Write), Just(Op::Read)]
    }

    proptest! {
        #[test]
        fn test_read_never_touches_write_slot(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            let n = 12;
            let lag = 2;
            let (mut writer, mut reader) = create_ring_buffer(n, 16, lag);

            for op in ops {
                match op {
                    Op::Write(len) => writer.write(&vec![0xAB; len]),
                    Op::Read => {
                        let read_slot = reader.read_index();
                        let write_slot = writer.slot_index();
                        if reader.next_ready_slot().is_some() {
                            prop_assert_ne!(read_slot, write_slot);
                            prop_assert!((write_slot + n - read_slot) % n > lag);
                        }
                    }
                }
            }
        }
    }
}
