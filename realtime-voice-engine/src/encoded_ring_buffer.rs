//! Lock-free SPSC ring buffer of variable-length encoded packets
//!
//! Same index discipline as the PCM ring, but each slot stores a
//! little-endian `i32` length prefix followed by the payload bytes.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{EngineError, EngineResult};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const LEN_PREFIX_BYTES: usize = 4;

/// Fixed-slot SPSC queue of length-prefixed byte packets.
///
/// Slot layout: `i32 length (LE) | payload`, payload capped at
/// `max_bytes_per_slot`. One slot is always kept free to distinguish empty
/// from full.
pub struct EncodedRingBuffer {
    slab: *mut u8,
    max_slots: usize,
    slot_stride: usize,
    max_bytes_per_slot: usize,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
    dropped_packets: AtomicU64,
}

// Same SPSC slab discipline as PcmRingBuffer.
unsafe impl Send for EncodedRingBuffer {}
unsafe impl Sync for EncodedRingBuffer {}

impl EncodedRingBuffer {
    pub fn new(max_slots: usize, max_bytes_per_slot: usize) -> EngineResult<Self> {
        if max_slots < 2 {
            return Err(EngineError::BadConfig(format!(
                "max_slots must be >= 2, got {max_slots}"
            )));
        }
        if max_bytes_per_slot == 0 {
            return Err(EngineError::BadConfig(
                "max_bytes_per_slot must be >= 1".to_string(),
            ));
        }

        let slot_stride = LEN_PREFIX_BYTES + max_bytes_per_slot;
        let slab_len = max_slots * slot_stride;
        let slab = Box::into_raw(vec![0u8; slab_len].into_boxed_slice()) as *mut u8;

        Ok(EncodedRingBuffer {
            slab,
            max_slots,
            slot_stride,
            max_bytes_per_slot,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            dropped_packets: AtomicU64::new(0),
        })
    }

    pub fn max_bytes_per_slot(&self) -> usize {
        self.max_bytes_per_slot
    }

    /// Write one packet. Fails with `TooLarge` if `data` exceeds the slot
    /// capacity, `BufferFull` if no slot is free.
    ///
    /// Producer side only.
    pub fn write(&self, data: &[u8]) -> EngineResult<()> {
        if data.len() > self.max_bytes_per_slot {
            return Err(EngineError::TooLarge {
                len: data.len(),
                max: self.max_bytes_per_slot,
            });
        }

        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Acquire);
        if (w + 1) % self.max_slots == r {
            return Err(EngineError::BufferFull);
        }

        let len_le = (data.len() as i32).to_le_bytes();
        unsafe {
            let slot = self.slab.add(w * self.slot_stride);
            ptr::copy_nonoverlapping(len_le.as_ptr(), slot, LEN_PREFIX_BYTES);
            ptr::copy_nonoverlapping(data.as_ptr(), slot.add(LEN_PREFIX_BYTES), data.len());
        }
        self.write_pos.store((w + 1) % self.max_slots, Ordering::Release);
        Ok(())
    }

    /// Write one packet, discarding the oldest queued packet if the ring is
    /// full. Returns true if a packet was dropped.
    pub fn write_dropping_oldest(&self, data: &[u8]) -> EngineResult<bool> {
        match self.write(data) {
            Ok(()) => Ok(false),
            Err(EngineError::BufferFull) => {
                self.discard_head();
                self.write(data)?;
                self.dropped_packets.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Read one packet into `dst`, returning the payload length.
    ///
    /// Returns `BufferEmpty` when no packet is queued. If `dst` is too small
    /// for the queued payload the slot is discarded and `BufferEmpty` is
    /// returned; the consumer is never stalled on an oversized slot.
    ///
    /// Consumer side only.
    pub fn read(&self, dst: &mut [u8]) -> EngineResult<usize> {
        let r = self.read_pos.load(Ordering::Relaxed);
        let w = self.write_pos.load(Ordering::Acquire);
        if r == w {
            return Err(EngineError::BufferEmpty);
        }

        let slot = unsafe { self.slab.add(r * self.slot_stride) };
        let mut len_le = [0u8; LEN_PREFIX_BYTES];
        unsafe {
            ptr::copy_nonoverlapping(slot, len_le.as_mut_ptr(), LEN_PREFIX_BYTES);
        }
        let len = i32::from_le_bytes(len_le) as usize;

        if dst.len() < len {
            self.read_pos.store((r + 1) % self.max_slots, Ordering::Release);
            return Err(EngineError::BufferEmpty);
        }

        unsafe {
            ptr::copy_nonoverlapping(slot.add(LEN_PREFIX_BYTES), dst.as_mut_ptr(), len);
        }
        self.read_pos.store((r + 1) % self.max_slots, Ordering::Release);
        Ok(len)
    }

    /// Number of queued packets. May be momentarily stale by one slot.
    pub fn available_packets(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        (w + self.max_slots - r) % self.max_slots
    }

    /// Total packets discarded by `write_dropping_oldest`.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets.load(Ordering::Relaxed)
    }

    /// Reset both indices. Callable only while quiescent.
    pub fn reset(&self) {
        self.read_pos.store(0, Ordering::Relaxed);
        self.write_pos.store(0, Ordering::Relaxed);
    }

    fn discard_head(&self) {
        let r = self.read_pos.load(Ordering::Relaxed);
        let w = self.write_pos.load(Ordering::Acquire);
        if r != w {
            self.read_pos.store((r + 1) % self.max_slots, Ordering::Release);
        }
    }
}

impl Drop for EncodedRingBuffer {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.slab,
                self.max_slots * self.slot_stride,
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_variable_lengths() {
        let ring = EncodedRingBuffer::new(8, 64).unwrap();
        ring.write(&[1, 2, 3]).unwrap();
        ring.write(&[9; 64]).unwrap();
        ring.write(&[]).unwrap();

        let mut out = [0u8; 64];
        assert_eq!(ring.read(&mut out).unwrap(), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert_eq!(ring.read(&mut out).unwrap(), 64);
        assert_eq!(out, [9; 64]);
        assert_eq!(ring.read(&mut out).unwrap(), 0);
        assert!(matches!(ring.read(&mut out), Err(EngineError::BufferEmpty)));
    }

    #[test]
    fn test_too_large_rejected() {
        let ring = EncodedRingBuffer::new(4, 16).unwrap();
        assert!(matches!(
            ring.write(&[0u8; 17]),
            Err(EngineError::TooLarge { len: 17, max: 16 })
        ));
    }

    #[test]
    fn test_full_then_drop_oldest() {
        let ring = EncodedRingBuffer::new(3, 8).unwrap();
        ring.write(&[1]).unwrap();
        ring.write(&[2]).unwrap();
        assert!(matches!(ring.write(&[3]), Err(EngineError::BufferFull)));

        assert!(ring.write_dropping_oldest(&[3]).unwrap());
        assert_eq!(ring.dropped_packets(), 1);

        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out).unwrap(), 1);
        assert_eq!(out[0], 2);
        assert_eq!(ring.read(&mut out).unwrap(), 1);
        assert_eq!(out[0], 3);
    }

    #[test]
    fn test_undersized_reader_discards_slot() {
        let ring = EncodedRingBuffer::new(4, 32).unwrap();
        ring.write(&[7u8; 20]).unwrap();
        ring.write(&[8u8; 4]).unwrap();

        let mut small = [0u8; 8];
        // Slot is discarded rather than blocking the consumer.
        assert!(matches!(ring.read(&mut small), Err(EngineError::BufferEmpty)));
        // The next packet is still intact.
        assert_eq!(ring.read(&mut small).unwrap(), 4);
        assert_eq!(&small[..4], &[8, 8, 8, 8]);
    }
}
