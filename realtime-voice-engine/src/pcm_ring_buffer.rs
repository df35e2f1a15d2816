//! Lock-free SPSC ring buffer of fixed-size PCM frames
//!
//! One thread produces, one thread consumes. The capture callback or the
//! playback feeder writes whole frames; the opposite side reads whole frames.
//! No locks, no allocations after construction.
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

/// Fixed-slot single-producer/single-consumer queue of int16 frames.
///
/// Holds `max_frames` slots of `frame_samples` interleaved samples each. One
/// slot is always kept free to distinguish empty from full, so at most
/// `max_frames - 1` frames are queued at any time.
///
/// A successful `write` happens-before the `read` that observes it: the write
/// index is stored with release ordering and loaded by the consumer with
/// acquire ordering.
pub struct PcmRingBuffer {
    slab: *mut i16,
    max_frames: usize,
    frame_samples: usize,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
    dropped_frames: AtomicU64,
}

// The slab is only ever touched under the SPSC index discipline: the producer
// writes slots it owns, the consumer reads slots the producer has released.
unsafe impl Send for PcmRingBuffer {}
unsafe impl Sync for PcmRingBuffer {}

impl PcmRingBuffer {
    /// Create a ring with `max_frames` slots of `frame_samples` samples each.
    ///
    /// The slab is allocated and zeroed up front.
    pub fn new(max_frames: usize, frame_samples: usize) -> EngineResult<Self> {
        if max_frames < 2 {
            return Err(EngineError::BadConfig(format!(
                "max_frames must be >= 2, got {max_frames}"
            )));
        }
        if frame_samples == 0 {
            return Err(EngineError::BadConfig(
                "frame_samples must be >= 1".to_string(),
            ));
        }

        let slab_len = max_frames * frame_samples;
        let slab = Box::into_raw(vec![0i16; slab_len].into_boxed_slice()) as *mut i16;

        Ok(PcmRingBuffer {
            slab,
            max_frames,
            frame_samples,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            dropped_frames: AtomicU64::new(0),
        })
    }

    /// Samples per frame slot.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Slot count (one of which is always reserved).
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Write one frame. `src.len()` must equal `frame_samples`.
    ///
    /// Producer side only.
    pub fn write(&self, src: &[i16]) -> EngineResult<()> {
        if src.len() != self.frame_samples {
            return Err(EngineError::SizeMismatch {
                expected: self.frame_samples,
                actual: src.len(),
            });
        }

        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Acquire);
        if (w + 1) % self.max_frames == r {
            return Err(EngineError::BufferFull);
        }

        unsafe {
            ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.slab.add(w * self.frame_samples),
                self.frame_samples,
            );
        }
        self.write_pos.store((w + 1) % self.max_frames, Ordering::Release);
        Ok(())
    }

    /// Read one frame into `dst`. `dst.len()` must equal `frame_samples`.
    ///
    /// Consumer side only.
    pub fn read(&self, dst: &mut [i16]) -> EngineResult<()> {
        if dst.len() != self.frame_samples {
            return Err(EngineError::SizeMismatch {
                expected: self.frame_samples,
                actual: dst.len(),
            });
        }

        let r = self.read_pos.load(Ordering::Relaxed);
        let w = self.write_pos.load(Ordering::Acquire);
        if r == w {
            return Err(EngineError::BufferEmpty);
        }

        unsafe {
            ptr::copy_nonoverlapping(
                self.slab.add(r * self.frame_samples),
                dst.as_mut_ptr(),
                self.frame_samples,
            );
        }
        self.read_pos.store((r + 1) % self.max_frames, Ordering::Release);
        Ok(())
    }

    /// Write one frame, discarding the oldest queued frame if the ring is
    /// full. Returns true if a frame was dropped.
    ///
    /// `drop_scratch` must be a producer-owned buffer of `frame_samples`
    /// samples; the playback callback's partial-frame buffer must never be
    /// passed here.
    pub fn write_dropping_oldest(
        &self,
        src: &[i16],
        drop_scratch: &mut [i16],
    ) -> EngineResult<bool> {
        match self.write(src) {
            Ok(()) => Ok(false),
            Err(EngineError::BufferFull) => {
                // Discard the head, then the retry has room.
                let _ = self.read(drop_scratch);
                self.write(src)?;
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Number of queued frames. May be momentarily stale by one slot.
    pub fn available_frames(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        (w + self.max_frames - r) % self.max_frames
    }

    /// Total frames discarded by `write_dropping_oldest`.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Reset both indices to zero.
    ///
    /// Callable only while no producer or consumer is active.
    pub fn reset(&self) {
        self.read_pos.store(0, Ordering::Relaxed);
        self.write_pos.store(0, Ordering::Relaxed);
    }

    /// Advance the read index so that at most `keep` frames remain queued.
    ///
    /// Safe from the consumer side or while quiescent.
    pub fn drain(&self, keep: usize) {
        let w = self.write_pos.load(Ordering::Acquire);
        let mut r = self.read_pos.load(Ordering::Relaxed);
        let mut avail = (w + self.max_frames - r) % self.max_frames;
        while avail > keep {
            r = (r + 1) % self.max_frames;
            avail -= 1;
        }
        self.read_pos.store(r, Ordering::Release);
    }
}

impl Drop for PcmRingBuffer {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.slab,
                self.max_frames * self.frame_samples,
            )));
        }
    }
}
