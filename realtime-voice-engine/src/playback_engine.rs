//! Speaker playback engine
//!
//! Owns the host output stream and its real-time callback. The callback
//! serves hardware bursts smaller than a logical frame from a partial-frame
//! buffer, falls back to bounded Opus packet-loss concealment on underrun,
//! and exits cleanly through a destroyed fence when torn down.
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


use crate::audio_backend::{
    AudioStreamHandle, CallbackResult, ContentType, HostAudioBackend, OutputDataCallback,
    OutputStreamParams, PerformanceMode, SharingMode, StreamUsage,
};
use crate::codec::Codec;
use crate::error::{EngineError, EngineResult};
use crate::pcm_ring_buffer::PcmRingBuffer;
use crate::profile::Profile;
use crate::throttle::LogThrottle;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Opus PLC quality degrades past roughly this many consecutive synthetic
/// frames; beyond the cap the callback emits silence.
const MAX_CONSECUTIVE_PLC: u32 = 5;

/// Worst-case Opus frame duration covered by the decode scratch
const MAX_OPUS_FRAME_MS: usize = 60;

/// Playback stream geometry
#[derive(Debug, Clone, Copy)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub channels: u8,
    /// Interleaved samples per logical frame
    pub frame_samples: usize,
    /// PCM ring capacity in frames
    pub max_buffer_frames: usize,
    /// Frames that must be queued before the stream is started
    pub prebuffer_frames: usize,
}

/// Diagnostics snapshot, readable while playing
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PlaybackStats {
    /// Packets decoded through `write_encoded_packet`
    pub decoded_frames: u64,
    /// Callback invocations
    pub callback_frames: u64,
    /// Callbacks that produced nothing from the ring or PLC
    pub callback_silence_count: u64,
    /// Callbacks that filled the gap with a concealment frame
    pub callback_plc_count: u64,
    /// Frames discarded by drop-oldest on the PCM ring
    pub frames_dropped: u64,
    /// Packets the decoder refused
    pub decode_errors: u64,
}

struct DecoderSlot {
    codec: Codec,
}

/// Producer-side scratches. Locked only by the feeding thread; never shared
/// with the callback's partial-frame buffer.
struct ProducerScratch {
    decode: Vec<i16>,
    drop: Vec<i16>,
}

struct PlaybackShared {
    playing: AtomicBool,
    muted: AtomicBool,
    destroyed: AtomicBool,
    route_error: AtomicBool,
    pcm_ring: PcmRingBuffer,
    /// The callback's PLC path try-locks this; the decode caller holds it
    /// across one decode.
    decoder: Mutex<Option<DecoderSlot>>,
    producer: Mutex<ProducerScratch>,
    frame_samples: usize,
    channels: usize,
    decoded_frames: AtomicU64,
    callback_frames: AtomicU64,
    callback_silence_count: AtomicU64,
    callback_plc_count: AtomicU64,
    decode_errors: AtomicU64,
    decode_fail_throttle: LogThrottle,
    length_mismatch_throttle: LogThrottle,
}

struct PlaybackInner {
    config: Option<PlaybackConfig>,
    shared: Option<Arc<PlaybackShared>>,
    stream: Option<Box<dyn AudioStreamHandle>>,
}

/// Process-scoped playback engine; see [`crate::capture_engine::CaptureEngine`]
/// for the singleton rationale.
pub struct PlaybackEngine {
    backend: Arc<dyn HostAudioBackend>,
    inner: Mutex<PlaybackInner>,
}

impl PlaybackEngine {
    pub fn new(backend: Arc<dyn HostAudioBackend>) -> Self {
        PlaybackEngine {
            backend,
            inner: Mutex::new(PlaybackInner {
                config: None,
                shared: None,
                stream: None,
            }),
        }
    }

    /// Allocate the ring and scratches. Destroys any previous incarnation
    /// first; clears the destroyed fence.
    pub fn create(&self, config: PlaybackConfig) -> EngineResult<()> {
        if config.channels == 0 || config.channels > 2 {
            return Err(EngineError::BadConfig(format!(
                "unsupported channel count: {}",
                config.channels
            )));
        }
        if config.frame_samples == 0 || config.frame_samples % config.channels as usize != 0 {
            return Err(EngineError::BadConfig(format!(
                "frame_samples {} incompatible with {} channels",
                config.frame_samples, config.channels
            )));
        }

        self.destroy();

        let shared = Arc::new(PlaybackShared {
            playing: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            route_error: AtomicBool::new(false),
            pcm_ring: PcmRingBuffer::new(config.max_buffer_frames, config.frame_samples)?,
            decoder: Mutex::new(None),
            producer: Mutex::new(ProducerScratch {
                decode: Vec::new(),
                drop: vec![0; config.frame_samples],
            }),
            frame_samples: config.frame_samples,
            channels: config.channels as usize,
            decoded_frames: AtomicU64::new(0),
            callback_frames: AtomicU64::new(0),
            callback_silence_count: AtomicU64::new(0),
            callback_plc_count: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            decode_fail_throttle: LogThrottle::default(),
            length_mismatch_throttle: LogThrottle::default(),
        });

        let mut inner = self.inner.lock().unwrap();
        inner.config = Some(config);
        inner.shared = Some(shared);
        info!(
            rate = config.sample_rate,
            channels = config.channels,
            frame_samples = config.frame_samples,
            prebuffer = config.prebuffer_frames,
            "Playback engine created"
        );
        Ok(())
    }

    /// Install a decoder for the profile's playback side. The decode scratch
    /// covers the worst-case 60 ms Opus frame or one nominal frame,
    /// whichever is larger.
    pub fn configure_decoder(&self, profile: &Profile) -> EngineResult<()> {
        let inner = self.inner.lock().unwrap();
        let shared = inner.shared.as_ref().ok_or(EngineError::NotCreated)?;
        let config = inner.config.as_ref().ok_or(EngineError::NotCreated)?;

        let codec = Codec::for_decoding(profile)?;
        let scratch_len = (config.sample_rate as usize * MAX_OPUS_FRAME_MS / 1000
            * config.channels as usize)
            .max(config.frame_samples);

        *shared.decoder.lock().unwrap() = Some(DecoderSlot { codec });
        shared.producer.lock().unwrap().decode = vec![0; scratch_len];
        info!(profile = profile.name, "Playback decoder configured");
        Ok(())
    }

    /// Remove the decoder; the engine falls back to the raw PCM path.
    pub fn destroy_decoder(&self) {
        let inner = self.inner.lock().unwrap();
        if let Some(shared) = inner.shared.as_ref() {
            *shared.decoder.lock().unwrap() = None;
            shared.producer.lock().unwrap().decode = Vec::new();
        }
    }

    /// Queue one decoded PCM frame. Returns true when drop-oldest discarded
    /// a queued frame to make room.
    pub fn write_samples(&self, pcm: &[i16]) -> EngineResult<bool> {
        let shared = self.shared()?;
        let mut producer = shared.producer.lock().unwrap();
        let ProducerScratch { drop, .. } = &mut *producer;
        shared.pcm_ring.write_dropping_oldest(pcm, drop)
    }

    /// Decode one packet and queue the resulting frame. Returns true when
    /// drop-oldest discarded a queued frame.
    pub fn write_encoded_packet(&self, packet: &[u8]) -> EngineResult<bool> {
        let shared = self.shared()?;
        let mut producer = shared.producer.lock().unwrap();
        let ProducerScratch { decode, drop } = &mut *producer;
        if decode.is_empty() {
            return Err(EngineError::BadConfig("no decoder configured".into()));
        }

        let decoded = {
            // The callback's PLC path uses a try-lock; holding this across
            // one decode cannot stall the audio thread.
            let mut slot = shared.decoder.lock().unwrap();
            let slot = slot
                .as_mut()
                .ok_or_else(|| EngineError::BadConfig("no decoder configured".into()))?;
            match slot.codec.decode(packet, decode) {
                Ok(n) => n,
                Err(e) => {
                    shared.decode_errors.fetch_add(1, Ordering::Relaxed);
                    if shared.decode_fail_throttle.should_log() {
                        warn!(error = %e, "Dropping undecodable packet");
                    }
                    return Err(e);
                }
            }
        };

        if decoded != shared.frame_samples && shared.length_mismatch_throttle.should_log() {
            warn!(
                decoded,
                expected = shared.frame_samples,
                "Decoded frame length differs from the configured frame"
            );
        }

        shared.decoded_frames.fetch_add(1, Ordering::Relaxed);
        shared.pcm_ring.write_dropping_oldest(&decode[..decoded], drop)
    }

    /// Open the host output stream and start the callback.
    ///
    /// `playing` is set before the host is asked to start, for the same
    /// liveness reason as the capture side.
    pub fn start_stream(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let shared = inner.shared.as_ref().ok_or(EngineError::NotCreated)?.clone();
        let config = *inner.config.as_ref().ok_or(EngineError::NotCreated)?;
        if inner.stream.is_some() {
            return Ok(());
        }

        let params = OutputStreamParams {
            sample_rate: config.sample_rate,
            channels: config.channels,
            performance: PerformanceMode::LowLatency,
            sharing: SharingMode::Exclusive,
            usage: StreamUsage::VoiceCommunication,
            content_type: ContentType::Speech,
            buffer_size_frames: None,
        };

        shared.playing.store(true, Ordering::Release);

        let callback = PlaybackCallback {
            shared: shared.clone(),
            partial: vec![0; config.frame_samples],
            offset: 0,
            valid: 0,
            consecutive_plc: 0,
        };
        let error_shared = shared.clone();
        let opened = self.backend.open_output_stream(
            &params,
            Box::new(callback),
            Box::new(move |_reason| {
                error_shared.route_error.store(true, Ordering::Release);
            }),
        );

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                shared.playing.store(false, Ordering::Release);
                return Err(e);
            }
        };

        // Double-buffer against callback jitter.
        if let Some(burst) = stream.frames_per_burst() {
            let _ = stream.set_buffer_size_in_frames(2 * burst);
        }

        if let Err(e) = stream.request_start() {
            shared.playing.store(false, Ordering::Release);
            stream.close();
            return Err(e);
        }

        inner.stream = Some(stream);
        info!("Playback stream started");
        Ok(())
    }

    /// Close and reopen the stream, e.g. after an audio routing change.
    /// Returns `NotRunning` when the engine is not currently playing.
    pub fn restart_stream(&self) -> EngineResult<()> {
        {
            let inner = self.inner.lock().unwrap();
            let shared = inner.shared.as_ref().ok_or(EngineError::NotCreated)?;
            if inner.stream.is_none() || !shared.playing.load(Ordering::Acquire) {
                return Err(EngineError::NotRunning);
            }
        }
        self.stop_stream();
        self.start_stream()
    }

    /// True once after the host reported a stream error while playing.
    pub fn take_route_error(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.shared.as_ref() {
            Some(shared) => shared.route_error.swap(false, Ordering::AcqRel),
            None => false,
        }
    }

    /// Stop the callback and close the stream. The engine stays created.
    pub fn stop_stream(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(shared) = inner.shared.as_ref() {
            shared.playing.store(false, Ordering::Release);
        }
        if let Some(mut stream) = inner.stream.take() {
            let _ = stream.request_stop();
            stream.close();
            info!("Playback stream stopped");
        }
    }

    /// Atomic mute; the callback emits silence while set.
    pub fn set_playback_mute(&self, muted: bool) {
        if let Ok(shared) = self.shared() {
            shared.muted.store(muted, Ordering::Release);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.shared()
            .map(|s| s.playing.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Queued frames awaiting the callback.
    pub fn buffered_frame_count(&self) -> usize {
        self.shared()
            .map(|s| s.pcm_ring.available_frames())
            .unwrap_or(0)
    }

    /// Prebuffer threshold the coordinator must reach before starting.
    pub fn prebuffer_frames(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.config.map(|c| c.prebuffer_frames).unwrap_or(0)
    }

    pub fn stats(&self) -> PlaybackStats {
        let Ok(shared) = self.shared() else {
            return PlaybackStats::default();
        };
        PlaybackStats {
            decoded_frames: shared.decoded_frames.load(Ordering::Relaxed),
            callback_frames: shared.callback_frames.load(Ordering::Relaxed),
            callback_silence_count: shared.callback_silence_count.load(Ordering::Relaxed),
            callback_plc_count: shared.callback_plc_count.load(Ordering::Relaxed),
            frames_dropped: shared.pcm_ring.dropped_frames(),
            decode_errors: shared.decode_errors.load(Ordering::Relaxed),
        }
    }

    /// Tear down in reverse order of setup. The destroyed fence is raised
    /// before the stream closes so a late callback exits without touching
    /// freed state.
    pub fn destroy(&self) {
        {
            let inner = self.inner.lock().unwrap();
            if let Some(shared) = inner.shared.as_ref() {
                shared.destroyed.store(true, Ordering::Release);
            }
        }
        self.stop_stream();
        let mut inner = self.inner.lock().unwrap();
        if inner.shared.take().is_some() {
            info!("Playback engine destroyed");
        }
        inner.config = None;
    }

    fn shared(&self) -> EngineResult<Arc<PlaybackShared>> {
        let inner = self.inner.lock().unwrap();
        inner.shared.as_ref().cloned().ok_or(EngineError::NotCreated)
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Real-time callback state. The partial-frame buffer and its counters are
/// touched only by the audio thread and need no atomics.
struct PlaybackCallback {
    shared: Arc<PlaybackShared>,
    partial: Vec<i16>,
    offset: usize,
    valid: usize,
    consecutive_plc: u32,
}

impl OutputDataCallback for PlaybackCallback {
    fn on_audio_ready(&mut self, out: &mut [i16]) -> CallbackResult {
        let shared = &*self.shared;

        // Some hosts deliver the error callback on the thread that closed
        // the stream; without this fence a late entry would race teardown.
        if shared.destroyed.load(Ordering::Acquire) {
            out.fill(0);
            return CallbackResult::Stop;
        }

        shared.callback_frames.fetch_add(1, Ordering::Relaxed);

        let playing = shared.playing.load(Ordering::Acquire);
        if shared.muted.load(Ordering::Relaxed) {
            out.fill(0);
            return if playing {
                CallbackResult::Continue
            } else {
                CallbackResult::Stop
            };
        }

        let frame_samples = shared.frame_samples;
        let mut filled = 0;
        let mut wrote_from_ring = false;

        while filled < out.len() {
            let remaining = out.len() - filled;

            if self.valid > 0 {
                let take = remaining.min(self.valid - self.offset);
                out[filled..filled + take]
                    .copy_from_slice(&self.partial[self.offset..self.offset + take]);
                self.offset += take;
                filled += take;
                wrote_from_ring = true;
                if self.offset == self.valid {
                    self.offset = 0;
                    self.valid = 0;
                }
                continue;
            }

            if remaining >= frame_samples {
                if shared
                    .pcm_ring
                    .read(&mut out[filled..filled + frame_samples])
                    .is_err()
                {
                    break;
                }
                filled += frame_samples;
                wrote_from_ring = true;
                self.consecutive_plc = 0;
            } else {
                if shared.pcm_ring.read(&mut self.partial).is_err() {
                    break;
                }
                self.valid = frame_samples;
                self.offset = 0;
                self.consecutive_plc = 0;
            }
        }

        let mut plc_used = false;
        if filled < out.len() {
            // Underrun: bounded Opus concealment, then silence.
            if self.consecutive_plc < MAX_CONSECUTIVE_PLC {
                if let Ok(mut slot) = shared.decoder.try_lock() {
                    if let Some(slot) = slot.as_mut() {
                        if slot.codec.is_opus() {
                            let per_channel = frame_samples / shared.channels;
                            if let Ok(produced) =
                                slot.codec.decode_plc(&mut self.partial, per_channel)
                            {
                                let take = (out.len() - filled).min(produced);
                                out[filled..filled + take]
                                    .copy_from_slice(&self.partial[..take]);
                                self.offset = take;
                                self.valid = produced;
                                if self.offset == self.valid {
                                    self.offset = 0;
                                    self.valid = 0;
                                }
                                filled += take;
                                plc_used = true;
                                self.consecutive_plc += 1;
                                shared.callback_plc_count.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
            }
            out[filled..].fill(0);
        }

        if !wrote_from_ring && !plc_used {
            shared.callback_silence_count.fetch_add(1, Ordering::Relaxed);
        }

        if playing {
            CallbackResult::Continue
        } else {
            CallbackResult::Stop
        }
    }
}
