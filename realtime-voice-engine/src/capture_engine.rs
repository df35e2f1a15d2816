//! Microphone capture engine
//!
//! Owns the host input stream and its real-time callback. The callback
//! realigns variable hardware bursts into fixed logical frames, runs the
//! voice filter chain, substitutes silence while muted, and either queues
//! raw PCM frames or encodes in place and queues packets.
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
    AudioStreamHandle, CallbackResult, HostAudioBackend, InputDataCallback, InputPreset,
    InputStreamParams, PerformanceMode, SharingMode,
};
use crate::codec::Codec;
use crate::encoded_ring_buffer::EncodedRingBuffer;
use crate::error::{EngineError, EngineResult};
use crate::filter_chain::{FilterConfig, VoiceFilterChain};
use crate::pcm_ring_buffer::PcmRingBuffer;
use crate::profile::Profile;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Encoded ring geometry when encoding in the callback
const ENCODED_RING_SLOTS: usize = 32;
const ENCODED_MAX_PACKET_BYTES: usize = 1500;

/// Capture stream geometry
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u8,
    /// Interleaved samples per logical frame
    pub frame_samples: usize,
    /// PCM ring capacity in frames
    pub max_buffer_frames: usize,
    pub enable_filters: bool,
}

/// Diagnostics snapshot, readable while recording
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CaptureStats {
    /// Full logical frames completed by the callback
    pub frames_captured: u64,
    /// Frames discarded by drop-oldest on the PCM ring
    pub frames_dropped: u64,
    /// Packets queued on the encoded ring
    pub packets_encoded: u64,
    /// Packets discarded by drop-oldest on the encoded ring
    pub packets_dropped: u64,
    /// Frames the encoder refused
    pub encode_errors: u64,
}

/// State the real-time callback owns while the stream runs.
///
/// The control thread only locks this when stopped or reconfiguring; the
/// callback takes a non-blocking try-lock and skips the burst on contention.
struct CaptureHot {
    accum: Vec<i16>,
    accum_count: usize,
    filter: Option<VoiceFilterChain>,
    encoder: Option<Codec>,
    encoded_ring: Option<Arc<EncodedRingBuffer>>,
    silence: Vec<i16>,
    encode_scratch: Vec<u8>,
    /// Producer-side scratch for drop-oldest PCM writes
    drop_scratch: Vec<i16>,
}

struct CaptureShared {
    recording: AtomicBool,
    muted: AtomicBool,
    destroyed: AtomicBool,
    route_error: AtomicBool,
    pcm_ring: PcmRingBuffer,
    hot: Mutex<CaptureHot>,
    frames_captured: AtomicU64,
    packets_encoded: AtomicU64,
    encode_errors: AtomicU64,
}

struct CaptureInner {
    config: Option<CaptureConfig>,
    shared: Option<Arc<CaptureShared>>,
    encoded_ring: Option<Arc<EncodedRingBuffer>>,
    stream: Option<Box<dyn AudioStreamHandle>>,
}

/// Process-scoped capture engine. The underlying OS audio stack arbitrates
/// one exclusive low-latency input stream, so one instance is constructed and
/// handed to the coordinator by handle.
pub struct CaptureEngine {
    backend: Arc<dyn HostAudioBackend>,
    inner: Mutex<CaptureInner>,
}

impl CaptureEngine {
    pub fn new(backend: Arc<dyn HostAudioBackend>) -> Self {
        CaptureEngine {
            backend,
            inner: Mutex::new(CaptureInner {
                config: None,
                shared: None,
                encoded_ring: None,
                stream: None,
            }),
        }
    }

    /// Allocate rings, accumulator, and (optionally) the filter chain.
    /// Destroys any previous incarnation first.
    pub fn create(&self, config: CaptureConfig) -> EngineResult<()> {
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

        let filter = if config.enable_filters {
            Some(VoiceFilterChain::new(
                config.sample_rate,
                config.channels as usize,
                config.frame_samples,
                FilterConfig::default(),
            )?)
        } else {
            None
        };

        let shared = Arc::new(CaptureShared {
            recording: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            route_error: AtomicBool::new(false),
            pcm_ring: PcmRingBuffer::new(config.max_buffer_frames, config.frame_samples)?,
            hot: Mutex::new(CaptureHot {
                accum: vec![0; config.frame_samples],
                accum_count: 0,
                filter,
                encoder: None,
                encoded_ring: None,
                silence: vec![0; config.frame_samples],
                encode_scratch: vec![0; ENCODED_MAX_PACKET_BYTES],
                drop_scratch: vec![0; config.frame_samples],
            }),
            frames_captured: AtomicU64::new(0),
            packets_encoded: AtomicU64::new(0),
            encode_errors: AtomicU64::new(0),
        });

        let mut inner = self.inner.lock().unwrap();
        inner.config = Some(config);
        inner.shared = Some(shared);
        info!(
            rate = config.sample_rate,
            channels = config.channels,
            frame_samples = config.frame_samples,
            "Capture engine created"
        );
        Ok(())
    }

    /// Install an encoder for the profile's capture side; subsequent frames
    /// are encoded inside the callback and queued on the encoded ring.
    pub fn configure_encoder(&self, profile: &Profile) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let shared = inner.shared.as_ref().ok_or(EngineError::NotCreated)?.clone();

        let encoder = Codec::for_encoding(profile)?;
        let ring = Arc::new(EncodedRingBuffer::new(
            ENCODED_RING_SLOTS,
            ENCODED_MAX_PACKET_BYTES,
        )?);

        {
            let mut hot = shared.hot.lock().unwrap();
            hot.encoder = Some(encoder);
            hot.encoded_ring = Some(ring.clone());
        }
        inner.encoded_ring = Some(ring);
        info!(profile = profile.name, "Capture encoder configured");
        Ok(())
    }

    /// Remove the encoder; the engine falls back to queuing raw PCM.
    pub fn destroy_encoder(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(shared) = inner.shared.as_ref() {
            let mut hot = shared.hot.lock().unwrap();
            hot.encoder = None;
            hot.encoded_ring = None;
        }
        inner.encoded_ring = None;
    }

    /// Open the host input stream and start the callback.
    ///
    /// `recording` is set before the host is asked to start: the callback can
    /// fire immediately and would exit the stream permanently if it observed
    /// false.
    pub fn start_stream(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let shared = inner.shared.as_ref().ok_or(EngineError::NotCreated)?.clone();
        let config = *inner.config.as_ref().ok_or(EngineError::NotCreated)?;
        if inner.stream.is_some() {
            return Ok(());
        }

        let params = InputStreamParams {
            sample_rate: config.sample_rate,
            channels: config.channels,
            performance: PerformanceMode::LowLatency,
            sharing: SharingMode::Exclusive,
            preset: InputPreset::VoiceCommunication,
            buffer_size_frames: None,
        };

        shared.recording.store(true, Ordering::Release);

        let callback = CaptureCallback {
            shared: shared.clone(),
        };
        let error_shared = shared.clone();
        let opened = self.backend.open_input_stream(
            &params,
            Box::new(callback),
            Box::new(move |_reason| {
                error_shared.route_error.store(true, Ordering::Release);
            }),
        );

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                shared.recording.store(false, Ordering::Release);
                return Err(e);
            }
        };
        if let Err(e) = stream.request_start() {
            shared.recording.store(false, Ordering::Release);
            stream.close();
            return Err(e);
        }

        inner.stream = Some(stream);
        info!("Capture stream started");
        Ok(())
    }

    /// Stop the callback and close the stream. The engine stays created.
    pub fn stop_stream(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(shared) = inner.shared.as_ref() {
            shared.recording.store(false, Ordering::Release);
        }
        if let Some(mut stream) = inner.stream.take() {
            let _ = stream.request_stop();
            stream.close();
            info!("Capture stream stopped");
        }
    }

    /// Reopen the stream after a host route error. Returns `NotRunning` when
    /// the engine is not recording.
    pub fn restart_stream(&self) -> EngineResult<()> {
        {
            let inner = self.inner.lock().unwrap();
            let shared = inner.shared.as_ref().ok_or(EngineError::NotCreated)?;
            if inner.stream.is_none() || !shared.recording.load(Ordering::Acquire) {
                return Err(EngineError::NotRunning);
            }
        }
        self.stop_stream();
        self.start_stream()
    }

    /// True once after the host reported a stream error while recording.
    pub fn take_route_error(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.shared.as_ref() {
            Some(shared) => shared.route_error.swap(false, Ordering::AcqRel),
            None => false,
        }
    }

    /// Consumer-side drain of one PCM frame.
    pub fn read_samples(&self, dst: &mut [i16]) -> EngineResult<()> {
        let shared = self.shared()?;
        shared.pcm_ring.read(dst)
    }

    /// Consumer-side drain of one encoded packet; returns its length.
    pub fn read_encoded_packet(&self, dst: &mut [u8]) -> EngineResult<usize> {
        let ring = {
            let inner = self.inner.lock().unwrap();
            inner
                .encoded_ring
                .as_ref()
                .ok_or_else(|| EngineError::BadConfig("no encoder configured".into()))?
                .clone()
        };
        ring.read(dst)
    }

    /// Atomic mute flag read by the callback; muted frames are replaced with
    /// silence before filtering/encoding.
    pub fn set_capture_mute(&self, muted: bool) {
        if let Ok(shared) = self.shared() {
            shared.muted.store(muted, Ordering::Release);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.shared()
            .map(|s| s.muted.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn is_recording(&self) -> bool {
        self.shared()
            .map(|s| s.recording.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Queued PCM frames.
    pub fn buffered_frame_count(&self) -> usize {
        self.shared()
            .map(|s| s.pcm_ring.available_frames())
            .unwrap_or(0)
    }

    /// Queued encoded packets.
    pub fn buffered_packet_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .encoded_ring
            .as_ref()
            .map(|r| r.available_packets())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CaptureStats {
        let inner = self.inner.lock().unwrap();
        let Some(shared) = inner.shared.as_ref() else {
            return CaptureStats::default();
        };
        CaptureStats {
            frames_captured: shared.frames_captured.load(Ordering::Relaxed),
            frames_dropped: shared.pcm_ring.dropped_frames(),
            packets_encoded: shared.packets_encoded.load(Ordering::Relaxed),
            packets_dropped: inner
                .encoded_ring
                .as_ref()
                .map(|r| r.dropped_packets())
                .unwrap_or(0),
            encode_errors: shared.encode_errors.load(Ordering::Relaxed),
        }
    }

    /// Tear down in reverse order of setup. Idempotent. The destroyed fence
    /// is raised before the stream closes so a late callback exits cleanly.
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
            info!("Capture engine destroyed");
        }
        inner.encoded_ring = None;
        inner.config = None;
    }

    fn shared(&self) -> EngineResult<Arc<CaptureShared>> {
        let inner = self.inner.lock().unwrap();
        inner.shared.as_ref().cloned().ok_or(EngineError::NotCreated)
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Real-time callback state; owned by the host's audio thread while running.
struct CaptureCallback {
    shared: Arc<CaptureShared>,
}

impl InputDataCallback for CaptureCallback {
    fn on_audio_ready(&mut self, burst: &[i16]) -> CallbackResult {
        let shared = &*self.shared;

        // Late delivery after destroy() exits without touching engine state.
        if shared.destroyed.load(Ordering::Acquire) {
            return CallbackResult::Stop;
        }

        // The control thread holds this lock only while reconfiguring; the
        // callback never blocks on it and skips the burst instead.
        let Ok(mut hot) = shared.hot.try_lock() else {
            return if shared.recording.load(Ordering::Acquire) {
                CallbackResult::Continue
            } else {
                CallbackResult::Stop
            };
        };
        let CaptureHot {
            accum,
            accum_count,
            filter,
            encoder,
            encoded_ring,
            silence,
            encode_scratch,
            drop_scratch,
        } = &mut *hot;

        let frame_samples = accum.len();
        let total = burst.len();
        let mut processed = 0;

        while processed < total {
            let take = (total - processed).min(frame_samples - *accum_count);
            accum[*accum_count..*accum_count + take]
                .copy_from_slice(&burst[processed..processed + take]);
            *accum_count += take;
            processed += take;

            if *accum_count == frame_samples {
                // Muted capture substitutes the silence buffer; accum is left
                // untouched.
                let frame: &mut [i16] = if shared.muted.load(Ordering::Relaxed) {
                    silence.as_mut_slice()
                } else {
                    accum.as_mut_slice()
                };

                if let Some(chain) = filter.as_mut() {
                    let _ = chain.process(frame);
                }

                match (encoder.as_mut(), encoded_ring.as_ref()) {
                    (Some(codec), Some(ring)) => match codec.encode(frame, encode_scratch) {
                        Ok(len) => {
                            if ring.write_dropping_oldest(&encode_scratch[..len]).is_ok() {
                                shared.packets_encoded.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(_) => {
                            // The next callback produces another frame.
                            shared.encode_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    _ => {
                        let _ = shared.pcm_ring.write_dropping_oldest(frame, drop_scratch);
                    }
                }

                shared.frames_captured.fetch_add(1, Ordering::Relaxed);
                *accum_count = 0;
            }
        }

        if shared.recording.load(Ordering::Acquire) {
            CallbackResult::Continue
        } else {
            CallbackResult::Stop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile;
    use crate::testing::ManualBackend;

    fn config(frame_samples: usize) -> CaptureConfig {
        CaptureConfig {
            sample_rate: 48000,
            channels: 1,
            frame_samples,
            max_buffer_frames: 8,
            enable_filters: false,
        }
    }

    #[test]
    fn test_configure_encoder_requires_create() {
        let backend = Arc::new(ManualBackend::new());
        let engine = CaptureEngine::new(backend);
        let err = engine
            .configure_encoder(profile::Profile::default_profile())
            .unwrap_err();
        assert!(matches!(err, EngineError::NotCreated));
    }

    #[test]
    fn test_create_validates_geometry() {
        let backend = Arc::new(ManualBackend::new());
        let engine = CaptureEngine::new(backend);
        assert!(engine
            .create(CaptureConfig { channels: 2, frame_samples: 961, ..config(960) })
            .is_err());
        assert!(engine.create(config(960)).is_ok());
    }

    #[test]
    fn test_recording_set_before_host_start() {
        let backend = Arc::new(ManualBackend::new());
        let engine = CaptureEngine::new(backend.clone());
        engine.create(config(960)).unwrap();
        engine.start_stream().unwrap();
        // The backend records the flag value it observed at request_start
        // time via the first immediate callback tick.
        let result = backend.drive_input(&vec![0i16; 16]);
        assert_eq!(result, Some(CallbackResult::Continue));
        engine.stop_stream();
        // The host closed the stream; no further callbacks are delivered.
        assert_eq!(backend.drive_input(&vec![0i16; 16]), None);
    }

    #[test]
    fn test_burst_realignment_pcm_path() {
        let backend = Arc::new(ManualBackend::new());
        let engine = CaptureEngine::new(backend.clone());
        engine.create(config(6)).unwrap();
        engine.start_stream().unwrap();

        // Feed 4-sample bursts; after three bursts two 6-sample frames exist.
        backend.drive_input(&[1, 2, 3, 4]);
        assert_eq!(engine.buffered_frame_count(), 0);
        backend.drive_input(&[5, 6, 7, 8]);
        assert_eq!(engine.buffered_frame_count(), 1);
        backend.drive_input(&[9, 10, 11, 12]);
        assert_eq!(engine.buffered_frame_count(), 2);

        let mut frame = [0i16; 6];
        engine.read_samples(&mut frame).unwrap();
        assert_eq!(frame, [1, 2, 3, 4, 5, 6]);
        engine.read_samples(&mut frame).unwrap();
        assert_eq!(frame, [7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_oversized_burst_produces_multiple_frames() {
        let backend = Arc::new(ManualBackend::new());
        let engine = CaptureEngine::new(backend.clone());
        engine.create(config(4)).unwrap();
        engine.start_stream().unwrap();

        backend.drive_input(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(engine.buffered_frame_count(), 2);
        assert_eq!(engine.stats().frames_captured, 2);
    }

    #[test]
    fn test_mute_substitutes_silence() {
        let backend = Arc::new(ManualBackend::new());
        let engine = CaptureEngine::new(backend.clone());
        engine.create(config(4)).unwrap();
        engine.start_stream().unwrap();
        engine.set_capture_mute(true);

        backend.drive_input(&[1000, 1000, 1000, 1000]);
        let mut frame = [99i16; 4];
        engine.read_samples(&mut frame).unwrap();
        assert_eq!(frame, [0, 0, 0, 0]);

        // Unmuting restores the live signal; the accumulator was never
        // overwritten by the silence substitution.
        engine.set_capture_mute(false);
        backend.drive_input(&[500, 500, 500, 500]);
        engine.read_samples(&mut frame).unwrap();
        assert_eq!(frame, [500, 500, 500, 500]);
    }

    #[test]
    fn test_encode_mode_lifecycle_and_packets() {
        let backend = Arc::new(ManualBackend::new());
        let engine = CaptureEngine::new(backend.clone());
        let mq = profile::Profile::default_profile();

        engine
            .create(CaptureConfig {
                sample_rate: mq.encode.sample_rate,
                channels: mq.encode.channels,
                frame_samples: mq.encode_frame_samples(),
                max_buffer_frames: 8,
                enable_filters: true,
            })
            .unwrap();
        engine.configure_encoder(mq).unwrap();
        engine.start_stream().unwrap();

        // 2 s of audio in frame-sized bursts -> at least 10 packets queued
        // (the 32-slot ring bounds what stays queued).
        let burst = vec![0i16; mq.encode_frame_samples()];
        for _ in 0..33 {
            backend.drive_input(&burst);
        }
        assert!(engine.stats().packets_encoded >= 10);
        assert!(engine.buffered_packet_count() >= 10);

        let mut packet = [0u8; 1500];
        let len = engine.read_encoded_packet(&mut packet).unwrap();
        assert!(len > 0);
        engine.destroy();
    }

    #[test]
    fn test_destroyed_fence_stops_late_callback() {
        let backend = Arc::new(ManualBackend::new());
        let engine = CaptureEngine::new(backend.clone());
        engine.create(config(4)).unwrap();
        engine.start_stream().unwrap();
        engine.destroy();

        assert_eq!(
            backend.drive_input_late(&[1, 2, 3, 4]),
            Some(CallbackResult::Stop)
        );
    }

    #[test]
    fn test_pcm_overflow_drops_oldest() {
        let backend = Arc::new(ManualBackend::new());
        let engine = CaptureEngine::new(backend.clone());
        engine
            .create(CaptureConfig { max_buffer_frames: 3, ..config(2) })
            .unwrap();
        engine.start_stream().unwrap();

        backend.drive_input(&[1, 1]);
        backend.drive_input(&[2, 2]);
        backend.drive_input(&[3, 3]); // ring holds 2; frame [1,1] dropped

        assert_eq!(engine.stats().frames_dropped, 1);
        let mut frame = [0i16; 2];
        engine.read_samples(&mut frame).unwrap();
        assert_eq!(frame, [2, 2]);
        engine.read_samples(&mut frame).unwrap();
        assert_eq!(frame, [3, 3]);
    }
}
