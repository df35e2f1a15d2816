//! End-to-end pipeline scenarios on the deterministic test backend
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


use bytes::Bytes;
use realtime_voice_engine::packet_router::{PacketCallback, PacketRouter};
use realtime_voice_engine::testing::ManualBackend;
use realtime_voice_engine::{
    CaptureConfig, CaptureEngine, Codec, EngineError, EngineResult, PipelineCoordinator,
    PlaybackConfig, PlaybackEngine, Profile,
};
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn sine(rate: u32, amplitude: f32, n: usize) -> Vec<i16> {
    (0..n)
        .map(|i| {
            let t = i as f32 / rate as f32;
            (amplitude * (2.0 * PI * 440.0 * t).sin() * 32767.0) as i16
        })
        .collect()
}

fn rms(frame: &[i16]) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame
        .iter()
        .map(|&s| {
            let f = s as f64 / 32768.0;
            f * f
        })
        .sum();
    (sum / frame.len() as f64).sqrt()
}

/// Router that immediately loops every outbound packet back inbound.
#[derive(Default)]
struct LoopbackRouter {
    callback: Mutex<Option<PacketCallback>>,
}

impl PacketRouter for LoopbackRouter {
    fn send_packet(&self, packet: Bytes) -> EngineResult<()> {
        if let Some(cb) = self.callback.lock().unwrap().as_ref() {
            cb(packet);
        }
        Ok(())
    }

    fn send_signal(&self, _code: i32) -> EngineResult<()> {
        Ok(())
    }

    fn set_packet_callback(&self, callback: PacketCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }
}

/// The PCM pass-through path (no encoder/decoder configured) round-trips
/// samples exactly.
#[test]
fn pcm_passthrough_roundtrip_is_exact() {
    voxlink_logging::init_test_logging("warn");
    let backend = Arc::new(ManualBackend::new());
    let capture = CaptureEngine::new(backend.clone());
    let playback = PlaybackEngine::new(backend.clone());

    let frame_samples = 480;
    capture
        .create(CaptureConfig {
            sample_rate: 48000,
            channels: 1,
            frame_samples,
            max_buffer_frames: 16,
            enable_filters: false,
        })
        .unwrap();
    playback
        .create(PlaybackConfig {
            sample_rate: 48000,
            channels: 1,
            frame_samples,
            max_buffer_frames: 16,
            prebuffer_frames: 1,
        })
        .unwrap();
    capture.start_stream().unwrap();
    playback.start_stream().unwrap();

    let tone = sine(48000, 0.5, frame_samples * 4);
    for burst in tone.chunks(160) {
        backend.drive_input(burst);
    }

    let mut frame = vec![0i16; frame_samples];
    let mut heard = Vec::new();
    while capture.read_samples(&mut frame).is_ok() {
        playback.write_samples(&frame).unwrap();
        let (burst, _) = backend.drive_output(frame_samples).unwrap();
        heard.extend(burst);
    }
    assert_eq!(heard, tone);
}

/// Scenario: 80 ms frames (3840 samples at 48 kHz) served from smaller
/// hardware bursts. After `frame_samples / burst` callbacks exactly one PCM
/// frame has been consumed, and 600 ms of callbacks leaves at least 4 of the
/// 16 preloaded frames queued.
#[test]
fn partial_frame_bursts_consume_at_real_time_rate() {
    let backend = Arc::new(ManualBackend::new());
    let playback = PlaybackEngine::new(backend.clone());
    let frame_samples = 3840;
    playback
        .create(PlaybackConfig {
            sample_rate: 48000,
            channels: 1,
            frame_samples,
            max_buffer_frames: 32,
            prebuffer_frames: 1,
        })
        .unwrap();

    for i in 0..16 {
        playback.write_samples(&vec![i as i16; frame_samples]).unwrap();
    }
    playback.start_stream().unwrap();

    // 960-sample bursts: four callbacks play exactly one frame.
    for _ in 0..4 {
        backend.drive_output(960).unwrap();
    }
    assert_eq!(playback.buffered_frame_count(), 15);

    // 600 ms of further bursts (30 x 20 ms) consumes 7.5 frames in total.
    for _ in 0..26 {
        backend.drive_output(960).unwrap();
    }
    assert!(playback.buffered_frame_count() >= 4);
    assert_eq!(playback.stats().callback_silence_count, 0);
}

/// Scenario: lifecycle ordering. Configuring an encoder before create fails
/// cleanly; after create it succeeds and 2 s of capture yields at least 10
/// encoded packets.
#[test]
fn lifecycle_ordering_and_encoded_output() {
    let backend = Arc::new(ManualBackend::new());
    let capture = CaptureEngine::new(backend.clone());
    let hq = Profile::by_id(0x50).unwrap();

    assert!(matches!(
        capture.configure_encoder(hq),
        Err(EngineError::NotCreated)
    ));

    capture
        .create(CaptureConfig {
            sample_rate: hq.encode.sample_rate,
            channels: hq.encode.channels,
            frame_samples: hq.encode_frame_samples(),
            max_buffer_frames: 8,
            enable_filters: true,
        })
        .unwrap();
    capture.configure_encoder(hq).unwrap();
    capture.start_stream().unwrap();

    // 2 s of 60 ms frames delivered as 480-sample bursts.
    let tone = sine(48000, 0.3, hq.encode_frame_samples());
    let mut packets = 0;
    let mut buf = [0u8; 1500];
    for _ in 0..33 {
        for burst in tone.chunks(480) {
            backend.drive_input(burst);
        }
        while capture.read_encoded_packet(&mut buf).is_ok() {
            packets += 1;
        }
    }
    assert!(packets >= 10, "only {packets} packets after 2 s");
}

/// Scenario: the playback callback did not exit on its first tick due to an
/// `is_playing` race; 400 ms of callbacks drains at least 4 of the 10
/// preloaded frames.
#[test]
fn callback_survives_startup() {
    let backend = Arc::new(ManualBackend::new());
    let playback = PlaybackEngine::new(backend.clone());
    let hq = Profile::by_id(0x50).unwrap();
    let frame_samples = hq.decode_frame_samples();

    playback
        .create(PlaybackConfig {
            sample_rate: 48000,
            channels: 1,
            frame_samples,
            max_buffer_frames: 16,
            prebuffer_frames: 5,
        })
        .unwrap();
    for _ in 0..10 {
        playback.write_samples(&vec![1000i16; frame_samples]).unwrap();
    }
    playback.start_stream().unwrap();

    // 400 ms as 20 ms bursts.
    for _ in 0..20 {
        let (_, result) = backend.drive_output(960).unwrap();
        assert_eq!(result, realtime_voice_engine::CallbackResult::Continue);
    }
    let consumed = 10 - playback.buffered_frame_count();
    assert!(consumed >= 4, "only {consumed} frames consumed");
}

/// Scenario: steady MQ feed. One frame in, one frame out, for 50 frames;
/// after the 10-frame warm-up no callback goes silent and the host reports
/// no xruns.
#[test]
fn steady_state_mq_has_no_underruns() {
    let backend = Arc::new(ManualBackend::new());
    let playback = PlaybackEngine::new(backend.clone());
    let mq = Profile::default_profile();
    let frame_samples = mq.decode_frame_samples();

    playback
        .create(PlaybackConfig {
            sample_rate: mq.decode.sample_rate,
            channels: mq.decode.channels,
            frame_samples,
            max_buffer_frames: 50,
            prebuffer_frames: mq.prebuffer_frames(),
        })
        .unwrap();
    playback.configure_decoder(mq).unwrap();

    let mut enc = Codec::for_encoding(mq).unwrap();
    let tone = sine(mq.encode.sample_rate, 0.3, mq.encode_frame_samples());
    let mut packet = [0u8; 1500];

    // Warm-up: fill the prebuffer before starting.
    for _ in 0..10 {
        let len = enc.encode(&tone, &mut packet).unwrap();
        playback.write_encoded_packet(&packet[..len]).unwrap();
    }
    playback.start_stream().unwrap();

    let silence_after_warmup = playback.stats().callback_silence_count;
    for _ in 0..50 {
        let len = enc.encode(&tone, &mut packet).unwrap();
        playback.write_encoded_packet(&packet[..len]).unwrap();
        backend.drive_output(frame_samples).unwrap();
    }
    let stats = playback.stats();
    assert_eq!(stats.callback_silence_count, silence_after_warmup);
    assert_eq!(stats.callback_plc_count, 0);
}

/// Muted capture still encodes, and every packet decodes to near-silence.
#[test]
fn muted_capture_encodes_silence() {
    let backend = Arc::new(ManualBackend::new());
    let capture = CaptureEngine::new(backend.clone());
    let mq = Profile::default_profile();

    capture
        .create(CaptureConfig {
            sample_rate: mq.encode.sample_rate,
            channels: mq.encode.channels,
            frame_samples: mq.encode_frame_samples(),
            max_buffer_frames: 8,
            enable_filters: true,
        })
        .unwrap();
    capture.configure_encoder(mq).unwrap();
    capture.start_stream().unwrap();
    capture.set_capture_mute(true);

    // Loud input while muted.
    let tone = sine(mq.encode.sample_rate, 0.9, mq.encode_frame_samples());
    for _ in 0..5 {
        backend.drive_input(&tone);
    }

    let mut dec = Codec::for_decoding(mq).unwrap();
    let mut packet = [0u8; 1500];
    let mut out = vec![0i16; mq.decode_frame_samples()];
    let mut checked = 0;
    while let Ok(len) = capture.read_encoded_packet(&mut packet) {
        let decoded = dec.decode(&packet[..len], &mut out).unwrap();
        assert!(
            rms(&out[..decoded]) < 0.01,
            "muted packet decoded above the silence floor"
        );
        checked += 1;
    }
    assert!(checked >= 5);
}

/// Full duplex through the coordinator with a loopback transport: encoded
/// capture packets come back, prebuffer playback, and play as audio.
#[tokio::test(flavor = "multi_thread")]
async fn coordinator_loopback_full_duplex() {
    let backend = Arc::new(ManualBackend::new());
    let router = Arc::new(LoopbackRouter::default());
    let capture = Arc::new(CaptureEngine::new(backend.clone()));
    let playback = Arc::new(PlaybackEngine::new(backend.clone()));
    let coordinator =
        PipelineCoordinator::new(capture.clone(), playback.clone(), router.clone());

    let profile = coordinator.start_call(None).unwrap();
    assert!(backend.input_running());

    // Feed the microphone until the loopback fills the prebuffer.
    let tone = sine(profile.encode.sample_rate, 0.3, profile.encode_frame_samples());
    let mut waited = 0;
    while !backend.output_running() && waited < 200 {
        backend.drive_input(&tone);
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert!(backend.output_running(), "prebuffer never reached");

    // The speaker now hears the looped-back tone.
    let mut heard_signal = false;
    for _ in 0..5 {
        let (burst, _) = backend.drive_output(profile.decode_frame_samples()).unwrap();
        if rms(&burst) > 0.01 {
            heard_signal = true;
        }
    }
    assert!(heard_signal);

    coordinator.stop_call();
    assert!(!backend.input_running());
}
