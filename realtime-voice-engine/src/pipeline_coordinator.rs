//! Pipeline coordinator: profile selection, prebuffering, transport wiring
//!
//! Owns the two engines and the PacketRouter reference. Capture starts
//! immediately on a call; playback is deferred until the inbound prebuffer
//! fills, so the callback never starts starved. Background tasks move
//! packets between the rings and the router off the real-time threads.
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


use crate::capture_engine::{CaptureConfig, CaptureEngine, CaptureStats};
use crate::codec::Codec;
use crate::error::{EngineError, EngineResult};
use crate::packet_router::{frame_packet, split_tagged, PacketRouter};
use crate::playback_engine::{PlaybackConfig, PlaybackEngine, PlaybackStats};
use crate::profile::Profile;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};
use voxlink_config::EngineSettings;

/// Ring sizing used when wiring engines for a call
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Playback PCM ring capacity in frames
    pub playback_buffer_frames: usize,
    /// Capture PCM ring capacity in frames (encode mode barely uses it)
    pub capture_buffer_frames: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            playback_buffer_frames: 50,
            capture_buffer_frames: 32,
        }
    }
}

struct CallState {
    profile: Option<&'static Profile>,
    rx_task: Option<JoinHandle<()>>,
    tx_task: Option<JoinHandle<()>>,
}

/// Coordinates the capture and playback engines over one PacketRouter.
pub struct PipelineCoordinator {
    capture: Arc<CaptureEngine>,
    playback: Arc<PlaybackEngine>,
    router: Arc<dyn PacketRouter>,
    config: CoordinatorConfig,
    default_profile: &'static Profile,
    state: Mutex<CallState>,
}

impl PipelineCoordinator {
    pub fn new(
        capture: Arc<CaptureEngine>,
        playback: Arc<PlaybackEngine>,
        router: Arc<dyn PacketRouter>,
    ) -> Self {
        PipelineCoordinator {
            capture,
            playback,
            router,
            config: CoordinatorConfig::default(),
            default_profile: Profile::default_profile(),
            state: Mutex::new(CallState {
                profile: None,
                rx_task: None,
                tx_task: None,
            }),
        }
    }

    /// Build a coordinator from environment-driven settings.
    pub fn from_settings(
        capture: Arc<CaptureEngine>,
        playback: Arc<PlaybackEngine>,
        router: Arc<dyn PacketRouter>,
        settings: &EngineSettings,
    ) -> EngineResult<Self> {
        let default_profile = Profile::by_id(settings.default_profile_id).ok_or_else(|| {
            EngineError::BadConfig(format!(
                "unknown profile id {:#04x}",
                settings.default_profile_id
            ))
        })?;
        let mut coordinator = Self::new(capture, playback, router);
        coordinator.default_profile = default_profile;
        coordinator.config.playback_buffer_frames = settings.max_buffer_frames;
        Ok(coordinator)
    }

    /// Start a call on the given profile (default profile when None).
    ///
    /// Capture starts immediately; playback is created and configured but its
    /// stream start is deferred until `prebuffer_frames` decoded frames are
    /// queued.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_call(&self, profile_id: Option<u8>) -> EngineResult<&'static Profile> {
        let profile = match profile_id {
            Some(id) => Profile::by_id(id).ok_or_else(|| {
                EngineError::BadConfig(format!("unknown profile id {id:#04x}"))
            })?,
            None => self.default_profile,
        };

        self.stop_call();

        self.capture.create(CaptureConfig {
            sample_rate: profile.encode.sample_rate,
            channels: profile.encode.channels,
            frame_samples: profile.encode_frame_samples(),
            max_buffer_frames: self.config.capture_buffer_frames,
            enable_filters: true,
        })?;
        self.capture.configure_encoder(profile)?;

        self.playback.create(PlaybackConfig {
            sample_rate: profile.decode.sample_rate,
            channels: profile.decode.channels,
            frame_samples: profile.decode_frame_samples(),
            max_buffer_frames: self.config.playback_buffer_frames,
            prebuffer_frames: profile.prebuffer_frames(),
        })?;
        self.playback.configure_decoder(profile)?;

        self.capture.start_stream()?;

        let (packets_tx, packets_rx) = mpsc::unbounded_channel::<Bytes>();
        self.router.set_packet_callback(Box::new(move |packet| {
            let _ = packets_tx.send(packet);
        }));

        let rx_task = tokio::spawn(inbound_loop(self.playback.clone(), packets_rx, profile));
        let tx_task = tokio::spawn(outbound_loop(
            self.capture.clone(),
            self.router.clone(),
            profile,
        ));

        let mut state = self.state.lock().unwrap();
        state.profile = Some(profile);
        state.rx_task = Some(rx_task);
        state.tx_task = Some(tx_task);
        info!(profile = profile.name, id = profile.id, "Call started");
        Ok(profile)
    }

    /// Tear the call down. Idempotent.
    pub fn stop_call(&self) {
        let (rx_task, tx_task, was_active) = {
            let mut state = self.state.lock().unwrap();
            let was_active = state.profile.take().is_some();
            (state.rx_task.take(), state.tx_task.take(), was_active)
        };
        if let Some(task) = rx_task {
            task.abort();
        }
        if let Some(task) = tx_task {
            task.abort();
        }
        // Detaching the handler also drops the channel sender.
        self.router.set_packet_callback(Box::new(|_| {}));
        self.capture.destroy();
        self.playback.destroy();
        if was_active {
            info!("Call stopped");
        }
    }

    /// Switch to another profile mid-call: full tear-down and rebuild. No
    /// decoder state survives a codec change. A bad profile fails before the
    /// running call is touched.
    pub fn switch_profile(&self, profile_id: u8) -> EngineResult<&'static Profile> {
        let profile = Profile::by_id(profile_id).ok_or_else(|| {
            EngineError::BadConfig(format!("unknown profile id {profile_id:#04x}"))
        })?;
        // Validate both codec sides before the rebuild.
        Codec::for_encoding(profile)?;
        Codec::for_decoding(profile)?;
        self.start_call(Some(profile_id))
    }

    /// Cycle to the next profile in wire order.
    pub fn switch_to_next_profile(&self) -> EngineResult<&'static Profile> {
        let current = self
            .active_profile()
            .ok_or(EngineError::NotRunning)?;
        self.switch_profile(current.next().id)
    }

    pub fn active_profile(&self) -> Option<&'static Profile> {
        self.state.lock().unwrap().profile
    }

    pub fn is_call_active(&self) -> bool {
        self.active_profile().is_some()
    }

    pub fn set_capture_mute(&self, muted: bool) {
        self.capture.set_capture_mute(muted);
    }

    pub fn set_playback_mute(&self, muted: bool) {
        self.playback.set_playback_mute(muted);
    }

    /// Opaque control code pass-through to the transport.
    pub fn send_signal(&self, code: i32) -> EngineResult<()> {
        self.router.send_signal(code)
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.stats()
    }

    pub fn playback_stats(&self) -> PlaybackStats {
        self.playback.stats()
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        self.stop_call();
    }
}

/// Drains inbound packets into the decoder and enforces the prebuffer
/// auto-start policy. Exits when the router handler is detached.
async fn inbound_loop(
    playback: Arc<PlaybackEngine>,
    mut packets: mpsc::UnboundedReceiver<Bytes>,
    profile: &'static Profile,
) {
    let prebuffer = profile.prebuffer_frames();
    let mut playback_started = false;
    let mut maintenance = time::interval(Duration::from_millis(profile.frame_time_ms as u64));
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            received = packets.recv() => {
                let Some(packet) = received else { break };
                match split_tagged(&packet) {
                    // The tag is informational; decode parameters come from
                    // the negotiated profile.
                    Ok((_tag, payload)) => {
                        let _ = playback.write_encoded_packet(payload);
                    }
                    Err(_) => continue,
                }

                if !playback_started && playback.buffered_frame_count() >= prebuffer {
                    match playback.start_stream() {
                        Ok(()) => {
                            playback_started = true;
                            info!(prebuffer, "Prebuffer reached, playback started");
                        }
                        Err(e) => warn!(error = %e, "Deferred playback start failed"),
                    }
                }
            }
            _ = maintenance.tick() => {
                if playback.take_route_error() {
                    warn!("Playback route error, reopening stream");
                    let _ = playback.restart_stream();
                }
            }
        }
    }
}

/// Drains the capture encoded ring to the router at the profile cadence.
async fn outbound_loop(
    capture: Arc<CaptureEngine>,
    router: Arc<dyn PacketRouter>,
    profile: &'static Profile,
) {
    let tag = profile.codec_tag();
    let mut ticker = time::interval(Duration::from_millis(profile.frame_time_ms as u64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut packet = vec![0u8; 1500];

    loop {
        ticker.tick().await;

        while let Ok(len) = capture.read_encoded_packet(&mut packet) {
            if let Err(e) = router.send_packet(frame_packet(tag, &packet[..len])) {
                warn!(error = %e, "Router refused outbound packet");
            }
        }

        if capture.take_route_error() {
            warn!("Capture route error, reopening stream");
            let _ = capture.restart_stream();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::CODEC_TAG_OPUS;
    use crate::testing::{ManualBackend, MockRouter};

    fn rig() -> (
        Arc<ManualBackend>,
        Arc<MockRouter>,
        PipelineCoordinator,
    ) {
        let backend = Arc::new(ManualBackend::new());
        let router = Arc::new(MockRouter::new());
        let capture = Arc::new(CaptureEngine::new(backend.clone()));
        let playback = Arc::new(PlaybackEngine::new(backend.clone()));
        let coordinator = PipelineCoordinator::new(capture, playback, router.clone());
        (backend, router, coordinator)
    }

    #[tokio::test]
    async fn test_start_call_defaults_to_medium_quality() {
        let (backend, router, coordinator) = rig();
        let profile = coordinator.start_call(None).unwrap();
        assert_eq!(profile.id, 0x40);
        assert!(coordinator.is_call_active());
        assert!(backend.input_running());
        // Playback waits for the prebuffer.
        assert!(!backend.output_running());
        assert!(router.has_callback());
        coordinator.stop_call();
        assert!(!coordinator.is_call_active());
    }

    #[tokio::test]
    async fn test_prebuffer_gates_playback_start() {
        let (backend, router, coordinator) = rig();
        let profile = coordinator.start_call(None).unwrap();
        let prebuffer = profile.prebuffer_frames();

        // Build valid inbound packets with the profile's capture-side codec.
        let mut enc = Codec::for_encoding(profile).unwrap();
        let pcm = vec![0i16; profile.encode_frame_samples()];
        let mut buf = [0u8; 1500];

        for i in 0..prebuffer {
            assert!(!backend.output_running(), "started early at frame {i}");
            let len = enc.encode(&pcm, &mut buf).unwrap();
            router.inject(frame_packet(profile.codec_tag(), &buf[..len]));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(backend.output_running());
    }

    #[tokio::test]
    async fn test_outbound_packets_are_tagged() {
        let (backend, router, coordinator) = rig();
        let profile = coordinator.start_call(None).unwrap();

        let burst = vec![0i16; profile.encode_frame_samples()];
        for _ in 0..3 {
            backend.drive_input(&burst);
        }
        tokio::time::sleep(Duration::from_millis(
            profile.frame_time_ms as u64 + 40,
        ))
        .await;

        let sent = router.sent_packets();
        assert!(!sent.is_empty());
        for packet in sent {
            assert_eq!(packet[0], CODEC_TAG_OPUS);
            assert!(packet.len() > 1);
        }
    }

    #[tokio::test]
    async fn test_bad_profile_switch_keeps_call() {
        let (_backend, _router, coordinator) = rig();
        coordinator.start_call(None).unwrap();
        assert!(coordinator.switch_profile(0x99).is_err());
        assert_eq!(coordinator.active_profile().unwrap().id, 0x40);
    }

    #[tokio::test]
    async fn test_switch_to_next_profile_cycles() {
        let (_backend, _router, coordinator) = rig();
        coordinator.start_call(Some(0x40)).unwrap();
        let next = coordinator.switch_to_next_profile().unwrap();
        assert_eq!(next.id, 0x50);
    }

    #[tokio::test]
    async fn test_from_settings_picks_default_profile() {
        let backend = Arc::new(ManualBackend::new());
        let router = Arc::new(MockRouter::new());
        let capture = Arc::new(CaptureEngine::new(backend.clone()));
        let playback = Arc::new(PlaybackEngine::new(backend.clone()));

        let settings = EngineSettings {
            default_profile_id: 0x30,
            max_buffer_frames: 20,
            log_level: None,
        };
        let coordinator =
            PipelineCoordinator::from_settings(capture, playback, router, &settings).unwrap();
        let profile = coordinator.start_call(None).unwrap();
        assert_eq!(profile.id, 0x30);

        let backend2 = Arc::new(ManualBackend::new());
        let bad = EngineSettings {
            default_profile_id: 0x99,
            max_buffer_frames: 20,
            log_level: None,
        };
        assert!(PipelineCoordinator::from_settings(
            Arc::new(CaptureEngine::new(backend2.clone())),
            Arc::new(PlaybackEngine::new(backend2)),
            Arc::new(MockRouter::new()),
            &bad,
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_signal_pass_through() {
        let (_backend, router, coordinator) = rig();
        coordinator.send_signal(7).unwrap();
        assert_eq!(router.sent_signals(), vec![7]);
    }

    #[tokio::test]
    async fn test_stop_call_idempotent() {
        let (_backend, _router, coordinator) = rig();
        coordinator.stop_call();
        coordinator.start_call(None).unwrap();
        coordinator.stop_call();
        coordinator.stop_call();
        assert!(!coordinator.is_call_active());
    }
}
