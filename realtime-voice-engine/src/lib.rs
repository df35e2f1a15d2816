//! Real-time full-duplex voice engine
//!
//! This crate sits between a microphone/speaker pair and a packet-switched
//! voice transport. It provides:
//! - A capture engine with burst-to-frame realignment, voice filtering, and
//!   in-callback encoding
//! - A playback engine with partial-frame handling and bounded packet-loss
//!   concealment
//! - Lock-free SPSC ring buffers for PCM frames and encoded packets
//! - A unified Opus/Codec2 codec facade with wire-header mode switching
//! - A pipeline coordinator handling profiles, prebuffering, and transport
//!   framing
//!
//! The transport itself, call-state UI, and device pickers live behind the
//! [`packet_router::PacketRouter`] and [`audio_backend::HostAudioBackend`]
//! seams.
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


pub mod audio_backend;
pub mod capture_engine;
pub mod codec;
pub mod cpal_backend;
pub mod encoded_ring_buffer;
pub mod error;
pub mod filter_chain;
pub mod packet_router;
pub mod pcm_ring_buffer;
pub mod pipeline_coordinator;
pub mod playback_engine;
pub mod profile;
pub mod testing;
pub mod throttle;

// Re-export main types
pub use audio_backend::{
    AudioStreamHandle, CallbackResult, ContentType, HostAudioBackend, InputDataCallback,
    InputPreset, InputStreamParams, OutputDataCallback, OutputStreamParams, PerformanceMode,
    SharingMode, StreamErrorCallback, StreamUsage,
};
pub use capture_engine::{CaptureConfig, CaptureEngine, CaptureStats};
pub use codec::{Codec, OpusConfig, CODEC2_SAMPLE_RATE, MAX_FRAME_SAMPLES};
pub use cpal_backend::CpalBackend;
pub use encoded_ring_buffer::EncodedRingBuffer;
pub use error::{EngineError, EngineResult};
pub use filter_chain::{FilterConfig, VoiceFilterChain};
pub use packet_router::{frame_packet, split_tagged, PacketCallback, PacketRouter};
pub use pcm_ring_buffer::PcmRingBuffer;
pub use pipeline_coordinator::{CoordinatorConfig, PipelineCoordinator};
pub use playback_engine::{PlaybackConfig, PlaybackEngine, PlaybackStats};
pub use profile::{
    library_mode_for_header, wire_header_for_mode, CodecKind, CodecSide, OpusMode, Profile,
    CODEC_TAG_CODEC2, CODEC_TAG_OPUS, MIN_PREBUFFER_FRAMES, PREBUFFER_TARGET_MS, PROFILES,
};
pub use throttle::LogThrottle;
