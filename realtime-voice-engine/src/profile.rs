//! Negotiated audio profiles and wire-level codec identifiers
//!
//! A profile fixes codec, frame time, and the encode/decode parameters for
//! both peers. The table is part of the wire contract; both sides must agree.
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


use serde::Serialize;

/// One-byte codec tag prefixed to every transport packet
pub const CODEC_TAG_OPUS: u8 = 0x01;
/// One-byte codec tag prefixed to every transport packet
pub const CODEC_TAG_CODEC2: u8 = 0x02;

/// Frames that must be queued before playback starts, lower bound
pub const MIN_PREBUFFER_FRAMES: usize = 5;
/// Prebuffer target in milliseconds of audio, absorbs typical transport jitter
pub const PREBUFFER_TARGET_MS: u32 = 300;

/// Codec family selected by a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CodecKind {
    Opus,
    Codec2,
}

/// Opus application hint forwarded to the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpusMode {
    Voip,
    Audio,
    LowDelay,
}

/// One direction's codec parameters.
///
/// The encode and decode sides of a profile may differ: the medium-quality
/// and low-latency Opus profiles encode at 24 kHz to save battery but decode
/// at the speaker's native 48 kHz, trusting Opus's internal resampler. Do not
/// normalise the two sides back to one rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CodecSide {
    pub sample_rate: u32,
    pub channels: u8,
    /// Bits per second; 0 where the codec derives it from the mode (Codec2)
    pub bitrate: u32,
}

impl CodecSide {
    /// Interleaved samples in one frame of `frame_time_ms` at these params
    pub const fn frame_samples(&self, frame_time_ms: u32) -> usize {
        (self.sample_rate as usize * frame_time_ms as usize * self.channels as usize) / 1000
    }
}

/// Immutable record of a negotiated configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Profile {
    /// Single byte, globally unique, used on the wire for negotiation
    pub id: u8,
    pub name: &'static str,
    pub codec: CodecKind,
    pub frame_time_ms: u32,
    pub encode: CodecSide,
    pub decode: CodecSide,
    /// Opus application for the encoder (ignored by Codec2 profiles)
    pub opus_mode: OpusMode,
    /// Codec2 library mode (None for Opus profiles)
    pub codec2_mode: Option<u8>,
}

const CODEC2_8K_MONO: CodecSide = CodecSide { sample_rate: 8000, channels: 1, bitrate: 0 };

/// The negotiation table, in "next profile" cycle order.
pub static PROFILES: [Profile; 8] = [
    Profile {
        id: 0x10,
        name: "ultra-low-bandwidth",
        codec: CodecKind::Codec2,
        frame_time_ms: 400,
        encode: CODEC2_8K_MONO,
        decode: CODEC2_8K_MONO,
        opus_mode: OpusMode::Voip,
        codec2_mode: Some(8), // 700C
    },
    Profile {
        id: 0x20,
        name: "very-low-bandwidth",
        codec: CodecKind::Codec2,
        frame_time_ms: 320,
        encode: CODEC2_8K_MONO,
        decode: CODEC2_8K_MONO,
        opus_mode: OpusMode::Voip,
        codec2_mode: Some(2), // 1600
    },
    Profile {
        id: 0x30,
        name: "low-bandwidth",
        codec: CodecKind::Codec2,
        frame_time_ms: 200,
        encode: CODEC2_8K_MONO,
        decode: CODEC2_8K_MONO,
        opus_mode: OpusMode::Voip,
        codec2_mode: Some(0), // 3200
    },
    Profile {
        id: 0x40,
        name: "medium-quality",
        codec: CodecKind::Opus,
        frame_time_ms: 60,
        encode: CodecSide { sample_rate: 24000, channels: 1, bitrate: 8000 },
        decode: CodecSide { sample_rate: 48000, channels: 1, bitrate: 16000 },
        opus_mode: OpusMode::Voip,
        codec2_mode: None,
    },
    Profile {
        id: 0x50,
        name: "high-quality",
        codec: CodecKind::Opus,
        frame_time_ms: 60,
        encode: CodecSide { sample_rate: 48000, channels: 1, bitrate: 16000 },
        decode: CodecSide { sample_rate: 48000, channels: 1, bitrate: 16000 },
        opus_mode: OpusMode::Voip,
        codec2_mode: None,
    },
    Profile {
        id: 0x60,
        name: "stereo-high-quality",
        codec: CodecKind::Opus,
        frame_time_ms: 60,
        encode: CodecSide { sample_rate: 48000, channels: 2, bitrate: 32000 },
        decode: CodecSide { sample_rate: 48000, channels: 2, bitrate: 32000 },
        opus_mode: OpusMode::Voip,
        codec2_mode: None,
    },
    Profile {
        id: 0x70,
        name: "ultra-low-latency",
        codec: CodecKind::Opus,
        frame_time_ms: 10,
        encode: CodecSide { sample_rate: 24000, channels: 1, bitrate: 8000 },
        decode: CodecSide { sample_rate: 48000, channels: 1, bitrate: 16000 },
        opus_mode: OpusMode::LowDelay,
        codec2_mode: None,
    },
    Profile {
        id: 0x80,
        name: "low-latency",
        codec: CodecKind::Opus,
        frame_time_ms: 20,
        encode: CodecSide { sample_rate: 24000, channels: 1, bitrate: 8000 },
        decode: CodecSide { sample_rate: 48000, channels: 1, bitrate: 16000 },
        opus_mode: OpusMode::LowDelay,
        codec2_mode: None,
    },
];

impl Profile {
    /// Profile used when a call starts unprompted
    pub fn default_profile() -> &'static Profile {
        Profile::by_id(0x40).expect("default profile present in table")
    }

    /// Look up a profile by its wire id
    pub fn by_id(id: u8) -> Option<&'static Profile> {
        PROFILES.iter().find(|p| p.id == id)
    }

    /// Next profile in the wraparound cycle
    pub fn next(&self) -> &'static Profile {
        let idx = PROFILES
            .iter()
            .position(|p| p.id == self.id)
            .expect("profile comes from the table");
        &PROFILES[(idx + 1) % PROFILES.len()]
    }

    /// The one-byte codec tag for this profile's packets
    pub const fn codec_tag(&self) -> u8 {
        match self.codec {
            CodecKind::Opus => CODEC_TAG_OPUS,
            CodecKind::Codec2 => CODEC_TAG_CODEC2,
        }
    }

    /// Interleaved samples per encoded frame (capture side)
    pub const fn encode_frame_samples(&self) -> usize {
        self.encode.frame_samples(self.frame_time_ms)
    }

    /// Interleaved samples per decoded frame (playback side)
    pub const fn decode_frame_samples(&self) -> usize {
        self.decode.frame_samples(self.frame_time_ms)
    }

    /// Frames that must be queued before playback starts for this profile
    pub fn prebuffer_frames(&self) -> usize {
        MIN_PREBUFFER_FRAMES.max((PREBUFFER_TARGET_MS / self.frame_time_ms) as usize)
    }
}

/// Codec2 wire header byte for a library mode.
///
/// The runtime derives wire headers from library modes through this mapping
/// only; it must match the peer exactly.
pub fn wire_header_for_mode(library_mode: u8) -> Option<u8> {
    match library_mode {
        8 => Some(0x00), // 700C
        5 => Some(0x01), // 1200
        4 => Some(0x02), // 1300
        3 => Some(0x03), // 1400
        2 => Some(0x04), // 1600
        1 => Some(0x05), // 2400
        0 => Some(0x06), // 3200
        _ => None,
    }
}

/// Codec2 library mode for a wire header byte; inverse of
/// [`wire_header_for_mode`].
pub fn library_mode_for_header(header: u8) -> Option<u8> {
    match header {
        0x00 => Some(8),
        0x01 => Some(5),
        0x02 => Some(4),
        0x03 => Some(3),
        0x04 => Some(2),
        0x05 => Some(1),
        0x06 => Some(0),
        _ => None,
    }
}
