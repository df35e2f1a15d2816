//! Unified voice codec facade over Opus and Codec2
//!
//! One `Codec` instance carries both directions for its family: the Opus
//! state holds an encoder/decoder pair at the configured rate, the Codec2
//! state a single handle (the vocoder is symmetric). Codec2 packets carry
//! their own one-byte mode header; a header mismatch on decode recreates the
//! handle at the peer's mode.
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
use crate::profile::{self, CodecKind, OpusMode, Profile};
use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Bitrate, Channels, SampleRate};
use codec2::{Codec2, Codec2Mode};

/// Largest interleaved frame the engine handles: 60 ms of 48 kHz stereo.
pub const MAX_FRAME_SAMPLES: usize = 5760;

/// Codec2 always runs at 8 kHz mono.
pub const CODEC2_SAMPLE_RATE: u32 = 8000;

/// Opus codec parameters
#[derive(Debug, Clone, Copy)]
pub struct OpusConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub mode: OpusMode,
    /// Bits per second
    pub bitrate: u32,
    /// Encoder complexity, 0..=10
    pub complexity: u8,
    /// Nominal frame duration; fixes the mono/stereo frame boundary
    pub frame_time_ms: u32,
}

impl Default for OpusConfig {
    fn default() -> Self {
        OpusConfig {
            sample_rate: 48000,
            channels: 1,
            mode: OpusMode::Voip,
            bitrate: 16000,
            complexity: 5,
            frame_time_ms: 60,
        }
    }
}

enum CodecState {
    Opus {
        encoder: OpusEncoder,
        decoder: OpusDecoder,
        sample_rate: u32,
        channels: usize,
        frame_time_ms: u32,
    },
    Codec2 {
        handle: Codec2,
        samples_per_frame: usize,
        bytes_per_frame: usize,
        mode_header: u8,
        library_mode: u8,
    },
}

/// Encoder+decoder facade for one codec family.
pub struct Codec {
    state: CodecState,
}

fn map_sample_rate(hz: u32) -> EngineResult<SampleRate> {
    match hz {
        8000 => Ok(SampleRate::Hz8000),
        12000 => Ok(SampleRate::Hz12000),
        16000 => Ok(SampleRate::Hz16000),
        24000 => Ok(SampleRate::Hz24000),
        48000 => Ok(SampleRate::Hz48000),
        _ => Err(EngineError::BadConfig(format!(
            "unsupported Opus sample rate: {hz}"
        ))),
    }
}

fn map_channels(channels: u8) -> EngineResult<Channels> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        _ => Err(EngineError::BadConfig(format!(
            "unsupported channel count: {channels}"
        ))),
    }
}

fn map_application(mode: OpusMode) -> Application {
    match mode {
        OpusMode::Voip => Application::Voip,
        OpusMode::Audio => Application::Audio,
        OpusMode::LowDelay => Application::LowDelay,
    }
}

fn codec2_mode(library_mode: u8) -> EngineResult<Codec2Mode> {
    match library_mode {
        0 => Ok(Codec2Mode::MODE_3200),
        1 => Ok(Codec2Mode::MODE_2400),
        2 => Ok(Codec2Mode::MODE_1600),
        3 => Ok(Codec2Mode::MODE_1400),
        4 => Ok(Codec2Mode::MODE_1300),
        5 => Ok(Codec2Mode::MODE_1200),
        8 => Ok(Codec2Mode::MODE_700C),
        _ => Err(EngineError::BadConfig(format!(
            "unsupported Codec2 library mode: {library_mode}"
        ))),
    }
}

impl Codec {
    /// Create an Opus encoder/decoder pair.
    pub fn create_opus(config: OpusConfig) -> EngineResult<Self> {
        if !(500..=512_000).contains(&config.bitrate) {
            return Err(EngineError::BadConfig(format!(
                "invalid bitrate: {} (must be 500-512000)",
                config.bitrate
            )));
        }
        if config.complexity > 10 {
            return Err(EngineError::BadConfig(format!(
                "invalid complexity: {} (must be 0-10)",
                config.complexity
            )));
        }

        let sample_rate = map_sample_rate(config.sample_rate)?;
        let channels = map_channels(config.channels)?;

        let mut encoder =
            OpusEncoder::new(sample_rate, channels, map_application(config.mode))
                .map_err(|e| EngineError::BadConfig(format!("opus encoder: {e:?}")))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(config.bitrate as i32))
            .map_err(|e| EngineError::BadConfig(format!("opus bitrate: {e:?}")))?;
        encoder
            .set_complexity(config.complexity)
            .map_err(|e| EngineError::BadConfig(format!("opus complexity: {e:?}")))?;

        let decoder = OpusDecoder::new(sample_rate, channels)
            .map_err(|e| EngineError::BadConfig(format!("opus decoder: {e:?}")))?;

        Ok(Codec {
            state: CodecState::Opus {
                encoder,
                decoder,
                sample_rate: config.sample_rate,
                channels: config.channels as usize,
                frame_time_ms: config.frame_time_ms,
            },
        })
    }

    /// Create a Codec2 handle at the given library mode (8 kHz mono).
    pub fn create_codec2(library_mode: u8) -> EngineResult<Self> {
        let handle = Codec2::new(codec2_mode(library_mode)?);
        let mode_header = profile::wire_header_for_mode(library_mode).ok_or_else(|| {
            EngineError::BadConfig(format!("library mode {library_mode} has no wire header"))
        })?;
        let samples_per_frame = handle.samples_per_frame();
        let bytes_per_frame = (handle.bits_per_frame() + 7) / 8;

        Ok(Codec {
            state: CodecState::Codec2 {
                handle,
                samples_per_frame,
                bytes_per_frame,
                mode_header,
                library_mode,
            },
        })
    }

    /// Codec for a profile's capture side.
    pub fn for_encoding(profile: &Profile) -> EngineResult<Self> {
        match profile.codec {
            CodecKind::Opus => Codec::create_opus(OpusConfig {
                sample_rate: profile.encode.sample_rate,
                channels: profile.encode.channels,
                mode: profile.opus_mode,
                bitrate: profile.encode.bitrate,
                complexity: 5,
                frame_time_ms: profile.frame_time_ms,
            }),
            CodecKind::Codec2 => Codec::create_codec2(
                profile
                    .codec2_mode
                    .ok_or_else(|| EngineError::BadConfig("profile lacks a Codec2 mode".into()))?,
            ),
        }
    }

    /// Codec for a profile's playback side.
    pub fn for_decoding(profile: &Profile) -> EngineResult<Self> {
        match profile.codec {
            CodecKind::Opus => Codec::create_opus(OpusConfig {
                sample_rate: profile.decode.sample_rate,
                channels: profile.decode.channels,
                mode: profile.opus_mode,
                bitrate: profile.decode.bitrate,
                complexity: 5,
                frame_time_ms: profile.frame_time_ms,
            }),
            CodecKind::Codec2 => Codec::for_encoding(profile),
        }
    }

    /// True when the active state is Opus (the only family with PLC).
    pub fn is_opus(&self) -> bool {
        matches!(self.state, CodecState::Opus { .. })
    }

    /// Interleaved samples per nominal frame for the active configuration.
    pub fn frame_samples(&self) -> usize {
        match &self.state {
            CodecState::Opus {
                sample_rate,
                channels,
                frame_time_ms,
                ..
            } => (*sample_rate as usize * *frame_time_ms as usize / 1000) * channels,
            CodecState::Codec2 {
                samples_per_frame, ..
            } => *samples_per_frame,
        }
    }

    /// Encode one frame of interleaved PCM into `out`, returning the encoded
    /// byte count. No codec-tag byte is written; tagging is the pipeline's
    /// job.
    pub fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> EngineResult<usize> {
        match &mut self.state {
            CodecState::Opus {
                encoder,
                sample_rate,
                channels,
                frame_time_ms,
                ..
            } => {
                let mono_frame = *sample_rate as usize * *frame_time_ms as usize / 1000;
                if *channels == 2 && pcm.len() <= mono_frame {
                    // Mono input on a stereo codec: duplicate each sample.
                    let mut upmix = [0i16; MAX_FRAME_SAMPLES];
                    if pcm.len() * 2 > MAX_FRAME_SAMPLES {
                        return Err(EngineError::EncodeBad(format!(
                            "upmixed frame of {} samples exceeds {MAX_FRAME_SAMPLES}",
                            pcm.len() * 2
                        )));
                    }
                    for (i, &s) in pcm.iter().enumerate() {
                        upmix[i * 2] = s;
                        upmix[i * 2 + 1] = s;
                    }
                    encoder
                        .encode(&upmix[..pcm.len() * 2], out)
                        .map_err(|e| EngineError::EncodeBad(format!("opus: {e:?}")))
                } else {
                    encoder
                        .encode(pcm, out)
                        .map_err(|e| EngineError::EncodeBad(format!("opus: {e:?}")))
                }
            }
            CodecState::Codec2 {
                handle,
                samples_per_frame,
                bytes_per_frame,
                mode_header,
                ..
            } => {
                if pcm.is_empty() || pcm.len() % *samples_per_frame != 0 {
                    return Err(EngineError::EncodeBad(format!(
                        "{} samples is not a multiple of the {}-sample Codec2 frame",
                        pcm.len(),
                        samples_per_frame
                    )));
                }
                let n_sub = pcm.len() / *samples_per_frame;
                let encoded_len = 1 + n_sub * *bytes_per_frame;
                if out.len() < encoded_len {
                    return Err(EngineError::EncodeBad(format!(
                        "output buffer of {} bytes cannot hold {encoded_len}",
                        out.len()
                    )));
                }

                out[0] = *mode_header;
                for i in 0..n_sub {
                    let speech = &pcm[i * *samples_per_frame..(i + 1) * *samples_per_frame];
                    let packed =
                        &mut out[1 + i * *bytes_per_frame..1 + (i + 1) * *bytes_per_frame];
                    handle.encode(packed, speech);
                }
                Ok(encoded_len)
            }
        }
    }

    /// Decode one packet into `out`, returning the total interleaved sample
    /// count.
    ///
    /// For Codec2 the packet's leading mode header is authoritative: a
    /// mismatch with the current mode recreates the handle at the peer's
    /// mode before decoding. An unknown header fails the packet.
    pub fn decode(&mut self, encoded: &[u8], out: &mut [i16]) -> EngineResult<usize> {
        match &mut self.state {
            CodecState::Opus {
                decoder, channels, ..
            } => {
                let per_channel = decoder
                    .decode(Some(encoded), out, false)
                    .map_err(|e| EngineError::DecodeBad(format!("opus: {e:?}")))?;
                Ok(per_channel * *channels)
            }
            CodecState::Codec2 {
                handle,
                samples_per_frame,
                bytes_per_frame,
                mode_header,
                library_mode,
            } => {
                if encoded.is_empty() {
                    return Err(EngineError::DecodeBad("empty Codec2 packet".into()));
                }

                let header = encoded[0];
                if header != *mode_header {
                    let new_mode = profile::library_mode_for_header(header).ok_or_else(|| {
                        EngineError::DecodeBad(format!("unknown Codec2 mode header {header:#04x}"))
                    })?;
                    // Mode changes coincide with profile switches; the handle
                    // is recreated at the peer's mode, never cached per mode.
                    let new_handle = Codec2::new(codec2_mode(new_mode)?);
                    *samples_per_frame = new_handle.samples_per_frame();
                    *bytes_per_frame = (new_handle.bits_per_frame() + 7) / 8;
                    *handle = new_handle;
                    *mode_header = header;
                    *library_mode = new_mode;
                }

                let n_sub = (encoded.len() - 1) / *bytes_per_frame;
                let total = n_sub * *samples_per_frame;
                if total > out.len() {
                    return Err(EngineError::DecodeBad(format!(
                        "decoded length {total} exceeds output capacity {}",
                        out.len()
                    )));
                }

                for i in 0..n_sub {
                    let packed = &encoded[1 + i * *bytes_per_frame..1 + (i + 1) * *bytes_per_frame];
                    let speech = &mut out[i * *samples_per_frame..(i + 1) * *samples_per_frame];
                    handle.decode(speech, packed);
                }
                Ok(total)
            }
        }
    }

    /// Produce a packet-loss concealment frame of `samples_per_channel`
    /// samples per channel into `out`, returning the total interleaved
    /// sample count. Opus only.
    pub fn decode_plc(&mut self, out: &mut [i16], samples_per_channel: usize) -> EngineResult<usize> {
        match &mut self.state {
            CodecState::Opus {
                decoder, channels, ..
            } => {
                let needed = samples_per_channel * *channels;
                if needed > out.len() {
                    return Err(EngineError::DecodeBad(format!(
                        "PLC frame of {needed} samples exceeds output capacity {}",
                        out.len()
                    )));
                }
                let per_channel = decoder
                    .decode(None::<&[u8]>, &mut out[..needed], false)
                    .map_err(|e| EngineError::DecodeBad(format!("opus plc: {e:?}")))?;
                Ok(per_channel * *channels)
            }
            CodecState::Codec2 { .. } => Err(EngineError::DecodeBad(
                "Codec2 has no packet-loss concealment".into(),
            )),
        }
    }

    /// Current Codec2 wire mode header (None for Opus).
    pub fn codec2_mode_header(&self) -> Option<u8> {
        match &self.state {
            CodecState::Codec2 { mode_header, .. } => Some(*mode_header),
            CodecState::Opus { .. } => None,
        }
    }

    /// Current Codec2 library mode (None for Opus).
    pub fn codec2_library_mode(&self) -> Option<u8> {
        match &self.state {
            CodecState::Codec2 { library_mode, .. } => Some(*library_mode),
            CodecState::Opus { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(rate: u32, n: usize, amplitude: f32) -> Vec<i16> {
        (0..n)
            .map(|i| {
                let t = i as f32 / rate as f32;
                (amplitude * (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 32767.0) as i16
            })
            .collect()
    }

    #[test]
    fn test_create_opus_validates_params() {
        assert!(Codec::create_opus(OpusConfig { sample_rate: 44100, ..Default::default() }).is_err());
        assert!(Codec::create_opus(OpusConfig { channels: 3, ..Default::default() }).is_err());
        assert!(Codec::create_opus(OpusConfig { bitrate: 0, ..Default::default() }).is_err());
        assert!(Codec::create_opus(OpusConfig { complexity: 11, ..Default::default() }).is_err());
        assert!(Codec::create_opus(OpusConfig::default()).is_ok());
    }

    #[test]
    fn test_create_codec2_validates_mode() {
        assert!(Codec::create_codec2(6).is_err());
        assert!(Codec::create_codec2(9).is_err());
        for mode in [0u8, 1, 2, 3, 4, 5, 8] {
            assert!(Codec::create_codec2(mode).is_ok(), "mode {mode}");
        }
    }

    #[test]
    fn test_opus_roundtrip_sample_counts() {
        // Medium-quality shape: encode 24 kHz mono, decode 48 kHz mono.
        let mut enc = Codec::create_opus(OpusConfig {
            sample_rate: 24000,
            channels: 1,
            bitrate: 8000,
            ..Default::default()
        })
        .unwrap();
        let mut dec = Codec::create_opus(OpusConfig {
            sample_rate: 48000,
            channels: 1,
            bitrate: 16000,
            ..Default::default()
        })
        .unwrap();

        let pcm = sine(24000, 1440, 0.3); // 60 ms
        let mut packet = [0u8; 1500];
        let len = enc.encode(&pcm, &mut packet).unwrap();
        assert!(len > 0 && len < 1500);

        let mut out = vec![0i16; 2880];
        let decoded = dec.decode(&packet[..len], &mut out).unwrap();
        assert_eq!(decoded, 2880); // 48 kHz · 60 ms · 1ch
    }

    #[test]
    fn test_opus_mono_upmix_on_stereo_codec() {
        let mut codec = Codec::create_opus(OpusConfig {
            sample_rate: 48000,
            channels: 2,
            bitrate: 32000,
            ..Default::default()
        })
        .unwrap();

        // A mono 60 ms frame on the stereo codec gets duplicated per channel.
        let mono = sine(48000, 2880, 0.3);
        let mut packet = [0u8; 1500];
        let len = codec.encode(&mono, &mut packet).unwrap();
        assert!(len > 0);

        let mut out = vec![0i16; 5760];
        let decoded = codec.decode(&packet[..len], &mut out).unwrap();
        assert_eq!(decoded, 5760); // interleaved stereo
    }

    #[test]
    fn test_opus_plc_generates_frame() {
        let mut codec = Codec::create_opus(OpusConfig {
            sample_rate: 48000,
            channels: 1,
            bitrate: 16000,
            ..Default::default()
        })
        .unwrap();

        // Prime the decoder with one real packet.
        let pcm = sine(48000, 2880, 0.3);
        let mut packet = [0u8; 1500];
        let len = codec.encode(&pcm, &mut packet).unwrap();
        let mut out = vec![0i16; 2880];
        codec.decode(&packet[..len], &mut out).unwrap();

        let produced = codec.decode_plc(&mut out, 2880).unwrap();
        assert_eq!(produced, 2880);
    }

    #[test]
    fn test_codec2_plc_unsupported() {
        let mut codec = Codec::create_codec2(0).unwrap();
        let mut out = vec![0i16; 160];
        assert!(codec.decode_plc(&mut out, 160).is_err());
    }

    #[test]
    fn test_codec2_wire_layout() {
        // 3200 mode: 160-sample sub-frames, 64 bits -> 8 bytes each.
        let mut codec = Codec::create_codec2(0).unwrap();
        assert_eq!(codec.codec2_mode_header(), Some(0x06));

        let pcm = sine(8000, 1600, 0.3); // 200 ms -> 10 sub-frames
        let mut packet = [0u8; 256];
        let len = codec.encode(&pcm, &mut packet).unwrap();
        assert_eq!(len, 1 + 10 * 8);
        assert_eq!(packet[0], 0x06);

        let mut out = vec![0i16; 1600];
        let decoded = codec.decode(&packet[..len], &mut out).unwrap();
        assert_eq!(decoded, 1600);
    }

    #[test]
    fn test_codec2_rejects_partial_subframe() {
        let mut codec = Codec::create_codec2(0).unwrap();
        let pcm = vec![0i16; 150]; // not a multiple of 160
        let mut packet = [0u8; 64];
        assert!(codec.encode(&pcm, &mut packet).is_err());
    }

    #[test]
    fn test_codec2_mode_switch_on_header_mismatch() {
        // Encode at 3200 (header 0x06), decode with a codec created at 700C.
        let mut enc = Codec::create_codec2(0).unwrap();
        let pcm = sine(8000, 320, 0.3);
        let mut packet = [0u8; 64];
        let len = enc.encode(&pcm, &mut packet).unwrap();

        let mut dec = Codec::create_codec2(8).unwrap();
        assert_eq!(dec.codec2_mode_header(), Some(0x00));

        let mut out = vec![0i16; 320];
        let decoded = dec.decode(&packet[..len], &mut out).unwrap();
        assert_eq!(decoded, 320);
        // The decoder followed the wire header.
        assert_eq!(dec.codec2_mode_header(), Some(0x06));
        assert_eq!(dec.codec2_library_mode(), Some(0));
    }

    #[test]
    fn test_codec2_unknown_header_fails_packet() {
        let mut codec = Codec::create_codec2(0).unwrap();
        let packet = [0x07u8, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut out = vec![0i16; 320];
        assert!(codec.decode(&packet, &mut out).is_err());
        // State unchanged.
        assert_eq!(codec.codec2_mode_header(), Some(0x06));
    }

    #[test]
    fn test_codec2_decode_overflow_rejected_without_writing() {
        let mut enc = Codec::create_codec2(0).unwrap();
        let pcm = sine(8000, 1600, 0.3);
        let mut packet = [0u8; 256];
        let len = enc.encode(&pcm, &mut packet).unwrap();

        let mut small = vec![0i16; 100];
        assert!(enc.decode(&packet[..len], &mut small).is_err());
    }

    #[test]
    fn test_profile_constructors() {
        for p in profile::PROFILES.iter() {
            let enc = Codec::for_encoding(p).unwrap();
            let dec = Codec::for_decoding(p).unwrap();
            match p.codec {
                CodecKind::Opus => {
                    assert_eq!(enc.frame_samples(), p.encode_frame_samples());
                    assert_eq!(dec.frame_samples(), p.decode_frame_samples());
                }
                CodecKind::Codec2 => {
                    assert!(enc.codec2_mode_header().is_some());
                    assert!(dec.codec2_mode_header().is_some());
                }
            }
        }
    }
}
