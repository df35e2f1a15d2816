//! Packet router seam and codec-tag wire framing
//!
//! The engine core never talks to the network; it emits and accepts opaque
//! packets through this interface. Every transport packet is exactly
//! `[codec tag][codec payload]`.
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
use bytes::{BufMut, Bytes, BytesMut};

/// Inbound packet delivery, installed by the coordinator. Called with raw
/// packets including the tag byte.
pub type PacketCallback = Box<dyn Fn(Bytes) + Send + Sync>;

/// Transport surface consumed by the core. Routing, security, and links live
/// behind it.
pub trait PacketRouter: Send + Sync {
    /// Emit one outbound tagged packet.
    fn send_packet(&self, packet: Bytes) -> EngineResult<()>;

    /// Opaque control code pass-through (ringing, busy, ...).
    fn send_signal(&self, code: i32) -> EngineResult<()>;

    /// Install the inbound packet handler, replacing any previous one.
    fn set_packet_callback(&self, callback: PacketCallback);
}

/// Prefix an encoded payload with its codec tag.
pub fn frame_packet(codec_tag: u8, payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(1 + payload.len());
    packet.put_u8(codec_tag);
    packet.put_slice(payload);
    packet.freeze()
}

/// Split an inbound packet into its codec tag and payload.
///
/// The tag is informational; decode parameters come from the negotiated
/// profile, because both peers have already agreed.
pub fn split_tagged(packet: &[u8]) -> EngineResult<(u8, &[u8])> {
    match packet.split_first() {
        Some((&tag, payload)) => Ok((tag, payload)),
        None => Err(EngineError::DecodeBad("empty transport packet".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{CODEC_TAG_CODEC2, CODEC_TAG_OPUS};

    #[test]
    fn test_frame_and_split_roundtrip() {
        let packet = frame_packet(CODEC_TAG_OPUS, &[0xAA, 0xBB]);
        assert_eq!(&packet[..], &[CODEC_TAG_OPUS, 0xAA, 0xBB]);

        let (tag, payload) = split_tagged(&packet).unwrap();
        assert_eq!(tag, CODEC_TAG_OPUS);
        assert_eq!(payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn test_codec2_payload_keeps_mode_header() {
        // The Codec2 payload's own first byte is the codec's mode header.
        let packet = frame_packet(CODEC_TAG_CODEC2, &[0x06, 1, 2, 3]);
        let (tag, payload) = split_tagged(&packet).unwrap();
        assert_eq!(tag, CODEC_TAG_CODEC2);
        assert_eq!(payload[0], 0x06);
    }

    #[test]
    fn test_empty_packet_rejected() {
        assert!(split_tagged(&[]).is_err());
    }
}
