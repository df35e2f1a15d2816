//! Error types for the realtime voice engine
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


use thiserror::Error;

/// Result type for voice engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the voice engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// An operation that requires a live engine was called before `create()`
    /// or after `destroy()`
    #[error("engine not created")]
    NotCreated,

    /// Invalid codec or stream parameters
    #[error("bad configuration: {0}")]
    BadConfig(String),

    /// Host audio backend refused to open or start a stream
    #[error("stream open failed: {0}")]
    StreamOpen(String),

    /// Engine is not in the running state required for this operation
    #[error("engine not running")]
    NotRunning,

    /// Ring buffer is full
    #[error("ring buffer full")]
    BufferFull,

    /// Ring buffer is empty
    #[error("ring buffer empty")]
    BufferEmpty,

    /// Caller passed a slice whose length does not match the frame size
    #[error("size mismatch: expected {expected} samples, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Packet exceeds the encoded ring's per-slot capacity
    #[error("packet too large: {len} bytes exceeds slot capacity {max}")]
    TooLarge { len: usize, max: usize },

    /// Codec failed to decode a specific packet
    #[error("decode error: {0}")]
    DecodeBad(String),

    /// Codec failed to encode a specific frame
    #[error("encode error: {0}")]
    EncodeBad(String),

    /// The host's stream error callback fired
    #[error("stream route error: {0}")]
    RouteError(String),

    /// Packet router refused an outbound packet
    #[error("router error: {0}")]
    RouterSend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::SizeMismatch { expected: 1440, actual: 960 };
        assert_eq!(err.to_string(), "size mismatch: expected 1440 samples, got 960");

        let err = EngineError::TooLarge { len: 2000, max: 1500 };
        assert!(err.to_string().contains("2000"));
    }
}
