//! Host audio backend seam
//!
//! The engines consume the platform's real-time audio primitive through this
//! trait. Streams are opened with a declared geometry and a data callback;
//! the host invokes the callback on its own real-time priority thread with
//! variable-size bursts. Callback work must stay allocation-free, lock-free,
//! and bounded.
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


use crate::error::EngineResult;

/// Latency/power trade-off requested from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceMode {
    None,
    LowLatency,
    PowerSaving,
}

/// Device sharing requested from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingMode {
    Exclusive,
    Shared,
}

/// Input tuning hint for capture streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPreset {
    Generic,
    VoiceCommunication,
}

/// Output routing hint for playback streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamUsage {
    Media,
    VoiceCommunication,
}

/// Output content hint for playback streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Music,
    Speech,
}

/// Geometry and tuning for a capture stream. Sample format is always int16.
#[derive(Debug, Clone, Copy)]
pub struct InputStreamParams {
    pub sample_rate: u32,
    pub channels: u8,
    pub performance: PerformanceMode,
    pub sharing: SharingMode,
    pub preset: InputPreset,
    /// Host buffer size hint, in frames
    pub buffer_size_frames: Option<u32>,
}

/// Geometry and tuning for a playback stream. Sample format is always int16.
#[derive(Debug, Clone, Copy)]
pub struct OutputStreamParams {
    pub sample_rate: u32,
    pub channels: u8,
    pub performance: PerformanceMode,
    pub sharing: SharingMode,
    pub usage: StreamUsage,
    pub content_type: ContentType,
    /// Host buffer size hint, in frames
    pub buffer_size_frames: Option<u32>,
}

/// Returned by data callbacks to keep or stop the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    Continue,
    Stop,
}

/// Capture-side data callback, invoked with one interleaved int16 burst.
pub trait InputDataCallback: Send {
    fn on_audio_ready(&mut self, burst: &[i16]) -> CallbackResult;
}

/// Playback-side data callback, asked to fill one interleaved int16 burst.
pub trait OutputDataCallback: Send {
    fn on_audio_ready(&mut self, burst: &mut [i16]) -> CallbackResult;
}

/// Host-level stream error hook (route change, device unplug).
///
/// Some hosts fire this on the very thread that closed the stream;
/// implementations must only flip flags.
pub type StreamErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Control surface of an opened stream.
///
/// Dropping a handle closes the stream.
pub trait AudioStreamHandle: Send {
    /// Ask the host to start invoking the data callback. Any flag the
    /// callback consults for its return value must already be set.
    fn request_start(&mut self) -> EngineResult<()>;

    /// Ask the host to stop the callback.
    fn request_stop(&mut self) -> EngineResult<()>;

    /// Release the stream. Does not synchronise with a callback already in
    /// flight on every host; callers keep their own destroyed fence.
    fn close(&mut self);

    /// Burst size the host prefers, if known.
    fn frames_per_burst(&self) -> Option<u32> {
        None
    }

    /// Hint the host's internal buffer size. Hosts that cannot resize ignore
    /// the hint.
    fn set_buffer_size_in_frames(&mut self, _frames: u32) -> EngineResult<()> {
        Ok(())
    }

    /// Host-reported over/underrun count, if known.
    fn xrun_count(&self) -> u64 {
        0
    }
}

/// The platform-supplied real-time audio primitive.
///
/// The OS arbitrates one exclusive low-latency stream per direction, so one
/// backend instance is shared per process and handed to the engines
/// explicitly.
pub trait HostAudioBackend: Send + Sync {
    fn open_input_stream(
        &self,
        params: &InputStreamParams,
        callback: Box<dyn InputDataCallback>,
        on_error: StreamErrorCallback,
    ) -> EngineResult<Box<dyn AudioStreamHandle>>;

    fn open_output_stream(
        &self,
        params: &OutputStreamParams,
        callback: Box<dyn OutputDataCallback>,
        on_error: StreamErrorCallback,
    ) -> EngineResult<Box<dyn AudioStreamHandle>>;
}
