//! Deterministic in-process audio backend for tests
//!
//! Drives the engines' real-time callbacks from the test thread, so burst
//! sizes, timing, and host errors are fully scripted. No hardware involved.
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
    AudioStreamHandle, CallbackResult, HostAudioBackend, InputDataCallback, InputStreamParams,
    OutputDataCallback, OutputStreamParams, StreamErrorCallback,
};
use crate::error::EngineResult;
use crate::packet_router::{PacketCallback, PacketRouter};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct SlotControl {
    started: AtomicBool,
    closed: AtomicBool,
    buffer_size_frames: AtomicU32,
    xruns: AtomicU64,
}

struct StreamSlot<T> {
    callback: T,
    control: Arc<SlotControl>,
    on_error: StreamErrorCallback,
}

#[derive(Default)]
struct ManualState {
    input: Option<StreamSlot<Box<dyn InputDataCallback>>>,
    output: Option<StreamSlot<Box<dyn OutputDataCallback>>>,
}

/// Backend whose "audio thread" is the test itself.
pub struct ManualBackend {
    state: Mutex<ManualState>,
    frames_per_burst: Option<u32>,
}

impl ManualBackend {
    pub fn new() -> Self {
        ManualBackend {
            state: Mutex::new(ManualState::default()),
            frames_per_burst: None,
        }
    }

    /// Backend that reports a preferred burst size to the engines.
    pub fn with_frames_per_burst(frames: u32) -> Self {
        ManualBackend {
            state: Mutex::new(ManualState::default()),
            frames_per_burst: Some(frames),
        }
    }

    /// Deliver one capture burst; None when no startable stream is open.
    pub fn drive_input(&self, burst: &[i16]) -> Option<CallbackResult> {
        let mut state = self.state.lock().unwrap();
        let slot = state.input.as_mut()?;
        if !slot.control.started.load(Ordering::Acquire)
            || slot.control.closed.load(Ordering::Acquire)
        {
            return None;
        }
        let result = slot.callback.on_audio_ready(burst);
        if result == CallbackResult::Stop {
            slot.control.started.store(false, Ordering::Release);
        }
        Some(result)
    }

    /// Ask the playback callback to fill `samples` interleaved samples.
    pub fn drive_output(&self, samples: usize) -> Option<(Vec<i16>, CallbackResult)> {
        let mut state = self.state.lock().unwrap();
        let slot = state.output.as_mut()?;
        if !slot.control.started.load(Ordering::Acquire)
            || slot.control.closed.load(Ordering::Acquire)
        {
            return None;
        }
        let mut burst = vec![0i16; samples];
        let result = slot.callback.on_audio_ready(&mut burst);
        if result == CallbackResult::Stop {
            slot.control.started.store(false, Ordering::Release);
        }
        Some((burst, result))
    }

    /// Deliver a capture burst regardless of started/closed state,
    /// mimicking hosts whose close does not synchronise with the audio
    /// thread.
    pub fn drive_input_late(&self, burst: &[i16]) -> Option<CallbackResult> {
        let mut state = self.state.lock().unwrap();
        let slot = state.input.as_mut()?;
        Some(slot.callback.on_audio_ready(burst))
    }

    /// Deliver a playback callback regardless of started/closed state,
    /// mimicking hosts whose close does not synchronise with the audio
    /// thread.
    pub fn drive_output_late(&self, samples: usize) -> Option<(Vec<i16>, CallbackResult)> {
        let mut state = self.state.lock().unwrap();
        let slot = state.output.as_mut()?;
        let mut burst = vec![0i16; samples];
        let result = slot.callback.on_audio_ready(&mut burst);
        Some((burst, result))
    }

    /// True while the playback stream is open and started.
    pub fn output_running(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .output
            .as_ref()
            .map(|s| {
                s.control.started.load(Ordering::Acquire)
                    && !s.control.closed.load(Ordering::Acquire)
            })
            .unwrap_or(false)
    }

    /// True while the capture stream is open and started.
    pub fn input_running(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .input
            .as_ref()
            .map(|s| {
                s.control.started.load(Ordering::Acquire)
                    && !s.control.closed.load(Ordering::Acquire)
            })
            .unwrap_or(false)
    }

    /// Buffer-size hint the engine applied to the playback stream.
    pub fn output_buffer_size_hint(&self) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state
            .output
            .as_ref()
            .map(|s| s.control.buffer_size_frames.load(Ordering::Relaxed))
    }

    /// Fire the host error callback of the capture stream.
    pub fn trigger_input_error(&self, reason: &str) {
        let state = self.state.lock().unwrap();
        if let Some(slot) = state.input.as_ref() {
            (slot.on_error)(reason);
        }
    }

    /// Fire the host error callback of the playback stream.
    pub fn trigger_output_error(&self, reason: &str) {
        let state = self.state.lock().unwrap();
        if let Some(slot) = state.output.as_ref() {
            (slot.on_error)(reason);
        }
    }

    /// Record one xrun on the playback stream.
    pub fn record_output_xrun(&self) {
        let state = self.state.lock().unwrap();
        if let Some(slot) = state.output.as_ref() {
            slot.control.xruns.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for ManualBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Router double: records outbound packets and signals, lets tests inject
/// inbound packets through the installed callback.
#[derive(Default)]
pub struct MockRouter {
    sent: Mutex<Vec<Bytes>>,
    signals: Mutex<Vec<i32>>,
    callback: Mutex<Option<PacketCallback>>,
}

impl MockRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outbound packets the core has emitted so far.
    pub fn sent_packets(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_signals(&self) -> Vec<i32> {
        self.signals.lock().unwrap().clone()
    }

    /// Deliver one inbound packet to the installed handler; false when no
    /// handler is installed.
    pub fn inject(&self, packet: Bytes) -> bool {
        let callback = self.callback.lock().unwrap();
        match callback.as_ref() {
            Some(cb) => {
                cb(packet);
                true
            }
            None => false,
        }
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }
}

impl PacketRouter for MockRouter {
    fn send_packet(&self, packet: Bytes) -> EngineResult<()> {
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }

    fn send_signal(&self, code: i32) -> EngineResult<()> {
        self.signals.lock().unwrap().push(code);
        Ok(())
    }

    fn set_packet_callback(&self, callback: PacketCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }
}

struct ManualStreamHandle {
    control: Arc<SlotControl>,
    frames_per_burst: Option<u32>,
}

impl AudioStreamHandle for ManualStreamHandle {
    fn request_start(&mut self) -> EngineResult<()> {
        self.control.started.store(true, Ordering::Release);
        Ok(())
    }

    fn request_stop(&mut self) -> EngineResult<()> {
        self.control.started.store(false, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) {
        self.control.closed.store(true, Ordering::Release);
    }

    fn frames_per_burst(&self) -> Option<u32> {
        self.frames_per_burst
    }

    fn set_buffer_size_in_frames(&mut self, frames: u32) -> EngineResult<()> {
        self.control.buffer_size_frames.store(frames, Ordering::Relaxed);
        Ok(())
    }

    fn xrun_count(&self) -> u64 {
        self.control.xruns.load(Ordering::Relaxed)
    }
}

impl HostAudioBackend for ManualBackend {
    fn open_input_stream(
        &self,
        _params: &InputStreamParams,
        callback: Box<dyn InputDataCallback>,
        on_error: StreamErrorCallback,
    ) -> EngineResult<Box<dyn AudioStreamHandle>> {
        let control = Arc::new(SlotControl::default());
        let mut state = self.state.lock().unwrap();
        state.input = Some(StreamSlot {
            callback,
            control: control.clone(),
            on_error,
        });
        Ok(Box::new(ManualStreamHandle {
            control,
            frames_per_burst: self.frames_per_burst,
        }))
    }

    fn open_output_stream(
        &self,
        _params: &OutputStreamParams,
        callback: Box<dyn OutputDataCallback>,
        on_error: StreamErrorCallback,
    ) -> EngineResult<Box<dyn AudioStreamHandle>> {
        let control = Arc::new(SlotControl::default());
        let mut state = self.state.lock().unwrap();
        state.output = Some(StreamSlot {
            callback,
            control: control.clone(),
            on_error,
        });
        Ok(Box::new(ManualStreamHandle {
            control,
            frames_per_burst: self.frames_per_burst,
        }))
    }
}
