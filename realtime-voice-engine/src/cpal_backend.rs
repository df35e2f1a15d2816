//! cpal implementation of the host audio backend
//!
//! `cpal::Stream` is not `Send`, so each opened stream lives on a dedicated
//! owner thread; the returned handle is a command-channel proxy. The data
//! callback itself still runs on cpal's audio thread.
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
use crate::error::{EngineError, EngineResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// Host backend over cpal's default input/output devices.
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        CpalBackend
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

enum StreamCommand {
    Start(mpsc::Sender<EngineResult<()>>),
    Stop(mpsc::Sender<EngineResult<()>>),
    Close,
}

/// Command-channel proxy for a stream owned by its builder thread.
struct CpalStreamHandle {
    commands: mpsc::Sender<StreamCommand>,
    owner: Option<thread::JoinHandle<()>>,
    error_count: Arc<AtomicU64>,
}

impl CpalStreamHandle {
    fn send_and_wait(
        &self,
        build: impl FnOnce(mpsc::Sender<EngineResult<()>>) -> StreamCommand,
    ) -> EngineResult<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| EngineError::StreamOpen("stream owner thread gone".into()))?;
        reply_rx
            .recv()
            .map_err(|_| EngineError::StreamOpen("stream owner thread gone".into()))?
    }
}

impl AudioStreamHandle for CpalStreamHandle {
    fn request_start(&mut self) -> EngineResult<()> {
        self.send_and_wait(StreamCommand::Start)
    }

    fn request_stop(&mut self) -> EngineResult<()> {
        self.send_and_wait(StreamCommand::Stop)
    }

    fn close(&mut self) {
        let _ = self.commands.send(StreamCommand::Close);
        if let Some(owner) = self.owner.take() {
            let _ = owner.join();
        }
    }

    fn xrun_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }
}

impl Drop for CpalStreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn owner_loop(stream: cpal::Stream, commands: mpsc::Receiver<StreamCommand>) {
    while let Ok(command) = commands.recv() {
        match command {
            StreamCommand::Start(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| EngineError::StreamOpen(format!("cpal play: {e}")));
                let _ = reply.send(result);
            }
            StreamCommand::Stop(reply) => {
                let result = stream
                    .pause()
                    .map_err(|e| EngineError::StreamOpen(format!("cpal pause: {e}")));
                let _ = reply.send(result);
            }
            StreamCommand::Close => break,
        }
    }
    drop(stream);
}

fn stream_config(sample_rate: u32, channels: u8, buffer_size_frames: Option<u32>) -> StreamConfig {
    StreamConfig {
        channels: channels as u16,
        sample_rate: SampleRate(sample_rate),
        buffer_size: match buffer_size_frames {
            Some(frames) => BufferSize::Fixed(frames),
            None => BufferSize::Default,
        },
    }
}

impl HostAudioBackend for CpalBackend {
    fn open_input_stream(
        &self,
        params: &InputStreamParams,
        mut callback: Box<dyn InputDataCallback>,
        on_error: StreamErrorCallback,
    ) -> EngineResult<Box<dyn AudioStreamHandle>> {
        let config = stream_config(params.sample_rate, params.channels, params.buffer_size_frames);
        let error_count = Arc::new(AtomicU64::new(0));
        let (commands_tx, commands_rx) = mpsc::channel();
        let (built_tx, built_rx) = mpsc::channel::<EngineResult<()>>();

        let error_count_cb = error_count.clone();
        let owner = thread::Builder::new()
            .name("voxlink-capture-stream".into())
            .spawn(move || {
                let host = cpal::default_host();
                let device = match host.default_input_device() {
                    Some(d) => d,
                    None => {
                        let _ = built_tx
                            .send(Err(EngineError::StreamOpen("no input device".into())));
                        return;
                    }
                };
                debug!(device = ?device.name().ok(), "Opening capture stream");

                let stream = device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        // cpal has no Stop return; a stopped engine just
                        // ignores further bursts until pause lands.
                        let _ = callback.on_audio_ready(data);
                    },
                    move |err| {
                        error_count_cb.fetch_add(1, Ordering::Relaxed);
                        on_error(&err.to_string());
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        let _ = built_tx.send(Ok(()));
                        owner_loop(stream, commands_rx);
                    }
                    Err(e) => {
                        let _ = built_tx
                            .send(Err(EngineError::StreamOpen(format!("cpal input: {e}"))));
                    }
                }
            })
            .map_err(|e| EngineError::StreamOpen(format!("spawn stream owner: {e}")))?;

        built_rx
            .recv()
            .map_err(|_| EngineError::StreamOpen("stream owner thread died".into()))??;

        info!(
            rate = params.sample_rate,
            channels = params.channels,
            "Capture stream opened"
        );
        Ok(Box::new(CpalStreamHandle {
            commands: commands_tx,
            owner: Some(owner),
            error_count,
        }))
    }

    fn open_output_stream(
        &self,
        params: &OutputStreamParams,
        mut callback: Box<dyn OutputDataCallback>,
        on_error: StreamErrorCallback,
    ) -> EngineResult<Box<dyn AudioStreamHandle>> {
        let config = stream_config(params.sample_rate, params.channels, params.buffer_size_frames);
        let error_count = Arc::new(AtomicU64::new(0));
        let (commands_tx, commands_rx) = mpsc::channel();
        let (built_tx, built_rx) = mpsc::channel::<EngineResult<()>>();

        let error_count_cb = error_count.clone();
        let owner = thread::Builder::new()
            .name("voxlink-playback-stream".into())
            .spawn(move || {
                let host = cpal::default_host();
                let device = match host.default_output_device() {
                    Some(d) => d,
                    None => {
                        let _ = built_tx
                            .send(Err(EngineError::StreamOpen("no output device".into())));
                        return;
                    }
                };
                debug!(device = ?device.name().ok(), "Opening playback stream");

                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        if callback.on_audio_ready(data) == CallbackResult::Stop {
                            // Engine has stopped; emit silence until pause lands.
                            data.fill(0);
                        }
                    },
                    move |err| {
                        error_count_cb.fetch_add(1, Ordering::Relaxed);
                        on_error(&err.to_string());
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        let _ = built_tx.send(Ok(()));
                        owner_loop(stream, commands_rx);
                    }
                    Err(e) => {
                        let _ = built_tx
                            .send(Err(EngineError::StreamOpen(format!("cpal output: {e}"))));
                    }
                }
            })
            .map_err(|e| EngineError::StreamOpen(format!("spawn stream owner: {e}")))?;

        built_rx
            .recv()
            .map_err(|_| EngineError::StreamOpen("stream owner thread died".into()))??;

        info!(
            rate = params.sample_rate,
            channels = params.channels,
            "Playback stream opened"
        );
        Ok(Box::new(CpalStreamHandle {
            commands: commands_tx,
            owner: Some(owner),
            error_count,
        }))
    }
}
