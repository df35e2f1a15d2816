//! In-place voice filter chain: high-pass, low-pass, AGC with hold, limiter
//!
//! Runs on the capture callback thread. All state is per-channel and persists
//! across frames of one stream; the float scratch is allocated at
//! construction so `process` is allocation-free.
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
use std::f32::consts::PI;

/// Number of equal AGC blocks per frame
const AGC_BLOCK_TARGET: usize = 10;
/// RMS below this is treated as silence and leaves the gain untouched
const AGC_TRIGGER_LEVEL: f32 = 0.003;
/// Post-AGC peak ceiling; frames above it are rescaled
const AGC_PEAK_LIMIT: f32 = 0.75;
/// Attack time constant in seconds
const AGC_ATTACK_S: f32 = 0.0001;
/// Release time constant in seconds
const AGC_RELEASE_S: f32 = 0.002;
/// Gain hold time in seconds after an attack
const AGC_HOLD_S: f32 = 0.001;

/// Filter chain tuning
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// High-pass cutoff in Hz
    pub hpf_cutoff_hz: f32,
    /// Low-pass cutoff in Hz
    pub lpf_cutoff_hz: f32,
    /// AGC target level in dBFS
    pub target_dbfs: f32,
    /// Maximum AGC gain in dB
    pub max_gain_db: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            hpf_cutoff_hz: 80.0,
            lpf_cutoff_hz: 7000.0,
            target_dbfs: -12.0,
            max_gain_db: 12.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    hpf_prev_in: f32,
    hpf_prev_out: f32,
    lpf_prev_out: f32,
    agc_gain: f32,
    agc_hold: i64,
}

/// HPF → LPF → AGC (with hold) → peak limiter, in place over int16 frames.
pub struct VoiceFilterChain {
    channels: usize,
    hpf_alpha: f32,
    lpf_alpha: f32,
    target_linear: f32,
    max_gain_linear: f32,
    attack_coeff: f32,
    release_coeff: f32,
    hold_samples: i64,
    state: Vec<ChannelState>,
    scratch: Vec<f32>,
}

impl VoiceFilterChain {
    /// Build a chain for a declared stream geometry. Coefficients derive from
    /// the sample rate; call again (replacing the chain) on reconfigure.
    pub fn new(
        sample_rate: u32,
        channels: usize,
        frame_samples: usize,
        config: FilterConfig,
    ) -> EngineResult<Self> {
        if sample_rate == 0 || channels == 0 || frame_samples == 0 {
            return Err(EngineError::BadConfig(format!(
                "invalid filter geometry: rate={sample_rate} channels={channels} frame_samples={frame_samples}"
            )));
        }
        if frame_samples % channels != 0 {
            return Err(EngineError::BadConfig(format!(
                "frame_samples {frame_samples} not divisible by channels {channels}"
            )));
        }

        let dt = 1.0 / sample_rate as f32;
        let hpf_rc = 1.0 / (2.0 * PI * config.hpf_cutoff_hz);
        let lpf_rc = 1.0 / (2.0 * PI * config.lpf_cutoff_hz);

        let mut state = vec![ChannelState::default(); channels];
        for ch in state.iter_mut() {
            ch.agc_gain = 1.0;
        }

        Ok(VoiceFilterChain {
            channels,
            hpf_alpha: hpf_rc / (hpf_rc + dt),
            lpf_alpha: dt / (lpf_rc + dt),
            target_linear: 10f32.powf(config.target_dbfs / 20.0),
            max_gain_linear: 10f32.powf(config.max_gain_db / 20.0),
            attack_coeff: 1.0 - (-1.0 / (AGC_ATTACK_S * sample_rate as f32)).exp(),
            release_coeff: 1.0 - (-1.0 / (AGC_RELEASE_S * sample_rate as f32)).exp(),
            hold_samples: (AGC_HOLD_S * sample_rate as f32) as i64,
            state,
            scratch: vec![0.0; frame_samples],
        })
    }

    /// Run the chain in place over one interleaved int16 frame.
    pub fn process(&mut self, frame: &mut [i16]) -> EngineResult<()> {
        if frame.len() != self.scratch.len() {
            return Err(EngineError::SizeMismatch {
                expected: self.scratch.len(),
                actual: frame.len(),
            });
        }

        for (dst, &src) in self.scratch.iter_mut().zip(frame.iter()) {
            *dst = src as f32 / 32768.0;
        }

        self.high_pass();
        self.low_pass();
        self.agc();
        self.limit_peak();

        for (dst, &src) in frame.iter_mut().zip(self.scratch.iter()) {
            *dst = (src.clamp(-1.0, 1.0) * 32767.0) as i16;
        }
        Ok(())
    }

    fn high_pass(&mut self) {
        let alpha = self.hpf_alpha;
        for ch in 0..self.channels {
            let state = &mut self.state[ch];
            let mut prev_in = state.hpf_prev_in;
            let mut prev_out = state.hpf_prev_out;
            for sample in self.scratch[ch..].iter_mut().step_by(self.channels) {
                let x = *sample;
                let y = alpha * (prev_out + x - prev_in);
                prev_in = x;
                prev_out = y;
                *sample = y;
            }
            state.hpf_prev_in = prev_in;
            state.hpf_prev_out = prev_out;
        }
    }

    fn low_pass(&mut self) {
        let alpha = self.lpf_alpha;
        for ch in 0..self.channels {
            let state = &mut self.state[ch];
            let mut prev_out = state.lpf_prev_out;
            for sample in self.scratch[ch..].iter_mut().step_by(self.channels) {
                let y = alpha * *sample + (1.0 - alpha) * prev_out;
                prev_out = y;
                *sample = y;
            }
            state.lpf_prev_out = prev_out;
        }
    }

    fn agc(&mut self) {
        let samples_per_channel = self.scratch.len() / self.channels;
        for block in 0..AGC_BLOCK_TARGET {
            let start = block * samples_per_channel / AGC_BLOCK_TARGET;
            let end = (block + 1) * samples_per_channel / AGC_BLOCK_TARGET;
            if start == end {
                continue;
            }
            let block_len = (end - start) as i64;

            for ch in 0..self.channels {
                let mut sum_sq = 0.0f32;
                for i in start..end {
                    let s = self.scratch[i * self.channels + ch];
                    sum_sq += s * s;
                }
                let rms = (sum_sq / block_len as f32).sqrt();

                let state = &mut self.state[ch];
                let target = if rms > AGC_TRIGGER_LEVEL {
                    (self.target_linear / rms).min(self.max_gain_linear)
                } else {
                    state.agc_gain
                };

                if target < state.agc_gain {
                    // Attack: clamp down fast, then hold
                    state.agc_gain = self.attack_coeff * target
                        + (1.0 - self.attack_coeff) * state.agc_gain;
                    state.agc_hold = self.hold_samples;
                } else {
                    state.agc_hold -= block_len;
                    if state.agc_hold <= 0 {
                        state.agc_gain = self.release_coeff * target
                            + (1.0 - self.release_coeff) * state.agc_gain;
                    }
                }

                let gain = state.agc_gain;
                for i in start..end {
                    self.scratch[i * self.channels + ch] *= gain;
                }
            }
        }
    }

    fn limit_peak(&mut self) {
        let mut peak = 0.0f32;
        for ch in 0..self.channels {
            for sample in self.scratch[ch..].iter().step_by(self.channels) {
                peak = peak.max(sample.abs());
            }
        }
        if peak > AGC_PEAK_LIMIT {
            let scale = AGC_PEAK_LIMIT / peak;
            for sample in self.scratch.iter_mut() {
                *sample *= scale;
            }
        }
    }

    /// Current AGC gain of a channel (diagnostics)
    pub fn current_gain(&self, channel: usize) -> Option<f32> {
        self.state.get(channel).map(|s| s.agc_gain)
    }

    /// Clear all per-channel state back to the post-construction values.
    pub fn reset(&mut self) {
        for state in self.state.iter_mut() {
            *state = ChannelState::default();
            state.agc_gain = 1.0;
        }
    }
}
