//! Voice Activity Detection (VAD) module.
//!
//! Detects speech activity in audio streams using RMS-based thresholding
//! and state machine logic to handle silence intervals.

use crate::clock::{Clock, SystemClock};
use crate::defaults;
use std::time::Instant;

/// Configuration for Voice Activity Detection.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// RMS threshold for detecting speech (0.0 to 1.0).
    pub speech_threshold: f32,
    /// Duration of silence before speech is considered ended (milliseconds).
    pub silence_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: defaults::VAD_THRESHOLD,
            silence_duration_ms: defaults::SILENCE_DURATION_MS,
        }
    }
}

/// Current state of voice activity detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech detected.
    Idle,
    /// Speech is being detected.
    Speaking,
    /// Silence detected, waiting to confirm speech end.
    MaybeSilence,
    /// Speech has ended.
    Stopped,
}

/// Events emitted by the VAD processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Speech has started.
    SpeechStart,
    /// Ongoing speech detected.
    Speech,
    /// Silence detected.
    Silence,
    /// Speech has ended.
    SpeechEnd,
}

/// Detailed VAD processing result with level information.
#[derive(Debug, Clone, Copy)]
pub struct VadResult {
    /// The VAD event
    pub event: VadEvent,
    /// Current RMS level (0.0 to 1.0)
    pub level: f32,
    /// Speech detection threshold
    pub threshold: f32,
    /// Milliseconds of silence (when in MaybeSilence state)
    pub silence_ms: u32,
}

/// Voice Activity Detector state machine.
pub struct Vad<C: Clock = SystemClock> {
    config: VadConfig,
    state: VadState,
    silence_start: Option<Instant>,
    clock: C,
}

impl<C: Clock> Vad<C> {
    /// Creates a new VAD instance with the given configuration and clock.
    pub fn with_clock(config: VadConfig, clock: C) -> Self {
        Self {
            config,
            state: VadState::Idle,
            silence_start: None,
            clock,
        }
    }

    /// Processes one window of audio samples and returns the VAD event.
    pub fn process(&mut self, samples: &[i16]) -> VadEvent {
        self.process_with_info(samples).event
    }

    /// Processes one window of audio samples and returns the detailed result.
    ///
    /// Window size does not affect correctness: silence timing is measured by
    /// the clock, not by sample count.
    pub fn process_with_info(&mut self, samples: &[i16]) -> VadResult {
        let rms = calculate_rms(samples);
        let is_speech = rms > self.config.speech_threshold;
        let now = self.clock.now();

        let (event, silence_ms) = match self.state {
            VadState::Idle => {
                if is_speech {
                    self.state = VadState::Speaking;
                    self.silence_start = None;
                    (VadEvent::SpeechStart, 0)
                } else {
                    (VadEvent::Silence, 0)
                }
            }
            VadState::Speaking => {
                if is_speech {
                    self.silence_start = None;
                    (VadEvent::Speech, 0)
                } else {
                    self.state = VadState::MaybeSilence;
                    self.silence_start = Some(now);
                    (VadEvent::Silence, 0)
                }
            }
            VadState::MaybeSilence => {
                if is_speech {
                    self.state = VadState::Speaking;
                    self.silence_start = None;
                    (VadEvent::Speech, 0)
                } else {
                    let silence_elapsed = self
                        .silence_start
                        .map(|start| now.duration_since(start).as_millis() as u32)
                        .unwrap_or(0);

                    if silence_elapsed >= self.config.silence_duration_ms {
                        self.state = VadState::Stopped;
                        self.silence_start = None;
                        (VadEvent::SpeechEnd, silence_elapsed)
                    } else {
                        (VadEvent::Silence, silence_elapsed)
                    }
                }
            }
            VadState::Stopped => (VadEvent::Silence, 0),
        };

        VadResult {
            event,
            level: rms,
            threshold: self.config.speech_threshold,
            silence_ms,
        }
    }

    /// Returns the current VAD state.
    pub fn state(&self) -> VadState {
        self.state
    }
}

impl Vad<SystemClock> {
    /// Creates a new VAD instance with the given configuration using the system clock.
    pub fn new(config: VadConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

/// Calculates the Root Mean Square (RMS) of audio samples.
///
/// # Arguments
/// * `samples` - Audio samples as 16-bit PCM
///
/// # Returns
/// Normalized RMS value (0.0 to 1.0), where:
/// - 0.0 represents silence
/// - ~0.707 represents a full-scale sine wave
/// - 1.0 represents maximum amplitude
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}
