//! Utterance segmentation.
//!
//! Consumes the capture frame stream, runs voice-activity detection, and
//! emits bounded [`AudioChunk`] segments:
//! - a chunk opens on the first speech frame after silence
//! - it closes non-final when it reaches the configured duration cap
//! - it closes final on trailing silence or when the stream ends
//!
//! One chunker instance serves one session; state never carries over.

use crate::audio::source::{AudioFrame, FrameEvent, FrameStream};
use crate::audio::vad::{Vad, VadConfig, VadEvent, VadState};
use crate::clock::{Clock, SystemClock};
use crate::defaults;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::trace;

/// Configuration for the chunker.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Sample rate for duration calculations.
    pub sample_rate: u32,
    /// Voice-activity detection settings.
    pub vad: VadConfig,
    /// Maximum chunk duration in milliseconds before a non-final cut.
    pub chunk_max_ms: u32,
    /// Pre-roll kept while idle and prepended when speech starts.
    pub pre_roll_ms: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            vad: VadConfig::default(),
            chunk_max_ms: defaults::CHUNK_MAX_MS,
            pre_roll_ms: defaults::PRE_ROLL_MS,
        }
    }
}

impl ChunkerConfig {
    /// Build a chunker configuration from the audio config section.
    pub fn from_audio(audio: &crate::config::AudioConfig) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            vad: VadConfig {
                speech_threshold: audio.vad_threshold,
                silence_duration_ms: audio.silence_duration_ms,
            },
            chunk_max_ms: audio.chunk_max_ms,
            pre_roll_ms: defaults::PRE_ROLL_MS,
        }
    }
}

/// One utterance segment, ready for inference.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Position of this chunk within the session (0-based).
    pub chunk_id: u64,
    /// Sequence of the first speech frame in this chunk.
    ///
    /// Pre-roll samples prepended at utterance start come from earlier frames
    /// and are not reflected here.
    pub start_sequence: u64,
    /// Sequence of the last frame added.
    pub end_sequence: u64,
    pub sample_rate: u32,
    pub samples: Vec<i16>,
    /// Set on the last chunk of the session.
    pub is_final: bool,
}

impl AudioChunk {
    /// Duration of this chunk in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / u64::from(self.sample_rate)
    }
}

/// What the chunker hands to the owning session.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkerEvent {
    /// An utterance segment.
    Chunk(AudioChunk),
    /// The stream ended without any speech being detected.
    NoSpeech,
    /// The capture source failed; the session cannot continue.
    Fatal { message: String },
}

/// Per-session segmentation state machine.
pub struct AudioChunker<C: Clock = SystemClock> {
    config: ChunkerConfig,
    vad: Vad<C>,
    /// Current chunk's audio samples.
    buffer: Vec<i16>,
    /// Idle-time samples kept for prepending when speech starts.
    pre_roll: VecDeque<i16>,
    /// Sequence of the first frame in the current chunk.
    start_sequence: Option<u64>,
    /// Sequence of the last frame added.
    last_sequence: u64,
    /// Next chunk ID to emit.
    next_chunk_id: u64,
    /// Whether the final chunk has been emitted.
    finished: bool,
}

impl<C: Clock> AudioChunker<C> {
    /// Creates a new chunker with the given configuration and clock.
    pub fn with_clock(config: ChunkerConfig, clock: C) -> Self {
        let vad = Vad::with_clock(config.vad, clock);
        Self {
            config,
            vad,
            buffer: Vec::new(),
            pre_roll: VecDeque::new(),
            start_sequence: None,
            last_sequence: 0,
            next_chunk_id: 0,
            finished: false,
        }
    }

    /// Returns the current buffer duration in milliseconds.
    pub fn buffer_duration_ms(&self) -> u32 {
        ((self.buffer.len() as u64 * 1000) / u64::from(self.config.sample_rate)) as u32
    }

    fn pre_roll_samples(&self) -> usize {
        (self.config.pre_roll_ms as u64 * u64::from(self.config.sample_rate) / 1000) as usize
    }

    /// Processes one frame and returns a chunk if one closed.
    ///
    /// Frames arriving after the final chunk are dropped.
    pub fn process_frame(&mut self, frame: &AudioFrame) -> Option<AudioChunk> {
        if self.finished {
            return None;
        }

        let info = self.vad.process_with_info(&frame.samples);
        trace!(
            level = info.level,
            threshold = info.threshold,
            silence_ms = info.silence_ms,
            sequence = frame.sequence,
            "vad window"
        );

        if info.event == VadEvent::SpeechEnd {
            self.append(frame);
            return self.emit_chunk(true);
        }

        let vad_active = matches!(self.vad.state(), VadState::Speaking | VadState::MaybeSilence);
        if vad_active {
            self.ensure_open(frame.sequence);
            self.append(frame);
            if self.buffer_duration_ms() >= self.config.chunk_max_ms {
                return self.emit_chunk(false);
            }
            return None;
        }

        // Idle silence: remember the tail for pre-roll
        self.feed_pre_roll(&frame.samples);
        None
    }

    /// Close out the stream after the source ended.
    ///
    /// Emits the final chunk from whatever is buffered. A session that had a
    /// duration-capped cut but nothing since still gets an (empty) final
    /// chunk, so the session always sees exactly one final item. Returns
    /// `None` if the final chunk was already emitted.
    pub fn finish(&mut self) -> Option<ChunkerEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;

        if self.next_chunk_id == 0 && self.buffer.is_empty() {
            return Some(ChunkerEvent::NoSpeech);
        }

        let chunk = AudioChunk {
            chunk_id: self.next_chunk_id,
            start_sequence: self.start_sequence.unwrap_or(self.last_sequence),
            end_sequence: self.last_sequence,
            sample_rate: self.config.sample_rate,
            samples: std::mem::take(&mut self.buffer),
            is_final: true,
        };
        self.next_chunk_id += 1;
        self.start_sequence = None;
        Some(ChunkerEvent::Chunk(chunk))
    }

    fn ensure_open(&mut self, sequence: u64) {
        if self.start_sequence.is_some() {
            return;
        }
        self.start_sequence = Some(sequence);

        // Pre-roll is only populated before the utterance starts, so this
        // fires once per session, on the first chunk.
        if !self.pre_roll.is_empty() {
            self.buffer.extend(self.pre_roll.drain(..));
        }
    }

    fn append(&mut self, frame: &AudioFrame) {
        if self.start_sequence.is_none() {
            self.start_sequence = Some(frame.sequence);
        }
        self.last_sequence = frame.sequence;
        self.buffer.extend_from_slice(&frame.samples);
    }

    fn feed_pre_roll(&mut self, samples: &[i16]) {
        self.pre_roll.extend(samples.iter().copied());
        let cap = self.pre_roll_samples();
        while self.pre_roll.len() > cap {
            self.pre_roll.pop_front();
        }
    }

    fn emit_chunk(&mut self, is_final: bool) -> Option<AudioChunk> {
        if self.buffer.is_empty() {
            return None;
        }

        let chunk = AudioChunk {
            chunk_id: self.next_chunk_id,
            start_sequence: self.start_sequence.unwrap_or(0),
            end_sequence: self.last_sequence,
            sample_rate: self.config.sample_rate,
            samples: std::mem::take(&mut self.buffer),
            is_final,
        };

        self.next_chunk_id += 1;
        self.start_sequence = None;
        if is_final {
            self.finished = true;
        }

        Some(chunk)
    }

    /// Runs the chunker as a pipeline station.
    ///
    /// Consumes the frame stream and sends [`ChunkerEvent`]s to the session
    /// until the final chunk is emitted, the stream ends, or the device
    /// fails. Dropping the stream on exit discards any frames still in
    /// flight, which is what unblocks a capture task mid-send.
    pub async fn run(mut self, mut input: FrameStream, output: mpsc::Sender<ChunkerEvent>) {
        loop {
            match input.next_frame().await {
                FrameEvent::Frame(frame) => {
                    if let Some(chunk) = self.process_frame(&frame) {
                        let is_final = chunk.is_final;
                        if output.send(ChunkerEvent::Chunk(chunk)).await.is_err() {
                            return;
                        }
                        if is_final {
                            return;
                        }
                    }
                }
                FrameEvent::EndOfStream => {
                    if let Some(event) = self.finish() {
                        let _ = output.send(event).await;
                    }
                    return;
                }
                FrameEvent::DeviceError { message } => {
                    let _ = output.send(ChunkerEvent::Fatal { message }).await;
                    return;
                }
            }
        }
    }
}

impl AudioChunker<SystemClock> {
    /// Creates a new chunker with the given configuration using the system clock.
    pub fn new(config: ChunkerConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}
