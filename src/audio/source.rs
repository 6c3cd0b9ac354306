//! Audio frame types and the capture source abstraction.
//!
//! A source delivers PCM frames over a [`FrameStream`] until it is closed or
//! the device fails. Implementations: cpal capture (`capture` module), WAV
//! replay (`wav` module), and [`MockAudioSource`] for tests.

use crate::defaults;
use crate::error::{DictadError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

/// One buffer of captured PCM audio.
///
/// Frames are immutable once produced and are consumed exactly once by the
/// chunker. Sequence numbers are monotonic per capture stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sequence: u64,
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(sequence: u64, sample_rate: u32, samples: Vec<i16>) -> Self {
        Self {
            sequence,
            sample_rate,
            samples,
        }
    }

    /// Duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / u64::from(self.sample_rate)
    }
}

/// What a capture stream yields next.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// A buffer of samples.
    Frame(AudioFrame),
    /// Capture ended cleanly (source closed).
    EndOfStream,
    /// The capture device failed; no further frames will arrive.
    DeviceError { message: String },
}

/// Receiving end of a capture stream.
pub struct FrameStream {
    rx: mpsc::Receiver<FrameEvent>,
}

impl FrameStream {
    pub fn new(rx: mpsc::Receiver<FrameEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next event.
    ///
    /// A closed channel is reported as `EndOfStream`, so producers may simply
    /// drop their sender to end the stream.
    pub async fn next_frame(&mut self) -> FrameEvent {
        self.rx.recv().await.unwrap_or(FrameEvent::EndOfStream)
    }
}

/// Trait for audio capture sources.
///
/// This trait allows swapping implementations (real audio device vs mock).
pub trait AudioSource: Send + Sync {
    /// Start capturing and return the frame stream.
    fn open(&mut self) -> Result<FrameStream>;

    /// Stop capturing. The stream yields `EndOfStream` shortly after.
    fn close(&mut self) -> Result<()>;
}

/// Mock audio source for testing.
///
/// Plays back a scripted list of frames, optionally paced in real time, then
/// ends the stream, reports a device error, or stays open until `close`.
pub struct MockAudioSource {
    frames: Vec<Vec<i16>>,
    sample_rate: u32,
    frame_interval: Option<Duration>,
    should_fail_open: bool,
    error_message: String,
    device_error: Option<String>,
    hold_open: bool,
    is_open: bool,
    closed: Option<Arc<Notify>>,
}

impl MockAudioSource {
    /// Create a new mock audio source with default settings.
    pub fn new() -> Self {
        Self {
            frames: vec![vec![0i16; 160]],
            sample_rate: defaults::SAMPLE_RATE,
            frame_interval: None,
            should_fail_open: false,
            error_message: "mock audio error".to_string(),
            device_error: None,
            hold_open: false,
            is_open: false,
            closed: None,
        }
    }

    /// Configure the mock to deliver specific frames.
    pub fn with_frames(mut self, frames: Vec<Vec<i16>>) -> Self {
        self.frames = frames;
        self
    }

    /// Configure the sample rate stamped on each frame.
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Deliver frames paced by the given interval instead of all at once.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Configure the mock to fail on open.
    pub fn with_open_failure(mut self) -> Self {
        self.should_fail_open = true;
        self
    }

    /// Configure the error message for open failures.
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// End the stream with a device error instead of `EndOfStream`.
    pub fn with_device_error(mut self, message: &str) -> Self {
        self.device_error = Some(message.to_string());
        self
    }

    /// Keep the stream open after the scripted frames until `close` is called.
    pub fn with_hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Check if the source is currently open.
    pub fn is_open(&self) -> bool {
        self.is_open
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn open(&mut self) -> Result<FrameStream> {
        if self.should_fail_open {
            return Err(DictadError::Device {
                message: self.error_message.clone(),
            });
        }

        let (tx, rx) = mpsc::channel(self.frames.len() + 2);
        let closed = Arc::new(Notify::new());
        self.closed = Some(closed.clone());
        self.is_open = true;

        let frames = self.frames.clone();
        let sample_rate = self.sample_rate;
        let interval = self.frame_interval;
        let device_error = self.device_error.clone();
        let hold_open = self.hold_open;

        tokio::spawn(async move {
            for (sequence, samples) in frames.into_iter().enumerate() {
                if let Some(interval) = interval {
                    tokio::time::sleep(interval).await;
                }
                let frame = AudioFrame::new(sequence as u64, sample_rate, samples);
                if tx.send(FrameEvent::Frame(frame)).await.is_err() {
                    return;
                }
            }

            if let Some(message) = device_error {
                let _ = tx.send(FrameEvent::DeviceError { message }).await;
                return;
            }

            if hold_open {
                closed.notified().await;
            }
            let _ = tx.send(FrameEvent::EndOfStream).await;
        });

        Ok(FrameStream::new(rx))
    }

    fn close(&mut self) -> Result<()> {
        self.is_open = false;
        if let Some(closed) = self.closed.take() {
            closed.notify_one();
        }
        Ok(())
    }
}
