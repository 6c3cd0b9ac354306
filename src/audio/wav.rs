//! WAV file audio source.
//!
//! Feeds a recorded file through the same frame pipeline as live capture.
//! Useful for scripted testing and for transcribing existing recordings.

use crate::audio::source::{AudioFrame, AudioSource, FrameEvent, FrameStream};
use crate::defaults;
use crate::error::{DictadError, Result};
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

/// Audio source that reads from WAV file data.
/// Supports arbitrary sample rates and channels, resampling to 16kHz mono.
pub struct WavAudioSource {
    samples: Vec<i16>,
    frame_samples: usize,
    /// When set, frames are delivered at real-time pace instead of
    /// as fast as the pipeline accepts them.
    paced: bool,
}

impl WavAudioSource {
    /// Create from any reader (for testing/flexibility).
    pub fn from_reader(reader: Box<dyn Read + Send>) -> Result<Self> {
        let mut wav_reader = hound::WavReader::new(reader).map_err(|e| DictadError::Device {
            message: format!("Failed to parse WAV file: {}", e),
        })?;

        let spec = wav_reader.spec();
        let source_rate = spec.sample_rate;
        let source_channels = spec.channels;

        // Read all samples from the WAV file
        let raw_samples: Vec<i16> = wav_reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| DictadError::Device {
                message: format!("Failed to read WAV samples: {}", e),
            })?;

        // Convert to mono if stereo
        let mono_samples = if source_channels == 2 {
            raw_samples
                .chunks_exact(2)
                .map(|chunk| {
                    let left = chunk[0] as i32;
                    let right = chunk[1] as i32;
                    ((left + right) / 2) as i16
                })
                .collect()
        } else {
            raw_samples
        };

        // Resample to 16kHz if needed
        let samples = if source_rate != defaults::SAMPLE_RATE {
            resample(&mono_samples, source_rate, defaults::SAMPLE_RATE)
        } else {
            mono_samples
        };

        let frame_samples =
            (defaults::SAMPLE_RATE as usize * defaults::CAPTURE_FRAME_MS as usize) / 1000;

        Ok(Self {
            samples,
            frame_samples,
            paced: false,
        })
    }

    /// Create from a file on disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(Box::new(std::io::BufReader::new(file)))
    }

    /// Create from stdin.
    pub fn from_stdin() -> Result<Self> {
        use std::io::Cursor;

        // Read all data from stdin into memory first (StdinLock is not Send)
        let mut buffer = Vec::new();
        std::io::stdin()
            .lock()
            .read_to_end(&mut buffer)
            .map_err(|e| DictadError::Device {
                message: format!("Failed to read from stdin: {}", e),
            })?;

        Self::from_reader(Box::new(Cursor::new(buffer)))
    }

    /// Deliver frames at real-time pace.
    ///
    /// Without pacing the whole file arrives at once, so trailing-silence
    /// detection never fires and the session only finalizes at end of file.
    pub fn with_pacing(mut self) -> Self {
        self.paced = true;
        self
    }

    /// Consume the source and return all samples as a single buffer.
    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}

impl AudioSource for WavAudioSource {
    fn open(&mut self) -> Result<FrameStream> {
        // Clone so a later open replays the file from the start
        let samples = self.samples.clone();
        let frame_samples = self.frame_samples;
        let paced = self.paced;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let frame_duration = Duration::from_millis(u64::from(defaults::CAPTURE_FRAME_MS));
            for (sequence, window) in samples.chunks(frame_samples).enumerate() {
                if paced {
                    tokio::time::sleep(frame_duration).await;
                }
                let frame =
                    AudioFrame::new(sequence as u64, defaults::SAMPLE_RATE, window.to_vec());
                if tx.send(FrameEvent::Frame(frame)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(FrameEvent::EndOfStream).await;
        });

        Ok(FrameStream::new(rx))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Simple linear interpolation resampling.
pub(crate) fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = source_pos.floor() as usize;
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}
