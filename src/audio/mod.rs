//! Audio capture and utterance segmentation.
//!
//! ```text
//! ┌──────────────┐    ┌─────────────────┐    ┌─────────────┐
//! │ AudioSource  │───▶│  AudioChunker   │───▶│   Session   │
//! │ (cpal / WAV) │    │  (VAD inside)   │    │             │
//! └──────────────┘    └─────────────────┘    └─────────────┘
//!    FrameEvent           ChunkerEvent
//! ```
//!
//! Sources produce a [`FrameStream`] of fixed-cadence PCM frames. The
//! chunker owns the VAD and cuts the stream into bounded utterance chunks
//! for inference.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod chunker;
pub mod source;
pub mod vad;
pub mod wav;

#[cfg(feature = "cpal-audio")]
pub use capture::{CpalAudioSource, list_devices, suppress_audio_warnings};
pub use chunker::{AudioChunk, AudioChunker, ChunkerConfig, ChunkerEvent};
pub use source::{AudioFrame, AudioSource, FrameEvent, FrameStream, MockAudioSource};
pub use vad::{Vad, VadConfig, VadEvent, VadState};
pub use wav::WavAudioSource;
