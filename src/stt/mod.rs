//! Speech-to-text engines and the async adapter around them.

pub mod adapter;
pub mod engine;
pub mod whisper;

pub use adapter::EngineAdapter;
pub use engine::{LoadedModel, MockEngine, SpeechEngine, Transcription};
pub use whisper::WhisperEngine;
