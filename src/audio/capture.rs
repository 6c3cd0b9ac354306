//! Real audio capture using CPAL (Cross-Platform Audio Library).
//!
//! `cpal::Stream` is not `Send`, so the whole stream lifecycle lives on a
//! dedicated capture thread. The thread drains the callback buffer on a
//! fixed cadence, slices it into [`AudioFrame`]s, and pushes them into the
//! session's [`FrameStream`].

use crate::audio::source::{AudioFrame, AudioSource, FrameEvent, FrameStream};
use crate::defaults;
use crate::error::{DictadError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// This suppresses noisy ALSA/JACK/PipeWire messages that CPAL triggers
/// when probing audio backends. The messages are harmless but confusing to users.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2 (stderr).
/// Safe as long as no other thread is concurrently manipulating fd 2.
fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Suppress noisy JACK/ALSA error messages that occur during audio backend probing.
/// These are harmless but confusing to users.
///
/// # Safety
/// This modifies environment variables which is safe when called before spawning threads.
pub fn suppress_audio_warnings() {
    // SAFETY: Called at startup before any threads are spawned
    unsafe {
        // Suppress JACK "cannot connect" messages - don't try to start JACK server
        std::env::set_var("JACK_NO_START_SERVER", "1");
        // Disable JACK completely for CPAL probing
        std::env::set_var("JACK_NO_AUDIO_RESERVATION", "1");
        // Force PipeWire to not print debug messages
        std::env::set_var("PIPEWIRE_DEBUG", "0");
        // Suppress ALSA verbose messages
        std::env::set_var("ALSA_DEBUG", "0");
        // Tell PipeWire's JACK to be quiet
        std::env::set_var("PW_LOG", "0");
    }
}

/// Preferred device names for GNOME/PipeWire environments.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns to filter out (not useful for voice input).
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

/// Check if a device name should be filtered out.
fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

/// Check if a device is a preferred device.
fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// List all available audio input devices with filtering and recommendations.
///
/// # Returns
/// A vector of device names, with preferred devices marked with "\[recommended\]".
/// Filters out obviously unusable devices (surround channels, HDMI, etc.).
///
/// # Errors
/// Returns `DictadError::Device` if device enumeration fails.
///
/// # Note
/// During enumeration, cpal may output ALSA/JACK warnings to stderr while
/// probing backends. These warnings are harmless and can be safely ignored.
/// They occur because cpal tries multiple audio backends (ALSA, JACK, Pulse)
/// to find available devices.
pub fn list_devices() -> Result<Vec<String>> {
    let (host, devices) = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host.input_devices();
        (host, devices)
    });
    let _ = host; // keep host alive while iterating devices
    let devices = devices.map_err(|e| DictadError::Device {
        message: format!("Failed to enumerate input devices: {}", e),
    })?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            // Skip filtered devices
            if should_filter_device(&name) {
                continue;
            }

            // Mark recommended devices
            if is_preferred_device(&name) {
                device_names.push(format!("{} [recommended]", name));
            } else {
                device_names.push(name);
            }
        }
    }

    Ok(device_names)
}

/// Resolve an input device by name, or pick the best default.
///
/// With no name, tries PipeWire, then PulseAudio/Pulse, then the system
/// default. This ensures we respect GNOME's audio device selection.
///
/// # Errors
/// Returns `DictadError::AudioDeviceNotFound` if no matching input device
/// is available.
fn resolve_device(device_name: Option<&str>) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();

        if let Some(name) = device_name {
            let devices = host.input_devices().map_err(|e| DictadError::Device {
                message: format!("Failed to enumerate devices: {}", e),
            })?;

            for device in devices {
                if let Ok(dev_name) = device.name()
                    && dev_name == name
                {
                    return Ok(device);
                }
            }

            return Err(DictadError::AudioDeviceNotFound {
                device: name.to_string(),
            });
        }

        // Try to find a preferred device
        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name()
                    && is_preferred_device(&name)
                {
                    return Ok(device);
                }
            }
        }

        // Fall back to system default
        host.default_input_device()
            .ok_or_else(|| DictadError::AudioDeviceNotFound {
                device: "default".to_string(),
            })
    })
}

/// Shared state between the cpal callbacks and the capture thread loop.
struct CaptureShared {
    buffer: Mutex<Vec<i16>>,
    callback_count: AtomicU64,
    /// First stream error reported by cpal (device unplugged, backend died).
    stream_error: Mutex<Option<String>>,
}

impl CaptureShared {
    fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            callback_count: AtomicU64::new(0),
            stream_error: Mutex::new(None),
        }
    }

    fn push_samples(&self, samples: &[i16]) {
        self.callback_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut buf) = self.buffer.lock() {
            buf.extend_from_slice(samples);
        }
    }

    fn record_error(&self, err: &cpal::StreamError) {
        warn!("Audio stream error: {}", err);
        if let Ok(mut slot) = self.stream_error.lock() {
            if slot.is_none() {
                *slot = Some(err.to_string());
            }
        }
    }

    fn take_error(&self) -> Option<String> {
        self.stream_error.lock().ok().and_then(|mut slot| slot.take())
    }

    fn drain(&self) -> Vec<i16> {
        match self.buffer.lock() {
            Ok(mut buf) => std::mem::take(&mut *buf),
            Err(_) => Vec::new(),
        }
    }
}

/// Build the audio stream with the configured format.
///
/// Tries in order:
/// 1. i16/16kHz/mono — preferred, zero-copy path
/// 2. f32/16kHz/mono — for devices that only expose float formats
/// 3. Device default config — native rate/channels with software conversion
///
/// Step 3 handles PipeWire setups where the ALSA compatibility layer accepts
/// non-native configs but never fires the data callback.
fn build_stream(
    device: &cpal::Device,
    sample_rate: u32,
    shared: &Arc<CaptureShared>,
) -> Result<cpal::Stream> {
    let preferred_config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    // Try i16/16kHz/mono — works with PipeWire/PulseAudio which convert transparently
    let data_shared = Arc::clone(shared);
    let err_shared = Arc::clone(shared);
    if let Ok(stream) = device.build_input_stream(
        &preferred_config,
        move |data: &[i16], _: &cpal::InputCallbackInfo| {
            data_shared.push_samples(data);
        },
        move |err| err_shared.record_error(&err),
        None,
    ) {
        return Ok(stream);
    }

    // Try f32/16kHz/mono — for devices that only expose float formats
    let data_shared = Arc::clone(shared);
    let err_shared = Arc::clone(shared);
    if let Ok(stream) = device.build_input_stream(
        &preferred_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let converted: Vec<i16> = data
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect();
            data_shared.push_samples(&converted);
        },
        move |err| err_shared.record_error(&err),
        None,
    ) {
        return Ok(stream);
    }

    // Fallback: capture at device's native config, convert in software.
    // Some PipeWire-ALSA setups accept non-native configs but never deliver data.
    build_stream_native(device, sample_rate, shared)
}

/// Build a stream using the device's default/native config, with software
/// channel mixing (stereo→mono) and resampling (native rate→16kHz).
fn build_stream_native(
    device: &cpal::Device,
    target_rate: u32,
    shared: &Arc<CaptureShared>,
) -> Result<cpal::Stream> {
    use cpal::SampleFormat;

    let default_config = device
        .default_input_config()
        .map_err(|e| DictadError::Device {
            message: format!("Failed to query default input config: {}", e),
        })?;

    let native_rate = default_config.sample_rate().0;
    let native_channels = default_config.channels() as usize;

    let stream_config: cpal::StreamConfig = default_config.clone().into();

    info!(
        channels = native_channels,
        rate = native_rate,
        format = ?default_config.sample_format(),
        "using native audio format, converting in software"
    );

    let data_shared = Arc::clone(shared);
    let err_shared = Arc::clone(shared);

    match default_config.sample_format() {
        SampleFormat::I16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let converted =
                        convert_to_mono_target_rate(data, native_channels, native_rate, target_rate);
                    data_shared.push_samples(&converted);
                },
                move |err| err_shared.record_error(&err),
                None,
            )
            .map_err(|e| DictadError::Device {
                message: format!("Failed to build native i16 stream: {}", e),
            }),
        SampleFormat::F32 => device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let i16_data: Vec<i16> = data
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                        .collect();
                    let converted = convert_to_mono_target_rate(
                        &i16_data,
                        native_channels,
                        native_rate,
                        target_rate,
                    );
                    data_shared.push_samples(&converted);
                },
                move |err| err_shared.record_error(&err),
                None,
            )
            .map_err(|e| DictadError::Device {
                message: format!("Failed to build native f32 stream: {}", e),
            }),
        fmt => Err(DictadError::Device {
            message: format!(
                "Unsupported native sample format: {:?}. \
                 Try specifying a device with --device.",
                fmt
            ),
        }),
    }
}

/// Mix multi-channel audio to mono and resample to the target rate.
fn convert_to_mono_target_rate(
    samples: &[i16],
    channels: usize,
    source_rate: u32,
    target_rate: u32,
) -> Vec<i16> {
    // Mix to mono by averaging channels
    let mono: Vec<i16> = if channels == 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    };

    // Resample if needed
    if source_rate == target_rate {
        mono
    } else {
        crate::audio::wav::resample(&mono, source_rate, target_rate)
    }
}

/// Body of the capture thread.
///
/// Builds and plays the stream, verifies the callback actually fires, then
/// drains the callback buffer every half frame until shutdown. Build or
/// stream failures turn into a single `DeviceError` event.
fn run_capture(
    device_name: Option<String>,
    sample_rate: u32,
    frame_ms: u32,
    shutdown: Arc<AtomicBool>,
    tx: mpsc::Sender<FrameEvent>,
) {
    let device_error = |message: String| FrameEvent::DeviceError { message };

    let device = match resolve_device(device_name.as_deref()) {
        Ok(device) => device,
        Err(e) => {
            let _ = tx.blocking_send(device_error(e.to_string()));
            return;
        }
    };

    let shared = Arc::new(CaptureShared::new());
    let stream = match build_stream(&device, sample_rate, &shared) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx.blocking_send(device_error(e.to_string()));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = tx.blocking_send(device_error(format!("Failed to start audio stream: {}", e)));
        return;
    }

    // Wait briefly to check if the CPAL callback actually fires.
    // Some PipeWire-ALSA setups accept non-native configs but never deliver data.
    std::thread::sleep(Duration::from_millis(200));

    let _stream = if shared.callback_count.load(Ordering::Relaxed) == 0 {
        // Preferred config didn't deliver data — stop it, clear buffer, try native
        drop(stream);
        shared.drain();

        let native_stream = match build_stream_native(&device, sample_rate, &shared) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.blocking_send(device_error(e.to_string()));
                return;
            }
        };
        if let Err(e) = native_stream.play() {
            let _ = tx.blocking_send(device_error(format!(
                "Failed to start native audio stream: {}",
                e
            )));
            return;
        }
        native_stream
    } else {
        stream
    };

    let frame_samples = (sample_rate as usize * frame_ms as usize) / 1000;
    let tick = Duration::from_millis(u64::from(frame_ms) / 2);
    let mut pending: Vec<i16> = Vec::new();
    let mut sequence = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(tick);

        if let Some(message) = shared.take_error() {
            let _ = tx.blocking_send(device_error(message));
            return;
        }

        pending.extend(shared.drain());
        while pending.len() >= frame_samples {
            let samples: Vec<i16> = pending.drain(..frame_samples).collect();
            let frame = AudioFrame::new(sequence, sample_rate, samples);
            if tx.blocking_send(FrameEvent::Frame(frame)).is_err() {
                // Receiver gone: the session is done with us
                return;
            }
            sequence += 1;
        }
    }

    // Flush the partial tail so the last word isn't clipped
    pending.extend(shared.drain());
    if !pending.is_empty() {
        let frame = AudioFrame::new(sequence, sample_rate, std::mem::take(&mut pending));
        let _ = tx.blocking_send(FrameEvent::Frame(frame));
    }
    let _ = tx.blocking_send(FrameEvent::EndOfStream);

    debug!("audio capture thread exiting");
}

/// Real audio capture implementation using CPAL.
///
/// Captures 16-bit PCM audio at 16kHz mono, as required by Whisper.
/// Tries the preferred format first (i16/16kHz/mono), then falls back to the
/// device's default config with software conversion (channel mixing + resampling).
pub struct CpalAudioSource {
    device_name: Option<String>,
    sample_rate: u32,
    frame_ms: u32,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CpalAudioSource {
    /// Create a new CPAL audio source.
    ///
    /// # Arguments
    /// * `device_name` - Optional device name. If None, uses the default input device.
    ///
    /// # Errors
    /// Returns `DictadError::AudioDeviceNotFound` if the named device does not
    /// exist, or `DictadError::Device` if enumeration fails.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        // Resolve once up front so a bad --device fails at session start,
        // not asynchronously from the capture thread.
        let device = resolve_device(device_name)?;
        drop(device);

        Ok(Self {
            device_name: device_name.map(str::to_string),
            sample_rate: defaults::SAMPLE_RATE,
            frame_ms: defaults::CAPTURE_FRAME_MS,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }
}

impl AudioSource for CpalAudioSource {
    fn open(&mut self) -> Result<FrameStream> {
        if self.worker.is_some() {
            return Err(DictadError::Device {
                message: "Capture already running".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(32);
        self.shutdown = Arc::new(AtomicBool::new(false));

        let device_name = self.device_name.clone();
        let sample_rate = self.sample_rate;
        let frame_ms = self.frame_ms;
        let shutdown = Arc::clone(&self.shutdown);

        let worker = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture(device_name, sample_rate, frame_ms, shutdown, tx))
            .map_err(|e| DictadError::Device {
                message: format!("Failed to spawn capture thread: {}", e),
            })?;

        self.worker = Some(worker);
        Ok(FrameStream::new(rx))
    }

    fn close(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            return Err(DictadError::Device {
                message: "Capture thread panicked".to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for CpalAudioSource {
    fn drop(&mut self) {
        // Signal only; the thread exits on its own once the receiver is gone
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
