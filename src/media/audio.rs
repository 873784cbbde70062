//! Audio Engine - Mikrofon-Capture und Lautsprecher-Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Ein deaktivierter
//! Audio-Track (Mute) schreibt Stille in den Capture-Buffer statt
//! den Stream zu beenden - die Gegenseite empfängt weiter Frames.
//!
//! Hinweis: Opus Encoding/Decoding folgt sobald der Codec-Unterbau
//! angebunden ist; bis dahin bleibt der Buffer-Inhalt lokal.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, der WebRTC-Standard)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Sprache)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz)
pub const FRAME_SIZE: usize = 960;

/// Kapazität der Audio-Ring-Buffer
const RING_CAPACITY: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start audio stream: {0}")]
    StreamStart(String),
}

// ============================================================================
// AUDIO ENGINE
// ============================================================================

/// Mikrofon-Capture und Lautsprecher-Playback
///
/// Note: cpal-Streams sind nicht Send, die Engine wird daher nur
/// hinter einem Lock im Capture-Backend gehalten.
pub struct AudioEngine {
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,

    /// Aufgenommenes Audio (Raw PCM, 48kHz mono)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Zu spielendes Audio (decoded PCM)
    playback_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Eingangspegel (0.0 - 1.0) für die Visualisierung
    input_level: Arc<Mutex<f32>>,
}

unsafe impl Send for AudioEngine {}

impl AudioEngine {
    /// Startet Capture und (falls ein Ausgabegerät existiert) Playback.
    ///
    /// `enabled` ist das Flag des zugehörigen Audio-Tracks: solange es
    /// false ist, landet Stille im Capture-Buffer.
    pub fn start(enabled: Arc<AtomicBool>) -> Result<Self, AudioError> {
        let host = cpal::default_host();

        let input_device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
        let output_device = host.default_output_device();

        if output_device.is_none() {
            tracing::warn!("No audio output device found, playback disabled");
        }

        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_CAPACITY)));
        let playback_buffer = Arc::new(Mutex::new(HeapRb::new(RING_CAPACITY)));
        let input_level = Arc::new(Mutex::new(0.0f32));

        let mut engine = Self {
            input_stream: None,
            output_stream: None,
            capture_buffer,
            playback_buffer,
            input_level,
        };

        engine.start_capture(&input_device, enabled)?;
        if let Some(device) = output_device {
            engine.start_playback(&device)?;
        }

        tracing::info!(
            "AudioEngine started: {}Hz, {} channel(s)",
            SAMPLE_RATE,
            CHANNELS
        );

        Ok(engine)
    }

    /// Liest einen 20ms-Frame aus dem Capture-Buffer
    // TODO: vom RTP-Sender-Task konsumieren sobald der Opus-Encoder
    // angebunden ist (siehe backend.rs)
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }

        let mut frame = Vec::with_capacity(FRAME_SIZE);
        for _ in 0..FRAME_SIZE {
            if let Some(sample) = buffer.try_pop() {
                frame.push(sample);
            }
        }
        Some(frame)
    }

    /// Schreibt Samples in den Playback-Buffer
    // TODO: vom RTP-Empfänger-Task befüllen sobald der Opus-Decoder
    // angebunden ist
    pub fn write_samples(&self, samples: &[f32]) {
        let mut buffer = self.playback_buffer.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    /// Gibt den aktuellen Eingangspegel zurück (0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    /// Stoppt alle Streams
    pub fn stop(&mut self) {
        self.input_stream = None;
        self.output_stream = None;
        tracing::info!("Audio streams stopped");
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn start_capture(
        &mut self,
        device: &Device,
        enabled: Arc<AtomicBool>,
    ) -> Result<(), AudioError> {
        let config = select_config(
            device
                .supported_input_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
                .collect(),
        )?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let input_level = Arc::clone(&self.input_level);
        let source_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Pegel berechnen (RMS)
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *input_level.lock() = rms.min(1.0);

                    let samples = resample_linear(data, source_rate, SAMPLE_RATE);
                    let muted = !enabled.load(Ordering::Relaxed);

                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        // Mute liefert Stille, kein Stream-Ende
                        let _ = buffer.try_push(if muted { 0.0 } else { sample });
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamStart(e.to_string()))?;

        self.input_stream = Some(stream);
        Ok(())
    }

    fn start_playback(&mut self, device: &Device) -> Result<(), AudioError> {
        let config = select_config(
            device
                .supported_output_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
                .collect(),
        )?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let playback_buffer = Arc::clone(&self.playback_buffer);
        let channels = config.channels as usize;
        let ratio = SAMPLE_RATE as f32 / config.sample_rate.0 as f32;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = playback_buffer.lock();
                    let frames = data.len() / channels;

                    for i in 0..frames {
                        // Nearest-Neighbour reicht hier, der Buffer läuft
                        // ohnehin auf der Ziel-Rate voll
                        let take = ((i + 1) as f32 * ratio) as usize > (i as f32 * ratio) as usize;
                        let sample = if take {
                            buffer.try_pop().unwrap_or(0.0)
                        } else {
                            0.0
                        };

                        for c in 0..channels {
                            if let Some(s) = data.get_mut(i * channels + c) {
                                *s = sample;
                            }
                        }
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamStart(e.to_string()))?;

        self.output_stream = Some(stream);
        Ok(())
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Einfaches Linear-Resampling auf die Ziel-Rate
fn resample_linear(data: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return data.to_vec();
    }

    let ratio = to_rate as f32 / from_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;

    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Wählt die beste Stream-Konfiguration aus
/// (Priorität: 48kHz und F32, dann Fallbacks)
fn select_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Ok(config.with_max_sample_rate().into());
        }
    }

    if let Some(config) = configs.first() {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(AudioError::UnsupportedConfig(
        "No suitable audio configuration found".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let data = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&data, 48000, 48000), data);
    }

    #[test]
    fn test_resample_upsamples_length() {
        let data = vec![0.0; 441];
        let resampled = resample_linear(&data, 44100, 48000);
        assert_eq!(resampled.len(), 480);
    }

    #[test]
    fn test_select_config_rejects_empty() {
        assert!(select_config(Vec::new()).is_err());
    }
}
