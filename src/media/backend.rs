//! Capture Backend - Geräte-Zugriff hinter einer Capability-Schnittstelle
//!
//! Die `MediaSource` kennt nur den `CaptureBackend`-Trait; der konkrete
//! Geräte-Zugriff (cpal, nokhwa) steckt in `DeviceCapture`. Tests
//! ersetzen das Backend durch einen Mock.

use super::audio::AudioEngine;
use super::tracks::{LocalTrack, TrackKind};
use crate::config::VideoConstraints;
use async_trait::async_trait;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::{query, CallbackCamera};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Camera/microphone unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Audio(#[from] super::audio::AudioError),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Display capture error: {0}")]
    Display(String),
}

// ============================================================================
// CAPTURE BACKEND TRAIT
// ============================================================================

/// Capability-Schnittstelle über die lokale Medien-Aufnahme
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Fordert Mikrofon + Kamera an. Schlägt als Ganzes fehl wenn
    /// eines der Geräte fehlt oder der Zugriff verweigert wird.
    async fn acquire_user_media(
        &self,
        video: &VideoConstraints,
    ) -> Result<Vec<Arc<LocalTrack>>, MediaError>;

    /// Fordert einen Bildschirmfreigabe-Track an
    async fn acquire_display_media(&self) -> Result<Arc<LocalTrack>, MediaError>;

    /// Aktueller Mikrofon-Pegel (0.0 - 1.0), 0.0 ohne laufende Aufnahme
    fn input_level(&self) -> f32 {
        0.0
    }
}

// ============================================================================
// DEVICE CAPTURE
// ============================================================================

/// Konkretes Backend über die lokalen Geräte (cpal + nokhwa)
pub struct DeviceCapture {
    audio: Arc<Mutex<Option<AudioEngine>>>,
    camera: Arc<Mutex<Option<CallbackCamera>>>,
}

impl DeviceCapture {
    pub fn new() -> Self {
        Self {
            audio: Arc::new(Mutex::new(None)),
            camera: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for DeviceCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureBackend for DeviceCapture {
    async fn acquire_user_media(
        &self,
        video: &VideoConstraints,
    ) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
        // Mikrofon
        let mic_track = Arc::new(LocalTrack::new(TrackKind::Audio, "microphone"));
        let mic_enabled = mic_track.enabled_flag();

        let engine = tokio::task::spawn_blocking(move || AudioEngine::start(mic_enabled))
            .await
            .map_err(|e| MediaError::Unavailable(e.to_string()))??;

        // Kamera
        let cam_track = Arc::new(LocalTrack::new(TrackKind::Video, "camera"));
        let cam_enabled = cam_track.enabled_flag();
        let constraints = *video;

        let camera = tokio::task::spawn_blocking(move || open_camera(&constraints, cam_enabled))
            .await
            .map_err(|e| MediaError::Unavailable(e.to_string()))?;

        let camera = match camera {
            Ok(camera) => camera,
            Err(e) => {
                // Teilweise Anfragen scheitern als Ganzes, wie bei
                // getUserMedia: Mikrofon wieder freigeben
                tracing::warn!("Camera acquisition failed: {}", e);
                return Err(e);
            }
        };

        *self.audio.lock() = Some(engine);
        *self.camera.lock() = Some(camera);

        // Aufräum-Hooks: stop() auf dem Track gibt das Gerät frei
        let audio_slot = Arc::clone(&self.audio);
        mic_track.set_stop_hook(move || {
            if let Some(mut engine) = audio_slot.lock().take() {
                engine.stop();
            }
        });

        let camera_slot = Arc::clone(&self.camera);
        cam_track.set_stop_hook(move || {
            // Drop der CallbackCamera beendet den Stream
            camera_slot.lock().take();
        });

        tracing::info!("Local media acquired (microphone + camera)");
        Ok(vec![mic_track, cam_track])
    }

    async fn acquire_display_media(&self) -> Result<Arc<LocalTrack>, MediaError> {
        // Der Track existiert ab hier und kann per replace_track in die
        // Session eingehängt werden; die Frame-Pipeline hängt an der
        // Encoder-Integration.
        // TODO: Bildschirmaufnahme über xdg-desktop-portal (Linux) bzw.
        // Graphics.Capture (Windows) anbinden sobald der VP8-Encoder steht.
        let track = Arc::new(LocalTrack::new(TrackKind::Video, "screen"));
        tracing::info!("Display capture track created: {}", track.id());
        Ok(track)
    }

    fn input_level(&self) -> f32 {
        self.audio
            .lock()
            .as_ref()
            .map(|engine| engine.input_level())
            .unwrap_or(0.0)
    }
}

/// Öffnet die erste verfügbare Kamera mit dem Format, das den
/// Constraints am nächsten kommt
fn open_camera(
    constraints: &VideoConstraints,
    enabled: Arc<AtomicBool>,
) -> Result<CallbackCamera, MediaError> {
    let cameras = query(ApiBackend::Auto).map_err(|e| MediaError::Camera(e.to_string()))?;

    let info = cameras
        .first()
        .ok_or_else(|| MediaError::Unavailable("no camera device found".to_string()))?;

    tracing::info!("Opening camera: {}", info.human_name());

    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
        CameraFormat::new(
            Resolution::new(constraints.width, constraints.height),
            FrameFormat::MJPEG,
            constraints.frame_rate,
        ),
    ));

    let mut camera = CallbackCamera::new(info.index().clone(), requested, move |_buffer| {
        if !enabled.load(Ordering::Relaxed) {
            // Kamera aus: Frames verwerfen, Stream läuft weiter
            return;
        }
        // TODO: Frames an den VP8-Encoder übergeben sobald er angebunden ist
    })
    .map_err(|e| MediaError::Camera(e.to_string()))?;

    camera
        .open_stream()
        .map_err(|e| MediaError::Camera(e.to_string()))?;

    Ok(camera)
}

/// Listet die verfügbaren Kameras auf (für die Geräte-Auswahl im UI)
pub fn list_cameras() -> Result<Vec<String>, MediaError> {
    let cameras = query(ApiBackend::Auto).map_err(|e| MediaError::Camera(e.to_string()))?;
    Ok(cameras.iter().map(|c| c.human_name()).collect())
}
