//! Media Source - die lokalen Aufnahme-Tracks und ihre Flags
//!
//! Hält die (höchstens eine) Menge lokaler Tracks, die Enable-Flags
//! pro Art und den optionalen Bildschirmfreigabe-Track. Alle
//! Netzwerk-Seiteneffekte (Track-Substitution in der Session) liegen
//! beim CallManager, hier gibt es nur Track-Lifecycle.

use super::backend::{CaptureBackend, MediaError};
use super::tracks::{LocalTrack, TrackKind, TrackSet};
use crate::config::VideoConstraints;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Die lokale Media Source (Kamera + Mikrofon, optional Bildschirm)
pub struct MediaSource {
    backend: Arc<dyn CaptureBackend>,
    tracks: RwLock<Option<TrackSet>>,
    screen: Mutex<Option<Arc<LocalTrack>>>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
}

impl MediaSource {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            tracks: RwLock::new(None),
            screen: Mutex::new(None),
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
        }
    }

    /// Fordert Mikrofon + Kamera an. Bei Ablehnung oder fehlenden
    /// Geräten bleibt die Source leer - Anrufe sind dann blockiert,
    /// die Anwendung läuft weiter.
    pub async fn acquire(&self, video: &VideoConstraints) -> Result<(), MediaError> {
        if self.tracks.read().is_some() {
            return Ok(());
        }

        let tracks = self.backend.acquire_user_media(video).await?;
        let set = TrackSet::new(tracks);

        set.set_enabled(TrackKind::Audio, self.audio_enabled.load(Ordering::Relaxed));
        set.set_enabled(TrackKind::Video, self.video_enabled.load(Ordering::Relaxed));

        *self.tracks.write() = Some(set);
        Ok(())
    }

    /// Ob lokale Medien vorhanden sind (Voraussetzung für Anrufe)
    pub fn is_ready(&self) -> bool {
        self.tracks
            .read()
            .as_ref()
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    /// Die aktuellen lokalen Tracks
    pub fn track_set(&self) -> Option<TrackSet> {
        self.tracks.read().clone()
    }

    /// Der Kamera-Track (für die Rückkehr von der Bildschirmfreigabe)
    pub fn camera_track(&self) -> Option<Arc<LocalTrack>> {
        self.tracks.read().as_ref().and_then(|set| set.first_video())
    }

    /// Aktueller Mikrofon-Pegel (für die Visualisierung im UI)
    pub fn input_level(&self) -> f32 {
        self.backend.input_level()
    }

    // ========================================================================
    // ENABLE FLAGS
    // ========================================================================

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::Relaxed)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
        if let Some(set) = self.tracks.read().as_ref() {
            set.set_enabled(TrackKind::Audio, enabled);
        }
        tracing::debug!("Audio {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::Relaxed);
        if let Some(set) = self.tracks.read().as_ref() {
            set.set_enabled(TrackKind::Video, enabled);
        }
        tracing::debug!("Video {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Kippt das Audio-Flag, gibt den neuen Zustand zurück
    pub fn toggle_audio(&self) -> bool {
        let enabled = !self.audio_enabled();
        self.set_audio_enabled(enabled);
        enabled
    }

    /// Kippt das Video-Flag, gibt den neuen Zustand zurück
    pub fn toggle_video(&self) -> bool {
        let enabled = !self.video_enabled();
        self.set_video_enabled(enabled);
        enabled
    }

    // ========================================================================
    // SCREEN SHARE
    // ========================================================================

    /// Fordert den Bildschirmfreigabe-Track an. Läuft bereits eine
    /// Freigabe, wird deren Track zurückgegeben.
    pub async fn start_screen_share(&self) -> Result<Arc<LocalTrack>, MediaError> {
        if let Some(track) = self.screen.lock().clone() {
            return Ok(track);
        }

        let track = self.backend.acquire_display_media().await?;

        let mut slot = self.screen.lock();
        if let Some(existing) = slot.clone() {
            // Paralleler Start hat gewonnen, den neuen Track verwerfen
            track.stop();
            return Ok(existing);
        }
        *slot = Some(Arc::clone(&track));

        Ok(track)
    }

    /// Nimmt den Bildschirm-Track aus dem Slot (idempotent: None wenn
    /// keine Freigabe läuft). Der Aufrufer stoppt den Track und stellt
    /// die Kamera in der Session wieder her.
    pub fn end_screen_share(&self) -> Option<Arc<LocalTrack>> {
        self.screen.lock().take()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.lock().is_some()
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Stoppt alle lokalen Tracks (Kamera, Mikrofon, Bildschirm).
    /// Best-effort für den Prozess-Teardown.
    pub fn release_all(&self) {
        if let Some(set) = self.tracks.write().take() {
            set.stop_all();
        }
        if let Some(screen) = self.end_screen_share() {
            screen.stop();
        }
        tracing::info!("All local tracks released");
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("ready", &self.is_ready())
            .field("audio_enabled", &self.audio_enabled())
            .field("video_enabled", &self.video_enabled())
            .field("screen_sharing", &self.is_screen_sharing())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingBackend, MockBackend};

    fn ready_source() -> (Arc<MediaSource>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let source = Arc::new(MediaSource::new(backend.clone()));
        (source, backend)
    }

    #[tokio::test]
    async fn test_acquire_failure_leaves_source_empty() {
        let source = MediaSource::new(Arc::new(FailingBackend));
        let result = source.acquire(&VideoConstraints::default()).await;

        assert!(result.is_err());
        assert!(!source.is_ready());
        assert!(source.track_set().is_none());
    }

    #[tokio::test]
    async fn test_toggle_parity() {
        let (source, _) = ready_source();
        source.acquire(&VideoConstraints::default()).await.unwrap();

        // Gerade Anzahl Toggles stellt den Ausgangszustand wieder her
        for _ in 0..4 {
            source.toggle_audio();
        }
        assert!(source.audio_enabled());

        for _ in 0..3 {
            source.toggle_video();
        }
        assert!(!source.video_enabled());
        source.toggle_video();
        assert!(source.video_enabled());
    }

    #[tokio::test]
    async fn test_toggle_applies_to_tracks() {
        let (source, _) = ready_source();
        source.acquire(&VideoConstraints::default()).await.unwrap();

        source.toggle_audio();

        let set = source.track_set().unwrap();
        for track in set.tracks() {
            match track.kind() {
                TrackKind::Audio => assert!(!track.is_enabled()),
                TrackKind::Video => assert!(track.is_enabled()),
            }
        }
    }

    #[tokio::test]
    async fn test_screen_share_slot_is_taken_once() {
        let (source, _) = ready_source();
        source.acquire(&VideoConstraints::default()).await.unwrap();

        assert!(source.end_screen_share().is_none());

        let track = source.start_screen_share().await.unwrap();
        assert!(source.is_screen_sharing());

        let taken = source.end_screen_share().unwrap();
        assert_eq!(taken.id(), track.id());

        // Zweites Beenden ist ein No-op
        assert!(source.end_screen_share().is_none());
        assert!(!source.is_screen_sharing());
    }

    #[tokio::test]
    async fn test_start_screen_share_is_idempotent() {
        let (source, _) = ready_source();

        let first = source.start_screen_share().await.unwrap();
        let second = source.start_screen_share().await.unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_release_all_clears_everything() {
        let (source, _) = ready_source();
        source.acquire(&VideoConstraints::default()).await.unwrap();
        source.start_screen_share().await.unwrap();

        source.release_all();

        assert!(!source.is_ready());
        assert!(!source.is_screen_sharing());
    }
}
