//! Track-Typen für lokale und entfernte Medien
//!
//! Ein `LocalTrack` koppelt einen WebRTC-Track mit dem Enable-Flag,
//! das die Capture-Pipeline liest: ein deaktivierter Audio-Track
//! liefert Stille, ein deaktivierter Video-Track keine Frames. Die
//! Gegenseite sieht dadurch nie ein Stream-Removal, nur leere Medien.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Stream-ID unter der alle lokalen Tracks gruppiert werden
const STREAM_ID: &str = "lumen";

// ============================================================================
// TRACK KIND
// ============================================================================

/// Art eines Media-Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

// ============================================================================
// LOCAL TRACK
// ============================================================================

type Hook = Box<dyn FnOnce() + Send>;

/// Ein lokaler Media-Track (Mikrofon, Kamera oder Bildschirm)
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: Arc<AtomicBool>,
    rtc: Arc<TrackLocalStaticRTP>,
    /// Wird aufgerufen wenn die Quelle von außen endet (z.B. Fenster
    /// der Bildschirmfreigabe geschlossen). Ein explizites `stop()`
    /// löst den Hook nicht aus.
    on_ended: Mutex<Option<Hook>>,
    /// Räumt die Capture-Pipeline auf (Kamera-Stream, Audio-Engine)
    stop_hook: Mutex<Option<Hook>>,
}

impl LocalTrack {
    /// Erstellt einen neuen Track mit der Standard-Codec-Capability
    /// seiner Art (Opus für Audio, VP8 für Video)
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        let label = label.into();

        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        let rtc = Arc::new(TrackLocalStaticRTP::new(
            capability,
            id.clone(),
            STREAM_ID.to_string(),
        ));

        Self {
            id,
            kind,
            label,
            enabled: Arc::new(AtomicBool::new(true)),
            rtc,
            on_ended: Mutex::new(None),
            stop_hook: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Schaltet den Track stumm bzw. wieder aktiv. Rein lokaler
    /// Effekt, es findet keine Neuverhandlung statt.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Gibt das Flag zurück, das die Capture-Pipeline liest
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }

    /// Der unterliegende WebRTC-Track (für `add_track`/`replace_track`)
    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.rtc) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Registriert den Ende-Hook. Läuft höchstens einmal.
    pub fn set_on_ended(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_ended.lock() = Some(Box::new(hook));
    }

    /// Registriert den Aufräum-Hook für die Capture-Pipeline
    pub fn set_stop_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.stop_hook.lock() = Some(Box::new(hook));
    }

    /// Meldet dass die Quelle von außen geendet hat
    pub fn notify_ended(&self) {
        if let Some(hook) = self.on_ended.lock().take() {
            hook();
        }
    }

    /// Stoppt den Track und seine Capture-Pipeline. Idempotent, und
    /// der Ende-Hook wird dabei bewusst verworfen statt ausgelöst.
    pub fn stop(&self) {
        self.on_ended.lock().take();
        if let Some(hook) = self.stop_hook.lock().take() {
            hook();
        }
        tracing::debug!("Track stopped: {} ({})", self.label, self.kind.as_str());
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ============================================================================
// TRACK SET
// ============================================================================

/// Die Menge der lokalen Tracks einer Media Source
#[derive(Debug, Clone, Default)]
pub struct TrackSet {
    tracks: Vec<Arc<LocalTrack>>,
}

impl TrackSet {
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self { tracks }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// Setzt das Enable-Flag auf allen Tracks einer Art
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    /// Der erste Video-Track (die Kamera)
    pub fn first_video(&self) -> Option<Arc<LocalTrack>> {
        self.tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .cloned()
    }

    /// Stoppt alle Tracks
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

// ============================================================================
// REMOTE TRACKS
// ============================================================================

/// Beschreibung eines empfangenen Tracks der Gegenseite
#[derive(Debug, Clone, Serialize)]
pub struct RemoteTrack {
    pub id: String,
    #[serde(rename = "streamId")]
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Die empfangenen Tracks der Gegenseite
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteTrackSet {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteTrackSet {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn set_with_one_audio_one_video() -> TrackSet {
        TrackSet::new(vec![
            Arc::new(LocalTrack::new(TrackKind::Audio, "microphone")),
            Arc::new(LocalTrack::new(TrackKind::Video, "camera")),
        ])
    }

    #[test]
    fn test_set_enabled_only_touches_kind() {
        let set = set_with_one_audio_one_video();
        set.set_enabled(TrackKind::Audio, false);

        let audio = &set.tracks()[0];
        let video = &set.tracks()[1];
        assert!(!audio.is_enabled());
        assert!(video.is_enabled());
    }

    #[test]
    fn test_stop_discards_ended_hook() {
        let fired = Arc::new(AtomicUsize::new(0));
        let track = LocalTrack::new(TrackKind::Video, "screen");

        let fired_clone = Arc::clone(&fired);
        track.set_on_ended(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        track.stop();
        // Nach stop() darf ein spätes notify_ended nichts mehr auslösen
        track.notify_ended();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_notify_ended_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let track = LocalTrack::new(TrackKind::Video, "screen");

        let fired_clone = Arc::clone(&fired);
        track.set_on_ended(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        track.notify_ended();
        track.notify_ended();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_first_video_returns_camera() {
        let set = set_with_one_audio_one_video();
        let video = set.first_video().unwrap();
        assert_eq!(video.kind(), TrackKind::Video);
        assert_eq!(video.label(), "camera");
    }
}
