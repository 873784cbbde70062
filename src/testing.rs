//! Test-Doubles für Capture-Backend und Session-Dienst
//!
//! `MockBackend` liefert Tracks ohne Geräte-Zugriff, `MockSession` und
//! `MockPeerService` zeichnen ihre Aufrufe auf und lassen Tests
//! Session-Events von Hand auslösen.

use crate::config::VideoConstraints;
use crate::media::{CaptureBackend, LocalTrack, MediaError, TrackKind, TrackSet};
use crate::peer::{CallSession, PeerError, PeerService, SessionEvent, SessionHandle};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// CAPTURE BACKENDS
// ============================================================================

/// Backend das Mikrofon- und Kamera-Tracks ohne Geräte erzeugt
pub struct MockBackend {
    last_display: Mutex<Option<Arc<LocalTrack>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            last_display: Mutex::new(None),
        }
    }

    /// Der zuletzt erzeugte Bildschirm-Track (zum Auslösen von
    /// `notify_ended` im Test)
    pub fn last_display_track(&self) -> Option<Arc<LocalTrack>> {
        self.last_display.lock().clone()
    }
}

#[async_trait]
impl CaptureBackend for MockBackend {
    async fn acquire_user_media(
        &self,
        _video: &VideoConstraints,
    ) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
        Ok(vec![
            Arc::new(LocalTrack::new(TrackKind::Audio, "microphone")),
            Arc::new(LocalTrack::new(TrackKind::Video, "camera")),
        ])
    }

    async fn acquire_display_media(&self) -> Result<Arc<LocalTrack>, MediaError> {
        let track = Arc::new(LocalTrack::new(TrackKind::Video, "screen"));
        *self.last_display.lock() = Some(Arc::clone(&track));
        Ok(track)
    }
}

/// Backend das jede Anfrage ablehnt (Zugriff verweigert)
pub struct FailingBackend;

#[async_trait]
impl CaptureBackend for FailingBackend {
    async fn acquire_user_media(
        &self,
        _video: &VideoConstraints,
    ) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
        Err(MediaError::Unavailable("capture denied".to_string()))
    }

    async fn acquire_display_media(&self) -> Result<Arc<LocalTrack>, MediaError> {
        Err(MediaError::Unavailable("capture denied".to_string()))
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Session-Double das Aufrufe aufzeichnet und Events auf Kommando sendet
pub struct MockSession {
    remote: String,
    answered: AtomicBool,
    fail_answer: AtomicBool,
    closed: AtomicBool,
    replaced: Mutex<Vec<String>>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl MockSession {
    /// Erzeugt Session und zugehöriges Handle (Receiver inklusive)
    pub fn handle(remote: &str) -> (Arc<Self>, SessionHandle) {
        let (event_tx, events) = mpsc::channel(16);

        let session = Arc::new(Self {
            remote: remote.to_string(),
            answered: AtomicBool::new(false),
            fail_answer: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            replaced: Mutex::new(Vec::new()),
            event_tx,
        });

        let handle = SessionHandle {
            session: Arc::clone(&session) as Arc<dyn CallSession>,
            events,
        };

        (session, handle)
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.try_send(event);
    }

    pub fn fail_next_answer(&self) {
        self.fail_answer.store(true, Ordering::SeqCst);
    }

    pub fn was_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Labels der Tracks, die per `replace_outgoing_video` gesetzt wurden
    pub fn replaced_labels(&self) -> Vec<String> {
        self.replaced.lock().clone()
    }
}

#[async_trait]
impl CallSession for MockSession {
    fn remote_identity(&self) -> String {
        self.remote.clone()
    }

    async fn answer(&self, _tracks: &TrackSet) -> Result<(), PeerError> {
        if self.fail_answer.swap(false, Ordering::SeqCst) {
            return Err(PeerError::Transport("answer failed".to_string()));
        }
        self.answered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn replace_outgoing_video(&self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        self.replaced.lock().push(track.label().to_string());
        Ok(())
    }
}

// ============================================================================
// PEER SERVICE
// ============================================================================

/// Dienst-Double das pro `place_call` eine neue `MockSession` ausgibt
pub struct MockPeerService {
    identity: Mutex<Option<String>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    fail_next: AtomicBool,
    delay: Mutex<Option<Duration>>,
    destroyed: AtomicBool,
}

impl MockPeerService {
    pub fn new() -> Self {
        Self {
            identity: Mutex::new(Some("peer-local".to_string())),
            sessions: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            delay: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn fail_next_place_call(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Verzögert `place_call`, um Abbruch während des Wählens zu testen
    pub fn set_place_call_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Die zuletzt ausgegebene Session
    pub fn last_session(&self) -> Arc<MockSession> {
        self.sessions
            .lock()
            .last()
            .cloned()
            .expect("no session was created")
    }

    pub fn was_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerService for MockPeerService {
    fn local_identity(&self) -> Option<String> {
        self.identity.lock().clone()
    }

    async fn place_call(
        &self,
        remote: &str,
        _tracks: &TrackSet,
    ) -> Result<SessionHandle, PeerError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PeerError::Transport("dial failed".to_string()));
        }

        let (session, handle) = MockSession::handle(remote);
        self.sessions.lock().push(session);
        Ok(handle)
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}
