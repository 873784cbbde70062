//! Call Manager - der Zustandsautomat über der Session
//!
//! Orchestriert Media Source und Session-Dienst: ausgehende und
//! eingehende Anrufe, Auflegen von beiden Seiten, Bildschirmfreigabe.
//! Es existiert höchstens eine Session; ein Generationszähler
//! serialisiert das Installieren einer neuen Session gegen ein
//! gleichzeitiges Auflegen, damit keine verwaiste Verbindung
//! zurückbleibt.

use crate::media::{MediaError, MediaSource, RemoteTrackSet};
use crate::peer::{PeerError, PeerEvent, PeerService, SessionEvent, SessionHandle};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Call target must not be empty")]
    InvalidTarget,

    #[error("Local media not acquired")]
    NoLocalMedia,

    #[error("A call is already in progress")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Zustand des Anruf-Automaten
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallState {
    /// Kein Anruf
    Idle,
    /// Anruf wird aufgebaut (lokal gewählt oder eingehend angenommen)
    Dialing { remote: String },
    /// Medien der Gegenseite sind eingetroffen
    Active { remote: String },
}

// ============================================================================
// UI EVENTS
// ============================================================================

/// Events für die Oberfläche
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Zustandswechsel des Automaten
    StateChanged { state: CallState },
    /// Remote-Tracks sind verfügbar
    RemoteStream(RemoteTrackSet),
    /// Bildschirmfreigabe gestartet/beendet
    ScreenShare { active: bool },
    /// Dienst verbunden, eigene Identity bekannt
    ServiceReady { identity: String },
    /// Verbindung zum Dienst verloren
    ServiceDown,
    /// Fehler, der dem Benutzer angezeigt werden soll
    Error(String),
}

// ============================================================================
// CALL MANAGER
// ============================================================================

pub struct CallManager {
    service: Arc<dyn PeerService>,
    media: Arc<MediaSource>,
    state: Mutex<CallState>,
    session: Mutex<Option<Arc<dyn crate::peer::CallSession>>>,
    /// Wird bei jedem Anruf-Start und -Ende erhöht. Ein Teardown wirkt
    /// nur wenn seine Generation noch aktuell ist, und eine Session aus
    /// einem überholten Wählversuch wird bei Ankunft geschlossen.
    generation: AtomicU64,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallManager {
    pub fn new(service: Arc<dyn PeerService>, media: Arc<MediaSource>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);

        Arc::new(Self {
            service,
            media,
            state: Mutex::new(CallState::Idle),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            event_tx,
        })
    }

    /// Gibt einen Event-Receiver für die Oberfläche zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> CallState {
        self.state.lock().clone()
    }

    pub fn media(&self) -> &Arc<MediaSource> {
        &self.media
    }

    /// Konsumiert die Dienst-Events in einem eigenen Task
    pub fn run_service_events(self: &Arc<Self>, mut events: mpsc::Receiver<PeerEvent>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_service_event(event).await;
            }
        });
    }

    // ========================================================================
    // OUTGOING CALLS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    pub async fn place_call(self: &Arc<Self>, remote: &str) -> Result<(), CallError> {
        let remote = remote.trim();
        if remote.is_empty() {
            return Err(CallError::InvalidTarget);
        }

        let tracks = self
            .media
            .track_set()
            .filter(|set| !set.is_empty())
            .ok_or(CallError::NoLocalMedia)?;

        let gen = self.begin(remote.to_string())?;
        self.emit_state();

        tracing::info!("Placing call to {}", remote);

        let handle = match self.service.place_call(remote, &tracks).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Failed to place call: {}", e);
                self.finish_call(gen).await;
                return Err(e.into());
            }
        };

        // Wurde während des Wählens aufgelegt, die verspätete Session
        // sofort wieder schließen
        if self.generation.load(Ordering::SeqCst) != gen {
            tracing::info!("Call to {} was cancelled while dialing", remote);
            handle.session.close().await;
            return Ok(());
        }

        self.install_session(handle, gen);
        Ok(())
    }

    // ========================================================================
    // INCOMING CALLS
    // ========================================================================

    /// Nimmt einen eingehenden Anruf an, sofern Idle und Medien bereit.
    /// Andernfalls wird die Session abgelehnt (geschlossen).
    async fn handle_incoming(self: &Arc<Self>, handle: SessionHandle) {
        let remote = handle.session.remote_identity();

        let tracks = self.media.track_set().filter(|set| !set.is_empty());
        let Some(tracks) = tracks else {
            tracing::warn!("Rejecting call from {}: no local media", remote);
            handle.session.close().await;
            return;
        };

        let gen = match self.begin(remote.clone()) {
            Ok(gen) => gen,
            Err(_) => {
                tracing::warn!("Rejecting call from {}: already in a call", remote);
                handle.session.close().await;
                return;
            }
        };
        self.emit_state();

        tracing::info!("Answering call from {}", remote);

        let session = Arc::clone(&handle.session);
        self.install_session(handle, gen);

        if let Err(e) = session.answer(&tracks).await {
            tracing::error!("Failed to answer call from {}: {}", remote, e);
            self.emit(CallEvent::Error(format!("Failed to answer call: {}", e)));
            self.finish_call(gen).await;
            return;
        }

        // Angenommen heißt aktiv; die Remote-Tracks liefert der
        // Stream-Event nach
        if self.generation.load(Ordering::SeqCst) == gen {
            let changed = {
                let mut state = self.state.lock();
                if matches!(*state, CallState::Dialing { .. }) {
                    *state = CallState::Active { remote };
                    true
                } else {
                    false
                }
            };
            if changed {
                self.emit_state();
            }
        }
    }

    // ========================================================================
    // HANGUP
    // ========================================================================

    /// Beendet den aktuellen Anruf. Immer gefahrlos aufrufbar, ohne
    /// Anruf ein No-op.
    pub async fn end_call(&self) {
        if matches!(self.state(), CallState::Idle) && self.session.lock().is_none() {
            return;
        }

        let gen = self.generation.load(Ordering::SeqCst);
        self.finish_call(gen).await;
    }

    // ========================================================================
    // SCREEN SHARE
    // ========================================================================

    /// Startet bzw. beendet die Bildschirmfreigabe. Gibt den neuen
    /// Zustand zurück. Start nur bei bestehender Session.
    pub async fn toggle_screen_share(self: &Arc<Self>) -> Result<bool, CallError> {
        if self.media.is_screen_sharing() {
            self.stop_screen_share().await;
            return Ok(false);
        }

        let session = self
            .session
            .lock()
            .clone()
            .ok_or(CallError::NoActiveCall)?;

        let track = self.media.start_screen_share().await?;

        // Endet die Quelle von außen (Fenster geschlossen), wird die
        // Kamera wiederhergestellt. Der Hook kann aus einem fremden
        // Thread feuern, daher den Runtime-Handle mitnehmen.
        let weak = Arc::downgrade(self);
        let runtime = tokio::runtime::Handle::current();
        track.set_on_ended(move || {
            if let Some(manager) = weak.upgrade() {
                runtime.spawn(async move {
                    manager.stop_screen_share().await;
                });
            }
        });

        if let Err(e) = session.replace_outgoing_video(Arc::clone(&track)).await {
            if let Some(track) = self.media.end_screen_share() {
                track.stop();
            }
            return Err(e.into());
        }

        tracing::info!("Screen share started");
        self.emit(CallEvent::ScreenShare { active: true });
        Ok(true)
    }

    /// Beendet die Bildschirmfreigabe und stellt die Kamera in der
    /// Session wieder her. Ohne laufende Freigabe ein No-op.
    pub async fn stop_screen_share(&self) {
        let Some(track) = self.media.end_screen_share() else {
            return;
        };
        track.stop();

        let session = self.session.lock().clone();
        if let (Some(session), Some(camera)) = (session, self.media.camera_track()) {
            if let Err(e) = session.replace_outgoing_video(camera).await {
                tracing::warn!("Failed to restore camera track: {}", e);
            }
        }

        tracing::info!("Screen share stopped");
        self.emit(CallEvent::ScreenShare { active: false });
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Beendet den Anruf und gibt den Dienst frei (Prozess-Teardown)
    pub async fn shutdown(&self) {
        self.end_call().await;
        self.service.destroy().await;
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Wechselt von Idle nach Dialing und liefert die neue Generation
    fn begin(&self, remote: String) -> Result<u64, CallError> {
        let mut state = self.state.lock();
        if !matches!(*state, CallState::Idle) {
            return Err(CallError::AlreadyInCall);
        }
        *state = CallState::Dialing { remote };
        Ok(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Legt die Session in den Slot und startet ihren Event-Pump
    fn install_session(self: &Arc<Self>, handle: SessionHandle, gen: u64) {
        let remote = handle.session.remote_identity();
        *self.session.lock() = Some(Arc::clone(&handle.session));

        let manager = Arc::clone(self);
        let mut events = handle.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Stream(set) => {
                        if manager.generation.load(Ordering::SeqCst) != gen {
                            continue;
                        }

                        let changed = {
                            let mut state = manager.state.lock();
                            if matches!(*state, CallState::Dialing { .. }) {
                                *state = CallState::Active {
                                    remote: remote.clone(),
                                };
                                true
                            } else {
                                false
                            }
                        };

                        if changed {
                            manager.emit_state();
                        }
                        manager.emit(CallEvent::RemoteStream(set));
                    }

                    SessionEvent::Closed => {
                        tracing::info!("Session with {} closed", remote);
                        manager.finish_call(gen).await;
                        break;
                    }

                    SessionEvent::Error(message) => {
                        tracing::error!("Session error with {}: {}", remote, message);
                        manager.emit(CallEvent::Error(message));
                        manager.finish_call(gen).await;
                        break;
                    }
                }
            }
        });
    }

    /// Baut den Anruf ab, sofern die Generation noch aktuell ist.
    /// Überholte Teardowns (der Anruf wurde bereits beendet und ggf.
    /// ein neuer gestartet) sind ein No-op.
    async fn finish_call(&self, gen: u64) {
        if self
            .generation
            .compare_exchange(gen, gen + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let session = self.session.lock().take();

        // Eine laufende Bildschirmfreigabe endet mit dem Anruf
        if let Some(track) = self.media.end_screen_share() {
            track.stop();
            self.emit(CallEvent::ScreenShare { active: false });
        }

        *self.state.lock() = CallState::Idle;
        self.emit_state();

        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Übersetzt Dienst-Events in Manager-Aktionen
    async fn handle_service_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Open { identity } => {
                self.emit(CallEvent::ServiceReady { identity });
            }

            PeerEvent::IncomingCall(handle) => {
                self.handle_incoming(handle).await;
            }

            PeerEvent::IncomingData { remote, label } => {
                tracing::info!("Data connection from {} ({}), ignoring", remote, label);
            }

            PeerEvent::ServiceError { message } => {
                tracing::error!("Service error: {}", message);
                self.emit(CallEvent::Error(message));
            }

            PeerEvent::Closed => {
                tracing::warn!("Lost connection to session service");
                self.end_call().await;
                self.emit(CallEvent::ServiceDown);
            }
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self) {
        self.emit(CallEvent::StateChanged {
            state: self.state(),
        });
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoConstraints;
    use crate::media::{RemoteTrack, TrackKind};
    use crate::testing::{MockBackend, MockPeerService, MockSession};
    use std::time::Duration;

    async fn ready_manager() -> (Arc<CallManager>, Arc<MockPeerService>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let media = Arc::new(MediaSource::new(backend.clone()));
        media.acquire(&VideoConstraints::default()).await.unwrap();

        let service = Arc::new(MockPeerService::new());
        let manager = CallManager::new(service.clone(), media);
        (manager, service, backend)
    }

    fn one_remote_track() -> RemoteTrackSet {
        RemoteTrackSet {
            tracks: vec![RemoteTrack {
                id: "r-audio".to_string(),
                stream_id: "remote".to_string(),
                kind: TrackKind::Audio,
            }],
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // ------------------------------------------------------------------------
    // Ausgehende Anrufe
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_place_call_rejects_empty_target() {
        let (manager, _, _) = ready_manager().await;

        assert!(matches!(
            manager.place_call("   ").await,
            Err(CallError::InvalidTarget)
        ));
        assert_eq!(manager.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_place_call_requires_media() {
        let backend = Arc::new(MockBackend::new());
        let media = Arc::new(MediaSource::new(backend));
        let service = Arc::new(MockPeerService::new());
        let manager = CallManager::new(service, media);

        assert!(matches!(
            manager.place_call("peer-b").await,
            Err(CallError::NoLocalMedia)
        ));
    }

    #[tokio::test]
    async fn test_place_call_dialing_then_active() {
        let (manager, service, _) = ready_manager().await;
        let mut events = manager.subscribe();

        manager.place_call("peer-b").await.unwrap();
        assert_eq!(
            manager.state(),
            CallState::Dialing {
                remote: "peer-b".to_string()
            }
        );

        service.last_session().emit(SessionEvent::Stream(one_remote_track()));
        settle().await;

        assert_eq!(
            manager.state(),
            CallState::Active {
                remote: "peer-b".to_string()
            }
        );

        // Dialing, Active, RemoteStream in dieser Reihenfolge
        assert!(matches!(
            events.recv().await.unwrap(),
            CallEvent::StateChanged {
                state: CallState::Dialing { .. }
            }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            CallEvent::StateChanged {
                state: CallState::Active { .. }
            }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            CallEvent::RemoteStream(_)
        ));
    }

    #[tokio::test]
    async fn test_second_call_is_rejected() {
        let (manager, _, _) = ready_manager().await;

        manager.place_call("peer-b").await.unwrap();
        assert!(matches!(
            manager.place_call("peer-c").await,
            Err(CallError::AlreadyInCall)
        ));
    }

    #[tokio::test]
    async fn test_failed_dial_returns_to_idle() {
        let (manager, service, _) = ready_manager().await;
        service.fail_next_place_call();

        assert!(manager.place_call("peer-b").await.is_err());
        assert_eq!(manager.state(), CallState::Idle);

        // Danach ist ein neuer Anruf wieder möglich
        manager.place_call("peer-c").await.unwrap();
        assert!(matches!(manager.state(), CallState::Dialing { .. }));
    }

    #[tokio::test]
    async fn test_hangup_while_dialing_closes_late_session() {
        let (manager, service, _) = ready_manager().await;
        service.set_place_call_delay(Duration::from_millis(50));

        let dialing = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.place_call("peer-b").await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.end_call().await;

        dialing.await.unwrap().unwrap();
        settle().await;

        assert!(service.last_session().is_closed());
        assert_eq!(manager.state(), CallState::Idle);
    }

    // ------------------------------------------------------------------------
    // Auflegen
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_end_call_closes_session() {
        let (manager, service, _) = ready_manager().await;

        manager.place_call("peer-b").await.unwrap();
        manager.end_call().await;

        assert!(service.last_session().is_closed());
        assert_eq!(manager.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_end_call_without_call_is_noop() {
        let (manager, _, _) = ready_manager().await;
        let mut events = manager.subscribe();

        manager.end_call().await;

        assert_eq!(manager.state(), CallState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_close_returns_to_idle() {
        let (manager, service, _) = ready_manager().await;

        manager.place_call("peer-b").await.unwrap();
        service.last_session().emit(SessionEvent::Closed);
        settle().await;

        assert_eq!(manager.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_session_error_surfaces_and_ends_call() {
        let (manager, service, _) = ready_manager().await;
        let mut events = manager.subscribe();

        manager.place_call("peer-b").await.unwrap();
        let _ = events.recv().await; // Dialing

        service
            .last_session()
            .emit(SessionEvent::Error("ice failed".to_string()));
        settle().await;

        assert!(matches!(events.recv().await.unwrap(), CallEvent::Error(_)));
        assert_eq!(manager.state(), CallState::Idle);
    }

    // ------------------------------------------------------------------------
    // Eingehende Anrufe
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_incoming_call_is_answered() {
        let (manager, _, _) = ready_manager().await;

        let (session, handle) = MockSession::handle("caller");
        manager.handle_incoming(handle).await;

        // Angenommene Anrufe sind sofort aktiv
        assert!(session.was_answered());
        assert_eq!(
            manager.state(),
            CallState::Active {
                remote: "caller".to_string()
            }
        );

        session.emit(SessionEvent::Stream(one_remote_track()));
        settle().await;
        assert!(matches!(manager.state(), CallState::Active { .. }));
    }

    #[tokio::test]
    async fn test_incoming_call_rejected_without_media() {
        let backend = Arc::new(MockBackend::new());
        let media = Arc::new(MediaSource::new(backend));
        let service = Arc::new(MockPeerService::new());
        let manager = CallManager::new(service, media);

        let (session, handle) = MockSession::handle("caller");
        manager.handle_incoming(handle).await;

        assert!(session.is_closed());
        assert!(!session.was_answered());
        assert_eq!(manager.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_incoming_call_rejected_while_busy() {
        let (manager, _, _) = ready_manager().await;
        manager.place_call("peer-b").await.unwrap();

        let (session, handle) = MockSession::handle("caller");
        manager.handle_incoming(handle).await;

        assert!(session.is_closed());
        // Der laufende Anruf bleibt unberührt
        assert_eq!(
            manager.state(),
            CallState::Dialing {
                remote: "peer-b".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_answer_returns_to_idle() {
        let (manager, _, _) = ready_manager().await;

        let (session, handle) = MockSession::handle("caller");
        session.fail_next_answer();
        manager.handle_incoming(handle).await;

        assert_eq!(manager.state(), CallState::Idle);
        assert!(session.is_closed());
    }

    // ------------------------------------------------------------------------
    // Bildschirmfreigabe
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_screen_share_requires_session() {
        let (manager, _, _) = ready_manager().await;

        assert!(matches!(
            manager.toggle_screen_share().await,
            Err(CallError::NoActiveCall)
        ));
    }

    #[tokio::test]
    async fn test_stop_screen_share_without_share_is_noop() {
        let (manager, service, _) = ready_manager().await;
        manager.place_call("peer-b").await.unwrap();
        let mut events = manager.subscribe();

        manager.stop_screen_share().await;

        // Keine Substitution, kein Event
        assert!(service.last_session().replaced_labels().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_screen_share_replaces_and_restores_video() {
        let (manager, service, _) = ready_manager().await;
        manager.place_call("peer-b").await.unwrap();
        let session = service.last_session();

        assert!(manager.toggle_screen_share().await.unwrap());
        assert!(manager.media().is_screen_sharing());

        assert!(!manager.toggle_screen_share().await.unwrap());
        assert!(!manager.media().is_screen_sharing());

        let labels = session.replaced_labels();
        assert_eq!(labels, vec!["screen".to_string(), "camera".to_string()]);
    }

    #[tokio::test]
    async fn test_screen_source_ended_restores_camera_once() {
        let (manager, service, backend) = ready_manager().await;
        manager.place_call("peer-b").await.unwrap();
        let session = service.last_session();

        manager.toggle_screen_share().await.unwrap();
        let track = backend.last_display_track().unwrap();

        track.notify_ended();
        settle().await;

        assert!(!manager.media().is_screen_sharing());
        assert_eq!(session.replaced_labels().len(), 2);

        // Ein zweites Ende-Signal löst nichts mehr aus
        track.notify_ended();
        settle().await;
        assert_eq!(session.replaced_labels().len(), 2);
    }

    #[tokio::test]
    async fn test_end_call_stops_screen_share() {
        let (manager, _, _) = ready_manager().await;
        manager.place_call("peer-b").await.unwrap();
        manager.toggle_screen_share().await.unwrap();

        manager.end_call().await;

        assert!(!manager.media().is_screen_sharing());
        assert_eq!(manager.state(), CallState::Idle);
    }

    // ------------------------------------------------------------------------
    // Dienst-Events
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_service_loss_ends_call() {
        let (manager, service, _) = ready_manager().await;
        let mut events = manager.subscribe();

        manager.place_call("peer-b").await.unwrap();
        manager.handle_service_event(PeerEvent::Closed).await;

        assert_eq!(manager.state(), CallState::Idle);
        assert!(service.last_session().is_closed());

        let mut saw_service_down = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CallEvent::ServiceDown) {
                saw_service_down = true;
            }
        }
        assert!(saw_service_down);
    }

    #[tokio::test]
    async fn test_shutdown_destroys_service() {
        let (manager, service, _) = ready_manager().await;

        manager.place_call("peer-b").await.unwrap();
        manager.shutdown().await;

        assert!(service.was_destroyed());
        assert_eq!(manager.state(), CallState::Idle);
    }
}
