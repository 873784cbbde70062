//! Capability-Schnittstelle zum Identity/Session-Dienst
//!
//! Der CallManager kennt den Dienst nur über diese Traits; die
//! konkrete WebRTC-Implementierung liegt in `webrtc.rs`, Tests
//! verwenden Mocks. Events laufen über Single-Consumer-Channels:
//! der Receiver in einem `SessionHandle` existiert bevor die Session
//! ihr erstes Event senden kann, es geht also keines durch eine
//! Registrierungs-Lücke verloren.

use crate::media::{RemoteTrackSet, TrackSet};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Not connected to the session service")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Signaling error: {0}")]
    Signaling(String),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Terminal-Events einer einzelnen Session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Remote-Tracks sind eingetroffen
    Stream(RemoteTrackSet),
    /// Session wurde geschlossen (lokal oder von der Gegenseite)
    Closed,
    /// Session-Fehler; wird wie ein Close behandelt
    Error(String),
}

/// Events des Dienstes selbst
#[derive(Debug)]
pub enum PeerEvent {
    /// Verbunden, Identity wurde zugewiesen
    Open { identity: String },
    /// Eingehender Anruf
    IncomingCall(SessionHandle),
    /// Eingehende Daten-Verbindung (ohne Medien)
    IncomingData { remote: String, label: String },
    /// Dienst-Fehler; wird nur geloggt
    ServiceError { message: String },
    /// Verbindung zum Dienst verloren
    Closed,
}

/// Eine Session samt ihrem Event-Receiver
pub struct SessionHandle {
    pub session: Arc<dyn CallSession>,
    pub events: mpsc::Receiver<SessionEvent>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("remote", &self.session.remote_identity())
            .finish()
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Eine ausgehandelte Punkt-zu-Punkt-Session
#[async_trait]
pub trait CallSession: Send + Sync {
    /// Die Identity der Gegenseite
    fn remote_identity(&self) -> String;

    /// Nimmt einen eingehenden Anruf mit den lokalen Tracks an
    async fn answer(&self, tracks: &TrackSet) -> Result<(), PeerError>;

    /// Schließt die Session. Idempotent.
    async fn close(&self);

    /// Ersetzt den ausgehenden Video-Track ohne Neuverhandlung
    /// (Bildschirmfreigabe-Substitution)
    async fn replace_outgoing_video(
        &self,
        track: Arc<crate::media::LocalTrack>,
    ) -> Result<(), PeerError>;
}

/// Der externe Identity/Session-Dienst
#[async_trait]
pub trait PeerService: Send + Sync {
    /// Die eigene Identity (sobald zugewiesen)
    fn local_identity(&self) -> Option<String>;

    /// Startet einen ausgehenden Anruf mit den lokalen Tracks
    async fn place_call(&self, remote: &str, tracks: &TrackSet)
        -> Result<SessionHandle, PeerError>;

    /// Gibt den Dienst und alle Ressourcen frei
    async fn destroy(&self);
}
