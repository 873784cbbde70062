//! WebRTC-Implementierung des Identity/Session-Dienstes
//!
//! Koppelt den Signaling-Client mit `RTCPeerConnection`s: Offers,
//! Answers und ICE Candidates laufen über den Broker, die Medien
//! direkt zwischen den Peers. Die Bildschirmfreigabe ersetzt den
//! ausgehenden Video-Track am Sender, ohne neu zu verhandeln.

use super::service::{CallSession, PeerError, PeerEvent, PeerService, SessionEvent, SessionHandle};
use crate::config::AppConfig;
use crate::media::{LocalTrack, RemoteTrack, RemoteTrackSet, TrackKind, TrackSet};
use crate::signaling::{SignalingClient, SignalingEvent};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

// ============================================================================
// PEER SERVICE
// ============================================================================

/// Der Session-Dienst über Broker + WebRTC
pub struct WebRtcPeerService {
    ice_servers: Vec<RTCIceServer>,
    signaling: Arc<SignalingClient>,
    identity: RwLock<Option<String>>,
    /// Transport-Routing: Answers und Candidates gehören zur
    /// jeweils aktuellen Session
    current: Arc<Mutex<Option<Arc<WebRtcSession>>>>,
    event_tx: mpsc::Sender<PeerEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
}

impl WebRtcPeerService {
    pub fn new(config: &AppConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(32);

        Self {
            ice_servers: config.ice_servers(),
            signaling: Arc::new(SignalingClient::new(config.signaling_url.clone())),
            identity: RwLock::new(None),
            current: Arc::new(Mutex::new(None)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Nimmt den Event-Receiver (einmalig; der CallManager konsumiert ihn)
    pub fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.event_rx.lock().take()
    }

    /// Verbindet mit dem Broker und startet Event-Routing + Heartbeat
    pub async fn connect(&self) -> Result<String, PeerError> {
        // Vor dem Handshake abonnieren, damit kein Event verloren geht
        let mut signaling_rx = self.signaling.subscribe();

        let identity = self
            .signaling
            .connect()
            .await
            .map_err(|e| PeerError::Signaling(e.to_string()))?;

        *self.identity.write() = Some(identity.clone());
        self.signaling.start_heartbeat();

        let ice_servers = self.ice_servers.clone();
        let signaling = Arc::clone(&self.signaling);
        let current = Arc::clone(&self.current);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Ok(event) = signaling_rx.recv().await {
                Self::route_signaling_event(event, &ice_servers, &signaling, &current, &event_tx)
                    .await;
            }
        });

        let _ = self
            .event_tx
            .send(PeerEvent::Open {
                identity: identity.clone(),
            })
            .await;

        tracing::info!("Session service connected, identity: {}", identity);
        Ok(identity)
    }

    /// Übersetzt Broker-Events in Dienst-/Session-Events
    async fn route_signaling_event(
        event: SignalingEvent,
        ice_servers: &[RTCIceServer],
        signaling: &Arc<SignalingClient>,
        current: &Arc<Mutex<Option<Arc<WebRtcSession>>>>,
        event_tx: &mpsc::Sender<PeerEvent>,
    ) {
        match event {
            SignalingEvent::IncomingOffer { from_peer_id, sdp } => {
                tracing::info!("Incoming call from {}", from_peer_id);

                let (session_tx, session_rx) = mpsc::channel(32);
                let session = Arc::new(WebRtcSession::incoming(
                    from_peer_id,
                    sdp,
                    ice_servers.to_vec(),
                    Arc::clone(signaling),
                    session_tx,
                ));

                // Eine laufende Session behält ihr Routing; der Manager
                // lehnt den zweiten Anruf ab und schließt ihn. Nur ein
                // leerer (oder bereits geschlossener) Slot wird belegt.
                {
                    let mut slot = current.lock();
                    let free = slot.as_ref().map(|s| s.is_closed()).unwrap_or(true);
                    if free {
                        *slot = Some(Arc::clone(&session));
                    }
                }

                let _ = event_tx
                    .send(PeerEvent::IncomingCall(SessionHandle {
                        session,
                        events: session_rx,
                    }))
                    .await;
            }

            SignalingEvent::AnswerReceived { from_peer_id, sdp } => {
                let session = current.lock().clone();
                match session {
                    Some(s) if s.remote_identity() == from_peer_id => {
                        if let Err(e) = s.handle_answer(sdp).await {
                            tracing::error!("Failed to handle answer: {}", e);
                        }
                    }
                    _ => tracing::warn!("Answer from {} without matching session", from_peer_id),
                }
            }

            SignalingEvent::IceCandidateReceived {
                from_peer_id,
                candidate,
            } => {
                let session = current.lock().clone();
                match session {
                    Some(s) if s.remote_identity() == from_peer_id => {
                        if let Err(e) = s.add_ice_candidate(candidate).await {
                            tracing::error!("Failed to add ICE candidate: {}", e);
                        }
                    }
                    _ => tracing::debug!("ICE candidate from {} ignored", from_peer_id),
                }
            }

            SignalingEvent::CallEnded { by_peer_id } => {
                // Nur ein Hangup der eigenen Gegenseite beendet die
                // Session; verspätete Hangups fremder Peers werden verworfen
                let session = {
                    let mut slot = current.lock();
                    match slot.as_ref() {
                        Some(s) if s.remote_identity() == by_peer_id => slot.take(),
                        _ => None,
                    }
                };

                match session {
                    Some(s) => {
                        tracing::info!("Call ended by {}", by_peer_id);
                        s.mark_remote_closed();
                    }
                    None => {
                        tracing::debug!("Hangup from {} without matching session", by_peer_id)
                    }
                }
            }

            SignalingEvent::IncomingData {
                from_peer_id,
                label,
            } => {
                let _ = event_tx
                    .send(PeerEvent::IncomingData {
                        remote: from_peer_id,
                        label,
                    })
                    .await;
            }

            SignalingEvent::Error { code, message } => {
                let _ = event_tx
                    .send(PeerEvent::ServiceError {
                        message: format!("{} ({})", message, code),
                    })
                    .await;
            }

            SignalingEvent::Disconnected => {
                let _ = event_tx.send(PeerEvent::Closed).await;
            }

            SignalingEvent::Connected | SignalingEvent::Assigned { .. } => {
                // Wird bereits über connect() abgewickelt
            }
        }
    }
}

#[async_trait]
impl PeerService for WebRtcPeerService {
    fn local_identity(&self) -> Option<String> {
        self.identity.read().clone()
    }

    async fn place_call(
        &self,
        remote: &str,
        tracks: &TrackSet,
    ) -> Result<SessionHandle, PeerError> {
        if !self.signaling.is_connected() {
            return Err(PeerError::NotConnected);
        }

        let (session_tx, session_rx) = mpsc::channel(32);
        let session = Arc::new(WebRtcSession::outgoing(
            remote.to_string(),
            self.ice_servers.clone(),
            Arc::clone(&self.signaling),
            session_tx,
        ));

        // Das Routing steht bevor das Offer den Broker verlässt, damit
        // ein schnelles Answer nicht verworfen wird
        *self.current.lock() = Some(Arc::clone(&session));

        if let Err(e) = session.dial(tracks).await {
            *self.current.lock() = None;
            return Err(e);
        }

        Ok(SessionHandle {
            session,
            events: session_rx,
        })
    }

    async fn destroy(&self) {
        let session = self.current.lock().take();
        if let Some(s) = session {
            s.close().await;
        }
        self.signaling.close();
        tracing::info!("Session service destroyed");
    }
}

impl std::fmt::Debug for WebRtcPeerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcPeerService")
            .field("identity", &self.local_identity())
            .finish()
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Eine Punkt-zu-Punkt-Session über eine RTCPeerConnection
struct WebRtcSession {
    remote: String,
    ice_servers: Vec<RTCIceServer>,
    signaling: Arc<SignalingClient>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    /// Das Offer der Gegenseite (nur bei eingehenden Sessions)
    pending_offer: Mutex<Option<String>>,
    event_tx: mpsc::Sender<SessionEvent>,
    remote_tracks: Arc<Mutex<Vec<RemoteTrack>>>,
    closed: Arc<AtomicBool>,
}

impl WebRtcSession {
    fn outgoing(
        remote: String,
        ice_servers: Vec<RTCIceServer>,
        signaling: Arc<SignalingClient>,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            remote,
            ice_servers,
            signaling,
            pc: Mutex::new(None),
            pending_offer: Mutex::new(None),
            event_tx,
            remote_tracks: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn incoming(
        remote: String,
        offer_sdp: String,
        ice_servers: Vec<RTCIceServer>,
        signaling: Arc<SignalingClient>,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let session = Self::outgoing(remote, ice_servers, signaling, event_tx);
        *session.pending_offer.lock() = Some(offer_sdp);
        session
    }

    /// Baut die Verbindung auf und verschickt das Offer
    async fn dial(&self, tracks: &TrackSet) -> Result<(), PeerError> {
        let pc = self.create_transport().await?;

        for track in tracks.tracks() {
            pc.add_track(track.rtc_track())
                .await
                .map_err(|e| PeerError::Transport(e.to_string()))?;
        }

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        self.signaling
            .send_offer(self.remote.clone(), offer.sdp)
            .await
            .map_err(|e| PeerError::Signaling(e.to_string()))?;

        Ok(())
    }

    /// Verarbeitet das Answer der Gegenseite
    async fn handle_answer(&self, answer_sdp: String) -> Result<(), PeerError> {
        let pc = self.pc.lock().clone().ok_or(PeerError::NotConnected)?;

        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        pc.set_remote_description(answer)
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        Ok(())
    }

    /// Fügt einen ICE Candidate der Gegenseite hinzu
    async fn add_ice_candidate(&self, candidate_json: String) -> Result<(), PeerError> {
        let pc = self.pc.lock().clone().ok_or(PeerError::NotConnected)?;

        let candidate: RTCIceCandidateInit = serde_json::from_str(&candidate_json)
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        pc.add_ice_candidate(candidate)
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        Ok(())
    }

    /// Die Gegenseite hat aufgelegt
    fn mark_remote_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.try_send(SessionEvent::Closed);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Erstellt die RTCPeerConnection und registriert die Handler.
    /// Die Handler stehen bevor irgendein Event feuern kann.
    async fn create_transport(&self) -> Result<Arc<RTCPeerConnection>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerError::Transport(e.to_string()))?,
        );

        // Connection State Handler
        let closed = Arc::clone(&self.closed);
        let event_tx = self.event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);

            match s {
                RTCPeerConnectionState::Disconnected
                | RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Closed => {
                    if !closed.swap(true, Ordering::SeqCst) {
                        let _ = event_tx.try_send(SessionEvent::Closed);
                    }
                }
                _ => {}
            }

            Box::pin(async {})
        }));

        // ICE Candidate Handler
        let signaling = Arc::clone(&self.signaling);
        let remote = self.remote.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    if let Ok(candidate_str) = serde_json::to_string(&json) {
                        if let Err(e) =
                            signaling.send_ice_candidate_sync(remote.clone(), candidate_str)
                        {
                            tracing::error!("Failed to send ICE candidate: {}", e);
                        }
                    }
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (empfangene Remote-Tracks)
        let remote_tracks = Arc::clone(&self.remote_tracks);
        let event_tx = self.event_tx.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };

            if let Some(kind) = kind {
                tracing::info!("Received remote {} track: {}", kind.as_str(), track.id());

                let set = {
                    let mut tracks = remote_tracks.lock();
                    tracks.push(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    });
                    RemoteTrackSet {
                        tracks: tracks.clone(),
                    }
                };

                let _ = event_tx.try_send(SessionEvent::Stream(set));
            }

            Box::pin(async {})
        }));

        // Daten-Kanäle werden angenommen, aber nur protokolliert
        pc.on_data_channel(Box::new(move |channel| {
            tracing::info!("Data channel opened: {}", channel.label());
            Box::pin(async {})
        }));

        *self.pc.lock() = Some(Arc::clone(&pc));
        Ok(pc)
    }
}

#[async_trait]
impl CallSession for WebRtcSession {
    fn remote_identity(&self) -> String {
        self.remote.clone()
    }

    async fn answer(&self, tracks: &TrackSet) -> Result<(), PeerError> {
        let offer_sdp = self
            .pending_offer
            .lock()
            .take()
            .ok_or_else(|| PeerError::Transport("no pending offer".to_string()))?;

        let pc = self.create_transport().await?;

        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        pc.set_remote_description(offer)
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        for track in tracks.tracks() {
            pc.add_track(track.rtc_track())
                .await
                .map_err(|e| PeerError::Transport(e.to_string()))?;
        }

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::Transport(e.to_string()))?;

        self.signaling
            .send_answer(self.remote.clone(), answer.sdp)
            .await
            .map_err(|e| PeerError::Signaling(e.to_string()))?;

        Ok(())
    }

    async fn close(&self) {
        // Nur beim ersten lokalen Close auflegen; kam das Close von der
        // Gegenseite, ist das Flag bereits gesetzt
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.signaling.hangup_sync(self.remote.clone()) {
                tracing::debug!("Hangup not sent: {}", e);
            }
        }

        let pc = self.pc.lock().take();
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                tracing::warn!("Error closing peer connection: {}", e);
            }
        }
    }

    async fn replace_outgoing_video(&self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        let pc = self.pc.lock().clone().ok_or(PeerError::NotConnected)?;

        for sender in pc.get_senders().await {
            let is_video = sender
                .track()
                .await
                .map(|t| t.kind() == RTPCodecType::Video)
                .unwrap_or(false);

            if is_video {
                sender
                    .replace_track(Some(track.rtc_track()))
                    .await
                    .map_err(|e| PeerError::Transport(e.to_string()))?;
                tracing::info!("Outgoing video track replaced: {}", track.label());
                return Ok(());
            }
        }

        Err(PeerError::Transport(
            "no outgoing video sender".to_string(),
        ))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(remote: &str) -> (Arc<WebRtcSession>, mpsc::Receiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(8);
        let session = Arc::new(WebRtcSession::incoming(
            remote.to_string(),
            "v=0".to_string(),
            Vec::new(),
            Arc::new(SignalingClient::new("https://broker.invalid".to_string())),
            event_tx,
        ));
        (session, event_rx)
    }

    async fn route(
        event: SignalingEvent,
        current: &Arc<Mutex<Option<Arc<WebRtcSession>>>>,
        event_tx: &mpsc::Sender<PeerEvent>,
    ) {
        let signaling = Arc::new(SignalingClient::new("https://broker.invalid".to_string()));
        WebRtcPeerService::route_signaling_event(event, &[], &signaling, current, event_tx)
            .await;
    }

    #[tokio::test]
    async fn test_offer_while_busy_keeps_current_routing() {
        let (active, mut active_rx) = test_session("peer-a");
        let current = Arc::new(Mutex::new(Some(Arc::clone(&active))));
        let (event_tx, mut event_rx) = mpsc::channel(8);

        route(
            SignalingEvent::IncomingOffer {
                from_peer_id: "peer-b".to_string(),
                sdp: "v=0".to_string(),
            },
            &current,
            &event_tx,
        )
        .await;

        // Der zweite Anruf erreicht den Manager (der ihn ablehnt)...
        match event_rx.recv().await.unwrap() {
            PeerEvent::IncomingCall(handle) => {
                assert_eq!(handle.session.remote_identity(), "peer-b");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // ...aber das Routing der laufenden Session bleibt bestehen
        assert_eq!(
            current.lock().as_ref().unwrap().remote_identity(),
            "peer-a"
        );

        // und ihr Hangup kommt weiterhin an
        route(
            SignalingEvent::CallEnded {
                by_peer_id: "peer-a".to_string(),
            },
            &current,
            &event_tx,
        )
        .await;
        assert!(matches!(active_rx.recv().await.unwrap(), SessionEvent::Closed));
    }

    #[tokio::test]
    async fn test_hangup_from_other_peer_is_ignored() {
        let (active, mut active_rx) = test_session("peer-a");
        let current = Arc::new(Mutex::new(Some(active)));
        let (event_tx, _event_rx) = mpsc::channel(8);

        route(
            SignalingEvent::CallEnded {
                by_peer_id: "peer-x".to_string(),
            },
            &current,
            &event_tx,
        )
        .await;

        // Session bleibt installiert und unberührt
        assert!(current.lock().is_some());
        assert!(active_rx.try_recv().is_err());

        route(
            SignalingEvent::CallEnded {
                by_peer_id: "peer-a".to_string(),
            },
            &current,
            &event_tx,
        )
        .await;

        assert!(current.lock().is_none());
        assert!(matches!(active_rx.recv().await.unwrap(), SessionEvent::Closed));
    }

    #[tokio::test]
    async fn test_offer_replaces_closed_session_in_slot() {
        let (stale, _stale_rx) = test_session("peer-a");
        stale.mark_remote_closed();
        let current = Arc::new(Mutex::new(Some(stale)));
        let (event_tx, mut event_rx) = mpsc::channel(8);

        route(
            SignalingEvent::IncomingOffer {
                from_peer_id: "peer-b".to_string(),
                sdp: "v=0".to_string(),
            },
            &current,
            &event_tx,
        )
        .await;

        let _ = event_rx.recv().await;
        assert_eq!(
            current.lock().as_ref().unwrap().remote_identity(),
            "peer-b"
        );
    }
}
