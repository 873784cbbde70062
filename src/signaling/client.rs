//! WebSocket Client für den Signaling-Broker
//!
//! Verwaltet die Verbindung zum externen Broker:
//! - Peer-ID-Zuweisung beim Verbinden
//! - Relay von Offer/Answer/ICE-Nachrichten
//! - Heartbeat gegen den Idle-Timeout
//! - Event-basierte Kommunikation

use super::messages::*;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling broker")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Broker error: {code} - {message}")]
    BrokerError { code: i32, message: String },
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden mit dem Broker
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Peer-ID wurde zugewiesen
    Assigned { peer_id: String },

    /// Eingehendes SDP Offer (= eingehender Anruf)
    IncomingOffer { from_peer_id: String, sdp: String },

    /// SDP Answer erhalten
    AnswerReceived { from_peer_id: String, sdp: String },

    /// ICE Candidate erhalten
    IceCandidateReceived {
        from_peer_id: String,
        candidate: String,
    },

    /// Eingehende Daten-Verbindung angekündigt
    IncomingData { from_peer_id: String, label: String },

    /// Anruf von der Gegenseite beendet
    CallEnded { by_peer_id: String },

    /// Fehler vom Broker
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    peer_id: Option<String>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Broker-Kommunikation
pub struct SignalingClient {
    broker_url: String,
    state: Arc<RwLock<ClientState>>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(broker_url: String) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            broker_url,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: RwLock::new(None),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt die zugewiesene Peer-ID zurück (falls verbunden)
    pub fn peer_id(&self) -> Option<String> {
        self.state.read().peer_id.clone()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Broker und wartet auf die Peer-ID-Zuweisung
    pub async fn connect(&self) -> Result<String, SignalingError> {
        let ws_url = format!("{}/ws", self.broker_url.replace("http", "ws"));

        // URL vorab validieren, connect_async liefert sonst kryptische Fehler
        Url::parse(&ws_url).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connecting to signaling broker: {}", ws_url);

        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.tx.write() = Some(tx);

        {
            let mut state = self.state.write();
            state.is_connected = true;
        }
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Channel für die Peer-ID-Zuweisung
        let (assign_tx, mut assign_rx) = mpsc::channel::<Result<String, SignalingError>>(1);

        // Read-Task starten
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(server_msg) => {
                                Self::handle_server_message(
                                    server_msg,
                                    &state_clone,
                                    &event_tx,
                                    &assign_tx,
                                )
                                .await;
                            }
                            Err(e) => {
                                tracing::warn!("Unparseable broker message: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by broker");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            {
                let mut state = state_clone.write();
                state.is_connected = false;
            }
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg.into())).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        // Auf die Zuweisung warten (max 10 Sekunden)
        tokio::select! {
            result = assign_rx.recv() => {
                match result {
                    Some(Ok(peer_id)) => Ok(peer_id),
                    Some(Err(e)) => Err(e),
                    None => Err(SignalingError::HandshakeFailed("No response".to_string())),
                }
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_secs(10)) => {
                Err(SignalingError::HandshakeFailed("Timeout".to_string()))
            }
        }
    }

    /// Sendet ein SDP Offer
    pub async fn send_offer(&self, to_peer_id: String, sdp: String) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send_message(OfferPayload::new(peer_id, to_peer_id, sdp))
            .await
    }

    /// Sendet ein SDP Answer
    pub async fn send_answer(&self, to_peer_id: String, sdp: String) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send_message(AnswerPayload::new(peer_id, to_peer_id, sdp))
            .await
    }

    /// Sendet einen ICE Candidate (non-blocking, für Callback-Kontexte)
    pub fn send_ice_candidate_sync(
        &self,
        to_peer_id: String,
        candidate: String,
    ) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send_message_sync(IceCandidatePayload::new(peer_id, to_peer_id, candidate))
    }

    /// Beendet einen Anruf (non-blocking)
    pub fn hangup_sync(&self, to_peer_id: String) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send_message_sync(HangupPayload::new(peer_id, to_peer_id))
    }

    /// Sendet einen Heartbeat (non-blocking)
    pub fn send_heartbeat_sync(&self) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send_message_sync(HeartbeatPayload::new(peer_id))
    }

    /// Trennt die Verbindung zum Broker
    pub fn close(&self) {
        // Write-Task beendet sich sobald der Sender wegfällt
        *self.tx.write() = None;

        let mut state = self.state.write();
        state.is_connected = false;
        state.peer_id = None;
    }

    /// Startet den Heartbeat-Task (der Broker trennt stille Verbindungen)
    pub fn start_heartbeat(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(25));
            loop {
                interval.tick().await;
                if client.is_connected() {
                    if let Err(e) = client.send_heartbeat_sync() {
                        tracing::warn!("Failed to send heartbeat: {}", e);
                    }
                } else {
                    tracing::debug!("Heartbeat: client disconnected, stopping task");
                    break;
                }
            }
        });
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn send_message<T: Serialize>(&self, payload: T) -> Result<(), SignalingError> {
        let tx = self
            .tx
            .read()
            .clone()
            .ok_or(SignalingError::NotConnected)?;

        let msg = serde_json::to_string(&payload)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.send(msg)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn send_message_sync<T: Serialize>(&self, payload: T) -> Result<(), SignalingError> {
        let tx = self
            .tx
            .read()
            .clone()
            .ok_or(SignalingError::NotConnected)?;

        let msg = serde_json::to_string(&payload)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // try_send blockiert nicht, der Channel puffert 100 Nachrichten
        tx.try_send(msg)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Broker-Nachrichten
    async fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        assign_tx: &mpsc::Sender<Result<String, SignalingError>>,
    ) {
        match msg {
            ServerMessage::Assigned { peer_id, .. } => {
                tracing::info!("Assigned peer_id: {}", peer_id);
                {
                    let mut s = state.write();
                    s.peer_id = Some(peer_id.clone());
                }
                let _ = assign_tx.send(Ok(peer_id.clone())).await;
                let _ = event_tx.send(SignalingEvent::Assigned { peer_id });
            }

            ServerMessage::IncomingOffer {
                from_peer_id, sdp, ..
            } => {
                let _ = event_tx.send(SignalingEvent::IncomingOffer { from_peer_id, sdp });
            }

            ServerMessage::IncomingAnswer {
                from_peer_id, sdp, ..
            } => {
                let _ = event_tx.send(SignalingEvent::AnswerReceived { from_peer_id, sdp });
            }

            ServerMessage::IncomingIceCandidate {
                from_peer_id,
                candidate,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::IceCandidateReceived {
                    from_peer_id,
                    candidate,
                });
            }

            ServerMessage::IncomingData {
                from_peer_id,
                label,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::IncomingData {
                    from_peer_id,
                    label,
                });
            }

            ServerMessage::CallEnded { by_peer_id, .. } => {
                let _ = event_tx.send(SignalingEvent::CallEnded { by_peer_id });
            }

            ServerMessage::Error { code, message, .. } => {
                tracing::error!("Broker error {}: {}", code, message);
                // Fehler während des Handshakes auch dem Verbindungsaufbau melden
                let _ = assign_tx
                    .send(Err(SignalingError::BrokerError {
                        code,
                        message: message.clone(),
                    }))
                    .await;
                let _ = event_tx.send(SignalingEvent::Error { code, message });
            }

            ServerMessage::Pong { .. } => {
                // Heartbeat-Antwort - nichts zu tun
            }
        }
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("broker_url", &self.broker_url)
            .field("state", &*self.state.read())
            .finish()
    }
}
