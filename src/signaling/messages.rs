//! Message Types für das Broker-Protokoll
//!
//! Diese Strukturen spiegeln das JSON-Protokoll des Signaling-Brokers
//! wider und ermöglichen typsichere Kommunikation. Der Broker weist
//! jedem Client beim Verbinden eine opake Peer-ID zu und leitet
//! Call-Setup-Nachrichten zwischen zwei Peers weiter.

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// SDP Offer an einen Peer senden
#[derive(Debug, Clone, Serialize)]
pub struct OfferPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: String,
    pub sdp: String,
    pub timestamp: i64,
}

impl OfferPayload {
    pub fn new(from_peer_id: String, to_peer_id: String, sdp: String) -> Self {
        Self {
            msg_type: "offer",
            from_peer_id,
            to_peer_id,
            sdp,
            timestamp: now_millis(),
        }
    }
}

/// SDP Answer an einen Peer senden
#[derive(Debug, Clone, Serialize)]
pub struct AnswerPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: String,
    pub sdp: String,
    pub timestamp: i64,
}

impl AnswerPayload {
    pub fn new(from_peer_id: String, to_peer_id: String, sdp: String) -> Self {
        Self {
            msg_type: "answer",
            from_peer_id,
            to_peer_id,
            sdp,
            timestamp: now_millis(),
        }
    }
}

/// ICE Candidate an einen Peer senden
#[derive(Debug, Clone, Serialize)]
pub struct IceCandidatePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: String,
    pub candidate: String,
    pub timestamp: i64,
}

impl IceCandidatePayload {
    pub fn new(from_peer_id: String, to_peer_id: String, candidate: String) -> Self {
        Self {
            msg_type: "ice_candidate",
            from_peer_id,
            to_peer_id,
            candidate,
            timestamp: now_millis(),
        }
    }
}

/// Anruf beenden
#[derive(Debug, Clone, Serialize)]
pub struct HangupPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: String,
    pub timestamp: i64,
}

impl HangupPayload {
    pub fn new(from_peer_id: String, to_peer_id: String) -> Self {
        Self {
            msg_type: "hangup",
            from_peer_id,
            to_peer_id,
            timestamp: now_millis(),
        }
    }
}

/// Heartbeat gegen den Idle-Timeout des Brokers
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub timestamp: i64,
}

impl HeartbeatPayload {
    pub fn new(peer_id: String) -> Self {
        Self {
            msg_type: "heartbeat",
            peer_id,
            timestamp: now_millis(),
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Broker-Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Peer-ID wurde zugewiesen (direkt nach dem Verbinden)
    Assigned {
        #[serde(rename = "peerId")]
        peer_id: String,
        timestamp: i64,
    },

    /// Eingehendes SDP Offer
    IncomingOffer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        sdp: String,
        timestamp: i64,
    },

    /// Eingehendes SDP Answer
    IncomingAnswer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        sdp: String,
        timestamp: i64,
    },

    /// Eingehender ICE Candidate
    IncomingIceCandidate {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        candidate: String,
        timestamp: i64,
    },

    /// Eingehende Daten-Verbindung (ohne Medien)
    IncomingData {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(default)]
        label: String,
        timestamp: i64,
    },

    /// Anruf wurde von der Gegenseite beendet
    CallEnded {
        #[serde(rename = "byPeerId")]
        by_peer_id: String,
        timestamp: i64,
    },

    /// Fehler vom Broker
    Error {
        code: i32,
        message: String,
        timestamp: i64,
    },

    /// Heartbeat-Antwort
    Pong { timestamp: i64 },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_payload_wire_format() {
        let payload = OfferPayload::new("abc".into(), "def".into(), "v=0".into());
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "offer");
        assert_eq!(json["fromPeerId"], "abc");
        assert_eq!(json["toPeerId"], "def");
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_server_message_assigned() {
        let raw = r#"{"type":"assigned","peerId":"peer-42","timestamp":1700000000000}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();

        match msg {
            ServerMessage::Assigned { peer_id, .. } => assert_eq!(peer_id, "peer-42"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_server_message_incoming_offer() {
        let raw = r#"{"type":"incoming_offer","fromPeerId":"peer-1","sdp":"v=0","timestamp":1}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();

        match msg {
            ServerMessage::IncomingOffer {
                from_peer_id, sdp, ..
            } => {
                assert_eq!(from_peer_id, "peer-1");
                assert_eq!(sdp, "v=0");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_server_message_data_label_defaults_empty() {
        let raw = r#"{"type":"incoming_data","fromPeerId":"peer-1","timestamp":1}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();

        match msg {
            ServerMessage::IncomingData { label, .. } => assert!(label.is_empty()),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
