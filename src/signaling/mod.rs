//! Signaling Module - Verbindung zum Broker
//!
//! Dieses Modul verwaltet:
//! - WebSocket-Verbindung zum externen Signaling-Broker
//! - Zuweisung der eigenen Peer-ID
//! - Relay von SDP Offers/Answers und ICE Candidates

mod client;
mod messages;

pub use client::{SignalingClient, SignalingError, SignalingEvent};
pub use messages::ServerMessage;
