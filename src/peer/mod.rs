//! Peer Module - Identity/Session Service
//!
//! Dieses Modul verwaltet:
//! - die Capability-Schnittstelle zum Session-Dienst (`PeerService`)
//! - die Session-Schnittstelle (`CallSession`)
//! - die konkrete WebRTC-Implementierung über den Signaling-Broker

mod service;
mod webrtc;

pub use service::{
    CallSession, PeerError, PeerEvent, PeerService, SessionEvent, SessionHandle,
};
pub use webrtc::WebRtcPeerService;
