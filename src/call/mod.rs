//! Call Module - Session-Lebenszyklus
//!
//! Dieses Modul verwaltet:
//! - den Zustandsautomaten Idle/Dialing/Active
//! - die (höchstens eine) aktive Session
//! - Bildschirmfreigabe-Substitution in der Session
//! - UI-Events über einen Broadcast-Channel

mod manager;

pub use manager::{CallError, CallEvent, CallManager, CallState};
