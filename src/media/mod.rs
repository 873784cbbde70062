//! Media Module - lokale Aufnahmequellen
//!
//! Dieses Modul verwaltet:
//! - Mikrofon-Capture (cpal)
//! - Kamera-Capture (nokhwa)
//! - Bildschirmfreigabe-Track
//! - Enable-Flags pro Track-Art (Mute / Kamera aus)

mod audio;
mod backend;
mod source;
mod tracks;

pub use audio::{AudioEngine, AudioError, FRAME_SIZE, SAMPLE_RATE};
pub use backend::{list_cameras, CaptureBackend, DeviceCapture, MediaError};
pub use source::MediaSource;
pub use tracks::{LocalTrack, RemoteTrack, RemoteTrackSet, TrackKind, TrackSet};
