//! Anwendungs-Konfiguration
//!
//! Bündelt Signaling-URL, STUN-Server und die bevorzugten
//! Video-Constraints an einer Stelle. Die Signaling-URL kann über
//! die Umgebungsvariable `SIGNALING_URL` überschrieben werden.

use webrtc::ice_transport::ice_server::RTCIceServer;

/// Default-URL des Signaling-Brokers
pub const DEFAULT_SIGNALING_URL: &str = "https://lumen-signaling.example.workers.dev";

/// Bevorzugte Video-Constraints für die Kamera-Aufnahme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        // 720p ist der Sweet-Spot zwischen Qualität und Bandbreite
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

/// Gesamt-Konfiguration der Anwendung
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub signaling_url: String,
    pub stun_servers: Vec<String>,
    pub video: VideoConstraints,
}

impl AppConfig {
    /// Liest die Konfiguration aus der Umgebung (mit Defaults)
    pub fn from_env() -> Self {
        let signaling_url = std::env::var("SIGNALING_URL")
            .unwrap_or_else(|_| DEFAULT_SIGNALING_URL.to_string());

        Self {
            signaling_url,
            stun_servers: default_stun_servers(),
            video: VideoConstraints::default(),
        }
    }

    /// Baut die ICE-Server-Liste für die RTCConfiguration
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        vec![RTCIceServer {
            urls: self.stun_servers.clone(),
            ..Default::default()
        }]
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Google STUN Server (kostenlos, reicht für ~90% der Verbindungen)
fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
        "stun:stun2.l.google.com:19302".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_video_constraints() {
        let video = VideoConstraints::default();
        assert_eq!((video.width, video.height), (1280, 720));
    }

    #[test]
    fn test_ice_servers_contain_stun() {
        let config = AppConfig {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_servers: default_stun_servers(),
            video: VideoConstraints::default(),
        };

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls.len(), 3);
        assert!(servers[0].urls[0].starts_with("stun:"));
    }
}
