//! Lumen - P2P Video Call Application
//!
//! Eine serverlose P2P Video-Call-Applikation mit:
//! - externem Signaling-Broker für die Vermittlung
//! - WebRTC für P2P Audio/Video
//! - Kamera-, Mikrofon- und Bildschirm-Aufnahme
//! - Bildschirmfreigabe per Track-Substitution

pub mod call;
pub mod config;
pub mod media;
pub mod peer;
pub mod signaling;

#[cfg(test)]
mod testing;

use call::{CallEvent, CallManager, CallState};
use config::AppConfig;
use media::{DeviceCapture, MediaSource};
use once_cell::sync::OnceCell;
use peer::{PeerService, WebRtcPeerService};
use std::sync::Arc;
use tauri::{AppHandle, Emitter, Manager, RunEvent, State};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Globaler Application State
pub struct AppState {
    config: AppConfig,
    media: Arc<MediaSource>,
    peer: Arc<WebRtcPeerService>,
    manager: Arc<CallManager>,
}

/// Singleton für den AppState
static APP_STATE: OnceCell<Arc<AppState>> = OnceCell::new();

impl AppState {
    /// Initialisiert den Application State
    pub fn init() -> Result<Arc<Self>, String> {
        // Logging initialisieren
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("lumen=debug".parse().unwrap())
                    .add_directive("webrtc=warn".parse().unwrap()),
            )
            .init();

        tracing::info!("Initializing Lumen...");

        let config = AppConfig::from_env();
        let media = Arc::new(MediaSource::new(Arc::new(DeviceCapture::new())));
        let peer = Arc::new(WebRtcPeerService::new(&config));
        let manager = CallManager::new(
            Arc::clone(&peer) as Arc<dyn PeerService>,
            Arc::clone(&media),
        );

        let state = Arc::new(Self {
            config,
            media,
            peer,
            manager,
        });

        APP_STATE
            .set(Arc::clone(&state))
            .map_err(|_| "AppState already initialized")?;

        Ok(state)
    }

    /// Gibt den globalen AppState zurück
    pub fn get() -> Option<Arc<Self>> {
        APP_STATE.get().cloned()
    }
}

// ============================================================================
// TAURI COMMANDS - SERVICE
// ============================================================================

/// Verbindet mit dem Session-Dienst, gibt die eigene Peer ID zurück
#[tauri::command]
async fn connect_service(state: State<'_, Arc<AppState>>) -> Result<String, String> {
    state.peer.connect().await.map_err(|e| e.to_string())
}

/// Gibt die eigene Peer ID zurück (falls verbunden)
#[tauri::command]
async fn get_peer_id(state: State<'_, Arc<AppState>>) -> Result<Option<String>, String> {
    Ok(state.peer.local_identity())
}

// ============================================================================
// TAURI COMMANDS - MEDIA
// ============================================================================

/// Fordert Kamera + Mikrofon an
#[tauri::command]
async fn acquire_media(state: State<'_, Arc<AppState>>) -> Result<(), String> {
    state
        .media
        .acquire(&state.config.video)
        .await
        .map_err(|e| e.to_string())
}

/// Ob lokale Medien vorhanden sind
#[tauri::command]
async fn is_media_ready(state: State<'_, Arc<AppState>>) -> Result<bool, String> {
    Ok(state.media.is_ready())
}

/// Kippt das Mikrofon, gibt den neuen Zustand zurück
#[tauri::command]
async fn toggle_audio(state: State<'_, Arc<AppState>>) -> Result<bool, String> {
    Ok(state.media.toggle_audio())
}

/// Kippt die Kamera, gibt den neuen Zustand zurück
#[tauri::command]
async fn toggle_video(state: State<'_, Arc<AppState>>) -> Result<bool, String> {
    Ok(state.media.toggle_video())
}

/// Gibt den aktuellen Mikrofon-Pegel zurück (0.0 - 1.0)
#[tauri::command]
async fn get_input_level(state: State<'_, Arc<AppState>>) -> Result<f32, String> {
    Ok(state.media.input_level())
}

// ============================================================================
// TAURI COMMANDS - CALLS
// ============================================================================

/// Startet einen ausgehenden Anruf
#[tauri::command]
async fn place_call(remote_id: String, state: State<'_, Arc<AppState>>) -> Result<(), String> {
    state
        .manager
        .place_call(&remote_id)
        .await
        .map_err(|e| e.to_string())
}

/// Beendet den aktuellen Anruf
#[tauri::command]
async fn end_call(state: State<'_, Arc<AppState>>) -> Result<(), String> {
    state.manager.end_call().await;
    Ok(())
}

/// Gibt den aktuellen Call-Zustand zurück
#[tauri::command]
async fn get_call_state(state: State<'_, Arc<AppState>>) -> Result<CallState, String> {
    Ok(state.manager.state())
}

/// Startet bzw. beendet die Bildschirmfreigabe
#[tauri::command]
async fn toggle_screen_share(state: State<'_, Arc<AppState>>) -> Result<bool, String> {
    state
        .manager
        .toggle_screen_share()
        .await
        .map_err(|e| e.to_string())
}

// ============================================================================
// TAURI COMMANDS - DEVICES
// ============================================================================

/// Repräsentiert ein Audio-Gerät
#[derive(serde::Serialize)]
struct AudioDevice {
    name: String,
    is_default: bool,
}

/// Gibt alle verfügbaren Audio-Geräte zurück
#[tauri::command]
async fn get_audio_devices() -> Result<(Vec<AudioDevice>, Vec<AudioDevice>), String> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let input_devices: Vec<AudioDevice> = host
        .input_devices()
        .map_err(|e| e.to_string())?
        .filter_map(|d| {
            d.name().ok().map(|name| AudioDevice {
                is_default: Some(&name) == default_input.as_ref(),
                name,
            })
        })
        .collect();

    let output_devices: Vec<AudioDevice> = host
        .output_devices()
        .map_err(|e| e.to_string())?
        .filter_map(|d| {
            d.name().ok().map(|name| AudioDevice {
                is_default: Some(&name) == default_output.as_ref(),
                name,
            })
        })
        .collect();

    Ok((input_devices, output_devices))
}

/// Gibt alle verfügbaren Kameras zurück
#[tauri::command]
async fn get_cameras() -> Result<Vec<String>, String> {
    media::list_cameras().map_err(|e| e.to_string())
}

// ============================================================================
// EVENT HANDLER
// ============================================================================

/// Leitet Manager-Events an das Frontend weiter
fn handle_call_event(event: CallEvent, manager: &Arc<CallManager>, app_handle: &AppHandle) {
    match event {
        CallEvent::StateChanged { state } => {
            tracing::info!("Call state changed: {:?}", state);
            let _ = app_handle.emit("call:state_changed", &state);
        }

        CallEvent::RemoteStream(tracks) => {
            let remote = match manager.state() {
                CallState::Dialing { remote } | CallState::Active { remote } => remote,
                CallState::Idle => return,
            };
            let _ = app_handle.emit(
                "call:remote_stream",
                serde_json::json!({
                    "remote": remote,
                    "tracks": tracks.tracks,
                }),
            );
        }

        CallEvent::ScreenShare { active } => {
            let _ = app_handle.emit("call:screen_share", serde_json::json!({ "active": active }));
        }

        CallEvent::ServiceReady { identity } => {
            let _ = app_handle.emit(
                "service:ready",
                serde_json::json!({ "identity": identity }),
            );
        }

        CallEvent::ServiceDown => {
            let _ = app_handle.emit("service:down", ());
        }

        CallEvent::Error(message) => {
            tracing::error!("Call error: {}", message);
            let _ = app_handle.emit("call:error", &message);
        }
    }
}

// ============================================================================
// TAURI APP RUNNER
// ============================================================================

/// Startet die Tauri-Anwendung
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    tauri::Builder::default()
        .plugin(tauri_plugin_single_instance::init(|app, _args, _cwd| {
            let _ = app
                .get_webview_window("main")
                .expect("no main window")
                .set_focus();
        }))
        .plugin(tauri_plugin_opener::init())
        .setup(move |app| {
            // App State initialisieren
            let state = AppState::init().expect("Failed to initialize app state");

            // Dienst-Events in den Manager leiten
            let service_events = state
                .peer
                .take_events()
                .expect("Service events already taken");
            state.manager.run_service_events(service_events);

            // Manager-Events ans Frontend weiterleiten
            let manager = Arc::clone(&state.manager);
            let mut events = manager.subscribe();
            let app_handle = app.handle().clone();
            tauri::async_runtime::spawn(async move {
                while let Ok(event) = events.recv().await {
                    handle_call_event(event, &manager, &app_handle);
                }
            });

            // State im Tauri-App registrieren
            app.manage(state);

            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            // Service
            connect_service,
            get_peer_id,
            // Media
            acquire_media,
            is_media_ready,
            toggle_audio,
            toggle_video,
            get_input_level,
            // Calls
            place_call,
            end_call,
            get_call_state,
            toggle_screen_share,
            // Devices
            get_audio_devices,
            get_cameras,
        ])
        .build(tauri::generate_context!())
        .expect("error while running tauri application")
        .run(|_app_handle, event| {
            if let RunEvent::Exit = event {
                // Best-effort Teardown: Anruf beenden, Geräte freigeben
                if let Some(state) = AppState::get() {
                    tauri::async_runtime::block_on(state.manager.shutdown());
                    state.media.release_all();
                }
            }
        });
}
