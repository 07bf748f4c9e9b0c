//! visema-server: sessions, stream transports and the HTTP surface
//!
//! Wiring:
//! - [`session::SessionManager`] owns the session registry and the avatar cache
//! - [`transports`] run one draw loop per attached client
//! - [`http::create_router`] exposes everything over axum

pub mod assets;
pub mod error;
pub mod http;
pub mod session;
pub mod transports;

pub use error::ApiError;
pub use http::{create_router, AppState};
pub use session::{SessionId, SessionInfo, SessionManager, SessionState};

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use transports::webrtc::LoopbackPeer;
use transports::{LoopbackConnector, PeerConnector};
use visema_core::{RenderConfig, Result, WebRtcBackend};

/// Assemble application state from configuration.
///
/// Must run inside a tokio runtime when the loopback WebRTC backend is selected.
pub fn build_state(config: RenderConfig) -> Result<AppState> {
    let assets = assets::from_config(&config)?;
    if let Some(store) = &assets {
        info!(store = store.name(), "avatar asset store configured");
    }
    let manager = Arc::new(SessionManager::from_config(&config, assets));
    let connector = build_connector(&config)?;

    Ok(AppState {
        manager,
        config: Arc::new(config),
        connector,
    })
}

pub fn build_connector(config: &RenderConfig) -> Result<Option<Arc<dyn PeerConnector>>> {
    match config.webrtc {
        WebRtcBackend::Disabled => Ok(None),
        WebRtcBackend::Loopback => {
            let connector = LoopbackConnector::new(config.stream_buffer_frames);
            if let Some(peers) = connector.take_peers() {
                tokio::spawn(log_loopback_peers(peers));
            }
            Ok(Some(Arc::new(connector)))
        }
        #[cfg(feature = "webrtc")]
        WebRtcBackend::Native => {
            let connector = transports::webrtc_native::NativeConnector::new(config.ice_servers.clone())?;
            Ok(Some(Arc::new(connector)))
        }
        #[cfg(not(feature = "webrtc"))]
        WebRtcBackend::Native => Err(visema_core::Error::NotConfigured(
            "native WebRTC requires building visema-server with the `webrtc` feature".to_string(),
        )),
    }
}

// Loopback peers in a running server just log what they receive.
async fn log_loopback_peers(mut peers: mpsc::UnboundedReceiver<LoopbackPeer>) {
    while let Some(mut peer) = peers.recv().await {
        tokio::spawn(async move {
            let mut frames = 0u64;
            while let Some(meta) = peer.frames.recv().await {
                frames += 1;
                debug!(index = meta.index, category = %meta.category, "loopback frame");
            }
            info!(frames, "loopback peer finished");
        });
    }
}
