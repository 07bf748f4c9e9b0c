//! Stream transports
//!
//! A transport carries rendered frames from a session's draw loop to one
//! client. The draw loop owns pacing and rendering; a transport only encodes
//! and delivers, and reports when the client has gone away.

pub mod draw_loop;
pub mod multipart;
pub mod webrtc;
#[cfg(feature = "webrtc")]
pub mod webrtc_native;

pub use draw_loop::{run_draw_loop, spawn_stream, DrawLoopOptions};
pub use multipart::{MultipartBody, MultipartTransport};
pub use self::webrtc::{LoopbackConnector, PeerConnector, SessionDescription, VideoTrack, WebRtcTransport};

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tokio::time::Instant;
use visema_core::Result;
use visema_render::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Multipart,
    WebRtc,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Multipart => f.write_str("multipart"),
            TransportKind::WebRtc => f.write_str("webrtc"),
        }
    }
}

/// Outcome of handing one frame to a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The client could not take the frame before its deadline
    Dropped,
    /// The client is gone
    Closed,
}

/// Why a draw loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Client went away
    Disconnected,
    /// Session was stopped or reaped
    Stopped,
    /// Session no longer exists
    Removed,
    TransportFailure,
    Panicked,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Disconnected => "disconnected",
            StopReason::Stopped => "stopped",
            StopReason::Removed => "removed",
            StopReason::TransportFailure => "transport_failure",
            StopReason::Panicked => "panicked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopReport {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub reason: StopReason,
}

impl LoopReport {
    pub fn ended(reason: StopReason) -> Self {
        Self {
            frames_sent: 0,
            frames_dropped: 0,
            reason,
        }
    }
}

#[async_trait]
pub trait StreamTransport: Send {
    fn kind(&self) -> TransportKind;

    /// Encode and hand over one frame.
    ///
    /// Must return by `deadline`: a consumer that cannot accept the frame in
    /// time gets `Delivery::Dropped`, never a queue of stale frames.
    async fn deliver(&mut self, frame: Frame, deadline: Instant) -> Result<Delivery>;

    /// Resolves once the client has disconnected.
    async fn closed(&self);

    /// Called exactly once after the draw loop ends.
    async fn finish(&mut self, _reason: StopReason) {}
}
