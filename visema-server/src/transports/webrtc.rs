//! WebRTC video transport
//!
//! Signalling is a single offer/answer exchange. The peer connection itself
//! sits behind [`PeerConnector`], so the draw loop only ever sees a
//! [`VideoTrack`] to write frames into.
//!
//! Two connectors exist: [`LoopbackConnector`], an in-process peer used for
//! local testing of the signalling path, and the native connector (feature
//! `webrtc`) that negotiates a real peer connection and sends H.264.

use super::{Delivery, StopReason, StreamTransport, TransportKind};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use visema_core::{Error, FrameGeometry, Result};
use visema_render::{Frame, FrameMeta};

const MAX_SDP_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Cheap structural checks before an offer reaches a peer connection.
    pub fn validate_offer(&self) -> Result<()> {
        if self.kind != SdpType::Offer {
            return Err(Error::Validation("expected an SDP offer".to_string()));
        }
        if self.sdp.len() > MAX_SDP_LEN {
            return Err(Error::Validation("SDP offer too large".to_string()));
        }
        if !self.sdp.starts_with("v=0") {
            return Err(Error::Validation("SDP offer must start with v=0".to_string()));
        }
        Ok(())
    }
}

/// Outgoing video track of one peer connection.
///
/// Delivery is two-phase. [`ready`](VideoTrack::ready) waits for room on the
/// track and is the only step the transport abandons at the frame deadline.
/// Once [`write_frame`](VideoTrack::write_frame) is called the frame is
/// committed: an encoder with inter-frame state must always send what it
/// has encoded, or the remote decoder loses its reference picture.
#[async_trait]
pub trait VideoTrack: Send + Sync {
    /// Resolves once the track can take another frame.
    async fn ready(&self) -> Result<()>;

    /// Encode and send one frame shown for `duration`.
    async fn write_frame(&self, frame: &Frame, duration: Duration) -> Result<()>;

    /// Resolves once the peer has gone away.
    async fn closed(&self);

    /// Tear down the peer connection.
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Answer `offer` and return the track frames should be written to.
    async fn negotiate(
        &self,
        offer: SessionDescription,
        geometry: FrameGeometry,
    ) -> Result<(SessionDescription, Box<dyn VideoTrack>)>;
}

pub struct WebRtcTransport {
    track: Box<dyn VideoTrack>,
    frame_duration: Duration,
}

impl WebRtcTransport {
    /// Negotiate with the remote peer. Returns the transport and the SDP answer.
    pub async fn connect(
        connector: &dyn PeerConnector,
        offer: SessionDescription,
        geometry: FrameGeometry,
    ) -> Result<(Self, SessionDescription)> {
        offer.validate_offer()?;
        let (answer, track) = connector.negotiate(offer, geometry).await?;
        debug!(connector = connector.name(), "peer negotiated");
        Ok((
            Self {
                track,
                frame_duration: geometry.frame_interval(),
            },
            answer,
        ))
    }
}

#[async_trait]
impl StreamTransport for WebRtcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebRtc
    }

    async fn deliver(&mut self, frame: Frame, deadline: Instant) -> Result<Delivery> {
        if self.track.closed().now_or_never().is_some() {
            return Ok(Delivery::Closed);
        }
        if Instant::now() >= deadline {
            return Ok(Delivery::Dropped);
        }
        match tokio::time::timeout_at(deadline, self.track.ready()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(Delivery::Dropped),
        }
        // committed: no deadline past this point
        self.track.write_frame(&frame, self.frame_duration).await?;
        Ok(Delivery::Sent)
    }

    async fn closed(&self) {
        self.track.closed().await
    }

    async fn finish(&mut self, _reason: StopReason) {
        self.track.close().await
    }
}

/// The remote end of a loopback connection.
pub struct LoopbackPeer {
    pub offer: SessionDescription,
    pub geometry: FrameGeometry,
    pub frames: mpsc::Receiver<FrameMeta>,
    hangup: CancellationToken,
}

impl LoopbackPeer {
    pub fn hang_up(&self) {
        self.hangup.cancel();
    }

    /// Whether the server side closed the connection.
    pub fn is_hung_up(&self) -> bool {
        self.hangup.is_cancelled()
    }
}

/// In-process peer: frame metadata is handed to a [`LoopbackPeer`] instead
/// of being encoded and sent over the network.
pub struct LoopbackConnector {
    peers_tx: mpsc::UnboundedSender<LoopbackPeer>,
    peers_rx: Mutex<Option<mpsc::UnboundedReceiver<LoopbackPeer>>>,
    buffer_frames: usize,
}

impl LoopbackConnector {
    pub fn new(buffer_frames: usize) -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            peers_tx,
            peers_rx: Mutex::new(Some(peers_rx)),
            buffer_frames: buffer_frames.max(1),
        }
    }

    /// Stream of connected peers. Can be taken once; later calls return `None`.
    pub fn take_peers(&self) -> Option<mpsc::UnboundedReceiver<LoopbackPeer>> {
        self.peers_rx.lock().take()
    }
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new(4)
    }
}

fn loopback_answer(geometry: FrameGeometry) -> String {
    format!(
        "v=0\r\n\
         o=- {} 2 IN IP4 127.0.0.1\r\n\
         s=visema-loopback\r\n\
         t=0 0\r\n\
         m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
         c=IN IP4 127.0.0.1\r\n\
         a=sendonly\r\n\
         a=rtpmap:96 H264/90000\r\n\
         a=framerate:{}\r\n\
         a=imageattr:96 send [x={},y={}]\r\n",
        uuid::Uuid::new_v4().as_u128() as u64 >> 1,
        geometry.fps,
        geometry.width,
        geometry.height
    )
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn negotiate(
        &self,
        offer: SessionDescription,
        geometry: FrameGeometry,
    ) -> Result<(SessionDescription, Box<dyn VideoTrack>)> {
        let (frames_tx, frames_rx) = mpsc::channel(self.buffer_frames);
        let hangup = CancellationToken::new();
        let peer = LoopbackPeer {
            offer,
            geometry,
            frames: frames_rx,
            hangup: hangup.clone(),
        };
        self.peers_tx
            .send(peer)
            .map_err(|_| Error::TransportFailure("loopback peer listener is gone".to_string()))?;

        let track = LoopbackTrack {
            frames: frames_tx,
            slot: Mutex::new(None),
            hangup,
        };
        Ok((SessionDescription::answer(loopback_answer(geometry)), Box::new(track)))
    }
}

struct LoopbackTrack {
    frames: mpsc::Sender<FrameMeta>,
    // buffer slot reserved by `ready`, consumed by `write_frame`
    slot: Mutex<Option<OwnedPermit<FrameMeta>>>,
    hangup: CancellationToken,
}

impl LoopbackTrack {
    fn check_open(&self) -> Result<()> {
        if self.hangup.is_cancelled() {
            return Err(Error::TransportFailure("peer hung up".to_string()));
        }
        Ok(())
    }
}

fn peer_gone() -> Error {
    Error::TransportFailure("peer stopped receiving".to_string())
}

#[async_trait]
impl VideoTrack for LoopbackTrack {
    async fn ready(&self) -> Result<()> {
        self.check_open()?;
        let reserved = self.slot.lock().is_some();
        if reserved {
            return Ok(());
        }
        let permit = self.frames.clone().reserve_owned().await.map_err(|_| peer_gone())?;
        *self.slot.lock() = Some(permit);
        Ok(())
    }

    async fn write_frame(&self, frame: &Frame, _duration: Duration) -> Result<()> {
        self.check_open()?;
        let reserved = self.slot.lock().take();
        match reserved {
            Some(permit) => {
                permit.send(frame.meta.clone());
                Ok(())
            }
            None => self.frames.send(frame.meta.clone()).await.map_err(|_| peer_gone()),
        }
    }

    async fn closed(&self) {
        tokio::select! {
            _ = self.hangup.cancelled() => {}
            _ = self.frames.closed() => {}
        }
    }

    async fn close(&self) {
        self.hangup.cancel();
    }
}
