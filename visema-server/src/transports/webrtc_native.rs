// Native peer connections: webrtc-rs for signalling and RTP, openh264 for
// encoding. Frames are sent as H.264 samples on a single sendonly track.

use super::webrtc::{PeerConnector, SessionDescription, VideoTrack};
use async_trait::async_trait;
use bytes::Bytes;
use openh264::encoder::Encoder;
use openh264::formats::{RgbSliceU8, YUVBuffer};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use visema_core::{Error, FrameGeometry, Result};
use visema_render::Frame;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

// Constrained baseline, what browsers decode everywhere
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

fn transport_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::TransportFailure(format!("{}: {}", context, e))
}

pub struct NativeConnector {
    api: API,
    ice_servers: Vec<String>,
}

impl NativeConnector {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| Error::Internal(format!("register codecs: {}", e)))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| Error::Internal(format!("register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for NativeConnector {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn negotiate(
        &self,
        offer: SessionDescription,
        geometry: FrameGeometry,
    ) -> Result<(SessionDescription, Box<dyn VideoTrack>)> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config())
                .await
                .map_err(|e| transport_err("create peer connection", e))?,
        );

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: H264_FMTP.to_owned(),
                rtcp_feedback: vec![],
            },
            "video".to_owned(),
            "visema".to_owned(),
        ));
        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| transport_err("add track", e))?;

        // RTCP must be read for interceptors (NACK, reports) to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let closed = CancellationToken::new();
        let on_state = closed.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(?state, "peer connection state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
                    | RTCPeerConnectionState::Disconnected
            ) {
                on_state.cancel();
            }
            Box::pin(async {})
        }));

        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| Error::Validation(format!("invalid SDP offer: {}", e)))?;
        pc.set_remote_description(remote)
            .await
            .map_err(|e| Error::Validation(format!("rejected SDP offer: {}", e)))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| transport_err("create answer", e))?;
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|e| transport_err("set local description", e))?;
        // non-trickle: the answer carries every candidate
        let _ = gathered.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::TransportFailure("no local description".to_string()))?;

        let encoder = Encoder::new().map_err(|e| Error::Internal(format!("H.264 encoder: {}", e)))?;
        info!(
            width = geometry.width,
            height = geometry.height,
            fps = geometry.fps,
            "peer connection negotiated"
        );

        let video = NativeTrack {
            pc,
            track,
            encoder: Arc::new(Mutex::new(encoder)),
            closed,
        };
        Ok((SessionDescription::answer(local.sdp), Box::new(video)))
    }
}

struct NativeTrack {
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    encoder: Arc<Mutex<Encoder>>,
    closed: CancellationToken,
}

#[async_trait]
impl VideoTrack for NativeTrack {
    // write_sample packetizes straight into RTP, so there is no queue to wait on
    async fn ready(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::TransportFailure("peer connection closed".to_string()));
        }
        Ok(())
    }

    async fn write_frame(&self, frame: &Frame, duration: Duration) -> Result<()> {
        self.ready().await?;

        let encoder = Arc::clone(&self.encoder);
        let image = frame.image.clone();
        let data = tokio::task::spawn_blocking(move || {
            let (w, h) = (image.width() as usize, image.height() as usize);
            let yuv = YUVBuffer::from_rgb_source(RgbSliceU8::new(image.as_raw(), (w, h)));
            let mut encoder = encoder.lock();
            encoder
                .encode(&yuv)
                .map(|bitstream| Bytes::from(bitstream.to_vec()))
                .map_err(|e| Error::Internal(format!("H.264 encode: {}", e)))
        })
        .await
        .map_err(|e| Error::Internal(format!("encode task failed: {}", e)))??;

        // the encoder has advanced its reference chain: this sample must go out
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| transport_err("write sample", e))
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "error closing peer connection");
        }
    }
}
