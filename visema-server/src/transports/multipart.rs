// multipart/x-mixed-replace JPEG streaming.
//
// Each frame is one part:
//
//   --frame\r\n
//   Content-Type: image/jpeg\r\n
//   Content-Length: <n>\r\n
//   \r\n
//   <jpeg bytes>\r\n
//
// Parts go through a small bounded channel into the HTTP response body. When
// the client reads slower than the frame rate the channel stays full and new
// frames are dropped rather than queued.

use super::{Delivery, StopReason, StreamTransport, TransportKind};
use async_trait::async_trait;
use axum::body::Body;
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use visema_core::{Error, Result};
use visema_render::{encode_jpeg, Frame};

pub const BOUNDARY: &str = "frame";

// How long a stopped stream waits for room to write its closing delimiter
const CLOSE_GRACE: Duration = Duration::from_millis(250);

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
}

/// Frame one JPEG as a multipart part.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

fn closing_delimiter() -> Bytes {
    Bytes::from(format!("--{}--\r\n", BOUNDARY))
}

pub struct MultipartTransport {
    parts: mpsc::Sender<Bytes>,
    quality: u8,
}

/// Receiving half, turned into the streaming response body.
pub struct MultipartBody {
    parts: mpsc::Receiver<Bytes>,
}

impl MultipartTransport {
    /// `buffer_frames` encoded parts may wait for the client before frames are dropped.
    pub fn channel(buffer_frames: usize, quality: u8) -> (Self, MultipartBody) {
        let (tx, rx) = mpsc::channel(buffer_frames.max(1));
        (
            Self { parts: tx, quality },
            MultipartBody { parts: rx },
        )
    }
}

impl MultipartBody {
    pub fn into_body(self) -> Body {
        Body::from_stream(ReceiverStream::new(self.parts).map(Ok::<Bytes, Infallible>))
    }

    /// Next raw part, for callers that consume the stream directly.
    pub async fn next_part(&mut self) -> Option<Bytes> {
        self.parts.recv().await
    }
}

#[async_trait]
impl StreamTransport for MultipartTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Multipart
    }

    async fn deliver(&mut self, frame: Frame, deadline: Instant) -> Result<Delivery> {
        if self.parts.is_closed() {
            return Ok(Delivery::Closed);
        }

        let quality = self.quality;
        let part = tokio::task::spawn_blocking(move || {
            encode_jpeg(&frame.image, quality).map(|jpeg| encode_part(&jpeg))
        })
        .await
        .map_err(|e| Error::Internal(format!("encode task failed: {}", e)))??;

        match tokio::time::timeout_at(deadline, self.parts.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(part);
                Ok(Delivery::Sent)
            }
            Ok(Err(_)) => Ok(Delivery::Closed),
            Err(_) => Ok(Delivery::Dropped),
        }
    }

    async fn closed(&self) {
        self.parts.closed().await
    }

    async fn finish(&mut self, reason: StopReason) {
        // A closed stream gets a proper terminator; a vanished client gets nothing.
        if reason != StopReason::Disconnected {
            let _ = tokio::time::timeout(CLOSE_GRACE, self.parts.send(closing_delimiter())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visema_render::{FrameCompositor, FrameMeta};

    fn frame() -> Frame {
        Frame {
            image: FrameCompositor::default().render(None, 64, 64, 0.0, "aa"),
            meta: FrameMeta {
                index: 0,
                elapsed_ms: 0,
                category: "aa".to_string(),
                openness: 1.0,
            },
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[test]
    fn test_part_layout() {
        let part = encode_part(b"JPEG");
        assert_eq!(
            &part[..],
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nJPEG\r\n"
        );
        assert_eq!(content_type(), "multipart/x-mixed-replace; boundary=frame");
    }

    #[tokio::test]
    async fn test_deliver_sends_jpeg_part() {
        let (mut transport, mut body) = MultipartTransport::channel(1, 85);
        assert_eq!(transport.deliver(frame(), soon()).await.unwrap(), Delivery::Sent);

        let part = body.next_part().await.unwrap();
        let header_end = part.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let header = std::str::from_utf8(&part[..header_end]).unwrap();
        assert!(header.starts_with("--frame\r\nContent-Type: image/jpeg\r\n"));

        let len: usize = header
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let jpeg = &part[header_end..header_end + len];
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&part[header_end + len..], b"\r\n");
    }

    #[tokio::test]
    async fn test_full_buffer_drops_frame() {
        let (mut transport, _body) = MultipartTransport::channel(1, 85);
        assert_eq!(transport.deliver(frame(), soon()).await.unwrap(), Delivery::Sent);
        // nobody is reading, the single slot is taken
        assert_eq!(transport.deliver(frame(), soon()).await.unwrap(), Delivery::Dropped);
    }

    #[tokio::test]
    async fn test_dropped_body_reports_closed() {
        let (mut transport, body) = MultipartTransport::channel(1, 85);
        drop(body);
        assert_eq!(transport.deliver(frame(), soon()).await.unwrap(), Delivery::Closed);
        tokio::time::timeout(Duration::from_millis(50), transport.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_finish_writes_terminator_when_stopped() {
        let (mut transport, mut body) = MultipartTransport::channel(1, 85);
        transport.finish(StopReason::Stopped).await;
        drop(transport);
        assert_eq!(body.next_part().await.unwrap(), Bytes::from_static(b"--frame--\r\n"));
        assert!(body.next_part().await.is_none());
    }
}
