// Router-level tests: requests go through axum without a socket.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use visema_core::RenderConfig;
use visema_server::transports::{LoopbackConnector, PeerConnector};
use visema_server::{create_router, AppState, SessionManager};

const OFFER: &str = "v=0\r\no=- 7 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=recvonly\r\n";

fn state(connector: Option<Arc<dyn PeerConnector>>) -> AppState {
    let config = RenderConfig::default();
    AppState {
        manager: Arc::new(SessionManager::from_config(&config, None)),
        config: Arc::new(config),
        connector,
    }
}

fn app() -> Router {
    create_router(state(None))
}

async fn send(app: &Router, request: Request<Body>) -> axum::response::Response {
    app.clone().oneshot(request).await.unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn start(app: &Router, body: Value) -> Value {
    let response = send(app, post_json("/render/start", body)).await;
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

/// Pull chunks until one complete multipart part is buffered; return its JPEG payload.
async fn next_jpeg<S>(stream: &mut S, buf: &mut Vec<u8>) -> Vec<u8>
where
    S: futures::Stream<Item = Result<bytes::Bytes, axum::Error>> + Unpin,
{
    loop {
        if let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let header = String::from_utf8_lossy(&buf[..header_end]).to_string();
            assert!(header.starts_with("--frame\r\n"), "bad part header: {:?}", header);
            let len: usize = header
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            let body_start = header_end + 4;
            if buf.len() >= body_start + len + 2 {
                let jpeg = buf[body_start..body_start + len].to_vec();
                assert_eq!(&buf[body_start + len..body_start + len + 2], b"\r\n");
                buf.drain(..body_start + len + 2);
                return jpeg;
            }
        }
        let chunk = stream.next().await.expect("stream ended").unwrap();
        buf.extend_from_slice(&chunk);
    }
}

#[tokio::test]
async fn test_root_and_health() {
    let app = app();
    let response = send(&app, get("/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let text = axum::body::to_bytes(response.into_body(), 16).await.unwrap();
    assert_eq!(&text[..], b"ok");

    let health = json_body(send(&app, get("/health")).await).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["sessions"], 0);
}

#[tokio::test]
async fn test_start_returns_stream_url() {
    let app = app();
    let body = start(
        &app,
        json!({
            "avatarKey": "nonexistent-key",
            "visemes": [{"timeMs": 0, "type": "SIL"}, {"timeMs": 300, "type": "aa"}],
            "width": 512, "height": 512, "fps": 15
        }),
    )
    .await;

    let id = body["sessionId"].as_str().unwrap();
    assert_eq!(body["streamUrl"], format!("/stream/{}", id));
    assert_eq!(body["streamHandle"], id);
    assert_eq!((body["width"].as_u64(), body["fps"].as_u64()), (Some(512), Some(15)));

    let info = json_body(send(&app, get(&format!("/render/{}", id))).await).await;
    assert_eq!(info["state"], "active");
    assert_eq!(info["hasAvatar"], false);
    assert_eq!(info["timelineEvents"], 2);
}

#[tokio::test]
async fn test_start_clamps_and_defaults() {
    let app = app();
    let body = start(&app, json!({"width": 5000, "fps": 0})).await;
    assert_eq!(body["width"], 1920);
    assert_eq!(body["height"], 512);
    assert_eq!(body["fps"], 1);
}

#[tokio::test]
async fn test_start_uses_dialogue_reply_timeline() {
    let app = app();
    let body = start(
        &app,
        json!({
            "reply": {
                "replyText": "hello",
                "audioBase64": "",
                "visemes": [{"timeMs": 0, "type": "sil"}, {"timeMs": 80, "type": "a"}]
            }
        }),
    )
    .await;
    let id = body["sessionId"].as_str().unwrap();
    let info = json_body(send(&app, get(&format!("/render/{}", id))).await).await;
    assert_eq!(info["timelineEvents"], 2);
}

#[tokio::test]
async fn test_start_rejects_malformed_input() {
    let app = app();
    let cases = [
        json!({"width": -1}),
        json!({"visemes": [{"timeMs": 300, "type": "aa"}, {"timeMs": 0, "type": "SIL"}]}),
        json!({"visemes": [{"timeMs": 0, "type": ""}]}),
        json!({"visemes": "not a list"}),
    ];
    for case in cases {
        let response = send(&app, post_json("/render/start", case.clone())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", case);
        let body = json_body(response).await;
        assert_eq!(body["code"], "validation_error");
    }

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/render/start")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let health = json_body(send(&app, get("/health")).await).await;
    assert_eq!(health["sessions"], 0);
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let app = app();
    assert_eq!(send(&app, get("/stream/nope")).await.status(), StatusCode::NOT_FOUND);
    assert_eq!(send(&app, get("/render/nope")).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let app = app();
    let body = start(&app, json!({})).await;
    let id = body["sessionId"].as_str().unwrap();

    for uri in [format!("/render/{}/stop", id), format!("/render/{}/stop", id)] {
        let response = send(
            &app,
            Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/render/{}", id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert_eq!(
        send(&app, get(&format!("/stream/{}", id))).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_stream_headers_and_frames() {
    let app = app();
    let body = start(&app, json!({"width": 96, "height": 64, "fps": 10})).await;
    let url = body["streamUrl"].as_str().unwrap().to_string();

    let response = send(&app, get(&url)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers[header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache, no-store, must-revalidate");
    assert_eq!(headers[header::PRAGMA], "no-cache");
    assert_eq!(headers["x-accel-buffering"], "no");

    let mut stream = response.into_body().into_data_stream();
    let mut buf = Vec::new();
    for _ in 0..2 {
        let jpeg = next_jpeg(&mut stream, &mut buf).await;
        let frame = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((frame.width(), frame.height()), (96, 64));
    }
}

#[tokio::test]
async fn test_second_viewer_is_refused() {
    let app = app();
    let body = start(&app, json!({"fps": 5})).await;
    let url = body["streamUrl"].as_str().unwrap().to_string();

    let first = send(&app, get(&url)).await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = send(&app, get(&url)).await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(second).await["code"], "already_attached");
    drop(first);
}

#[tokio::test]
async fn test_disconnect_removes_session() {
    let app = app();
    let body = start(&app, json!({"width": 64, "height": 64, "fps": 10})).await;
    let id = body["sessionId"].as_str().unwrap().to_string();

    let response = send(&app, get(&format!("/stream/{}", id))).await;
    let mut stream = response.into_body().into_data_stream();
    let mut buf = Vec::new();
    next_jpeg(&mut stream, &mut buf).await;
    drop(stream);

    // gone within about one frame interval (100ms at 10 fps)
    let mut status = StatusCode::OK;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = send(&app, get(&format!("/render/{}", id))).await.status();
        if status == StatusCode::NOT_FOUND {
            break;
        }
    }
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webrtc_offer_without_connector_is_501() {
    let app = app();
    let response = send(
        &app,
        post_json("/webrtc/offer", json!({"type": "offer", "sdp": OFFER})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_webrtc_offer_with_loopback() {
    let connector = Arc::new(LoopbackConnector::new(8));
    let mut peers = connector.take_peers().unwrap();
    let app = create_router(state(Some(connector)));

    let response = send(
        &app,
        post_json(
            "/webrtc/offer",
            json!({"type": "offer", "sdp": OFFER, "width": 321, "height": 241, "fps": 20}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let answer = json_body(response).await;
    assert_eq!(answer["type"], "answer");
    assert!(answer["sdp"].as_str().unwrap().starts_with("v=0"));

    let mut peer = peers.recv().await.unwrap();
    // video encoders need even dimensions
    assert_eq!((peer.geometry.width, peer.geometry.height), (320, 240));
    let first = peer.frames.recv().await.unwrap();
    assert_eq!(first.category, "SIL");

    let id = answer["sessionId"].as_str().unwrap();
    let info = json_body(send(&app, get(&format!("/render/{}", id))).await).await;
    assert_eq!(info["attached"], true);

    peer.hang_up();
    let mut status = StatusCode::OK;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = send(&app, get(&format!("/render/{}", id))).await.status();
        if status == StatusCode::NOT_FOUND {
            break;
        }
    }
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webrtc_rejects_answer_as_offer() {
    let app = create_router(state(Some(Arc::new(LoopbackConnector::default()))));
    let response = send(
        &app,
        post_json("/webrtc/offer", json!({"type": "answer", "sdp": OFFER})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
