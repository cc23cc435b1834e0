//! End-to-end tests for the signaling endpoint
//!
//! A real server is started on an ephemeral port and driven with a WebSocket
//! client. `sleep` stands in for the encoder so no capture device is needed.
//!
//! Run with: cargo test -p deskcast-server --test signaling_integration

#![cfg(unix)]

use deskcast_server::state::{AppState, Config, EncoderConfig, SignalingConfig};
use deskcast_server::ws::connections::ConnectionPhase;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use webrtc::api::APIBuilder;
use webrtc::api::media_engine::MediaEngine;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Time allowed for a reply that must not arrive
const QUIET_PERIOD: Duration = Duration::from_millis(300);

struct TestServer {
    addr: std::net::SocketAddr,
    state: AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start(max_viewers: usize) -> anyhow::Result<Self> {
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            max_viewers,
            signaling: SignalingConfig {
                gather_before_offer: false,
                ..SignalingConfig::default()
            },
            encoder: EncoderConfig {
                program: "sleep".to_string(),
                args: Some(vec!["30".to_string()]),
                ..EncoderConfig::default()
            },
        };

        let (router, state) = deskcast_server::create_app(config)?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn connect(&self) -> Socket {
        let (socket, _) = connect_async(self.ws_url())
            .await
            .expect("WebSocket connect failed");
        socket
    }

    async fn wait_for_no_viewers(&self) {
        assert!(
            self.state.connections.wait_idle(Duration::from_secs(10)).await,
            "connection was not cleaned up"
        );
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.connections.shutdown();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn request_offer(socket: &mut Socket) -> String {
    socket
        .send(Message::Text("offerreqXYZ".into()))
        .await
        .unwrap();

    loop {
        let msg = timeout(Duration::from_secs(10), socket.next())
            .await
            .expect("no offer within timeout")
            .expect("socket closed")
            .unwrap();

        if let Message::Text(text) = msg {
            return text.to_string();
        }
    }
}

/// Expect the server to stay silent for a short while
async fn assert_no_reply(socket: &mut Socket) {
    match timeout(QUIET_PERIOD, socket.next()).await {
        Err(_) => {}
        Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
        Ok(other) => panic!("unexpected reply: {:?}", other),
    }
}

async fn viewer_peer(offer: &str) -> (Arc<RTCPeerConnection>, String) {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let api = APIBuilder::new().with_media_engine(media_engine).build();
    let viewer = Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap(),
    );

    viewer
        .set_remote_description(RTCSessionDescription::offer(offer.to_string()).unwrap())
        .await
        .unwrap();
    let answer = viewer.create_answer(None).await.unwrap();
    viewer.set_local_description(answer.clone()).await.unwrap();

    (viewer, answer.sdp)
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start(1).await.unwrap();

    let response = reqwest::get(format!("{}/health", server.http_url()))
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_offer_request_returns_video_offer() {
    let server = TestServer::start(1).await.unwrap();
    let mut socket = server.connect().await;

    let offer = request_offer(&mut socket).await;
    assert!(offer.starts_with("v=0"));
    assert!(offer.contains("m=video"));
    assert!(offer.contains("VP8/90000"));

    // The offer request is answered once; nothing else follows
    assert_no_reply(&mut socket).await;

    socket.close(None).await.unwrap();
    server.wait_for_no_viewers().await;
}

#[tokio::test]
async fn test_full_negotiation_is_silent() {
    let server = TestServer::start(1).await.unwrap();
    let mut socket = server.connect().await;

    // Candidate before the answer is queued, not replied to
    let candidate = r#"{"candidate":{"candidate":"candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
    socket.send(Message::Text(candidate.into())).await.unwrap();
    assert_no_reply(&mut socket).await;

    let offer = request_offer(&mut socket).await;
    let (viewer, answer) = viewer_peer(&offer).await;

    socket.send(Message::Text(answer.into())).await.unwrap();
    assert_no_reply(&mut socket).await;

    // Binary frames and garbage candidates are ignored without closing the socket
    socket
        .send(Message::Binary(vec![1u8, 2, 3].into()))
        .await
        .unwrap();
    socket
        .send(Message::Text(r#"{"candidate":42}"#.into()))
        .await
        .unwrap();
    assert_no_reply(&mut socket).await;

    // Still alive: another offer request is served
    let again = request_offer(&mut socket).await;
    assert!(again.starts_with("v=0"));

    socket.close(None).await.unwrap();
    server.wait_for_no_viewers().await;
    viewer.close().await.unwrap();
}

#[tokio::test]
async fn test_connection_phase_tracks_lifecycle() {
    let server = TestServer::start(1).await.unwrap();
    let mut socket = server.connect().await;

    // Wait until the session is up
    let _ = request_offer(&mut socket).await;
    assert_eq!(server.state.connections.active_count().await, 1);

    drop(socket);
    server.wait_for_no_viewers().await;
    assert_eq!(server.state.connections.active_count().await, 0);

    // A fresh connection starts from scratch
    let mut socket = server.connect().await;
    assert!(request_offer(&mut socket).await.starts_with("v=0"));
    socket.close(None).await.unwrap();
    server.wait_for_no_viewers().await;
}

#[tokio::test]
async fn test_second_viewer_rejected_when_full() {
    let server = TestServer::start(1).await.unwrap();
    let mut first = server.connect().await;
    let _ = request_offer(&mut first).await;

    match connect_async(server.ws_url()).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 503);
        }
        other => panic!("expected 503, got {:?}", other.map(|(_, r)| r.status())),
    }

    first.close(None).await.unwrap();
    server.wait_for_no_viewers().await;

    // Room again once the first viewer left
    let mut second = server.connect().await;
    assert!(request_offer(&mut second).await.starts_with("v=0"));
    second.close(None).await.unwrap();
    server.wait_for_no_viewers().await;
}

#[tokio::test]
async fn test_shutdown_closes_viewers() {
    let server = TestServer::start(2).await.unwrap();
    let mut socket = server.connect().await;
    let _ = request_offer(&mut socket).await;

    assert_eq!(server.state.connections.active_count().await, 1);

    server.state.connections.shutdown();

    // Server sends a close frame and drops the connection
    let closed = timeout(Duration::from_secs(10), async {
        while let Some(msg) = socket.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => return true,
                _ => {}
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);

    server.wait_for_no_viewers().await;
    assert!(connect_async(server.ws_url()).await.is_err());
}

#[tokio::test]
async fn test_phase_is_negotiating_after_upgrade() {
    let server = TestServer::start(1).await.unwrap();
    let mut socket = server.connect().await;
    let _ = request_offer(&mut socket).await;

    let phases = server.state.connections.phases().await;
    assert_eq!(phases.len(), 1);
    assert!(matches!(
        phases[0],
        ConnectionPhase::Negotiating | ConnectionPhase::Streaming
    ));

    socket.close(None).await.unwrap();
    server.wait_for_no_viewers().await;
}
