use anyhow::Result;
use deskcast_media::{VP8_CLOCK_RATE, VP8_MIME_TYPE, VP8_PAYLOAD_TYPE};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

/// Size of one RTCP read; matches a typical MTU
const RTCP_BUFFER_SIZE: usize = 1500;

/// The VP8 capability used both for codec registration and for the outbound track.
///
/// The two must agree or the track has no codec to bind to during negotiation.
pub fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: VP8_MIME_TYPE.to_string(),
        clock_rate: VP8_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![
            RTCPFeedback {
                typ: "goog-remb".to_string(),
                parameter: String::new(),
            },
            RTCPFeedback {
                typ: "ccm".to_string(),
                parameter: "fir".to_string(),
            },
            RTCPFeedback {
                typ: "nack".to_string(),
                parameter: String::new(),
            },
            RTCPFeedback {
                typ: "nack".to_string(),
                parameter: "pli".to_string(),
            },
        ],
    }
}

/// Codec registry and interceptors shared by every viewer's peer connection
pub struct RtcEngine {
    api: API,
    configuration: RTCConfiguration,
}

impl RtcEngine {
    /// Build the engine with VP8 as the only video codec.
    ///
    /// No ICE servers are configured: viewers are expected on a directly
    /// reachable network.
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: vp8_capability(),
                payload_type: VP8_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            configuration: RTCConfiguration::default(),
        })
    }

    pub async fn new_peer_connection(&self) -> webrtc::error::Result<Arc<RTCPeerConnection>> {
        let peer_connection = self
            .api
            .new_peer_connection(self.configuration.clone())
            .await?;
        Ok(Arc::new(peer_connection))
    }
}

/// Read and discard RTCP from the sender so the interceptors (NACK, reports)
/// keep running. Ends when the sender closes or the token is cancelled.
pub async fn drain_rtcp(sender: Arc<RTCRtpSender>, cancel: CancellationToken) {
    let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = sender.read(&mut buf) => {
                if let Err(e) = result {
                    tracing::debug!("RTCP reader stopped: {}", e);
                    break;
                }
            }
        }
    }
}
