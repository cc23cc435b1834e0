use crate::rtc::RtcEngine;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub const VIDEO_TRACK_ID: &str = "video";
pub const STREAM_ID: &str = "screen-share";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("Session is closed")]
    Closed,
}

/// Offer/answer progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::New => "new",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::Stable => "stable",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What happened to a candidate handed to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    /// Held until the remote description is committed
    Queued,
}

pub struct ScreenSession {
    peer_connection: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    pending_candidates: Vec<RTCIceCandidateInit>,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
    closed: bool,
}

impl ScreenSession {
    /// Create a peer connection and an outbound track for `capability`.
    ///
    /// The track is not attached yet; call [`ScreenSession::add_track`].
    pub async fn create(
        engine: &RtcEngine,
        capability: RTCRtpCodecCapability,
    ) -> Result<(Self, Arc<TrackLocalStaticSample>), SessionError> {
        let peer_connection = engine.new_peer_connection().await?;

        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            VIDEO_TRACK_ID.to_string(),
            STREAM_ID.to_string(),
        ));

        let session = Self {
            peer_connection,
            track: Arc::clone(&track),
            pending_candidates: Vec::new(),
            local_sdp: None,
            remote_sdp: None,
            closed: false,
        };

        Ok((session, track))
    }

    /// Attach the session's track to the peer connection
    pub async fn add_track(&mut self) -> Result<Arc<RTCRtpSender>, SessionError> {
        self.ensure_open()?;
        let track = Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>;
        Ok(self.peer_connection.add_track(track).await?)
    }

    /// Register a remote candidate, or queue it while no remote description exists
    pub async fn add_candidate(
        &mut self,
        candidate: RTCIceCandidateInit,
    ) -> Result<CandidateDisposition, SessionError> {
        self.ensure_open()?;

        if self.remote_sdp.is_none() {
            self.pending_candidates.push(candidate);
            return Ok(CandidateDisposition::Queued);
        }

        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(CandidateDisposition::Applied)
    }

    pub async fn create_offer(&mut self) -> Result<RTCSessionDescription, SessionError> {
        self.ensure_open()?;
        Ok(self.peer_connection.create_offer(None).await?)
    }

    pub async fn set_local_description(
        &mut self,
        description: RTCSessionDescription,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let sdp = description.sdp.clone();
        self.peer_connection.set_local_description(description).await?;
        self.local_sdp = Some(sdp);
        Ok(())
    }

    /// Commit the remote description, then apply any queued candidates.
    ///
    /// A queued candidate that fails to apply is logged and dropped.
    pub async fn set_remote_description(
        &mut self,
        description: RTCSessionDescription,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let sdp = description.sdp.clone();
        self.peer_connection.set_remote_description(description).await?;
        self.remote_sdp = Some(sdp);

        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.peer_connection.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply queued ICE candidate: {}", e);
            }
        }

        Ok(())
    }

    /// Resolves once ICE gathering for the next local description completes.
    /// Must be requested before [`ScreenSession::set_local_description`].
    pub async fn gathering_complete(&self) -> mpsc::Receiver<()> {
        self.peer_connection.gathering_complete_promise().await
    }

    /// Re-read the committed local description, which picks up gathered candidates
    pub async fn refresh_local_description(&mut self) -> Option<&str> {
        if let Some(description) = self.peer_connection.local_description().await {
            self.local_sdp = Some(description.sdp);
        }
        self.local_sdp.as_deref()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                NegotiationState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                NegotiationState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => NegotiationState::Closed,
            RTCSignalingState::Stable
                if self.local_sdp.is_some() || self.remote_sdp.is_some() =>
            {
                NegotiationState::Stable
            }
            _ => NegotiationState::New,
        }
    }

    /// Last local description committed through this session
    pub fn local_description(&self) -> Option<&str> {
        self.local_sdp.as_deref()
    }

    /// Last remote description committed through this session
    pub fn remote_description(&self) -> Option<&str> {
        self.remote_sdp.as_deref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the peer connection. Later calls are no-ops.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending_candidates.clear();
        self.peer_connection.close().await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

/// Holder for a connection's session; empty before setup and after teardown.
///
/// The slot's mutex serializes every negotiation step for the connection. The
/// encoder bridge holds its own `Arc` to the track and writes without it.
#[derive(Clone, Default)]
pub struct SessionSlot {
    inner: Arc<Mutex<Option<ScreenSession>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a session in the slot, closing any session it replaces
    pub async fn install(&self, session: ScreenSession) {
        let previous = self.inner.lock().await.replace(session);
        if let Some(mut previous) = previous {
            if let Err(e) = previous.close().await {
                tracing::warn!("Error closing replaced session: {}", e);
            }
        }
    }

    /// Exclusive access to the session for one negotiation step
    pub async fn lock(&self) -> MutexGuard<'_, Option<ScreenSession>> {
        self.inner.lock().await
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Remove and close the session. Returns `false` when the slot was already empty,
    /// so every teardown path can call it.
    pub async fn close(&self) -> bool {
        let session = self.inner.lock().await.take();
        match session {
            Some(mut session) => {
                if let Err(e) = session.close().await {
                    tracing::warn!("Error closing peer connection: {}", e);
                }
                true
            }
            None => false,
        }
    }
}
