use crate::session::{ScreenSession, SessionError, SessionSlot};
use crate::state::SignalingConfig;
use deskcast_protocol::{IceCandidate, SignalMessage};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Failed to create offer: {0}")]
    CreateOffer(#[source] SessionError),

    #[error("Failed to set local description: {0}")]
    LocalDescription(#[source] SessionError),

    /// Any text that is neither a candidate nor an offer request lands here,
    /// so unrecognized messages surface as a bad answer.
    #[error("Failed to set remote answer: {0}")]
    RemoteDescription(#[source] SessionError),

    #[error("Signaling step cancelled")]
    Cancelled,
}

/// Turns one inbound text frame into at most one session mutation and at most
/// one reply. Each step holds the session lock from start to finish.
pub struct SignalingInterpreter {
    session: SessionSlot,
    settings: SignalingConfig,
}

impl SignalingInterpreter {
    pub fn new(session: SessionSlot, settings: SignalingConfig) -> Self {
        Self { session, settings }
    }

    /// Handle one text frame. `Ok(Some(text))` is a reply to send back.
    pub async fn handle(&self, text: &str) -> Result<Option<String>, SignalingError> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            tracing::warn!(
                "No active session, ignoring signaling message ({} bytes)",
                text.len()
            );
            return Ok(None);
        };

        let message = SignalMessage::classify(text);
        tracing::debug!(kind = message.kind(), "Received signaling message");

        match message {
            SignalMessage::Candidate(candidate) => {
                add_candidate(session, candidate).await;
                Ok(None)
            }
            SignalMessage::MalformedCandidate(reason) => {
                tracing::warn!("Dropping malformed ICE candidate: {}", reason);
                Ok(None)
            }
            SignalMessage::OfferRequest => self.offer(session).await.map(Some),
            SignalMessage::Answer(sdp) => {
                apply_answer(session, sdp).await?;
                Ok(None)
            }
            SignalMessage::Empty => {
                tracing::debug!("Ignoring empty signaling message");
                Ok(None)
            }
        }
    }

    /// [`handle`](Self::handle), abandoned as soon as `cancel` fires.
    ///
    /// An offer waiting on ICE gathering must not hold up connection teardown.
    pub async fn handle_until_cancelled(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, SignalingError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SignalingError::Cancelled),
            handled = self.handle(text) => handled,
        }
    }

    async fn offer(&self, session: &mut ScreenSession) -> Result<String, SignalingError> {
        let offer = session
            .create_offer()
            .await
            .map_err(SignalingError::CreateOffer)?;

        let gathering = if self.settings.gather_before_offer {
            Some(session.gathering_complete().await)
        } else {
            None
        };

        let sdp = offer.sdp.clone();
        session
            .set_local_description(offer)
            .await
            .map_err(SignalingError::LocalDescription)?;

        let Some(mut gathering) = gathering else {
            tracing::info!("Sending offer ({} bytes)", sdp.len());
            return Ok(sdp);
        };

        let timeout = Duration::from_millis(self.settings.gather_timeout_ms);
        if tokio::time::timeout(timeout, gathering.recv()).await.is_err() {
            tracing::warn!(
                "ICE gathering not complete after {:?}, sending offer with candidates so far",
                timeout
            );
        }

        let sdp = session
            .refresh_local_description()
            .await
            .map(str::to_string)
            .unwrap_or(sdp);

        tracing::info!(
            "Sending offer ({} bytes, {} candidates)",
            sdp.len(),
            sdp.lines().filter(|l| l.starts_with("a=candidate:")).count()
        );
        Ok(sdp)
    }
}

async fn add_candidate(session: &mut ScreenSession, candidate: IceCandidate) {
    tracing::debug!("Received ICE candidate: {}", candidate.candidate);

    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    };

    match session.add_candidate(init).await {
        Ok(disposition) => tracing::debug!("ICE candidate {:?}", disposition),
        Err(e) => tracing::warn!("Failed to add ICE candidate: {}", e),
    }
}

async fn apply_answer(session: &mut ScreenSession, sdp: &str) -> Result<(), SignalingError> {
    let answer = RTCSessionDescription::answer(sdp.to_string())
        .map_err(|e| SignalingError::RemoteDescription(e.into()))?;

    session
        .set_remote_description(answer)
        .await
        .map_err(SignalingError::RemoteDescription)?;

    tracing::info!(
        "Remote answer applied, negotiation is {}",
        session.negotiation_state()
    );
    Ok(())
}
