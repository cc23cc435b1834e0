use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker a client sends to ask the server for a fresh offer.
///
/// Only the first eight bytes are significant; anything after the marker is ignored.
pub const OFFER_REQUEST: &str = "offerreq";

/// ICE candidate as serialized by a browser's `RTCIceCandidate.toJSON()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Wrap the candidate in the `{"candidate": {...}}` envelope used on the wire
    pub fn to_signal_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(&CandidateEnvelope {
            candidate: self.clone(),
        })
    }
}

#[derive(Serialize)]
struct CandidateEnvelope {
    candidate: IceCandidate,
}

/// Interpretation of one inbound signaling text frame.
///
/// The three wire shapes share one channel and are told apart by content.
/// Classification is total: every frame maps to exactly one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage<'a> {
    /// JSON object carrying a non-null `candidate` field
    Candidate(IceCandidate),
    /// JSON object whose `candidate` field is present but unusable
    MalformedCandidate(String),
    /// Text beginning with [`OFFER_REQUEST`]
    OfferRequest,
    /// Anything else, taken verbatim as the SDP of a remote answer
    Answer(&'a str),
    /// Empty or whitespace-only frame
    Empty,
}

impl<'a> SignalMessage<'a> {
    /// Classify a text frame. First match wins: candidate, offer request, answer.
    pub fn classify(text: &'a str) -> Self {
        if let Some(candidate) = candidate_field(text) {
            return match serde_json::from_value::<IceCandidate>(candidate) {
                Ok(candidate) => SignalMessage::Candidate(candidate),
                Err(e) => SignalMessage::MalformedCandidate(e.to_string()),
            };
        }

        if text.as_bytes().starts_with(OFFER_REQUEST.as_bytes()) {
            return SignalMessage::OfferRequest;
        }

        if text.trim().is_empty() {
            return SignalMessage::Empty;
        }

        SignalMessage::Answer(text)
    }

    /// Short label for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Candidate(_) => "candidate",
            SignalMessage::MalformedCandidate(_) => "malformed-candidate",
            SignalMessage::OfferRequest => "offer-request",
            SignalMessage::Answer(_) => "answer",
            SignalMessage::Empty => "empty",
        }
    }
}

fn candidate_field(text: &str) -> Option<Value> {
    let Ok(Value::Object(mut object)) = serde_json::from_str::<Value>(text) else {
        return None;
    };

    match object.remove("candidate") {
        Some(Value::Null) | None => None,
        Some(candidate) => Some(candidate),
    }
}
