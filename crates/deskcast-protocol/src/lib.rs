//! Signaling protocol for Deskcast
//!
//! A viewer and the server talk over a single WebSocket carrying plain text
//! frames. There is no envelope: candidates are JSON, the offer request is a
//! fixed marker, and session descriptions travel as raw SDP.

pub mod messages;

pub use messages::*;
