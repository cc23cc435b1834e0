use std::time::Duration;

/// MIME type of the only codec the relay speaks
pub const VP8_MIME_TYPE: &str = "video/VP8";

/// RTP clock rate for video
pub const VP8_CLOCK_RATE: u32 = 90000;

/// Dynamic payload type the codec is registered under
pub const VP8_PAYLOAD_TYPE: u8 = 96;

/// Capture frame rate the encoder is configured for
pub const FRAME_RATE: u32 = 30;

/// Duration stamped on every forwarded sample (~30 fps).
///
/// The IVF timestamps are ignored; the encoder runs at a constant rate.
pub const FRAME_DURATION: Duration = Duration::from_millis(33);

/// IVF FourCC for VP8
pub const VP8_FOURCC: [u8; 4] = *b"VP80";
