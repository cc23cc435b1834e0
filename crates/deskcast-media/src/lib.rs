//! Media plumbing for Deskcast: codec constants, capture arguments, and encoder output framing

pub mod capture;
pub mod codec;
pub mod ivf;

pub use capture::CaptureSettings;
pub use codec::*;
pub use ivf::{IVFFileHeader, IvfError, IvfFrame, IvfStream};
