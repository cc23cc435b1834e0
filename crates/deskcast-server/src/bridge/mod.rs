mod process;

pub use process::{ChildProcess, SpawnedEncoder, drain_diagnostics, spawn_encoder};

use crate::state::EncoderConfig;
use async_trait::async_trait;
use deskcast_media::{FRAME_DURATION, IvfError, IvfStream, VP8_FOURCC};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Log progress every this many frames (~10 s at 30 fps)
const PROGRESS_INTERVAL: u64 = 300;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to start encoder `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder {0} pipe was not captured")]
    MissingPipe(&'static str),
}

/// Destination for encoded samples
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn push_sample(&self, sample: &Sample) -> anyhow::Result<()>;
}

#[async_trait]
impl SampleSink for TrackLocalStaticSample {
    async fn push_sample(&self, sample: &Sample) -> anyhow::Result<()> {
        self.write_sample(sample).await?;
        Ok(())
    }
}

/// Handle to the external encoder
#[async_trait]
pub trait EncoderProcess: Send {
    /// Kill the process and reap it
    async fn terminate(&mut self) -> std::io::Result<()>;
}

/// Terminates the wrapped process at most once, whichever exit path asks first
pub struct ProcessGuard<P: EncoderProcess> {
    process: Option<P>,
}

impl<P: EncoderProcess> ProcessGuard<P> {
    pub fn new(process: P) -> Self {
        Self {
            process: Some(process),
        }
    }

    /// Returns `true` if this call performed the termination
    pub async fn terminate(&mut self) -> bool {
        let Some(mut process) = self.process.take() else {
            return false;
        };

        if let Err(e) = process.terminate().await {
            tracing::warn!("Failed to terminate encoder: {}", e);
        }
        true
    }
}

/// Why the bridge stopped
#[derive(Debug)]
pub enum BridgeExit {
    SourceEnded,
    ParseFailed(IvfError),
    WriteFailed(anyhow::Error),
    Cancelled,
}

impl fmt::Display for BridgeExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeExit::SourceEnded => write!(f, "encoder output ended"),
            BridgeExit::ParseFailed(e) => write!(f, "encoder output unreadable: {}", e),
            BridgeExit::WriteFailed(e) => write!(f, "track write failed: {}", e),
            BridgeExit::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug)]
pub struct BridgeReport {
    pub exit: BridgeExit,
    pub frames_forwarded: u64,
}

/// Reads the encoder's IVF output and writes each frame to a track as a sample.
///
/// Any failure ends the bridge for good: the track stops receiving samples and
/// signaling carries on unaffected. The encoder is always terminated on the way out.
pub struct EncoderBridge<S> {
    sink: Arc<S>,
    cancel: CancellationToken,
}

impl<S: SampleSink> EncoderBridge<S> {
    pub fn new(sink: Arc<S>, cancel: CancellationToken) -> Self {
        Self { sink, cancel }
    }

    /// Forward frames from `source` until it ends, fails, or the token is cancelled,
    /// then terminate `process`.
    ///
    /// If this future panics or is dropped instead, the process is killed when
    /// its handle drops (see [`ChildProcess`]).
    pub async fn run<R, P>(self, source: R, process: P) -> BridgeReport
    where
        R: AsyncRead + Unpin + Send + 'static,
        P: EncoderProcess,
    {
        let mut guard = ProcessGuard::new(process);
        let report = self.forward(source).await;

        match &report.exit {
            BridgeExit::SourceEnded | BridgeExit::Cancelled => tracing::info!(
                "Encoder bridge stopped after {} frames: {}",
                report.frames_forwarded,
                report.exit
            ),
            _ => tracing::error!(
                "Encoder bridge stopped after {} frames: {}",
                report.frames_forwarded,
                report.exit
            ),
        }

        guard.terminate().await;
        report
    }

    async fn forward<R>(&self, source: R) -> BridgeReport
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return report(BridgeExit::Cancelled, 0),
            opened = IvfStream::open(source) => opened,
        };

        let mut reader = match opened {
            Ok((reader, header)) => {
                tracing::info!(
                    "Encoder stream opened: {}x{}, fourcc {}",
                    header.width,
                    header.height,
                    String::from_utf8_lossy(&header.four_cc)
                );
                if header.four_cc != VP8_FOURCC {
                    tracing::warn!("Encoder is not producing VP8; the viewer will not decode it");
                }
                reader
            }
            Err(e) => return report(BridgeExit::ParseFailed(e), 0),
        };

        let mut frames_forwarded = 0u64;

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break BridgeExit::Cancelled,
                next = reader.next_frame() => next,
            };

            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break BridgeExit::SourceEnded,
                Err(e) => break BridgeExit::ParseFailed(e),
            };

            let sample = Sample {
                data: frame.data,
                duration: FRAME_DURATION,
                ..Default::default()
            };

            let written = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break BridgeExit::Cancelled,
                written = self.sink.push_sample(&sample) => written,
            };

            if let Err(e) = written {
                break BridgeExit::WriteFailed(e);
            }

            frames_forwarded += 1;
            if frames_forwarded % PROGRESS_INTERVAL == 1 {
                tracing::debug!(
                    "Forwarded frame {} ({} bytes)",
                    frames_forwarded,
                    sample.data.len()
                );
            }
        };

        report(exit, frames_forwarded)
    }
}

fn report(exit: BridgeExit, frames_forwarded: u64) -> BridgeReport {
    BridgeReport {
        exit,
        frames_forwarded,
    }
}

/// Start the encoder and a bridge feeding `track`.
///
/// The stderr drain and the bridge both stop when `cancel` fires.
pub fn spawn_bridge(
    encoder: &EncoderConfig,
    track: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
) -> Result<JoinHandle<BridgeReport>, BridgeError> {
    let args = encoder.command_args();
    tracing::info!("Starting encoder: {} {}", encoder.program, args.join(" "));

    let SpawnedEncoder {
        process,
        stdout,
        stderr,
    } = spawn_encoder(&encoder.program, &args)?;

    if let Some(stderr) = stderr {
        drain_diagnostics(stderr, cancel.clone());
    }

    let bridge = EncoderBridge::new(track, cancel);
    Ok(tokio::spawn(bridge.run(stdout, process)))
}
