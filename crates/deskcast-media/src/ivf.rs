use bytes::Bytes;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use webrtc::media::io::ivf_reader::IVFReader;

pub use webrtc::media::io::ivf_reader::IVFFileHeader;

/// Frames parsed ahead of the consumer
const FRAME_BUFFER: usize = 4;

#[derive(Error, Debug)]
pub enum IvfError {
    #[error("Invalid IVF stream: {0}")]
    Invalid(#[from] webrtc::media::Error),

    #[error("IVF stream ended inside the file header")]
    TruncatedFileHeader,

    #[error("IVF stream ended {0} bytes into a frame")]
    TruncatedFrame(u64),

    #[error("IVF reader stopped unexpectedly: {0}")]
    ReaderFailed(String),
}

#[derive(Debug, Clone)]
pub struct IvfFrame {
    pub data: Bytes,
    pub timestamp: u64,
}

/// Frames of an IVF stream read from an async source.
///
/// Parsing runs on a blocking thread through [`IVFReader`]. The thread ends
/// with the source, after an error, or after the next frame once this handle
/// is gone.
pub struct IvfStream {
    frames: mpsc::Receiver<Result<IvfFrame, IvfError>>,
    reader: Option<JoinHandle<()>>,
    frames_read: u64,
}

impl IvfStream {
    /// Read the file header and start parsing frames. Must run inside a tokio runtime.
    pub async fn open<R>(source: R) -> Result<(Self, IVFFileHeader), IvfError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let source = SyncIoBridge::new(source);
        let (header_tx, header_rx) = oneshot::channel();
        let (frame_tx, frames) = mpsc::channel(FRAME_BUFFER);

        let reader =
            tokio::task::spawn_blocking(move || read_frames(source, header_tx, frame_tx));

        let header = match header_rx.await {
            Ok(header) => header?,
            Err(_) => return Err(reader_failure(reader).await),
        };

        tracing::debug!(
            "IVF stream {} {}x{}, timebase {}/{}",
            String::from_utf8_lossy(&header.four_cc),
            header.width,
            header.height,
            header.timebase_numerator,
            header.timebase_denominator
        );

        Ok((
            Self {
                frames,
                reader: Some(reader),
                frames_read: 0,
            },
            header,
        ))
    }

    /// Next frame, or `Ok(None)` once the stream ended cleanly on a frame boundary.
    ///
    /// Cancel safe.
    pub async fn next_frame(&mut self) -> Result<Option<IvfFrame>, IvfError> {
        match self.frames.recv().await {
            Some(Ok(frame)) => {
                self.frames_read += 1;
                Ok(Some(frame))
            }
            Some(Err(e)) => Err(e),
            None => match self.reader.take() {
                Some(reader) => match reader.await {
                    Ok(()) => Ok(None),
                    Err(e) => Err(IvfError::ReaderFailed(e.to_string())),
                },
                None => Ok(None),
            },
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

async fn reader_failure(reader: JoinHandle<()>) -> IvfError {
    match reader.await {
        Err(e) => IvfError::ReaderFailed(e.to_string()),
        Ok(()) => IvfError::ReaderFailed("no file header reported".to_string()),
    }
}

/// Counts bytes pulled through it so a short read can be placed relative to a frame boundary
struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

fn is_eof(err: &webrtc::media::Error) -> bool {
    matches!(err, webrtc::media::Error::Io(e) if e.0.kind() == io::ErrorKind::UnexpectedEof)
}

fn read_frames<R: Read>(
    source: R,
    header_tx: oneshot::Sender<Result<IVFFileHeader, IvfError>>,
    frame_tx: mpsc::Sender<Result<IvfFrame, IvfError>>,
) {
    let consumed = Arc::new(AtomicU64::new(0));
    let source = CountingReader {
        inner: source,
        consumed: Arc::clone(&consumed),
    };

    let mut reader = match IVFReader::new(source) {
        Ok((reader, header)) => {
            if header_tx.send(Ok(header)).is_err() {
                return;
            }
            reader
        }
        Err(e) => {
            let err = if is_eof(&e) {
                IvfError::TruncatedFileHeader
            } else {
                IvfError::Invalid(e)
            };
            let _ = header_tx.send(Err(err));
            return;
        }
    };

    let mut boundary = consumed.load(Ordering::Relaxed);
    loop {
        let result = match reader.parse_next_frame() {
            Ok((payload, header)) => {
                boundary = consumed.load(Ordering::Relaxed);
                Ok(IvfFrame {
                    data: payload.freeze(),
                    timestamp: header.timestamp,
                })
            }
            Err(e) => {
                let partial = consumed.load(Ordering::Relaxed) - boundary;
                if is_eof(&e) && partial == 0 {
                    return;
                }
                Err(if is_eof(&e) {
                    IvfError::TruncatedFrame(partial)
                } else {
                    IvfError::Invalid(e)
                })
            }
        };

        let failed = result.is_err();
        if frame_tx.blocking_send(result).is_err() || failed {
            return;
        }
    }
}
