//! Code recognition adapter.
//!
//! A [`ScanSession`] owns a capture device and a decoder picked once at
//! start. A spawned task pulls one frame per tick and tries to decode it;
//! decode failures and bad frames are dropped and the next tick retries.
//! The task stops on the first decoded string, on permission denial, or when
//! the session is closed, and releases the device in every case.

mod decoder;

pub use decoder::{CodeDecoder, DecodeError, DecoderStrategy, SoftwareDecoder};

use crate::check_in::{CheckInEngine, CheckInError, CheckInOutcome};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// One grey byte per pixel
    Luma8,
    /// Four bytes per pixel, red first
    Rgba8,
}

impl PixelFormat {
    /// Bytes per pixel
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Luma8 => 1,
            Self::Rgba8 => 4,
        }
    }
}

/// One captured video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: usize,
    height: usize,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap a raw pixel buffer
    ///
    /// # Errors
    ///
    /// [`CaptureError::MalformedFrame`] if the buffer length does not match
    /// the dimensions.
    pub fn new(width: usize, height: usize, format: PixelFormat, data: Vec<u8>) -> Result<Self, CaptureError> {
        let expected = width
            .checked_mul(height)
            .and_then(|pixels| pixels.checked_mul(format.bytes_per_pixel()));
        if expected != Some(data.len()) {
            return Err(CaptureError::MalformedFrame);
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Width in pixels
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Pixel layout
    #[must_use]
    pub const fn format(&self) -> PixelFormat {
        self.format
    }

    /// Raw buffer
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Grey level at `(x, y)`; zero outside the frame
    #[must_use]
    pub fn luma_at(&self, x: usize, y: usize) -> u8 {
        if x >= self.width || y >= self.height {
            return 0;
        }
        let offset = (y * self.width + x) * self.format.bytes_per_pixel();
        match self.format {
            PixelFormat::Luma8 => self.data.get(offset).copied().unwrap_or(0),
            PixelFormat::Rgba8 => match self.data.get(offset..offset + 3) {
                Some(&[r, g, b]) => {
                    let luma = (299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b)) / 1000;
                    u8::try_from(luma).unwrap_or(u8::MAX)
                },
                _ => 0,
            },
        }
    }
}

/// Capture device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The actor refused camera access
    #[error("Camera permission denied")]
    PermissionDenied,

    /// No frame right now
    #[error("Camera unavailable: {0}")]
    Unavailable(String),

    /// Buffer length does not match the frame dimensions
    #[error("Malformed frame")]
    MalformedFrame,
}

/// Scan session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// Camera access refused; the only fatal capture error
    #[error("Camera permission denied; allow camera access to scan")]
    PermissionDenied,

    /// The session was closed before a code was read
    #[error("Scan session closed")]
    Closed,
}

/// Live video frame source
pub trait FrameSource: Send {
    /// Pull the current frame
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Frame, CaptureError>>;

    /// Release the device
    fn release(&mut self);
}

/// Closes a running [`ScanSession`] from elsewhere
#[derive(Clone, Debug)]
pub struct ScanCancel {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ScanCancel {
    /// Stop scanning and release the device
    pub fn cancel(&self) {
        self.shutdown.send_replace(true);
    }
}

/// A running scan
pub struct ScanSession {
    shutdown: Arc<watch::Sender<bool>>,
    task: Option<JoinHandle<Result<String, ScanError>>>,
    frames: Arc<AtomicUsize>,
}

impl ScanSession {
    /// Open `source` and start polling it every `interval`
    #[must_use]
    pub fn start(source: Box<dyn FrameSource>, strategy: DecoderStrategy, interval: Duration) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let frames = Arc::new(AtomicUsize::new(0));
        tracing::info!(decoder = strategy.decoder().name(), interval = ?interval, "Scan session started");

        let task = tokio::spawn(poll_frames(source, strategy, interval, shutdown_rx, Arc::clone(&frames)));

        Self {
            shutdown: Arc::new(shutdown),
            task: Some(task),
            frames,
        }
    }

    /// Wait for the first decoded string
    ///
    /// # Errors
    ///
    /// [`ScanError::PermissionDenied`], or [`ScanError::Closed`] if the
    /// session was closed or already yielded its code.
    pub async fn decoded(&mut self) -> Result<String, ScanError> {
        let task = self.task.take().ok_or(ScanError::Closed)?;
        task.await.unwrap_or(Err(ScanError::Closed))
    }

    /// Handle that closes this session from another task
    #[must_use]
    pub fn cancel_handle(&self) -> ScanCancel {
        ScanCancel {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Frames pulled so far
    #[must_use]
    pub fn frames_pulled(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    /// Stop scanning and wait for the device to be released
    pub async fn close(mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn poll_frames(
    mut source: Box<dyn FrameSource>,
    strategy: DecoderStrategy,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    frames: Arc<AtomicUsize>,
) -> Result<String, ScanError> {
    let decoder = strategy.decoder();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        if *shutdown.borrow() {
            break Err(ScanError::Closed);
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Err(ScanError::Closed);
                }
                continue;
            }
        }

        let frame = tokio::select! {
            frame = source.next_frame() => frame,
            _ = shutdown.changed() => continue,
        };
        frames.fetch_add(1, Ordering::SeqCst);

        match frame {
            Ok(frame) => match decoder.decode(&frame) {
                Ok(code) => break Ok(code),
                Err(DecodeError::NoCode) => {},
                Err(error) => tracing::debug!(error = %error, "Frame not decoded"),
            },
            Err(CaptureError::PermissionDenied) => break Err(ScanError::PermissionDenied),
            Err(error) => tracing::debug!(error = %error, "Frame skipped"),
        }
    };

    source.release();
    match &outcome {
        Ok(_) => tracing::info!(frames = frames.load(Ordering::SeqCst), "Code decoded"),
        Err(error) => tracing::info!(error = %error, "Scan session ended"),
    }
    outcome
}

/// Scan one code and check its booking in
///
/// # Errors
///
/// [`ScanCheckInError::Scan`] if no code was read, otherwise
/// [`ScanCheckInError::CheckIn`] from the engine.
pub async fn scan_and_check_in(
    session: &mut ScanSession,
    engine: &CheckInEngine,
) -> Result<CheckInOutcome, ScanCheckInError> {
    let code = session.decoded().await?;
    Ok(engine.check_in_by_code(&code).await?)
}

/// Errors from [`scan_and_check_in`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanCheckInError {
    /// No code was read
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// The code did not check a booking in
    #[error(transparent)]
    CheckIn(#[from] CheckInError),
}

/// Frame source that plays back a fixed script, then blank frames
///
/// Stands in for a camera in tests and demos.
#[derive(Debug)]
pub struct ReplaySource {
    script: VecDeque<Result<Frame, CaptureError>>,
    blank: Frame,
    released: Arc<AtomicBool>,
}

impl ReplaySource {
    /// Replay `script`, then blank `width × height` grey frames
    #[must_use]
    pub fn new(script: Vec<Result<Frame, CaptureError>>, width: usize, height: usize) -> Self {
        Self {
            script: script.into(),
            blank: Frame {
                width,
                height,
                format: PixelFormat::Luma8,
                data: vec![u8::MAX; width * height],
            },
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag set once the session releases this source
    #[must_use]
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Frame, CaptureError>> {
        let next = self.script.pop_front().unwrap_or_else(|| Ok(self.blank.clone()));
        Box::pin(async move { next })
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Reads frames whose first byte is zero as a UTF-8 payload
    struct MarkerDecoder;

    impl CodeDecoder for MarkerDecoder {
        fn name(&self) -> &'static str {
            "marker"
        }

        fn decode(&self, frame: &Frame) -> Result<String, DecodeError> {
            match frame.data().split_first() {
                Some((&0, payload)) => String::from_utf8(payload.iter().copied().take_while(|b| *b != 0).collect())
                    .map_err(|error| DecodeError::Unreadable(error.to_string())),
                _ => Err(DecodeError::NoCode),
            }
        }
    }

    fn marker_frame(text: &str) -> Frame {
        let mut data = vec![0_u8];
        data.extend_from_slice(text.as_bytes());
        data.resize(64, 0);
        Frame::new(8, 8, PixelFormat::Luma8, data).unwrap()
    }

    fn marker() -> DecoderStrategy {
        DecoderStrategy::select(Some(Arc::new(MarkerDecoder)))
    }

    #[test]
    fn test_frame_rejects_wrong_buffer_length() {
        assert_eq!(Frame::new(4, 4, PixelFormat::Rgba8, vec![0; 15]), Err(CaptureError::MalformedFrame));
    }

    #[test]
    fn test_rgba_luma_weights() {
        let frame = Frame::new(2, 1, PixelFormat::Rgba8, vec![255, 255, 255, 255, 255, 0, 0, 255]).unwrap();

        assert_eq!(frame.luma_at(0, 0), 255);
        assert_eq!(frame.luma_at(1, 0), 76);
        assert_eq!(frame.luma_at(5, 5), 0);
    }

    #[tokio::test]
    async fn test_bad_frames_are_skipped_until_a_code_decodes() {
        let source = ReplaySource::new(
            vec![
                Err(CaptureError::Unavailable("warming up".to_string())),
                Ok(Frame::new(8, 8, PixelFormat::Luma8, vec![255; 64]).unwrap()),
                Ok(marker_frame("BOOKING-42")),
            ],
            8,
            8,
        );
        let released = source.released_flag();

        let mut session = ScanSession::start(Box::new(source), marker(), Duration::from_millis(1));

        assert_eq!(session.decoded().await.unwrap(), "BOOKING-42");
        assert_eq!(session.frames_pulled(), 3);
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(session.decoded().await, Err(ScanError::Closed));
    }

    #[tokio::test]
    async fn test_permission_denied_is_fatal() {
        let source = ReplaySource::new(vec![Err(CaptureError::PermissionDenied), Ok(marker_frame("never"))], 8, 8);
        let released = source.released_flag();

        let mut session = ScanSession::start(Box::new(source), marker(), Duration::from_millis(1));

        assert_eq!(session.decoded().await, Err(ScanError::PermissionDenied));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_stops_polling_and_releases() {
        let source = ReplaySource::new(Vec::new(), 8, 8);
        let released = source.released_flag();
        let session = ScanSession::start(Box::new(source), marker(), Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(10)).await;

        session.close().await;

        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_handle_ends_pending_decode() {
        let source = ReplaySource::new(Vec::new(), 8, 8);
        let mut session = ScanSession::start(Box::new(source), marker(), Duration::from_millis(1));
        let cancel = session.cancel_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        assert_eq!(session.decoded().await, Err(ScanError::Closed));
    }
}
