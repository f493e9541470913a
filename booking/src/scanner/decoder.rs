//! Code decoders.

use super::Frame;
use std::sync::Arc;
use thiserror::Error;

/// Why a single frame yielded nothing; never fatal to a scan
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// No code visible
    #[error("No code found in frame")]
    NoCode,

    /// A code was found but could not be read
    #[error("Code could not be read: {0}")]
    Unreadable(String),
}

/// Turns a frame into the string encoded in it
pub trait CodeDecoder: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Decode the first code visible in `frame`
    ///
    /// # Errors
    ///
    /// [`DecodeError`] when nothing readable is visible.
    fn decode(&self, frame: &Frame) -> Result<String, DecodeError>;
}

/// Software QR decoder working on the raw pixel buffer
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareDecoder;

impl CodeDecoder for SoftwareDecoder {
    fn name(&self) -> &'static str {
        "software"
    }

    fn decode(&self, frame: &Frame) -> Result<String, DecodeError> {
        let mut image = rqrr::PreparedImage::prepare_from_greyscale(frame.width(), frame.height(), |x, y| {
            frame.luma_at(x, y)
        });
        let grids = image.detect_grids();
        let grid = grids.first().ok_or(DecodeError::NoCode)?;
        let (_meta, content) = grid
            .decode()
            .map_err(|error| DecodeError::Unreadable(error.to_string()))?;
        Ok(content)
    }
}

/// Decoder chosen once when a scan session starts
#[derive(Clone)]
pub enum DecoderStrategy {
    /// Platform decoder
    Native(Arc<dyn CodeDecoder>),
    /// Fallback when the platform offers none
    Software(SoftwareDecoder),
}

impl DecoderStrategy {
    /// Prefer `native` when the platform provides one
    #[must_use]
    pub fn select(native: Option<Arc<dyn CodeDecoder>>) -> Self {
        native.map_or(Self::Software(SoftwareDecoder), Self::Native)
    }

    /// The decoder to run on every frame
    #[must_use]
    pub fn decoder(&self) -> &dyn CodeDecoder {
        match self {
            Self::Native(decoder) => decoder.as_ref(),
            Self::Software(decoder) => decoder,
        }
    }

    /// Whether the platform decoder was picked
    #[must_use]
    pub const fn is_native(&self) -> bool {
        matches!(self, Self::Native(_))
    }
}

impl std::fmt::Debug for DecoderStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DecoderStrategy").field(&self.decoder().name()).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::scanner::PixelFormat;

    struct FixedDecoder;

    impl CodeDecoder for FixedDecoder {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn decode(&self, _frame: &Frame) -> Result<String, DecodeError> {
            Ok("fixed".to_string())
        }
    }

    #[test]
    fn test_native_decoder_is_preferred() {
        let native: Arc<dyn CodeDecoder> = Arc::new(FixedDecoder);

        assert!(DecoderStrategy::select(Some(native)).is_native());
        assert!(!DecoderStrategy::select(None).is_native());
        assert_eq!(DecoderStrategy::select(None).decoder().name(), "software");
    }

    /// Render `text` as a QR code, 4 pixels per module with a 4 module quiet zone
    fn qr_frame(text: &str, format: PixelFormat) -> Frame {
        const SCALE: usize = 4;
        const QUIET: usize = 4;
        let code = qrcode::QrCode::new(text.as_bytes()).unwrap();
        let modules = code.width();
        let colors = code.to_colors();
        let side = (modules + 2 * QUIET) * SCALE;

        let mut data = Vec::with_capacity(side * side * format.bytes_per_pixel());
        for y in 0..side {
            for x in 0..side {
                let (mx, my) = ((x / SCALE).wrapping_sub(QUIET), (y / SCALE).wrapping_sub(QUIET));
                let dark = mx < modules && my < modules && colors[my * modules + mx] == qrcode::Color::Dark;
                let level = if dark { 0 } else { 255 };
                match format {
                    PixelFormat::Luma8 => data.push(level),
                    PixelFormat::Rgba8 => data.extend_from_slice(&[level, level, level, 255]),
                }
            }
        }
        Frame::new(side, side, format, data).unwrap()
    }

    #[test]
    fn test_software_decoder_finds_nothing_in_blank_frame() {
        let frame = Frame::new(64, 64, PixelFormat::Luma8, vec![255; 64 * 64]).unwrap();

        assert_eq!(SoftwareDecoder.decode(&frame), Err(DecodeError::NoCode));
    }

    #[test]
    fn test_software_decoder_reads_rendered_code() {
        let booking = "7f3c2a9e-1b4d-4c8a-9e2f-5a6b7c8d9e0f";

        assert_eq!(SoftwareDecoder.decode(&qr_frame(booking, PixelFormat::Luma8)).unwrap(), booking);
        assert_eq!(SoftwareDecoder.decode(&qr_frame("VM-0042", PixelFormat::Rgba8)).unwrap(), "VM-0042");
    }
}
