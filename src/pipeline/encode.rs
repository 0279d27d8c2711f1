//! Image encoding: `DynamicImage` → base64 PNG data URI.
//!
//! The chat-completions API accepts images as base64 data URIs embedded in
//! the JSON request body. PNG is chosen over JPEG because it is lossless —
//! text crispness matters far more than file size for OCR of diacritized
//! Arabic script.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Image fidelity hint for the vision API's tiling algorithm.
///
/// The current page gets `High` so the model can read fine diacritics;
/// context pages get `Low` — they only establish column flow and entry
/// boundaries, and a single overview tile costs a fraction of the tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detail {
    Low,
    High,
}

impl Detail {
    pub fn as_str(&self) -> &'static str {
        match self {
            Detail::Low => "low",
            Detail::High => "high",
        }
    }
}

/// Encode a rasterised page as a base64 PNG data URI.
pub fn encode_page(img: &DynamicImage) -> Result<String, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(format!("data:image/png;base64,{b64}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let uri = encode_page(&img).expect("encode should succeed");
        assert!(uri.starts_with("data:image/png;base64,"));
        // Verify the payload is valid base64.
        let b64 = uri.strip_prefix("data:image/png;base64,").unwrap();
        let decoded = STANDARD.decode(b64).expect("valid base64");
        assert!(!decoded.is_empty());
    }

    #[test]
    fn detail_strings() {
        assert_eq!(Detail::High.as_str(), "high");
        assert_eq!(Detail::Low.as_str(), "low");
    }
}
