//! Preview frame compression.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, RgbImage};

use crate::frame::{Frame, META_PIXEL_FORMAT, PIXEL_FORMAT_RGB8};

/// Compress a raw RGB frame to JPEG for the lossy preview channel, scaling
/// it down to at most `max_width` pixels wide.
///
/// Returns `Ok(None)` when the payload is not a raw rgb8 buffer matching its
/// metadata; the caller forwards such payloads unchanged.
pub fn compress_preview(frame: &Frame, max_width: u32, quality: u8) -> Result<Option<Vec<u8>>> {
    if frame.metadata.get(META_PIXEL_FORMAT).map(String::as_str) != Some(PIXEL_FORMAT_RGB8) {
        return Ok(None);
    }
    let Some((width, height)) = frame.dimensions() else {
        return Ok(None);
    };
    let expected_len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3));
    if expected_len != Some(frame.payload.len()) {
        return Ok(None);
    }

    let image = RgbImage::from_raw(width, height, frame.payload.clone())
        .ok_or_else(|| anyhow!("payload does not form a {}x{} rgb8 image", width, height))?;

    let (image, out_width, out_height) = if max_width > 0 && width > max_width {
        let scaled_height = ((height as u64 * max_width as u64) / width as u64).max(1) as u32;
        (
            image::imageops::resize(&image, max_width, scaled_height, FilterType::Triangle),
            max_width,
            scaled_height,
        )
    } else {
        (image, width, height)
    };

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode(image.as_raw(), out_width, out_height, ExtendedColorType::Rgb8)
        .context("failed to encode preview JPEG")?;
    Ok(Some(jpeg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{META_HEIGHT, META_WIDTH};

    fn rgb_frame(width: u32, height: u32) -> Frame {
        let payload = vec![128u8; (width * height * 3) as usize];
        Frame::new(1, "edge0", payload)
            .with_metadata(META_WIDTH, width)
            .with_metadata(META_HEIGHT, height)
            .with_metadata(META_PIXEL_FORMAT, PIXEL_FORMAT_RGB8)
    }

    #[test]
    fn encodes_jpeg_with_soi_marker() {
        let jpeg = compress_preview(&rgb_frame(8, 4), 640, 70)
            .expect("compress")
            .expect("jpeg");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn downscales_wide_frames() {
        let wide = compress_preview(&rgb_frame(64, 32), 16, 70)
            .expect("compress")
            .expect("jpeg");
        let full = compress_preview(&rgb_frame(64, 32), 0, 70)
            .expect("compress")
            .expect("jpeg");
        assert!(wide.len() < full.len());
    }

    #[test]
    fn passes_through_non_rgb_payloads() {
        let frame = Frame::new(1, "edge0", vec![1, 2, 3]);
        assert_eq!(compress_preview(&frame, 640, 70).expect("compress"), None);
    }

    #[test]
    fn passes_through_when_metadata_disagrees_with_payload() {
        let frame = Frame::new(1, "edge0", vec![0u8; 10])
            .with_metadata(META_WIDTH, 8)
            .with_metadata(META_HEIGHT, 4)
            .with_metadata(META_PIXEL_FORMAT, PIXEL_FORMAT_RGB8);
        assert_eq!(compress_preview(&frame, 640, 70).expect("compress"), None);
    }
}
