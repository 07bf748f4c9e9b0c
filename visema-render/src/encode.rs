use crate::error::RenderError;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Encode a frame as baseline JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Bytes, RenderError> {
    let quality = quality.clamp(1, 100);
    // JPEG at q85 typically lands well under 1 byte per pixel
    let mut buf = Vec::with_capacity((frame.width() * frame.height()) as usize / 4);
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(frame)
        .map_err(|e| RenderError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}
