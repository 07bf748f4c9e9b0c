// Avatar decoding.
//
// Images are decoded and scaled to the session's frame size once, when the
// session is created. Per-frame work is then a buffer copy.

use crate::compositor::BACKGROUND;
use crate::error::RenderError;
use image::imageops::FilterType;
use image::{Rgb, RgbImage, RgbaImage};

#[derive(Debug, Clone)]
pub struct AvatarImage {
    image: RgbImage,
}

impl AvatarImage {
    /// Decode `bytes` (any format the `image` crate recognises) and scale to `width` x `height`.
    ///
    /// Transparent regions are flattened onto the frame background.
    pub fn decode(bytes: &[u8], width: u32, height: u32) -> Result<Self, RenderError> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidDimensions { width, height });
        }

        let decoded = image::load_from_memory(bytes)
            .map_err(|e| RenderError::Decode(format!("decode avatar: {}", e)))?;
        let rgba = decoded.to_rgba8();
        let scaled = if rgba.dimensions() == (width, height) {
            rgba
        } else {
            image::imageops::resize(&rgba, width, height, FilterType::Triangle)
        };

        Ok(Self {
            image: flatten(&scaled, BACKGROUND),
        })
    }

    pub fn from_rgb(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

fn flatten(rgba: &RgbaImage, background: Rgb<u8>) -> RgbImage {
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let px = rgba.get_pixel(x, y);
        let alpha = u16::from(px[3]);
        let blend = |fg: u8, bg: u8| -> u8 {
            ((u16::from(fg) * alpha + u16::from(bg) * (255 - alpha) + 127) / 255) as u8
        };
        Rgb([
            blend(px[0], background[0]),
            blend(px[1], background[1]),
            blend(px[2], background[2]),
        ])
    })
}
