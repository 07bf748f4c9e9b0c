//! Frame compositor: background, avatar, idle motion and the mouth ellipse

use crate::avatar::AvatarImage;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use visema_core::category_to_openness;

/// Placeholder background (`#0b0b0d`) used when no avatar is available.
pub const BACKGROUND: Rgb<u8> = Rgb([0x0b, 0x0b, 0x0d]);

/// Mouth fill colour (`#aa1111`).
pub const MOUTH: Rgb<u8> = Rgb([0xaa, 0x11, 0x11]);

// Anatomy, as fractions of the frame size.
const MOUTH_CENTER_X: f64 = 0.5;
const MOUTH_CENTER_Y: f64 = 0.7;
const MOUTH_BASE_WIDTH: f64 = 0.22;
const MOUTH_BASE_HEIGHT: f64 = 0.035;
const MOTION_PIVOT_Y: f64 = 0.65;

/// Periodic head sway, a pure function of elapsed seconds.
///
/// Amplitudes are in pixels and radians, independent of frame rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdleMotion {
    pub dx: f64,
    pub dy: f64,
    pub rotation: f64,
}

impl IdleMotion {
    pub fn at(elapsed_secs: f64) -> Self {
        Self {
            dx: (elapsed_secs * 0.6).sin() * 3.0,
            dy: (elapsed_secs * 0.9).sin() * 2.0,
            rotation: (elapsed_secs * 0.7).sin() * 0.03,
        }
    }
}

/// Screen-space mouth ellipse for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MouthGeometry {
    /// Ellipse centre before idle motion
    pub center: (f64, f64),
    pub radius_x: f64,
    pub radius_y: f64,
    /// Rotation pivot of the idle motion
    pub pivot: (f64, f64),
    pub motion: IdleMotion,
}

impl MouthGeometry {
    pub fn new(width: u32, height: u32, elapsed_secs: f64, openness: f32) -> Self {
        let (w, h) = (f64::from(width), f64::from(height));
        let openness = f64::from(openness.clamp(0.0, 1.0));
        Self {
            center: (w * MOUTH_CENTER_X, h * MOUTH_CENTER_Y),
            radius_x: w * MOUTH_BASE_WIDTH,
            radius_y: h * MOUTH_BASE_HEIGHT * (0.5 + 1.8 * openness),
            pivot: (w * MOUTH_CENTER_X, h * MOTION_PIVOT_Y),
            motion: IdleMotion::at(elapsed_secs),
        }
    }

    /// Where the ellipse centre lands after idle motion.
    pub fn screen_center(&self) -> (f64, f64) {
        let (sin, cos) = self.motion.rotation.sin_cos();
        let (rx, ry) = (self.center.0 - self.pivot.0, self.center.1 - self.pivot.1);
        (
            self.pivot.0 + rx * cos - ry * sin + self.motion.dx,
            self.pivot.1 + rx * sin + ry * cos + self.motion.dy,
        )
    }

    /// Whether the screen point `(x, y)` falls inside the moved ellipse.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        // undo translation, then rotation about the pivot
        let (sin, cos) = (-self.motion.rotation).sin_cos();
        let (px, py) = (
            x - self.motion.dx - self.pivot.0,
            y - self.motion.dy - self.pivot.1,
        );
        let lx = self.pivot.0 + px * cos - py * sin;
        let ly = self.pivot.1 + px * sin + py * cos;

        let nx = (lx - self.center.0) / self.radius_x;
        let ny = (ly - self.center.1) / self.radius_y;
        nx * nx + ny * ny <= 1.0
    }
}

#[derive(Debug, Clone)]
pub struct FrameCompositor {
    background: Rgb<u8>,
    mouth: Rgb<u8>,
}

impl Default for FrameCompositor {
    fn default() -> Self {
        Self {
            background: BACKGROUND,
            mouth: MOUTH,
        }
    }
}

impl FrameCompositor {
    pub fn new(background: Rgb<u8>, mouth: Rgb<u8>) -> Self {
        Self { background, mouth }
    }

    /// Render one frame.
    ///
    /// Same inputs, same pixels: the output depends only on the arguments.
    pub fn render(
        &self,
        avatar: Option<&AvatarImage>,
        width: u32,
        height: u32,
        elapsed_secs: f64,
        category: &str,
    ) -> RgbImage {
        let mut frame = match avatar {
            Some(avatar) if avatar.dimensions() == (width, height) => avatar.image().clone(),
            Some(avatar) => {
                image::imageops::resize(avatar.image(), width, height, FilterType::Triangle)
            }
            None => RgbImage::from_pixel(width, height, self.background),
        };

        let mouth = self.mouth_geometry(width, height, elapsed_secs, category);
        self.fill_mouth(&mut frame, &mouth);
        frame
    }

    /// The mouth ellipse `render` would draw for these inputs.
    pub fn mouth_geometry(
        &self,
        width: u32,
        height: u32,
        elapsed_secs: f64,
        category: &str,
    ) -> MouthGeometry {
        MouthGeometry::new(width, height, elapsed_secs, category_to_openness(category))
    }

    fn fill_mouth(&self, frame: &mut RgbImage, mouth: &MouthGeometry) {
        let (cx, cy) = mouth.screen_center();
        let reach = mouth.radius_x.max(mouth.radius_y) + 1.0;
        let (width, height) = (f64::from(frame.width()), f64::from(frame.height()));

        let x0 = (cx - reach).floor().clamp(0.0, width) as u32;
        let x1 = (cx + reach).ceil().clamp(0.0, width) as u32;
        let y0 = (cy - reach).floor().clamp(0.0, height) as u32;
        let y1 = (cy + reach).ceil().clamp(0.0, height) as u32;

        for y in y0..y1 {
            for x in x0..x1 {
                if mouth.contains(f64::from(x) + 0.5, f64::from(y) + 0.5) {
                    frame.put_pixel(x, y, self.mouth);
                }
            }
        }
    }
}
