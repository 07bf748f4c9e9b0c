//! Frame dimensions and rate, clamped to what the renderer supports

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIN_WIDTH: u32 = 64;
pub const MAX_WIDTH: u32 = 1920;
pub const MIN_HEIGHT: u32 = 64;
pub const MAX_HEIGHT: u32 = 1080;
pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl FrameGeometry {
    /// Clamp raw request values into the supported range.
    ///
    /// Negative values are malformed input and rejected; everything else,
    /// including zero, is clamped.
    pub fn clamped(width: i64, height: i64, fps: i64) -> Result<Self> {
        for (name, value) in [("width", width), ("height", height), ("fps", fps)] {
            if value < 0 {
                return Err(Error::Validation(format!(
                    "{} must not be negative (got {})",
                    name, value
                )));
            }
        }

        Ok(Self {
            width: clamp_u32(width, MIN_WIDTH, MAX_WIDTH),
            height: clamp_u32(height, MIN_HEIGHT, MAX_HEIGHT),
            fps: clamp_u32(fps, MIN_FPS, MAX_FPS),
        })
    }

    /// Time between scheduled frames.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(MIN_FPS)
    }

    /// Round dimensions down to even numbers, as 4:2:0 video encoders require.
    pub fn even(self) -> Self {
        Self {
            width: self.width & !1,
            height: self.height & !1,
            fps: self.fps,
        }
    }
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            fps: 15,
        }
    }
}

fn clamp_u32(value: i64, min: u32, max: u32) -> u32 {
    value.clamp(i64::from(min), i64::from(max)) as u32
}
