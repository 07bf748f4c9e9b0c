use image::RgbImage;

/// What a frame shows and when it was scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMeta {
    /// Position in the session's delivery order
    pub index: u64,
    /// Animation time the frame was rendered for
    pub elapsed_ms: u64,
    pub category: String,
    pub openness: f32,
}

/// One rendered frame, not yet encoded for a particular transport.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub meta: FrameMeta,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
