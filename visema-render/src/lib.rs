//! visema-render: frame compositing for the viseme render service
//!
//! Compositing is a pure function of (avatar, dimensions, elapsed time,
//! viseme category). Nothing is cached between frames, so sessions can render
//! in parallel without coordination.

pub mod avatar;
pub mod compositor;
pub mod encode;
pub mod error;
pub mod frame;

pub use avatar::AvatarImage;
pub use compositor::{FrameCompositor, IdleMotion, MouthGeometry};
pub use encode::{encode_jpeg, DEFAULT_JPEG_QUALITY};
pub use error::RenderError;
pub use frame::{Frame, FrameMeta};
