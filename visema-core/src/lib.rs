//! visema-core: timing and data model for the viseme render service
//!
//! - Viseme timelines and the category → mouth openness table
//! - Session clock (wall-clock anchored animation time and tick schedule)
//! - Frame geometry clamping
//! - Error taxonomy and service configuration

pub mod clock;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod geometry;
pub mod timeline;

pub use clock::SessionClock;
pub use config::{AssetBackend, ConfigError, DropPolicy, RenderConfig, WebRtcBackend};
pub use dialogue::DialogueReply;
pub use error::{Error, Result};
pub use geometry::FrameGeometry;
pub use timeline::{category_to_openness, current_category, Timeline, Viseme, SILENCE};
