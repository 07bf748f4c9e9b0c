//! Reply payload of the external dialogue service
//!
//! Only the timeline is consumed here. Reply text and audio pass through
//! untouched for the client UI.

use crate::error::Result;
use crate::timeline::{Timeline, Viseme};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogueReply {
    #[serde(default)]
    pub reply_text: String,
    /// Base64 encoded audio, opaque to the render service
    #[serde(default)]
    pub audio_base64: String,
    #[serde(default, alias = "timeline")]
    pub visemes: Vec<Viseme>,
}

impl DialogueReply {
    pub fn timeline(&self) -> Result<Timeline> {
        Timeline::new(self.visemes.clone())
    }

    pub fn into_timeline(self) -> Result<Timeline> {
        Timeline::new(self.visemes)
    }
}
