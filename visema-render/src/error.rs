//! Error types for visema-render

use thiserror::Error;
use visema_core::Error as CoreError;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Invalid dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
}

impl From<RenderError> for CoreError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Decode(msg) => CoreError::AssetUnavailable(msg),
            other => CoreError::Internal(format!("Render error: {}", other)),
        }
    }
}
