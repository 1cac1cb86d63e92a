//! Oracle abstractions for uipilot.
//!
//! The engine treats the oracle as an opaque text/vision completion function:
//! a prompt (and optionally a screenshot) goes in, free-form text comes out.
//! All prompt content and response parsing live in `uipilot-core`.

pub mod mock;
pub mod openai;

pub use mock::{MockOracle, MockReply, RecordedPrompt};
pub use openai::OpenAIOracle;

use anyhow::Result;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Trait for text/vision completion oracles
#[async_trait::async_trait]
pub trait Oracle: Send + Sync {
    /// Run a single prompt, optionally with an attached image, and return the raw response text
    async fn run_prompt(&self, prompt: &str, image: Option<&ImageContent>) -> Result<String>;

    /// Whether the oracle accepts image input alongside the prompt
    fn supports_image_input(&self) -> bool {
        false
    }

    /// Get the oracle name (used in logs)
    fn name(&self) -> &str;
}

/// Image payload attached to a prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageContent {
    /// Media type (e.g., "image/png", "image/jpeg", "image/gif", "image/webp")
    pub media_type: String,
    /// Base64-encoded image data
    pub data: String,
}

impl ImageContent {
    pub fn new(media_type: &str, data: String) -> Self {
        Self {
            media_type: media_type.to_string(),
            data,
        }
    }

    /// Encode raw captured bytes, sniffing the media type (PNG when unknown)
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let media_type = Self::media_type_from_bytes(bytes).unwrap_or("image/png");
        Self::new(
            media_type,
            base64::engine::general_purpose::STANDARD.encode(bytes),
        )
    }

    /// Render as a `data:` URI for APIs that take inline images
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }

    /// Detect media type from image data magic bytes (file signature)
    pub fn media_type_from_bytes(bytes: &[u8]) -> Option<&'static str> {
        if bytes.len() < 12 {
            return None;
        }

        // PNG: 89 50 4E 47 0D 0A 1A 0A
        if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some("image/png");
        }

        // JPEG: FF D8 FF
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some("image/jpeg");
        }

        // GIF: 47 49 46 38 (GIF8)
        if bytes.starts_with(&[0x47, 0x49, 0x46, 0x38]) {
            return Some("image/gif");
        }

        // WebP: 52 49 46 46 ... 57 45 42 50 (RIFF....WEBP)
        if bytes.starts_with(&[0x52, 0x49, 0x46, 0x46]) && &bytes[8..12] == b"WEBP" {
            return Some("image/webp");
        }

        None
    }
}
