//! Mock oracle for testing
//!
//! A scripted oracle that returns queued replies in order and records every
//! prompt it receives, so tests can assert exactly how often (and with what)
//! the engine consulted it.
//!
//! # Example
//!
//! ```rust,ignore
//! use uipilot_oracle::mock::{MockOracle, MockReply};
//!
//! let oracle = MockOracle::new()
//!     .with_reply(MockReply::error("rate limited"))
//!     .with_reply(MockReply::text("```\nclick(\"#login\")\n```"));
//! ```

use crate::{ImageContent, Oracle};
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};

/// A scripted reply: either response text or a failure
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Error(String),
}

impl MockReply {
    pub fn text(content: &str) -> Self {
        Self::Text(content.to_string())
    }

    pub fn error(message: &str) -> Self {
        Self::Error(message.to_string())
    }
}

/// A prompt the mock received
#[derive(Debug, Clone)]
pub struct RecordedPrompt {
    pub prompt: String,
    pub image: Option<ImageContent>,
}

/// A mock oracle for testing
///
/// Replies are returned FIFO. Once the queue is drained the default reply is
/// used, or an error if none was configured.
#[derive(Clone)]
pub struct MockOracle {
    name: String,
    image_input: bool,
    replies: Arc<Mutex<Vec<MockReply>>>,
    prompts: Arc<Mutex<Vec<RecordedPrompt>>>,
    default_reply: Option<MockReply>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            image_input: false,
            replies: Arc::new(Mutex::new(Vec::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
            default_reply: None,
        }
    }

    /// Set the oracle name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Declare image input support
    pub fn with_image_input(mut self, enabled: bool) -> Self {
        self.image_input = enabled;
        self
    }

    /// Add a reply to the queue
    pub fn with_reply(self, reply: MockReply) -> Self {
        self.lock_replies().push(reply);
        self
    }

    /// Add multiple replies to the queue
    pub fn with_replies(self, replies: Vec<MockReply>) -> Self {
        self.lock_replies().extend(replies);
        self
    }

    /// Set a default reply for when the queue is empty
    pub fn with_default_reply(mut self, reply: MockReply) -> Self {
        self.default_reply = Some(reply);
        self
    }

    /// Queue another reply after construction
    pub fn push_reply(&self, reply: MockReply) {
        self.lock_replies().push(reply);
    }

    /// Get all prompts that were sent to this oracle
    pub fn prompts(&self) -> Vec<RecordedPrompt> {
        self.lock_prompts().clone()
    }

    /// Get the number of prompts received
    pub fn call_count(&self) -> usize {
        self.lock_prompts().len()
    }

    /// Clear recorded prompts
    pub fn clear_prompts(&self) {
        self.lock_prompts().clear();
    }

    fn next_reply(&self) -> Option<MockReply> {
        let mut replies = self.lock_replies();
        if replies.is_empty() {
            self.default_reply.clone()
        } else {
            Some(replies.remove(0))
        }
    }

    // A poisoned lock only means another test thread panicked; the data is still usable.
    fn lock_replies(&self) -> std::sync::MutexGuard<'_, Vec<MockReply>> {
        self.replies.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_prompts(&self) -> std::sync::MutexGuard<'_, Vec<RecordedPrompt>> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Oracle for MockOracle {
    async fn run_prompt(&self, prompt: &str, image: Option<&ImageContent>) -> Result<String> {
        self.lock_prompts().push(RecordedPrompt {
            prompt: prompt.to_string(),
            image: image.cloned(),
        });

        match self.next_reply() {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Error(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("mock oracle has no scripted reply left")),
        }
    }

    fn supports_image_input(&self) -> bool {
        self.image_input
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_oracle_replies_in_order() {
        let oracle = MockOracle::new()
            .with_replies(vec![MockReply::text("first"), MockReply::text("second")]);

        assert_eq!(oracle.run_prompt("a", None).await.unwrap(), "first");
        assert_eq!(oracle.run_prompt("b", None).await.unwrap(), "second");
        assert_eq!(oracle.call_count(), 2);
        assert_eq!(oracle.prompts()[1].prompt, "b");
    }

    #[tokio::test]
    async fn test_mock_oracle_scripted_error() {
        let oracle = MockOracle::new().with_reply(MockReply::error("boom"));

        let err = oracle.run_prompt("a", None).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(oracle.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_oracle_exhausted_without_default() {
        let oracle = MockOracle::new();
        assert!(oracle.run_prompt("a", None).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_oracle_default_reply_and_image_recording() {
        let oracle = MockOracle::new()
            .with_image_input(true)
            .with_default_reply(MockReply::text("ok"));
        let image = ImageContent::new("image/png", "AAAA".to_string());

        assert_eq!(oracle.run_prompt("a", Some(&image)).await.unwrap(), "ok");
        assert_eq!(oracle.run_prompt("b", None).await.unwrap(), "ok");
        assert!(oracle.supports_image_input());
        assert_eq!(oracle.prompts()[0].image, Some(image));
        assert!(oracle.prompts()[1].image.is_none());
    }
}
