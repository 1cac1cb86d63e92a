//! UI-automation backend abstractions for uipilot.
//!
//! A [`Driver`] is what the engine observes and drives: it captures the
//! screen as an image and as a text hierarchy, and it declares the
//! [`CapabilityCatalog`] of named operations that generated code may call.

pub mod catalog;
pub mod webdriver;

pub use catalog::{
    binding, optional_u64_arg, string_arg, Binding, Capability, CapabilityCatalog,
    CapabilityCategory,
};
pub use webdriver::{WebDriverBackend, WebDriverBrowser, WebDriverOptions};

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Driver: Send + Sync {
    /// Capture the current screen as encoded image bytes.
    ///
    /// Returns `None` when there is nothing to capture (e.g. no active screen).
    async fn capture_image(&self) -> Result<Option<Vec<u8>>>;

    /// Capture the current view hierarchy as text (DOM, accessibility tree, ...).
    async fn capture_hierarchy_text(&self) -> Result<String>;

    /// The operations generated code may call, with documentation for prompts
    fn catalog(&self) -> CapabilityCatalog;
}
