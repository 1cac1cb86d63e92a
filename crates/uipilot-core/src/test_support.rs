//! Test doubles: a scripted backend and screenshot fixtures.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uipilot_config::{CacheMode, Config};
use uipilot_driver::{binding, string_arg, Capability, CapabilityCatalog, CapabilityCategory, Driver};

const SIZE: u32 = 64;

/// Screenshot layouts that hash far apart from each other
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    LeftDark,
    TopDark,
}

fn render(pattern: Pattern, noise: bool) -> Vec<u8> {
    let img = RgbImage::from_fn(SIZE, SIZE, |x, y| {
        let dark = match pattern {
            Pattern::LeftDark => x < SIZE / 2,
            Pattern::TopDark => y < SIZE / 2,
        };
        if noise && (x, y) == (12, 12) {
            return Rgb([30, 30, 30]);
        }
        if dark {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    });

    let mut bytes = Vec::new();
    if let Err(e) = DynamicImage::ImageRgb8(img).write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png) {
        panic!("failed to encode fixture png: {}", e);
    }
    bytes
}

pub fn patterned_png(pattern: Pattern) -> Vec<u8> {
    render(pattern, false)
}

/// Same layout as [`patterned_png`] with one off-shade pixel in the dark area
pub fn noisy_png(pattern: Pattern) -> Vec<u8> {
    render(pattern, true)
}

/// A binding call seen by the scripted backend
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub name: String,
    pub args: Vec<Value>,
}

#[derive(Default)]
struct Screen {
    images: VecDeque<Option<Vec<u8>>>,
    image: Option<Vec<u8>>,
    hierarchy: String,
    capture_error: Option<String>,
}

/// Backend double with a fixed screen and recording bindings.
///
/// Catalog:
/// - `tap(selector)` returns `"tapped <selector>"`
/// - `type_text(selector, text)` returns `"typed <text>"`
/// - `read_text(selector)` returns the configured text for the selector
/// - `fail(message)` always errors
#[derive(Clone)]
pub struct ScriptedDriver {
    screen: Arc<Mutex<Screen>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    texts: Arc<Mutex<Vec<(String, String)>>>,
    image_captures: Arc<AtomicUsize>,
    hierarchy_captures: Arc<AtomicUsize>,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        let screen = Screen {
            image: Some(patterned_png(Pattern::LeftDark)),
            hierarchy: "<screen id=\"login\"><button id=\"login\">Log in</button></screen>".to_string(),
            ..Screen::default()
        };
        Self {
            screen: Arc::new(Mutex::new(screen)),
            calls: Arc::new(Mutex::new(Vec::new())),
            texts: Arc::new(Mutex::new(Vec::new())),
            image_captures: Arc::new(AtomicUsize::new(0)),
            hierarchy_captures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Change the steady-state screen
    pub fn set_screen(&self, image: Option<Vec<u8>>, hierarchy: &str) {
        let mut screen = self.screen.lock().unwrap_or_else(|e| e.into_inner());
        screen.image = image;
        screen.hierarchy = hierarchy.to_string();
    }

    /// Screenshots returned before the steady-state image
    pub fn queue_images(&self, images: Vec<Option<Vec<u8>>>) {
        let mut screen = self.screen.lock().unwrap_or_else(|e| e.into_inner());
        screen.images.extend(images);
    }

    pub fn fail_captures(&self, message: &str) {
        let mut screen = self.screen.lock().unwrap_or_else(|e| e.into_inner());
        screen.capture_error = Some(message.to_string());
    }

    pub fn set_text(&self, selector: &str, text: &str) {
        let mut texts = self.texts.lock().unwrap_or_else(|e| e.into_inner());
        texts.retain(|(s, _)| s != selector);
        texts.push((selector.to_string(), text.to_string()));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn image_captures(&self) -> usize {
        self.image_captures.load(Ordering::SeqCst)
    }

    pub fn hierarchy_captures(&self) -> usize {
        self.hierarchy_captures.load(Ordering::SeqCst)
    }

    fn recorder(&self, name: &'static str, respond: fn(&[Value], &[(String, String)]) -> Result<Value>) -> Capability {
        let calls = self.calls.clone();
        let texts = self.texts.clone();
        let callable = binding(move |args| {
            calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(RecordedCall {
                    name: name.to_string(),
                    args: args.clone(),
                });
            let texts = texts.lock().unwrap_or_else(|e| e.into_inner());
            respond(&args, &texts)
        });
        Capability::new(name, name, "", callable)
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn capture_image(&self) -> Result<Option<Vec<u8>>> {
        self.image_captures.fetch_add(1, Ordering::SeqCst);
        let mut screen = self.screen.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(message) = &screen.capture_error {
            return Err(anyhow!(message.clone()));
        }
        match screen.images.pop_front() {
            Some(image) => Ok(image),
            None => Ok(screen.image.clone()),
        }
    }

    async fn capture_hierarchy_text(&self) -> Result<String> {
        self.hierarchy_captures.fetch_add(1, Ordering::SeqCst);
        let screen = self.screen.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(message) = &screen.capture_error {
            return Err(anyhow!(message.clone()));
        }
        Ok(screen.hierarchy.clone())
    }

    fn catalog(&self) -> CapabilityCatalog {
        CapabilityCatalog::new("Scripted", "In-memory test backend")
            .with_category(
                CapabilityCategory::new("Actions")
                    .with_item(self.recorder("tap", |args, _| {
                        Ok(json!(format!("tapped {}", string_arg(args, 0, "selector")?)))
                    }))
                    .with_item(self.recorder("type_text", |args, _| {
                        Ok(json!(format!("typed {}", string_arg(args, 1, "text")?)))
                    })),
            )
            .with_category(
                CapabilityCategory::new("Queries")
                    .with_item(self.recorder("read_text", |args, texts| {
                        let selector = string_arg(args, 0, "selector")?;
                        texts
                            .iter()
                            .find(|(s, _)| *s == selector)
                            .map(|(_, text)| json!(text))
                            .ok_or_else(|| anyhow!("no element matches {}", selector))
                    }))
                    .with_item(self.recorder("fail", |args, _| {
                        Err(anyhow!(
                            "{}",
                            string_arg(args, 0, "message").unwrap_or_else(|_| "failed".to_string())
                        ))
                    })),
            )
    }
}

/// Config tuned for tests: fast stabilization, cache under `dir`
pub fn test_config(dir: &Path, mode: CacheMode) -> Config {
    let mut config = Config::default();
    config.engine.cache_mode = mode;
    config.engine.cache_path = dir.join("uipilot_cache.json");
    config.stabilization.poll_interval_ms = 1;
    config.stabilization.timeout_ms = 50;
    config
}

/// Oracle reply wrapping `code` in a fenced block
pub fn code_reply(code: &str) -> String {
    format!("```rhai\n{}\n```", code)
}

/// Planner reply in the tagged format
pub fn planner_reply(screen: &str, thoughts: &str, action: &str) -> String {
    format!(
        "<SCREENDESCRIPTION>{}</SCREENDESCRIPTION>\n<THOUGHTS>{}</THOUGHTS>\n<ACTION>{}</ACTION>",
        screen, thoughts, action
    )
}
