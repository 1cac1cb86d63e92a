//! WebDriver backend built on fantoccini.
//!
//! Screenshots serve as the image capture and the page source as the view
//! hierarchy. The capability bindings are synchronous: the sandbox calls them
//! from a blocking thread, and they drive the async client through the
//! runtime handle captured at connect time.

use crate::catalog::{
    binding, optional_u64_arg, string_arg, Binding, Capability, CapabilityCatalog,
    CapabilityCategory,
};
use crate::Driver;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use fantoccini::{Client, ClientBuilder, Locator};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};

const DEFAULT_WAIT_MS: u64 = 5000;

/// Browser type for WebDriver
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WebDriverBrowser {
    #[default]
    Chrome,
    Safari,
}

#[derive(Debug, Clone)]
pub struct WebDriverOptions {
    pub browser: WebDriverBrowser,
    pub port: u16,
    pub headless: bool,
    /// Optional path to a Chrome binary (e.g. Chrome for Testing)
    pub chrome_binary: Option<String>,
    /// Page to open right after connecting
    pub start_url: Option<String>,
}

impl Default for WebDriverOptions {
    fn default() -> Self {
        Self {
            browser: WebDriverBrowser::Chrome,
            port: 9515,
            headless: true,
            chrome_binary: None,
            start_url: None,
        }
    }
}

pub struct WebDriverBackend {
    client: Client,
    handle: Handle,
}

impl WebDriverBackend {
    /// Connect to a running ChromeDriver or SafariDriver.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn connect(options: &WebDriverOptions) -> Result<Self> {
        let url = format!("http://localhost:{}", options.port);
        let caps = capabilities(options);

        let mut builder = ClientBuilder::native();
        let connect_future = builder.capabilities(caps).connect(&url);

        let client = tokio::time::timeout(Duration::from_secs(30), connect_future)
            .await
            .context("Connection to WebDriver timed out after 30 seconds")?
            .context("Failed to connect to WebDriver")?;

        info!("Connected to {:?} WebDriver at {}", options.browser, url);

        if let Some(start_url) = &options.start_url {
            client
                .goto(start_url)
                .await
                .with_context(|| format!("Failed to open start url {}", start_url))?;
        }

        Ok(Self {
            client,
            handle: Handle::current(),
        })
    }

    /// Quit the browser session
    pub async fn close(self) -> Result<()> {
        self.client.close().await?;
        Ok(())
    }

    fn navigation(&self) -> CapabilityCategory {
        CapabilityCategory::new("Navigation")
            .with_item(Capability::new(
                "navigate",
                "Open a URL in the current tab.",
                r#"navigate("https://example.com/login");"#,
                self.bind(|client, args| async move {
                    let url = string_arg(&args, 0, "url")?;
                    client.goto(&url).await?;
                    Ok(Value::Null)
                }),
            ))
            .with_item(Capability::new(
                "back",
                "Go back in browser history.",
                "back();",
                self.bind(|client, _| async move {
                    client.back().await?;
                    Ok(Value::Null)
                }),
            ))
            .with_item(Capability::new(
                "refresh",
                "Reload the current page.",
                "refresh();",
                self.bind(|client, _| async move {
                    client.refresh().await?;
                    Ok(Value::Null)
                }),
            ))
            .with_item(Capability::new(
                "current_url",
                "Return the URL of the current page.",
                r#"let url = current_url();"#,
                self.bind(|client, _| async move {
                    Ok(json!(client.current_url().await?.to_string()))
                }),
            ))
    }

    fn interaction(&self) -> CapabilityCategory {
        CapabilityCategory::new("Interaction")
            .with_item(
                Capability::new(
                    "click",
                    "Click the element matching a CSS selector.",
                    r##"click("#submit");"##,
                    self.bind(|client, args| async move {
                        let selector = string_arg(&args, 0, "selector")?;
                        client.find(Locator::Css(&selector)).await?.click().await?;
                        Ok(Value::Null)
                    }),
                )
                .with_guideline("Prefer ids or data-testid attributes over positional selectors."),
            )
            .with_item(Capability::new(
                "type_text",
                "Type text into the input matching a CSS selector.",
                r##"type_text("#email", "user@example.com");"##,
                self.bind(|client, args| async move {
                    let selector = string_arg(&args, 0, "selector")?;
                    let text = string_arg(&args, 1, "text")?;
                    client
                        .find(Locator::Css(&selector))
                        .await?
                        .send_keys(&text)
                        .await?;
                    Ok(Value::Null)
                }),
            ))
            .with_item(Capability::new(
                "clear",
                "Clear the input matching a CSS selector.",
                r##"clear("#email");"##,
                self.bind(|client, args| async move {
                    let selector = string_arg(&args, 0, "selector")?;
                    client.find(Locator::Css(&selector)).await?.clear().await?;
                    Ok(Value::Null)
                }),
            ))
    }

    fn queries(&self) -> CapabilityCategory {
        CapabilityCategory::new("Queries and assertions")
            .with_item(Capability::new(
                "text_of",
                "Return the visible text of the element matching a CSS selector.",
                r#"let title = text_of("h1");"#,
                self.bind(|client, args| async move {
                    let selector = string_arg(&args, 0, "selector")?;
                    let text = client.find(Locator::Css(&selector)).await?.text().await?;
                    Ok(json!(text))
                }),
            ))
            .with_item(Capability::new(
                "is_visible",
                "Return whether an element matching a CSS selector is displayed.",
                r#"if is_visible(".banner") { click(".banner .close"); }"#,
                self.bind(|client, args| async move {
                    let selector = string_arg(&args, 0, "selector")?;
                    let visible = match client.find(Locator::Css(&selector)).await {
                        Ok(element) => element.is_displayed().await?,
                        Err(_) => false,
                    };
                    Ok(json!(visible))
                }),
            ))
            .with_item(Capability::new(
                "assert_visible",
                "Fail the step unless the element matching a CSS selector is displayed.",
                r#"assert_visible(".welcome");"#,
                self.bind(|client, args| async move {
                    let selector = string_arg(&args, 0, "selector")?;
                    let element = client
                        .find(Locator::Css(&selector))
                        .await
                        .with_context(|| format!("element {} not found", selector))?;
                    if !element.is_displayed().await? {
                        return Err(anyhow!("element {} is not visible", selector));
                    }
                    Ok(Value::Bool(true))
                }),
            ))
            .with_item(Capability::new(
                "assert_text",
                "Fail the step unless the element's text contains the expected string.",
                r#"assert_text(".status", "Saved");"#,
                self.bind(|client, args| async move {
                    let selector = string_arg(&args, 0, "selector")?;
                    let expected = string_arg(&args, 1, "expected")?;
                    let text = client.find(Locator::Css(&selector)).await?.text().await?;
                    if !text.contains(&expected) {
                        return Err(anyhow!(
                            "expected {} to contain {:?}, found {:?}",
                            selector,
                            expected,
                            text
                        ));
                    }
                    Ok(Value::Bool(true))
                }),
            ))
            .with_item(Capability::new(
                "wait_for",
                "Wait until an element matching a CSS selector exists (timeout in ms, default 5000).",
                r#"wait_for(".results", 10000);"#,
                self.bind(|client, args| async move {
                    let selector = string_arg(&args, 0, "selector")?;
                    let timeout = optional_u64_arg(&args, 1, "timeout_ms")?.unwrap_or(DEFAULT_WAIT_MS);
                    client
                        .wait()
                        .at_most(Duration::from_millis(timeout))
                        .for_element(Locator::Css(&selector))
                        .await
                        .with_context(|| format!("timed out waiting for {}", selector))?;
                    Ok(Value::Null)
                }),
            ))
    }

    /// Turn an async client operation into a blocking binding
    fn bind<F, Fut>(&self, op: F) -> Binding
    where
        F: Fn(Client, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send,
    {
        let client = self.client.clone();
        let handle = self.handle.clone();
        binding(move |args| handle.block_on(op(client.clone(), args)))
    }
}

#[async_trait]
impl Driver for WebDriverBackend {
    async fn capture_image(&self) -> Result<Option<Vec<u8>>> {
        let bytes = self.client.screenshot().await.context("Failed to take screenshot")?;
        debug!("Captured screenshot ({} bytes)", bytes.len());
        Ok(if bytes.is_empty() { None } else { Some(bytes) })
    }

    async fn capture_hierarchy_text(&self) -> Result<String> {
        Ok(self
            .client
            .source()
            .await
            .context("Failed to read page source")?)
    }

    fn catalog(&self) -> CapabilityCatalog {
        CapabilityCatalog::new(
            "WebDriver",
            "Browser automation through WebDriver. Elements are addressed with CSS selectors.",
        )
        .with_category(self.navigation())
        .with_category(self.interaction())
        .with_category(self.queries())
        .with_restriction("Only call the functions listed above; there is no other browser access.")
        .with_restriction("Each step should do one thing and fail loudly if it cannot.")
    }
}

fn capabilities(options: &WebDriverOptions) -> serde_json::Map<String, Value> {
    let mut caps = serde_json::Map::new();
    match options.browser {
        WebDriverBrowser::Chrome => {
            caps.insert("browserName".to_string(), json!("chrome"));
            let mut args = vec![
                // Use a unique temp directory to avoid conflicts with running Chrome instances
                json!(format!("--user-data-dir=/tmp/uipilot-chrome-{}", std::process::id())),
                json!("--disable-gpu"),
                json!("--no-sandbox"),
                json!("--disable-dev-shm-usage"),
                json!("--window-size=1280,900"),
            ];
            if options.headless {
                args.push(json!("--headless=new"));
            }
            let mut chrome_options = serde_json::Map::new();
            chrome_options.insert("args".to_string(), Value::Array(args));
            if let Some(binary) = &options.chrome_binary {
                chrome_options.insert("binary".to_string(), json!(binary));
            }
            caps.insert("goog:chromeOptions".to_string(), Value::Object(chrome_options));
        }
        WebDriverBrowser::Safari => {
            caps.insert("browserName".to_string(), json!("safari"));
        }
    }
    caps
}
