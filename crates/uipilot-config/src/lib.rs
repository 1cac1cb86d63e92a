use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable that forces every cache lookup to miss
pub const OVERRIDE_CACHE_ENV: &str = "UIPILOT_OVERRIDE_CACHE";

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["./uipilot.toml", "~/.config/uipilot/config.toml"];

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub stabilization: StabilizationConfig,
    #[serde(default)]
    pub webdriver: WebDriverConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OracleProvider {
    #[default]
    Openai,
    OpenaiCompatible,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub provider: OracleProvider,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    #[serde(default = "default_true")]
    pub supports_images: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: OracleProvider::Openai,
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.1),
            supports_images: true,
        }
    }
}

/// How generated code is cached between runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Match on intent + history, then disambiguate by screen fingerprint
    #[default]
    Full,
    /// Match on intent + history alone
    Lightweight,
    /// Never read or write the cache
    Disabled,
}

/// How much oracle work goes into generating a step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    /// Single generation call
    #[default]
    Fast,
    /// View analysis and API search passes before generation
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache_mode: CacheMode,
    #[serde(default)]
    pub analysis_mode: AnalysisMode,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default)]
    pub bypass_cache: bool,
    #[serde(default = "default_image_similarity_threshold")]
    pub image_similarity_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::Full,
            analysis_mode: AnalysisMode::Fast,
            max_attempts: default_max_attempts(),
            max_steps: default_max_steps(),
            cache_path: default_cache_path(),
            bypass_cache: false,
            image_similarity_threshold: default_image_similarity_threshold(),
        }
    }
}

impl EngineConfig {
    /// Missing or invalid required fields, one message per problem
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_attempts == 0 {
            problems.push("engine.max_attempts must be at least 1".to_string());
        }
        if self.max_steps == 0 {
            problems.push("engine.max_steps must be at least 1".to_string());
        }
        if self.cache_mode != CacheMode::Disabled && self.cache_path.as_os_str().is_empty() {
            problems.push("engine.cache_path is required unless cache_mode is disabled".to_string());
        }
        if !(0.0..=1.0).contains(&self.image_similarity_threshold) {
            problems.push("engine.image_similarity_threshold must be within 0.0..=1.0".to_string());
        }
        problems
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilizationConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Browser type for WebDriver
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WebDriverBrowser {
    #[default]
    Chrome,
    Safari,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDriverConfig {
    #[serde(default)]
    pub browser: WebDriverBrowser,
    #[serde(default = "default_webdriver_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub headless: bool,
    /// Optional path to Chrome binary (e.g., Chrome for Testing)
    pub chrome_binary: Option<String>,
    pub start_url: Option<String>,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            browser: WebDriverBrowser::Chrome,
            port: default_webdriver_port(),
            headless: true,
            chrome_binary: None,
            start_url: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    2
}

fn default_max_steps() -> u32 {
    100
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("uipilot_cache.json")
}

fn default_image_similarity_threshold() -> f64 {
    0.1
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_webdriver_port() -> u16 {
    9515
}

/// Whether the environment forces cache lookups to miss
pub fn cache_override_from_env() -> bool {
    std::env::var(OVERRIDE_CACHE_ENV)
        .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl Config {
    /// Load from an explicit path, or the first default path that exists.
    ///
    /// Falls back to defaults when no config file is found. Environment
    /// overrides are applied on top.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path_to_load = match config_path {
            Some(path) => {
                let expanded = shellexpand::tilde(path).to_string();
                if !Path::new(&expanded).exists() {
                    anyhow::bail!("Config file not found: {}", expanded);
                }
                Some(expanded)
            }
            None => DEFAULT_CONFIG_PATHS.iter().find_map(|path| {
                let expanded = shellexpand::tilde(path);
                if Path::new(expanded.as_ref()).exists() {
                    Some(expanded.to_string())
                } else {
                    None
                }
            }),
        };

        let mut config = match path_to_load {
            Some(path) => {
                debug!("Loading config from {}", path);
                let content = std::fs::read_to_string(&path)?;
                toml::from_str::<Config>(&content)
                    .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path, e))?
            }
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Default per-user config location (`~/.config/uipilot/config.toml`)
    pub fn default_user_path() -> PathBuf {
        dirs::home_dir()
            .map(|mut path| {
                path.push(".config");
                path.push("uipilot");
                path.push("config.toml");
                path
            })
            .unwrap_or_else(|| PathBuf::from("uipilot.toml"))
    }

    pub fn apply_env_overrides(&mut self) {
        if cache_override_from_env() {
            self.engine.bypass_cache = true;
        }
    }

    /// All missing or invalid required fields
    pub fn problems(&self) -> Vec<String> {
        let mut problems = self.engine.problems();
        if self.oracle.model.trim().is_empty() {
            problems.push("oracle.model is required".to_string());
        }
        if self.stabilization.poll_interval_ms == 0 {
            problems.push("stabilization.poll_interval_ms must be positive".to_string());
        }
        problems
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if !problems.is_empty() {
            anyhow::bail!("Invalid configuration:\n- {}", problems.join("\n- "));
        }
        Ok(())
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, toml_string)?;
        Ok(())
    }
}
