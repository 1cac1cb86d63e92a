//! uipilot CLI - run UI test steps and autopilot goals against a browser.

mod cli_args;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use uipilot_config::{Config, OracleProvider, WebDriverBrowser as ConfiguredBrowser};
use uipilot_core::{AutoReport, Pilot, SnapshotComparator, StepCache};
use uipilot_driver::{WebDriverBackend, WebDriverBrowser, WebDriverOptions};
use uipilot_oracle::{OpenAIOracle, Oracle};

pub use cli_args::{CacheAction, Cli, Command};
use clap::Parser;

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    initialize_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;
    debug!("Loaded configuration: {:?}", config.engine);

    match &cli.command {
        Command::Step { intents } => run_steps(&cli, &config, intents).await,
        Command::Autopilot { goal, report } => {
            run_autopilot(&cli, &config, goal, report.as_deref()).await
        }
        Command::Cache {
            action: CacheAction::Clear,
        } => {
            clear_cache(&config);
            Ok(())
        }
    }
}

fn initialize_logging(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "uipilot={level},uipilot_cli={level},uipilot_core={level},uipilot_execution={level},uipilot_oracle={level},uipilot_driver={level},fantoccini=warn",
            level = default_level
        ))
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn build_oracle(config: &Config) -> Result<Arc<dyn Oracle>> {
    let oracle = &config.oracle;
    if oracle.api_key.trim().is_empty() {
        anyhow::bail!("oracle.api_key is required to run steps");
    }

    let name = match oracle.provider {
        OracleProvider::Openai => "openai",
        OracleProvider::OpenaiCompatible => {
            if oracle.base_url.is_none() {
                anyhow::bail!("oracle.base_url is required for openai_compatible providers");
            }
            "openai_compatible"
        }
    };

    let client = OpenAIOracle::new_with_name(
        name.to_string(),
        oracle.api_key.clone(),
        Some(oracle.model.clone()),
        oracle.base_url.clone(),
        oracle.max_tokens,
        oracle.temperature,
    )?
    .with_image_input(oracle.supports_images);
    Ok(Arc::new(client))
}

async fn connect_backend(config: &Config) -> Result<Arc<WebDriverBackend>> {
    let webdriver = &config.webdriver;
    let options = WebDriverOptions {
        browser: match webdriver.browser {
            ConfiguredBrowser::Chrome => WebDriverBrowser::Chrome,
            ConfiguredBrowser::Safari => WebDriverBrowser::Safari,
        },
        port: webdriver.port,
        headless: webdriver.headless,
        chrome_binary: webdriver.chrome_binary.clone(),
        start_url: webdriver.start_url.clone(),
    };
    let backend = WebDriverBackend::connect(&options)
        .await
        .context("Is chromedriver/safaridriver running on the configured port?")?;
    Ok(Arc::new(backend))
}

async fn close_backend(backend: Arc<WebDriverBackend>) {
    match Arc::try_unwrap(backend) {
        Ok(backend) => {
            if let Err(e) = backend.close().await {
                warn!("Failed to close browser session: {:#}", e);
            }
        }
        Err(_) => warn!("Browser session still in use, leaving it open"),
    }
}

async fn run_steps(cli: &Cli, config: &Config, intents: &[String]) -> Result<()> {
    let oracle = build_oracle(config)?;
    let backend = connect_backend(config).await?;
    let mut pilot = Pilot::init(config, oracle, backend.clone())?;

    pilot.start()?;
    let outcome = pilot.perform_steps(intents).await;
    pilot.end(!cli.discard)?;
    drop(pilot);
    close_backend(backend).await;

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_autopilot(cli: &Cli, config: &Config, goal: &str, report_path: Option<&Path>) -> Result<()> {
    let oracle = build_oracle(config)?;
    let backend = connect_backend(config).await?;
    let mut pilot = Pilot::init(config, oracle, backend.clone())?;

    pilot.start()?;
    let outcome = pilot.autopilot(goal).await;
    pilot.end(!cli.discard)?;
    drop(pilot);
    close_backend(backend).await;

    let report = outcome?;
    println!("{}", report.to_markdown());
    if let Some(path) = report_path {
        write_report(&report, path)?;
    }
    Ok(())
}

fn write_report(report: &AutoReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    info!("Report written to {}", path.display());
    Ok(())
}

fn clear_cache(config: &Config) {
    let mut cache = StepCache::new(
        config.engine.cache_path.clone(),
        config.engine.cache_mode,
        SnapshotComparator::new(config.engine.image_similarity_threshold),
    );
    cache.clear();
    println!("Cleared step cache at {}", config.engine.cache_path.display());
}
