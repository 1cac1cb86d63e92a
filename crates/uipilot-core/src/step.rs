//! Step execution: intent to cached, retried, sandboxed code.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};
use uipilot_config::{AnalysisMode, CacheMode};
use uipilot_driver::CapabilityCatalog;
use uipilot_execution::{extract_code, Sandbox};
use uipilot_oracle::Oracle;

use crate::cache::{cache_key, CacheEntry, ScreenFingerprint, StepCache};
use crate::capture::ScreenCapture;
use crate::error::PilotError;
use crate::fingerprint::SnapshotComparator;
use crate::prompts::{api_search_prompt, generation_prompt, view_analysis_prompt, GenerationContext};

/// A step that already ran, as context for later prompts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousStep {
    pub intent: String,
    pub code: String,
    pub result: Value,
}

impl PreviousStep {
    pub fn new(intent: &str, code: &str, result: Value) -> Self {
        Self {
            intent: intent.to_string(),
            code: code.to_string(),
            result,
        }
    }
}

/// Why a single attempt failed
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError {
    Generation { message: String },
    Evaluation { code: String, message: String },
}

impl AttemptError {
    /// History entry telling the next attempt what went wrong
    pub fn as_previous_step(&self, intent: &str) -> PreviousStep {
        match self {
            AttemptError::Generation { message } => PreviousStep::new(
                &format!("Failed to generate code for \"{}\"", intent),
                "",
                json!({ "error": message }),
            ),
            AttemptError::Evaluation { code, message } => PreviousStep::new(
                &format!("Failed to perform \"{}\", tried with \"{}\"", intent, code),
                code,
                json!({ "error": message }),
            ),
        }
    }
}

impl From<AttemptError> for PilotError {
    fn from(err: AttemptError) -> Self {
        match err {
            AttemptError::Generation { message } => PilotError::Generation(message),
            AttemptError::Evaluation { message, .. } => PilotError::Evaluation(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub code: String,
    pub result: Value,
    /// Whether the code came from the cache
    pub cached: bool,
    pub attempts: u32,
}

/// Everything one `perform` call works on
pub struct StepRequest<'a> {
    pub intent: &'a str,
    pub previous: &'a [PreviousStep],
    pub screen: &'a ScreenCapture,
    pub shared_state: &'a mut Map<String, Value>,
    pub max_attempts: u32,
}

pub struct StepExecutor<'a> {
    oracle: &'a dyn Oracle,
    catalog: &'a CapabilityCatalog,
    analysis_mode: AnalysisMode,
    comparator: SnapshotComparator,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        oracle: &'a dyn Oracle,
        catalog: &'a CapabilityCatalog,
        analysis_mode: AnalysisMode,
        comparator: SnapshotComparator,
    ) -> Self {
        Self {
            oracle,
            catalog,
            analysis_mode,
            comparator,
        }
    }

    /// Resolve, evaluate and cache one step.
    ///
    /// The cache is only consulted on the first attempt; retries always
    /// regenerate with the failure appended to the history. Shared state and
    /// the cache are only touched by the attempt that succeeds. A cached
    /// snippet that failed is evicted once a regenerated one succeeds.
    #[instrument(skip_all, fields(intent = %request.intent))]
    pub async fn perform(&self, cache: &mut StepCache, request: StepRequest<'_>) -> Result<StepOutcome> {
        cache.load();

        let key = cache_key(request.intent, request.previous);
        let fingerprint = (cache.mode() == CacheMode::Full)
            .then(|| ScreenFingerprint::of(request.screen, &self.comparator));
        let sandbox = Sandbox::from_catalog(self.catalog);
        let mut history = request.previous.to_vec();
        let max_attempts = request.max_attempts.max(1);
        let mut last_error = None;
        let mut stale: Option<CacheEntry> = None;

        for attempt in 1..=max_attempts {
            let cached = if attempt == 1 {
                cache.get(&key, fingerprint.as_ref())
            } else {
                None
            };
            let from_cache = cached.is_some();

            let code = match &cached {
                Some(entry) => {
                    debug!("Cache hit for step");
                    entry.code.clone()
                }
                None => match self.generate(request.intent, &history, request.screen).await {
                    Ok(code) => code,
                    Err(err) => {
                        warn!("Attempt {}/{} failed: {:?}", attempt, max_attempts, err);
                        if attempt < max_attempts {
                            history.push(err.as_previous_step(request.intent));
                        }
                        last_error = Some(err);
                        continue;
                    }
                },
            };

            match sandbox.evaluate(&code, request.shared_state).await {
                Ok(evaluation) => {
                    *request.shared_state = evaluation.shared_state;
                    if let Some(stale) = stale.take() {
                        cache.evict(&key, &stale);
                    }
                    let entry = match &fingerprint {
                        Some(screen) => CacheEntry::full(&code, screen),
                        None => CacheEntry::lightweight(&code),
                    };
                    cache.stage(&key, entry);
                    info!("Step succeeded on attempt {}", attempt);
                    return Ok(StepOutcome {
                        code,
                        result: evaluation.result,
                        cached: from_cache,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    if from_cache {
                        stale = cached;
                    }
                    let err = AttemptError::Evaluation {
                        code,
                        message: e.to_string(),
                    };
                    warn!("Attempt {}/{} failed: {:?}", attempt, max_attempts, err);
                    if attempt < max_attempts {
                        history.push(err.as_previous_step(request.intent));
                    }
                    last_error = Some(err);
                }
            }
        }

        let err = last_error
            .map(PilotError::from)
            .unwrap_or_else(|| PilotError::Generation("no attempt was made".to_string()));
        Err(err.into())
    }

    async fn generate(
        &self,
        intent: &str,
        history: &[PreviousStep],
        screen: &ScreenCapture,
    ) -> std::result::Result<String, AttemptError> {
        let documentation = self.catalog.render_documentation();
        let extra_context = match self.analysis_mode {
            AnalysisMode::Fast => None,
            AnalysisMode::Full => Some(self.analyze(intent, screen, &documentation).await?),
        };

        let prompt = generation_prompt(&GenerationContext {
            intent,
            hierarchy: &screen.hierarchy_text,
            image_attached: screen.image_attached,
            history,
            api_documentation: &documentation,
            extra_context: extra_context.as_deref(),
        });
        let image = screen.image_content();
        let response = self
            .oracle
            .run_prompt(&prompt, image.as_ref())
            .await
            .map_err(generation_error)?;

        let code = extract_code(&response).map_err(generation_error)?;
        if code.is_empty() {
            return Err(AttemptError::Generation {
                message: "oracle response contained no code".to_string(),
            });
        }
        debug!("Generated code:\n{}", code);
        Ok(code)
    }

    /// View analysis followed by API search, spliced into the generation prompt
    async fn analyze(
        &self,
        intent: &str,
        screen: &ScreenCapture,
        documentation: &str,
    ) -> std::result::Result<String, AttemptError> {
        let analysis = self
            .oracle
            .run_prompt(&view_analysis_prompt(intent, &screen.hierarchy_text), None)
            .await
            .map_err(generation_error)?;
        let apis = self
            .oracle
            .run_prompt(&api_search_prompt(intent, &analysis, documentation), None)
            .await
            .map_err(generation_error)?;
        Ok(format!("## Screen\n{}\n\n## Relevant API\n{}", analysis.trim(), apis.trim()))
    }
}

fn generation_error(err: anyhow::Error) -> AttemptError {
    AttemptError::Generation {
        message: format!("{:#}", err),
    }
}
