//! Session control surface.
//!
//! A [`Pilot`] is created once by [`Pilot::init`] and drives one flow at a
//! time: `start`, any number of steps or autopilot runs, then `end`. The step
//! cache outlives individual sessions.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uipilot_config::{cache_override_from_env, Config, EngineConfig};
use uipilot_driver::{Binding, CapabilityCatalog, CapabilityCategory, Driver};
use uipilot_oracle::Oracle;
use uuid::Uuid;

use crate::autopilot::{Autopilot, StepDelegate};
use crate::cache::StepCache;
use crate::capture::{ScreenCapture, ScreenCapturer, StabilizeOptions};
use crate::error::PilotError;
use crate::fingerprint::SnapshotComparator;
use crate::report::AutoReport;
use crate::step::{PreviousStep, StepExecutor, StepOutcome, StepRequest};

/// State of the active flow
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub id: String,
    pub previous_steps: Vec<PreviousStep>,
    pub shared_state: Map<String, Value>,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ..Self::default()
        }
    }
}

enum SessionState {
    Idle,
    Running(Session),
}

pub struct Pilot {
    engine: EngineConfig,
    oracle: Arc<dyn Oracle>,
    catalog: CapabilityCatalog,
    comparator: SnapshotComparator,
    capturer: ScreenCapturer,
    cache: StepCache,
    state: SessionState,
}

impl Pilot {
    /// Validate the configuration and wire up the collaborators.
    ///
    /// The cache is bypassed when the config asks for it or when
    /// `UIPILOT_OVERRIDE_CACHE` is set.
    pub fn init(config: &Config, oracle: Arc<dyn Oracle>, driver: Arc<dyn Driver>) -> Result<Self> {
        let problems = config.problems();
        if !problems.is_empty() {
            return Err(PilotError::Config(problems.join("; ")).into());
        }

        let engine = config.engine.clone();
        let comparator = SnapshotComparator::new(engine.image_similarity_threshold);
        let bypass = engine.bypass_cache || cache_override_from_env();
        let cache = StepCache::new(engine.cache_path.clone(), engine.cache_mode, comparator)
            .with_bypass(bypass);
        let capturer = ScreenCapturer::new(
            driver.clone(),
            comparator,
            StabilizeOptions::from(&config.stabilization),
        );

        info!(
            "Pilot ready: oracle={} cache={:?} analysis={:?} bypass={}",
            oracle.name(),
            engine.cache_mode,
            engine.analysis_mode,
            bypass
        );
        Ok(Self {
            catalog: driver.catalog(),
            engine,
            oracle,
            comparator,
            capturer,
            cache,
            state: SessionState::Idle,
        })
    }

    /// Begin a new flow with empty history and shared state
    pub fn start(&mut self) -> Result<()> {
        if let SessionState::Running(session) = &self.state {
            return Err(PilotError::Sequencing(format!(
                "session {} is already running",
                session.id
            ))
            .into());
        }
        self.cache.load();
        let session = Session::new();
        info!("Session {} started", session.id);
        self.state = SessionState::Running(session);
        Ok(())
    }

    /// Finish the flow, committing or discarding its staged cache entries
    pub fn end(&mut self, commit_to_cache: bool) -> Result<()> {
        let session = match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Running(session) => session,
            SessionState::Idle => {
                return Err(PilotError::Sequencing("no session is running".to_string()).into())
            }
        };

        if commit_to_cache {
            self.cache.commit();
        } else {
            self.cache.discard();
        }
        info!(
            "Session {} ended after {} steps",
            session.id,
            session.previous_steps.len()
        );
        Ok(())
    }

    /// Capture the screen and perform one intent
    #[instrument(skip(self))]
    pub async fn perform_step(&mut self, intent: &str) -> Result<Value> {
        self.running()?;
        let screen = self.capture().await?;
        let outcome = self.run_step(intent, &screen).await?;
        Ok(outcome.result)
    }

    /// Perform intents in order, returning the last result.
    ///
    /// The first failure aborts the remaining intents.
    pub async fn perform_steps<S: AsRef<str>>(&mut self, intents: &[S]) -> Result<Value> {
        self.running()?;
        let mut last = Value::Null;
        for intent in intents {
            last = self.perform_step(intent.as_ref()).await?;
        }
        Ok(last)
    }

    /// Drive the planner loop toward `goal`
    pub async fn autopilot(&mut self, goal: &str) -> Result<AutoReport> {
        self.running()?;
        let autopilot = Autopilot::new(
            self.oracle.clone(),
            self.catalog.render_documentation(),
            self.engine.max_steps,
        );
        let mut delegate = SessionDelegate { pilot: self };
        autopilot.run(goal, &mut delegate).await
    }

    /// Add capability categories and extra sandbox bindings
    pub fn extend_capability_catalog(
        &mut self,
        categories: Vec<CapabilityCategory>,
        extra_bindings: BTreeMap<String, Binding>,
    ) {
        debug!(
            "Extending catalog with {} categories and {} bindings",
            categories.len(),
            extra_bindings.len()
        );
        self.catalog.extend(categories, extra_bindings);
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SessionState::Running(_))
    }

    pub fn session(&self) -> Option<&Session> {
        match &self.state {
            SessionState::Running(session) => Some(session),
            SessionState::Idle => None,
        }
    }

    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.catalog
    }

    pub fn cache(&self) -> &StepCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut StepCache {
        &mut self.cache
    }

    pub fn capturer(&self) -> &ScreenCapturer {
        &self.capturer
    }

    fn running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(PilotError::Sequencing("no session is running; call start() first".to_string()).into())
        }
    }

    async fn capture(&self) -> Result<ScreenCapture> {
        self.capturer
            .capture(self.oracle.supports_image_input())
            .await
    }

    async fn run_step(&mut self, intent: &str, screen: &ScreenCapture) -> Result<StepOutcome> {
        let session = match &mut self.state {
            SessionState::Running(session) => session,
            SessionState::Idle => {
                return Err(PilotError::Sequencing("no session is running".to_string()).into())
            }
        };

        let executor = StepExecutor::new(
            self.oracle.as_ref(),
            &self.catalog,
            self.engine.analysis_mode,
            self.comparator,
        );
        let outcome = executor
            .perform(
                &mut self.cache,
                StepRequest {
                    intent,
                    previous: &session.previous_steps,
                    screen,
                    shared_state: &mut session.shared_state,
                    max_attempts: self.engine.max_attempts,
                },
            )
            .await?;

        session
            .previous_steps
            .push(PreviousStep::new(intent, &outcome.code, outcome.result.clone()));
        Ok(outcome)
    }
}

struct SessionDelegate<'a> {
    pilot: &'a mut Pilot,
}

#[async_trait]
impl StepDelegate for SessionDelegate<'_> {
    async fn capture(&mut self) -> Result<ScreenCapture> {
        self.pilot.capture().await
    }

    async fn perform(&mut self, intent: &str, screen: &ScreenCapture) -> Result<StepOutcome> {
        self.pilot.run_step(intent, screen).await
    }
}
