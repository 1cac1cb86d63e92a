//! Autonomous planner loop.
//!
//! Each iteration captures the screen, asks the planner oracle for the next
//! action plus an optional review, and delegates the action to the step
//! executor. The loop ends when the planner answers `success` or when the
//! step budget runs out.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uipilot_oracle::Oracle;

use crate::capture::ScreenCapture;
use crate::error::PilotError;
use crate::prompts::{planner_prompt, PlannerContext};
use crate::report::{AutoReport, AutoStepReport, Plan, Review, ReviewSection};
use crate::step::StepOutcome;
use crate::tagged::{find_tag, Outputs, OutputsMapping};

/// Action text that ends the loop
pub const SUCCESS_ACTION: &str = "success";

/// What the planner loop drives: screen capture and step execution
#[async_trait]
pub trait StepDelegate: Send {
    async fn capture(&mut self) -> Result<ScreenCapture>;

    /// Perform `intent` on the already captured `screen`
    async fn perform(&mut self, intent: &str, screen: &ScreenCapture) -> Result<StepOutcome>;
}

/// Parsed planner response
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerOutput {
    pub screen_label: String,
    pub thoughts: String,
    pub action: String,
    pub review: Option<Review>,
}

impl PlannerOutput {
    fn mapping() -> OutputsMapping {
        OutputsMapping::new()
            .required("screen", "SCREENDESCRIPTION")
            .required("thoughts", "THOUGHTS")
            .required("action", "ACTION")
            .optional("ux", "UX")
            .optional("a11y", "ACCESSIBILITY")
            .optional("i18n", "INTERNATIONALIZATION")
    }

    pub fn parse(response: &str) -> Result<Self> {
        let outputs = Self::mapping().extract(response)?;
        let review = Review {
            ux: parse_section(&outputs, "ux")?,
            a11y: parse_section(&outputs, "a11y")?,
            i18n: parse_section(&outputs, "i18n")?,
        };

        Ok(Self {
            screen_label: outputs.get("screen").to_string(),
            thoughts: outputs.get("thoughts").to_string(),
            action: outputs.get("action").trim_matches('`').trim().to_string(),
            review: (!review.is_empty()).then_some(review),
        })
    }

    pub fn is_success(&self) -> bool {
        self.action.eq_ignore_ascii_case(SUCCESS_ACTION)
    }

    /// `<SUMMARY>` inside the thoughts, else the thoughts themselves
    pub fn summary(&self) -> Result<String> {
        Ok(find_tag(&self.thoughts, "SUMMARY")?.unwrap_or_else(|| self.thoughts.clone()))
    }
}

fn parse_section(outputs: &Outputs, field: &str) -> Result<Option<ReviewSection>> {
    let Some(text) = outputs.present(field) else {
        return Ok(None);
    };
    if text.is_empty() {
        return Ok(None);
    }

    let summary = find_tag(text, "SUMMARY")?.unwrap_or_else(|| text.to_string());
    let findings = find_tag(text, "FINDINGS")?
        .map(|block| {
            block
                .lines()
                .map(|line| line.trim().trim_start_matches(['-', '*']).trim().to_string())
                .filter(|line| !line.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let score = match find_tag(text, "SCORE")? {
        Some(raw) => Regex::new(r"\d+")?
            .find(&raw)
            .and_then(|m| m.as_str().parse().ok()),
        None => None,
    };

    Ok(Some(ReviewSection {
        summary,
        findings,
        score,
    }))
}

pub struct Autopilot {
    oracle: Arc<dyn Oracle>,
    api_documentation: String,
    max_steps: u32,
}

impl Autopilot {
    pub fn new(oracle: Arc<dyn Oracle>, api_documentation: String, max_steps: u32) -> Self {
        Self {
            oracle,
            api_documentation,
            max_steps,
        }
    }

    /// Run the loop toward `goal`.
    ///
    /// Running out of steps is not an error: the partial report comes back
    /// with `goal_achieved == false`. A failed delegated step aborts the run.
    #[instrument(skip(self, delegate))]
    pub async fn run(&self, goal: &str, delegate: &mut dyn StepDelegate) -> Result<AutoReport> {
        let mut steps: Vec<AutoStepReport> = Vec::new();

        for index in 0..self.max_steps {
            let screen = delegate.capture().await?;
            let plan = self.plan(goal, &screen, &steps).await?;
            info!(step = index + 1, "Planner chose: {}", plan.action);

            if plan.is_success() {
                let summary = plan.summary()?;
                let review = aggregate_review(&steps, plan.review.as_ref());
                info!("Goal achieved after {} steps", steps.len());
                return Ok(AutoReport {
                    goal: goal.to_string(),
                    steps,
                    summary: Some(summary),
                    review,
                    goal_achieved: true,
                });
            }

            let outcome = delegate.perform(&plan.action, &screen).await?;
            steps.push(AutoStepReport {
                screen_label: plan.screen_label,
                plan: Plan {
                    thoughts: plan.thoughts,
                    action: plan.action,
                },
                review: plan.review,
                goal_achieved: false,
                summary: None,
                code: Some(outcome.code),
                result: Some(outcome.result),
            });
        }

        warn!("Step budget of {} exhausted before reaching the goal", self.max_steps);
        let review = aggregate_review(&steps, None);
        Ok(AutoReport {
            goal: goal.to_string(),
            steps,
            summary: None,
            review,
            goal_achieved: false,
        })
    }

    async fn plan(
        &self,
        goal: &str,
        screen: &ScreenCapture,
        steps: &[AutoStepReport],
    ) -> Result<PlannerOutput> {
        let prompt = planner_prompt(&PlannerContext {
            goal,
            hierarchy: &screen.hierarchy_text,
            image_attached: screen.image_attached,
            steps,
            api_documentation: &self.api_documentation,
        });
        let image = screen.image_content();
        let response = self
            .oracle
            .run_prompt(&prompt, image.as_ref())
            .await
            .map_err(|e| PilotError::Generation(format!("planner: {:#}", e)))?;
        PlannerOutput::parse(&response)
    }
}

/// Per category: the terminal review if it has one, else the latest step's
fn aggregate_review(steps: &[AutoStepReport], terminal: Option<&Review>) -> Option<Review> {
    let step_reviews = steps.iter().rev().filter_map(|step| step.review.as_ref());
    Review::merge_latest(terminal.into_iter().chain(step_reviews))
}
