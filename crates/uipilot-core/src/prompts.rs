//! Prompt assembly for the step generator and the planner.

use crate::report::AutoStepReport;
use crate::step::PreviousStep;

const GENERATION_RULES: &str = "# Rules
- Answer with a single fenced code block containing a Rhai script and nothing else.
- Only call the functions documented under Available API.
- Store values that later steps need in the `shared` object map (e.g. `shared.user = \"ada\";`).
- The value of the last expression is the step result.
- Do not repeat steps that already succeeded.";

const PLANNER_FORMAT: &str = "# Response format
Reply with these tagged blocks:
<SCREENDESCRIPTION>short label for the current screen</SCREENDESCRIPTION>
<THOUGHTS>your reasoning about progress toward the goal; when the goal is achieved include <SUMMARY>what was accomplished</SUMMARY></THOUGHTS>
<ACTION>one concrete UI action in plain language, or exactly `success` when the goal is achieved</ACTION>

Optionally review the screen, omitting any category that does not apply:
<UX><SUMMARY>...</SUMMARY><FINDINGS>one finding per line</FINDINGS><SCORE>0-10</SCORE></UX>
<ACCESSIBILITY><SUMMARY>...</SUMMARY><FINDINGS>...</FINDINGS><SCORE>0-10</SCORE></ACCESSIBILITY>
<INTERNATIONALIZATION><SUMMARY>...</SUMMARY><FINDINGS>...</FINDINGS><SCORE>0-10</SCORE></INTERNATIONALIZATION>";

/// Inputs to the main code generation prompt
pub struct GenerationContext<'a> {
    pub intent: &'a str,
    pub hierarchy: &'a str,
    pub image_attached: bool,
    pub history: &'a [PreviousStep],
    pub api_documentation: &'a str,
    pub extra_context: Option<&'a str>,
}

pub fn generation_prompt(ctx: &GenerationContext<'_>) -> String {
    let mut prompt = String::from(
        "You write test automation steps. Turn the intent below into code that performs it on the current screen.\n\n",
    );
    prompt.push_str(&format!("# Available API\n{}\n\n", ctx.api_documentation));
    prompt.push_str(GENERATION_RULES);
    prompt.push_str("\n\n");

    if !ctx.history.is_empty() {
        prompt.push_str("# Previous steps\n");
        prompt.push_str(&render_history(ctx.history));
        prompt.push('\n');
    }

    prompt.push_str(&format!("# Current view hierarchy\n{}\n\n", ctx.hierarchy));
    if ctx.image_attached {
        prompt.push_str("A screenshot of the current screen is attached.\n\n");
    }

    if let Some(extra) = ctx.extra_context {
        prompt.push_str(&format!("# Analysis\n{}\n\n", extra));
    }

    prompt.push_str(&format!("# Intent\n{}\n", ctx.intent));
    prompt
}

pub fn view_analysis_prompt(intent: &str, hierarchy: &str) -> String {
    format!(
        "Analyze this view hierarchy. List the elements relevant to the intent \
         with their identifiers, visible text and state. Be brief.\n\n\
         # Intent\n{}\n\n# View hierarchy\n{}\n",
        intent, hierarchy
    )
}

pub fn api_search_prompt(intent: &str, analysis: &str, api_documentation: &str) -> String {
    format!(
        "Pick the API functions needed to perform the intent on the analyzed screen. \
         Name each function and show how it would be called. Be brief.\n\n\
         # Intent\n{}\n\n# Screen analysis\n{}\n\n# Available API\n{}\n",
        intent, analysis, api_documentation
    )
}

/// Inputs to one planner iteration
pub struct PlannerContext<'a> {
    pub goal: &'a str,
    pub hierarchy: &'a str,
    pub image_attached: bool,
    pub steps: &'a [AutoStepReport],
    pub api_documentation: &'a str,
}

pub fn planner_prompt(ctx: &PlannerContext<'_>) -> String {
    let mut prompt = String::from(
        "You are testing an application. Decide the single next action that moves toward the goal, \
         and review what you see.\n\n",
    );
    prompt.push_str(&format!("# Goal\n{}\n\n", ctx.goal));
    prompt.push_str(&format!(
        "# What the executor can do\n{}\n\n",
        ctx.api_documentation
    ));

    if !ctx.steps.is_empty() {
        prompt.push_str("# Steps so far\n");
        for (index, step) in ctx.steps.iter().enumerate() {
            prompt.push_str(&format!(
                "{}. [{}] {}\n",
                index + 1,
                step.screen_label,
                step.plan.action
            ));
            if let Some(review) = &step.review {
                for (category, section) in review.sections() {
                    prompt.push_str(&format!("   {}: {}\n", category, section.summary));
                }
            }
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!("# Current view hierarchy\n{}\n\n", ctx.hierarchy));
    if ctx.image_attached {
        prompt.push_str("A screenshot of the current screen is attached.\n\n");
    }
    prompt.push_str(PLANNER_FORMAT);
    prompt.push('\n');
    prompt
}

fn render_history(history: &[PreviousStep]) -> String {
    history
        .iter()
        .enumerate()
        .map(|(index, step)| {
            format!(
                "{}. {}\n```\n{}\n```\nResult: {}\n",
                index + 1,
                step.intent,
                step.code,
                step.result
            )
        })
        .collect()
}
