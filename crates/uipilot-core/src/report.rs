//! Autopilot reports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One review category (UX, accessibility, internationalization)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSection {
    pub summary: String,
    pub findings: Vec<String>,
    pub score: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Review {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ux: Option<ReviewSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a11y: Option<ReviewSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i18n: Option<ReviewSection>,
}

impl Review {
    pub fn is_empty(&self) -> bool {
        self.ux.is_none() && self.a11y.is_none() && self.i18n.is_none()
    }

    /// Present sections with their display names
    pub fn sections(&self) -> Vec<(&'static str, &ReviewSection)> {
        [
            ("UX", self.ux.as_ref()),
            ("Accessibility", self.a11y.as_ref()),
            ("Internationalization", self.i18n.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, section)| section.map(|s| (name, s)))
        .collect()
    }

    /// Per category, the first review that has it
    pub fn merge_latest<'a>(reviews: impl IntoIterator<Item = &'a Review>) -> Option<Review> {
        let mut merged = Review::default();
        for review in reviews {
            if merged.ux.is_none() {
                merged.ux = review.ux.clone();
            }
            if merged.a11y.is_none() {
                merged.a11y = review.a11y.clone();
            }
            if merged.i18n.is_none() {
                merged.i18n = review.i18n.clone();
            }
        }
        (!merged.is_empty()).then_some(merged)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub thoughts: String,
    pub action: String,
}

/// One planner iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoStepReport {
    pub screen_label: String,
    pub plan: Plan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<Review>,
    pub goal_achieved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Code the delegated step ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Outcome of an autopilot run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoReport {
    pub goal: String,
    pub steps: Vec<AutoStepReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<Review>,
    pub goal_achieved: bool,
}

impl AutoReport {
    pub fn to_markdown(&self) -> String {
        let mut md = format!("# Autopilot report\n\n**Goal:** {}\n\n", self.goal);
        let status = if self.goal_achieved {
            "achieved"
        } else {
            "not achieved (step budget exhausted)"
        };
        md.push_str(&format!("**Status:** {}\n\n", status));

        if let Some(summary) = &self.summary {
            md.push_str(&format!("## Summary\n\n{}\n\n", summary));
        }

        md.push_str("## Steps\n\n");
        if self.steps.is_empty() {
            md.push_str("_No steps were executed._\n\n");
        }
        for (index, step) in self.steps.iter().enumerate() {
            md.push_str(&format!("### {}. {}\n\n", index + 1, step.screen_label));
            md.push_str(&format!("- **Thoughts:** {}\n", step.plan.thoughts));
            md.push_str(&format!("- **Action:** {}\n", step.plan.action));
            if let Some(code) = &step.code {
                md.push_str(&format!("- **Code:** `{}`\n", code.replace('\n', " ")));
            }
            if let Some(review) = &step.review {
                for (name, section) in review.sections() {
                    md.push_str(&format!("- **{}:** {}\n", name, score_label(section)));
                }
            }
            md.push('\n');
        }

        if let Some(review) = &self.review {
            md.push_str("## Review\n\n");
            for (name, section) in review.sections() {
                md.push_str(&format!("### {} ({})\n\n{}\n\n", name, score_label(section), section.summary));
                for finding in &section.findings {
                    md.push_str(&format!("- {}\n", finding));
                }
                if !section.findings.is_empty() {
                    md.push('\n');
                }
            }
        }

        md
    }
}

fn score_label(section: &ReviewSection) -> String {
    match section.score {
        Some(score) => format!("{}/10", score),
        None => "unscored".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(summary: &str, score: u32) -> ReviewSection {
        ReviewSection {
            summary: summary.to_string(),
            findings: vec!["Button label truncated".to_string()],
            score: Some(score),
        }
    }

    #[test]
    fn test_merge_latest_takes_first_per_category() {
        let newest = Review {
            ux: Some(section("new ux", 9)),
            ..Review::default()
        };
        let older = Review {
            ux: Some(section("old ux", 3)),
            a11y: Some(section("old a11y", 5)),
            i18n: None,
        };

        let merged = Review::merge_latest([&newest, &older]).unwrap();
        assert_eq!(merged.ux.unwrap().summary, "new ux");
        assert_eq!(merged.a11y.unwrap().summary, "old a11y");
        assert!(merged.i18n.is_none());
        assert!(Review::merge_latest([&Review::default()]).is_none());
    }

    #[test]
    fn test_markdown_lists_steps_and_review() {
        let report = AutoReport {
            goal: "Log in".to_string(),
            steps: vec![AutoStepReport {
                screen_label: "Login screen".to_string(),
                plan: Plan {
                    thoughts: "Need to tap login".to_string(),
                    action: "Tap login".to_string(),
                },
                review: None,
                goal_achieved: false,
                summary: None,
                code: Some("tap(\"#login\")".to_string()),
                result: None,
            }],
            summary: Some("Logged in".to_string()),
            review: Some(Review {
                ux: Some(section("Clean", 8)),
                ..Review::default()
            }),
            goal_achieved: true,
        };

        let md = report.to_markdown();
        assert!(md.contains("**Goal:** Log in"));
        assert!(md.contains("### 1. Login screen"));
        assert!(md.contains("### UX (8/10)"));
        assert!(md.contains("- Button label truncated"));
        assert!(md.contains("## Summary\n\nLogged in"));
    }

    #[test]
    fn test_json_omits_absent_fields() {
        let report = AutoReport {
            goal: "g".to_string(),
            steps: Vec::new(),
            summary: None,
            review: None,
            goal_achieved: false,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("summary").is_none());
        assert_eq!(json["goal_achieved"], false);
    }
}
