//! Sanity rules: pass/fail predicates over captured output and the stage
//! directory.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

use super::pattern::{CapturedOutput, OutputSource, Pattern};

/// One sanity predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SanityRule {
    /// Passes if the pattern matches somewhere in the document
    AssertFound {
        pattern: Pattern,
        #[serde(default)]
        source: OutputSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
    /// Passes if the pattern matches nowhere in the document
    AssertNotFound {
        pattern: Pattern,
        #[serde(default)]
        source: OutputSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
    /// Passes if any of the listed files exists in the stage directory
    FileExists {
        any_of: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
}

impl SanityRule {
    /// Short human-readable form used in reports
    pub fn describe(&self) -> String {
        match self {
            SanityRule::AssertFound {
                pattern, source, ..
            } => format!("assert_found('{}', {})", pattern, source),
            SanityRule::AssertNotFound {
                pattern, source, ..
            } => format!("assert_not_found('{}', {})", pattern, source),
            SanityRule::FileExists { any_of, .. } => {
                format!("file_exists({})", any_of.join(" | "))
            }
        }
    }

    /// Evaluate against captured output. Returns the diagnostic on failure.
    pub fn evaluate(&self, output: &CapturedOutput) -> Result<(), String> {
        match self {
            SanityRule::AssertFound {
                pattern,
                source,
                msg,
            } => {
                if pattern.is_found(output.text(*source)) {
                    Ok(())
                } else {
                    Err(non_empty(msg).unwrap_or_else(|| {
                        format!("pattern '{}' not found in {}", pattern, source)
                    }))
                }
            }
            SanityRule::AssertNotFound {
                pattern,
                source,
                msg,
            } => {
                if pattern.is_found(output.text(*source)) {
                    Err(non_empty(msg)
                        .unwrap_or_else(|| format!("pattern '{}' found in {}", pattern, source)))
                } else {
                    Ok(())
                }
            }
            SanityRule::FileExists { any_of, msg } => {
                check_files(&output.stage_dir, any_of, msg.as_deref())
            }
        }
    }
}

fn non_empty(msg: &Option<String>) -> Option<String> {
    msg.as_ref().filter(|m| !m.trim().is_empty()).cloned()
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn check_files(stage_dir: &Path, candidates: &[String], msg: Option<&str>) -> Result<(), String> {
    for candidate in candidates {
        let relative = Path::new(candidate);
        if !is_contained(relative) {
            return Err(format!(
                "file check '{}' refers outside the stage directory",
                candidate
            ));
        }
        if stage_dir.join(relative).exists() {
            return Ok(());
        }
    }
    let names = candidates
        .iter()
        .map(|c| format!("'{}'", c))
        .collect::<Vec<_>>()
        .join(", ");
    let detail = format!("none of {} exist in {}", names, stage_dir.display());
    Err(match msg.filter(|m| !m.trim().is_empty()) {
        Some(m) => format!("{} ({})", m, detail),
        None => detail,
    })
}

/// Result of one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of all rules of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanityOutcome {
    pub passed: bool,
    /// Diagnostic of the first failing rule, in declared order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_failure: Option<String>,
    pub results: Vec<RuleResult>,
}

/// Evaluate every rule in declared order.
///
/// The outcome is the logical AND of all rules; every rule runs even after a
/// failure so the report shows the full picture. No rules means pass.
pub fn evaluate_sanity(rules: &[SanityRule], output: &CapturedOutput) -> SanityOutcome {
    let results: Vec<RuleResult> = rules
        .iter()
        .map(|rule| match rule.evaluate(output) {
            Ok(()) => RuleResult {
                rule: rule.describe(),
                passed: true,
                message: None,
            },
            Err(message) => RuleResult {
                rule: rule.describe(),
                passed: false,
                message: Some(message),
            },
        })
        .collect();

    let primary_failure = results
        .iter()
        .find(|r| !r.passed)
        .and_then(|r| r.message.clone());

    SanityOutcome {
        passed: primary_failure.is_none(),
        primary_failure,
        results,
    }
}
