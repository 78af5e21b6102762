//! Output validation: sanity rules and performance extraction.
//!
//! Everything here is a pure function of the captured output (plus the
//! stage directory for file checks), so evaluating the same artifacts twice
//! gives the same answer. `hpc-regress evaluate` relies on that to re-check a
//! finished stage offline.

pub mod pattern;
pub mod perf;
pub mod sanity;

pub use pattern::{CaptureGroup, CapturedOutput, OutputSource, Pattern};
pub use perf::{
    Classification, MetricSource, MetricValue, Operand, PerformanceRule, Reference,
    ReferenceTable, extract_metrics, extract_single, lookup_reference,
};
pub use sanity::{RuleResult, SanityOutcome, SanityRule, evaluate_sanity};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::PipelineError;

/// Sanity and performance results of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub sanity: SanityOutcome,
    pub metrics: Vec<MetricValue>,
}

impl Evaluation {
    /// The error that decides the instance's outcome, if any.
    ///
    /// Sanity wins over extraction, which wins over reference bounds.
    pub fn failure(&self) -> Option<PipelineError> {
        if !self.sanity.passed {
            let reason = self
                .sanity
                .primary_failure
                .clone()
                .unwrap_or_else(|| "sanity check failed".to_string());
            return Some(PipelineError::Sanity(reason));
        }
        if let Some(metric) = self.metrics.iter().find(|m| m.required && m.value.is_none()) {
            return Some(PipelineError::Extraction {
                metric: metric.name.clone(),
                reason: metric.error.clone().unwrap_or_default(),
            });
        }
        let out_of_bounds: Vec<String> = self
            .metrics
            .iter()
            .filter(|m| m.is_out_of_bounds())
            .map(|m| {
                format!(
                    "{}={} {} ({})",
                    m.name,
                    m.value.unwrap_or_default(),
                    m.unit,
                    m.classification
                        .map(|c| c.to_string())
                        .unwrap_or_default()
                )
            })
            .collect();
        if !out_of_bounds.is_empty() {
            return Some(PipelineError::Performance(out_of_bounds.join(", ")));
        }
        None
    }
}

/// Run sanity rules, then performance rules if sanity passed
pub fn evaluate_output(
    sanity_rules: &[SanityRule],
    performance_rules: &[PerformanceRule],
    output: &CapturedOutput,
    parameters: &BTreeMap<String, f64>,
    references: &BTreeMap<String, Reference>,
) -> Evaluation {
    let sanity = evaluate_sanity(sanity_rules, output);
    let metrics = if sanity.passed {
        extract_metrics(performance_rules, output, parameters, references)
    } else {
        Vec::new()
    };
    Evaluation { sanity, metrics }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;

    fn rules() -> (Vec<SanityRule>, Vec<PerformanceRule>) {
        let sanity: Vec<SanityRule> = serde_yaml::from_str(
            r#"
- kind: assert_found
  pattern: cm1 completed successfully
"#,
        )
        .unwrap();
        let perf: Vec<PerformanceRule> = serde_yaml::from_str(
            r#"
- name: total_runtime
  unit: s
  required: true
  kind: extract
  pattern: 'Total time:\s+(\S+)\s+s'
"#,
        )
        .unwrap();
        (sanity, perf)
    }

    #[test]
    fn test_sanity_failure_skips_metrics() {
        let (sanity, perf) = rules();
        let output = CapturedOutput::new(".").with_stdout("Total time: 10.0 s\n");
        let eval = evaluate_output(&sanity, &perf, &output, &BTreeMap::new(), &BTreeMap::new());
        assert!(eval.metrics.is_empty());
        assert_eq!(eval.failure().unwrap().kind(), FailureKind::SanityFailure);
    }

    #[test]
    fn test_required_metric_missing() {
        let (sanity, perf) = rules();
        let output = CapturedOutput::new(".").with_stdout("cm1 completed successfully\n");
        let eval = evaluate_output(&sanity, &perf, &output, &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(eval.failure().unwrap().kind(), FailureKind::ExtractionError);
    }

    #[test]
    fn test_reference_violation() {
        let (sanity, perf) = rules();
        let refs = BTreeMap::from([(
            "total_runtime".to_string(),
            Reference::new(1800.0, None, Some(0.15), "s"),
        )]);
        let slow = CapturedOutput::new(".")
            .with_stdout("cm1 completed successfully\nTotal time: 2200.0 s\n");
        let eval = evaluate_output(&sanity, &perf, &slow, &BTreeMap::new(), &refs);
        assert_eq!(
            eval.metrics[0].classification,
            Some(Classification::AboveUpperBound)
        );
        assert_eq!(eval.failure().unwrap().kind(), FailureKind::PerformanceFailure);

        let fast = CapturedOutput::new(".")
            .with_stdout("cm1 completed successfully\nTotal time: 1800.0 s\n");
        let eval = evaluate_output(&sanity, &perf, &fast, &BTreeMap::new(), &refs);
        assert!(eval.failure().is_none());
    }
}
