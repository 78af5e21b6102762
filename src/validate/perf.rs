//! Performance rules, references and classification

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::pattern::{CaptureGroup, CapturedOutput, OutputSource, Pattern};

/// One named metric and how to obtain it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRule {
    pub name: String,
    pub unit: String,
    /// A required metric that cannot be extracted fails the instance
    #[serde(default)]
    pub required: bool,
    #[serde(flatten)]
    pub source: MetricSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricSource {
    /// First match of a pattern, converted to a number
    Extract {
        pattern: Pattern,
        #[serde(default)]
        group: CaptureGroup,
        #[serde(default)]
        source: OutputSource,
        /// Used only when the pattern matches nothing
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<f64>,
    },
    /// `numerator / denominator * scale`
    Ratio {
        numerator: Operand,
        denominator: Operand,
        #[serde(default = "default_scale")]
        scale: f64,
    },
}

fn default_scale() -> f64 {
    1.0
}

/// An input of a derived metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Constant(f64),
    Metric { metric: String },
    Parameter { parameter: String },
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Constant(v) => write!(f, "{}", v),
            Operand::Metric { metric } => write!(f, "metric '{}'", metric),
            Operand::Parameter { parameter } => write!(f, "parameter '{}'", parameter),
        }
    }
}

/// Expected value with relative bounds, e.g. `[1800, null, 0.15, "s"]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ReferenceRepr")]
pub struct Reference {
    pub value: f64,
    /// Lowest allowed relative deviation (a fraction, normally <= 0)
    pub lower: Option<f64>,
    /// Highest allowed relative deviation (a fraction, normally >= 0)
    pub upper: Option<f64>,
    pub unit: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReferenceRepr {
    Tuple(f64, Option<f64>, Option<f64>, Option<String>),
    Map {
        value: f64,
        #[serde(default)]
        lower: Option<f64>,
        #[serde(default)]
        upper: Option<f64>,
        #[serde(default)]
        unit: Option<String>,
    },
}

impl From<ReferenceRepr> for Reference {
    fn from(repr: ReferenceRepr) -> Self {
        match repr {
            ReferenceRepr::Tuple(value, lower, upper, unit)
            | ReferenceRepr::Map {
                value,
                lower,
                upper,
                unit,
            } => Reference {
                value,
                lower,
                upper,
                unit,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    WithinTolerance,
    BelowLowerBound,
    AboveUpperBound,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::WithinTolerance => "within tolerance",
            Classification::BelowLowerBound => "below lower bound",
            Classification::AboveUpperBound => "above upper bound",
        };
        f.write_str(s)
    }
}

impl Reference {
    pub fn new(value: f64, lower: Option<f64>, upper: Option<f64>, unit: &str) -> Self {
        Self {
            value,
            lower,
            upper,
            unit: Some(unit.to_string()),
        }
    }

    /// Relative deviation of `measured` from the reference value. A zero
    /// reference falls back to the absolute difference.
    pub fn deviation(&self, measured: f64) -> f64 {
        if self.value == 0.0 {
            measured
        } else {
            (measured - self.value) / self.value.abs()
        }
    }

    /// A bound of `None` is unbounded on that side. The sign of a bound is
    /// ignored: lower always limits downward, upper upward.
    pub fn classify(&self, measured: f64) -> Classification {
        let deviation = self.deviation(measured);
        if let Some(lower) = self.lower
            && deviation < -lower.abs()
        {
            return Classification::BelowLowerBound;
        }
        if let Some(upper) = self.upper
            && deviation > upper.abs()
        {
            return Classification::AboveUpperBound;
        }
        Classification::WithinTolerance
    }
}

/// References keyed by `system:partition` (or `system:*`, `*`), then by
/// metric name
pub type ReferenceTable = BTreeMap<String, BTreeMap<String, Reference>>;

/// Find the reference for a metric: exact `system:partition` first, then
/// `system:*`, then `*`
pub fn lookup_reference<'a>(
    table: &'a ReferenceTable,
    system: &str,
    partition: &str,
    metric: &str,
) -> Option<&'a Reference> {
    [
        format!("{}:{}", system, partition),
        format!("{}:*", system),
        "*".to_string(),
    ]
    .iter()
    .filter_map(|key| table.get(key))
    .find_map(|metrics| metrics.get(metric))
}

/// Extracted value of one metric plus its classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<Reference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl MetricValue {
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(
            self.classification,
            Some(Classification::BelowLowerBound | Classification::AboveUpperBound)
        )
    }
}

/// Pull the first match of `pattern` out of `text` as a number
pub fn extract_single(
    pattern: &Pattern,
    group: &CaptureGroup,
    text: &str,
    default: Option<f64>,
) -> Result<f64, String> {
    match pattern.first_capture(text, group)? {
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("captured '{}' is not a number", raw)),
        None => default.ok_or_else(|| format!("pattern '{}' did not match", pattern)),
    }
}

/// Evaluate all performance rules in declared order.
///
/// Rules are independent: a failed rule is recorded with its error and does
/// not stop the others. Ratio rules can refer to metrics declared earlier
/// and to numeric instance parameters.
pub fn extract_metrics(
    rules: &[PerformanceRule],
    output: &CapturedOutput,
    parameters: &BTreeMap<String, f64>,
    references: &BTreeMap<String, Reference>,
) -> Vec<MetricValue> {
    let mut known: BTreeMap<&str, f64> = BTreeMap::new();
    let mut values = Vec::with_capacity(rules.len());

    for rule in rules {
        let result = match &rule.source {
            MetricSource::Extract {
                pattern,
                group,
                source,
                default,
            } => extract_single(pattern, group, output.text(*source), *default),
            MetricSource::Ratio {
                numerator,
                denominator,
                scale,
            } => {
                let resolve = |op: &Operand| -> Result<f64, String> {
                    match op {
                        Operand::Constant(v) => Ok(*v),
                        Operand::Metric { metric } => known
                            .get(metric.as_str())
                            .copied()
                            .ok_or_else(|| format!("metric '{}' has no value", metric)),
                        Operand::Parameter { parameter } => parameters
                            .get(parameter)
                            .copied()
                            .ok_or_else(|| format!("parameter '{}' is not numeric or unset", parameter)),
                    }
                };
                let num = resolve(numerator);
                let den = resolve(denominator);
                match (num, den) {
                    (Ok(_), Ok(d)) if d == 0.0 => Err(format!("{} is zero", denominator)),
                    (Ok(n), Ok(d)) => Ok(n / d * scale),
                    (Err(e), _) | (_, Err(e)) => Err(e),
                }
            }
        };

        let reference = references.get(&rule.name).cloned();
        let value = match result {
            Ok(v) => {
                known.insert(rule.name.as_str(), v);
                MetricValue {
                    name: rule.name.clone(),
                    unit: rule.unit.clone(),
                    value: Some(v),
                    classification: reference.as_ref().map(|r| r.classify(v)),
                    reference,
                    error: None,
                    required: rule.required,
                }
            }
            Err(e) => MetricValue {
                name: rule.name.clone(),
                unit: rule.unit.clone(),
                value: None,
                reference,
                classification: None,
                error: Some(e),
                required: rule.required,
            },
        };
        values.push(value);
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(name: &str, unit: &str, pattern: &str) -> PerformanceRule {
        PerformanceRule {
            name: name.to_string(),
            unit: unit.to_string(),
            required: false,
            source: MetricSource::Extract {
                pattern: Pattern::new(pattern).unwrap(),
                group: CaptureGroup::default(),
                source: OutputSource::Stdout,
                default: None,
            },
        }
    }

    #[test]
    fn test_classify_upper_only() {
        let reference = Reference::new(1800.0, None, Some(0.15), "s");
        assert_eq!(reference.classify(1800.0), Classification::WithinTolerance);
        assert_eq!(reference.classify(2070.0), Classification::WithinTolerance);
        assert_eq!(reference.classify(2200.0), Classification::AboveUpperBound);
        assert_eq!(reference.classify(10.0), Classification::WithinTolerance);
    }

    #[test]
    fn test_classify_lower_only() {
        let reference = Reference::new(2.0, Some(-0.15), None, "timesteps/s");
        assert_eq!(reference.classify(1.5), Classification::BelowLowerBound);
        assert_eq!(reference.classify(1.8), Classification::WithinTolerance);
        assert_eq!(reference.classify(50.0), Classification::WithinTolerance);
    }

    #[test]
    fn test_reference_forms() {
        let tuple: Reference = serde_yaml::from_str("[1800, null, 0.15, s]").unwrap();
        assert_eq!(tuple, Reference::new(1800.0, None, Some(0.15), "s"));
        let map: Reference =
            serde_json::from_str(r#"{"value": 0.5, "upper": 0.15, "unit": "s"}"#).unwrap();
        assert_eq!(map, Reference::new(0.5, None, Some(0.15), "s"));
    }

    #[test]
    fn test_lookup_reference_fallback() {
        let mut table = ReferenceTable::new();
        table.insert(
            "casper:compute".to_string(),
            BTreeMap::from([("total_runtime".to_string(), Reference::new(1800.0, None, Some(0.15), "s"))]),
        );
        table.insert(
            "*".to_string(),
            BTreeMap::from([("total_runtime".to_string(), Reference::new(900.0, None, None, "s"))]),
        );
        let exact = lookup_reference(&table, "casper", "compute", "total_runtime").unwrap();
        assert_eq!(exact.value, 1800.0);
        let fallback = lookup_reference(&table, "casper", "gpu", "total_runtime").unwrap();
        assert_eq!(fallback.value, 900.0);
        assert!(lookup_reference(&table, "casper", "compute", "walltime").is_none());
    }

    #[test]
    fn test_extract_columns_per_sec() {
        let rules = vec![extract(
            "columns_per_second",
            "columns/s",
            r"Average columns per sec :\s+(\S+)",
        )];
        let output = CapturedOutput::new(".").with_stdout("Average columns per sec :   12345.6\n");
        let metrics = extract_metrics(&rules, &output, &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(metrics[0].value, Some(12345.6));
        assert_eq!(metrics[0].unit, "columns/s");
        assert!(metrics[0].classification.is_none());
    }

    #[test]
    fn test_extraction_failures_are_per_rule() {
        let mut with_default = extract("compile_time", "s", r"Elapsed.*:\s+(\S+)");
        if let MetricSource::Extract { default, source, .. } = &mut with_default.source {
            *default = Some(0.0);
            *source = OutputSource::BuildStdout;
        }
        let rules = vec![
            extract("total_time", "s", r"Total time:\s+(\S+)"),
            with_default,
            extract("copy", "MB/s", r"Copy:\s+(\S+)"),
        ];
        let output = CapturedOutput::new(".").with_stdout("Copy: oops\n");
        let metrics = extract_metrics(&rules, &output, &BTreeMap::new(), &BTreeMap::new());
        assert!(metrics[0].error.as_deref().unwrap().contains("did not match"));
        assert_eq!(metrics[1].value, Some(0.0));
        assert!(metrics[2].error.as_deref().unwrap().contains("not a number"));
    }

    #[test]
    fn test_ratio_metrics() {
        let rules = vec![
            extract("walltime", "s", r"Total time:\s+(\S+)\s+s"),
            PerformanceRule {
                name: "speedup".to_string(),
                unit: "x".to_string(),
                required: false,
                source: MetricSource::Ratio {
                    numerator: Operand::Constant(3600.0),
                    denominator: Operand::Metric {
                        metric: "walltime".to_string(),
                    },
                    scale: 1.0,
                },
            },
            PerformanceRule {
                name: "efficiency".to_string(),
                unit: "%".to_string(),
                required: false,
                source: MetricSource::Ratio {
                    numerator: Operand::Metric {
                        metric: "speedup".to_string(),
                    },
                    denominator: Operand::Parameter {
                        parameter: "num_tasks".to_string(),
                    },
                    scale: 400.0,
                },
            },
        ];
        let output = CapturedOutput::new(".").with_stdout("Total time: 1200.0 s\n");
        let params = BTreeMap::from([("num_tasks".to_string(), 16.0)]);
        let metrics = extract_metrics(&rules, &output, &params, &BTreeMap::new());
        assert_eq!(metrics[1].value, Some(3.0));
        assert_eq!(metrics[2].value, Some(75.0));
    }

    #[test]
    fn test_ratio_of_failed_metric() {
        let rules: Vec<PerformanceRule> = serde_yaml::from_str(
            r#"
- name: total_runtime
  unit: s
  kind: extract
  pattern: 'Total time:\s+(\S+)\s+s'
- name: throughput
  unit: timesteps/s
  kind: ratio
  numerator: {metric: total_steps}
  denominator: {metric: total_runtime}
"#,
        )
        .unwrap();
        let output = CapturedOutput::new(".").with_stdout("Total time: 10.0 s\n");
        let metrics = extract_metrics(&rules, &output, &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(metrics[0].value, Some(10.0));
        assert!(metrics[1].error.as_deref().unwrap().contains("total_steps"));
    }
}
