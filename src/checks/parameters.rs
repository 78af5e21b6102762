//! Parameter sweeps: value notation, combination and substitution.
//!
//! A parameter is written either as a list (`[4, 8, 16]` or a YAML
//! sequence) or as an integer range `start:end[:step]`, end inclusive.
//! Several parameters combine as a Cartesian product or element-wise (zip).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

/// One value of a swept parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Integer(i64),
    Float(f64),
    String(String),
}

impl ParameterValue {
    /// Numeric view used by ratio metrics and resource fields
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Integer(i) => Some(*i as f64),
            ParameterValue::Float(f) => Some(*f),
            ParameterValue::String(s) => s.parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Integer(i) => Some(*i),
            ParameterValue::Float(_) => None,
            ParameterValue::String(s) => s.parse().ok(),
        }
    }

    fn parse_scalar(raw: &str) -> Self {
        let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'');
        if let Ok(i) = trimmed.parse::<i64>() {
            ParameterValue::Integer(i)
        } else if let Ok(f) = trimmed.parse::<f64>() {
            ParameterValue::Float(f)
        } else {
            ParameterValue::String(trimmed.to_string())
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Integer(i) => write!(f, "{}", i),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::String(s) => f.write_str(s),
        }
    }
}

/// A parameter as written in a suite file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterSpec {
    List(Vec<ParameterValue>),
    Notation(String),
}

impl ParameterSpec {
    pub fn values(&self) -> Result<Vec<ParameterValue>, String> {
        match self {
            ParameterSpec::List(values) if values.is_empty() => {
                Err("parameter list is empty".to_string())
            }
            ParameterSpec::List(values) => Ok(values.clone()),
            ParameterSpec::Notation(text) => parse_parameter_value(text),
        }
    }
}

/// How several parameters are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterMode {
    #[default]
    Product,
    Zip,
}

/// One assignment of every swept parameter
pub type Combination = BTreeMap<String, ParameterValue>;

/// Parse `1:5`, `0:10:2`, `[a, b, c]` or a single scalar
pub fn parse_parameter_value(text: &str) -> Result<Vec<ParameterValue>, String> {
    let text = text.trim();
    if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        let values: Vec<ParameterValue> = inner
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(ParameterValue::parse_scalar)
            .collect();
        if values.is_empty() {
            return Err(format!("empty parameter list '{}'", text));
        }
        return Ok(values);
    }

    let parts: Vec<&str> = text.split(':').collect();
    if (parts.len() == 2 || parts.len() == 3) && parts.iter().all(|p| p.trim().parse::<i64>().is_ok())
    {
        let nums: Vec<i64> = parts.iter().filter_map(|p| p.trim().parse().ok()).collect();
        let (start, end) = (nums[0], nums[1]);
        let step = nums.get(2).copied().unwrap_or(1);
        if step <= 0 {
            return Err(format!("range step must be positive in '{}'", text));
        }
        if end < start {
            return Err(format!("range end is before start in '{}'", text));
        }
        return Ok((start..=end)
            .step_by(step as usize)
            .map(ParameterValue::Integer)
            .collect());
    }

    if text.is_empty() {
        return Err("empty parameter value".to_string());
    }
    Ok(vec![ParameterValue::parse_scalar(text)])
}

/// Every combination of every parameter, in name order
pub fn cartesian_product(params: &BTreeMap<String, Vec<ParameterValue>>) -> Vec<Combination> {
    let mut combos: Vec<Combination> = vec![Combination::new()];
    for (name, values) in params {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.insert(name.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

/// Element-wise combination; every parameter must have the same length
pub fn zip_parameters(
    params: &BTreeMap<String, Vec<ParameterValue>>,
) -> Result<Vec<Combination>, String> {
    let mut lengths = params.values().map(Vec::len);
    let Some(len) = lengths.next() else {
        return Ok(vec![Combination::new()]);
    };
    if lengths.any(|l| l != len) {
        let sizes = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.len()))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(format!("zip mode requires equal lengths ({})", sizes));
    }
    Ok((0..len)
        .map(|i| {
            params
                .iter()
                .map(|(name, values)| (name.clone(), values[i].clone()))
                .collect()
        })
        .collect())
}

/// Expand parameter specs into combinations
pub fn expand_parameters(
    specs: &BTreeMap<String, ParameterSpec>,
    mode: ParameterMode,
) -> Result<Vec<Combination>, String> {
    let mut parsed = BTreeMap::new();
    for (name, spec) in specs {
        let values = spec
            .values()
            .map_err(|e| format!("parameter '{}': {}", name, e))?;
        parsed.insert(name.clone(), values);
    }
    match mode {
        ParameterMode::Product => Ok(cartesian_product(&parsed)),
        ParameterMode::Zip => zip_parameters(&parsed),
    }
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").expect("static regex")
});

fn format_value(value: &ParameterValue, spec: &str) -> String {
    // {n:03d}
    if let Some(width) = spec.strip_suffix('d')
        && let Some(n) = value.as_i64()
    {
        let zero_pad = width.starts_with('0');
        let width: usize = width.trim_start_matches('0').parse().unwrap_or(0);
        return if zero_pad {
            format!("{:0width$}", n, width = width)
        } else {
            format!("{:width$}", n, width = width)
        };
    }
    // {x:.2f}
    if let Some(precision) = spec.strip_prefix('.').and_then(|p| p.strip_suffix('f'))
        && let (Ok(precision), Some(v)) = (precision.parse::<usize>(), value.as_f64())
    {
        return format!("{:.precision$}", v, precision = precision);
    }
    value.to_string()
}

/// Replace `{name}` and `{name:fmt}` placeholders whose name is known.
/// Unknown placeholders are left untouched.
pub fn substitute_parameters(text: &str, values: &Combination) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures| {
            let name = &caps[1];
            match values.get(name) {
                Some(value) => format_value(value, caps.get(2).map_or("", |m| m.as_str())),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
