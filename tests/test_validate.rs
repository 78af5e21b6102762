//! Sanity and performance evaluation against captured application output

use rstest::rstest;
use std::collections::BTreeMap;
use std::fs;
use tempfile::TempDir;

use hpc_regress::FailureKind;
use hpc_regress::validate::{
    CapturedOutput, Classification, PerformanceRule, Reference, SanityRule, evaluate_output,
    evaluate_sanity, extract_metrics, lookup_reference,
};

fn sanity_rules(yaml: &str) -> Vec<SanityRule> {
    serde_yaml::from_str(yaml).unwrap()
}

fn perf_rules(yaml: &str) -> Vec<PerformanceRule> {
    serde_yaml::from_str(yaml).unwrap()
}

const CM1_STDOUT: &str = "\
 Writing restart file
 Total time steps: 3600
 Total time:   1800.0 s
 Time per time step:   0.5 s
 Maximum vertical velocity:  42.7
 cm1 completed successfully
";

// ============== Reference Classification ==============

#[rstest]
#[case(1800.0, Classification::WithinTolerance)]
#[case(2000.0, Classification::WithinTolerance)]
#[case(2200.0, Classification::AboveUpperBound)]
#[case(100.0, Classification::WithinTolerance)]
fn test_upper_bound_only(#[case] measured: f64, #[case] expected: Classification) {
    let reference = Reference::new(1800.0, None, Some(0.15), "s");
    assert_eq!(reference.classify(measured), expected);
}

#[rstest]
#[case(2.0, Classification::WithinTolerance)]
#[case(1.8, Classification::WithinTolerance)]
#[case(1.6, Classification::BelowLowerBound)]
#[case(10.0, Classification::WithinTolerance)]
fn test_lower_bound_only(#[case] measured: f64, #[case] expected: Classification) {
    let reference = Reference::new(2.0, Some(-0.15), None, "timesteps/s");
    assert_eq!(reference.classify(measured), expected);
}

#[rstest]
fn test_reference_lookup_order() {
    let table: BTreeMap<String, BTreeMap<String, Reference>> = serde_yaml::from_str(
        r#"
'casper:compute':
  total_runtime: [1800, null, 0.15, s]
'casper:*':
  total_runtime: [2400, null, 0.2, s]
  throughput: {value: 2.0, lower: -0.15}
'*':
  throughput: [1.0, -0.5, 0.5, timesteps/s]
"#,
    )
    .unwrap();
    let exact = lookup_reference(&table, "casper", "compute", "total_runtime").unwrap();
    assert_eq!(exact.value, 1800.0);
    let system = lookup_reference(&table, "casper", "gpu", "total_runtime").unwrap();
    assert_eq!(system.value, 2400.0);
    let through = lookup_reference(&table, "casper", "compute", "throughput").unwrap();
    assert_eq!(through.value, 2.0);
    assert_eq!(through.upper, None);
    let anywhere = lookup_reference(&table, "derecho", "cpu", "throughput").unwrap();
    assert_eq!(anywhere.unit.as_deref(), Some("timesteps/s"));
    assert!(lookup_reference(&table, "derecho", "cpu", "total_runtime").is_none());
}

// ============== Sanity ==============

#[rstest]
fn test_cm1_sanity_passes() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("cm1out_000001.nc"), b"CDF").unwrap();
    let rules = sanity_rules(
        r#"
- kind: assert_found
  pattern: 'cm1 completed successfully'
- kind: assert_found
  pattern: 'Maximum vertical velocity.*\d+'
- kind: file_exists
  any_of: [cm1out.nc, cm1out_000001.nc]
- kind: assert_not_found
  pattern: 'FATAL|ERROR'
  source: stderr
"#,
    );
    let output = CapturedOutput::new(tmp.path())
        .with_stdout(CM1_STDOUT)
        .with_stderr("warning: deprecated namelist entry\n");
    let outcome = evaluate_sanity(&rules, &output);
    assert!(outcome.passed, "{:?}", outcome);
    assert!(outcome.primary_failure.is_none());
}

#[rstest]
fn test_missing_file_names_every_candidate() {
    let tmp = TempDir::new().unwrap();
    let rules = sanity_rules(
        r#"
- kind: file_exists
  any_of: [cm1out_stats.nc, cm1out_s.nc]
"#,
    );
    let outcome = evaluate_sanity(&rules, &CapturedOutput::new(tmp.path()));
    assert!(!outcome.passed);
    let reason = outcome.primary_failure.unwrap();
    assert!(reason.contains("cm1out_stats.nc"), "{}", reason);
    assert!(reason.contains("cm1out_s.nc"), "{}", reason);
}

#[rstest]
fn test_error_on_stderr_fails() {
    let rules = sanity_rules(
        r#"
- kind: assert_not_found
  pattern: 'FATAL|ERROR'
  source: stderr
  msg: CM1 reported an error
"#,
    );
    let output = CapturedOutput::new(".")
        .with_stdout("ERROR appears only on stdout\n")
        .with_stderr("FATAL: namelist read failed\n");
    let outcome = evaluate_sanity(&rules, &output);
    assert!(!outcome.passed);
    assert_eq!(
        outcome.primary_failure.as_deref(),
        Some("CM1 reported an error")
    );
}

#[rstest]
fn test_file_rule_rejects_escaping_paths() {
    let tmp = TempDir::new().unwrap();
    let stage = tmp.path().join("stage");
    fs::create_dir_all(&stage).unwrap();
    fs::write(tmp.path().join("outside.txt"), "x").unwrap();
    let rules = sanity_rules(
        r#"
- kind: file_exists
  any_of: [../outside.txt]
"#,
    );
    assert!(!evaluate_sanity(&rules, &CapturedOutput::new(&stage)).passed);
}

// ============== Performance ==============

#[rstest]
fn test_mg2_columns_per_second() {
    let rules = perf_rules(
        r#"
- name: columns_per_second
  unit: columns/s
  kind: extract
  pattern: 'Average columns per sec :\s+(\S+)'
"#,
    );
    let output = CapturedOutput::new(".").with_stdout(
        "CESM2_MG2: PASSED verification\n Average columns per sec :   12345.6\n",
    );
    let metrics = extract_metrics(&rules, &output, &BTreeMap::new(), &BTreeMap::new());
    assert_eq!(metrics[0].value, Some(12345.6));
    assert_eq!(metrics[0].unit, "columns/s");
}

#[rstest]
fn test_derived_metrics_use_earlier_values_and_parameters() {
    let rules = perf_rules(
        r#"
- name: walltime
  unit: s
  kind: extract
  pattern: 'Total time:\s+(\S+)'
- name: speedup
  unit: x
  kind: ratio
  numerator: 3600
  denominator: {metric: walltime}
- name: efficiency
  unit: '%'
  kind: ratio
  numerator: {metric: speedup}
  denominator: {parameter: num_tasks}
  scale: 400
"#,
    );
    let output = CapturedOutput::new(".").with_stdout(" Total time:   450.0 s\n");
    let params = BTreeMap::from([("num_tasks".to_string(), 32.0)]);
    let metrics = extract_metrics(&rules, &output, &params, &BTreeMap::new());
    assert_eq!(metrics[1].value, Some(8.0));
    assert_eq!(metrics[2].value, Some(100.0));
}

#[rstest]
fn test_missing_metric_does_not_stop_others() {
    let rules = perf_rules(
        r#"
- name: compile_time
  unit: s
  kind: extract
  pattern: 'Elapsed.*:\s+(\S+)'
  source: build_stdout
  default: 0.0
- name: missing
  unit: s
  kind: extract
  pattern: 'never printed:\s+(\S+)'
- name: total_time
  unit: s
  kind: extract
  pattern: 'Total time:\s+(\S+)'
"#,
    );
    let output = CapturedOutput::new(".").with_stdout(CM1_STDOUT);
    let metrics = extract_metrics(&rules, &output, &BTreeMap::new(), &BTreeMap::new());
    assert_eq!(metrics[0].value, Some(0.0));
    assert!(metrics[1].value.is_none());
    assert!(metrics[1].error.is_some());
    assert_eq!(metrics[2].value, Some(1800.0));
}

// ============== Full Evaluation ==============

#[rstest]
#[case("1800.0", None)]
#[case("2200.0", Some(FailureKind::PerformanceFailure))]
fn test_evaluation_against_reference(
    #[case] total: &str,
    #[case] expected: Option<FailureKind>,
) {
    let sanity = sanity_rules("- {kind: assert_found, pattern: 'cm1 completed successfully'}");
    let perf = perf_rules(
        r#"
- name: total_runtime
  unit: s
  kind: extract
  pattern: 'Total time:\s+(\S+)'
"#,
    );
    let references = BTreeMap::from([(
        "total_runtime".to_string(),
        Reference::new(1800.0, None, Some(0.15), "s"),
    )]);
    let stdout = format!(" Total time: {} s\n cm1 completed successfully\n", total);
    let output = CapturedOutput::new(".").with_stdout(stdout);
    let evaluation = evaluate_output(&sanity, &perf, &output, &BTreeMap::new(), &references);
    assert_eq!(evaluation.failure().map(|e| e.kind()), expected);
    assert!(evaluation.sanity.passed);
}

#[rstest]
fn test_required_metric_missing_is_extraction_error() {
    let sanity = sanity_rules("- {kind: assert_found, pattern: 'Solution Validates:'}");
    let perf = perf_rules(
        r#"
- name: copy_bandwidth
  unit: MB/s
  required: true
  kind: extract
  pattern: 'Copy:\s+(\S+)'
"#,
    );
    let output = CapturedOutput::new(".").with_stdout("Solution Validates: avg error less than 1e-13\n");
    let evaluation = evaluate_output(&sanity, &perf, &output, &BTreeMap::new(), &BTreeMap::new());
    assert_eq!(
        evaluation.failure().map(|e| e.kind()),
        Some(FailureKind::ExtractionError)
    );
}
