//! The suites shipped under `suites/` load and resolve on Casper

mod common;

use rstest::{fixture, rstest};
use std::collections::BTreeMap;

use common::shipped_suites;
use hpc_regress::checks::{CheckFilter, CheckRegistry};
use hpc_regress::config::RegressConfig;
use hpc_regress::pipeline::{ExecutionPlan, TestInstance};

#[fixture]
fn registry() -> CheckRegistry {
    CheckRegistry::load(&[shipped_suites()], true).unwrap()
}

fn casper_plan(registry: &CheckRegistry) -> ExecutionPlan {
    let config = RegressConfig::builtin();
    let system = config.get_system("casper").unwrap();
    ExecutionPlan::build(&config, system, registry.definitions(), None).unwrap()
}

fn instance<'a>(plan: &'a ExecutionPlan, name: &str) -> &'a TestInstance {
    plan.get(name)
        .unwrap_or_else(|| panic!("no instance named '{}'", name))
}

#[rstest]
fn test_all_suites_load(registry: CheckRegistry) {
    let suites: Vec<&str> = registry
        .suites()
        .iter()
        .map(|s| s.spec.name.as_str())
        .collect();
    for expected in ["cm1", "cm1_simple", "fasteddy", "helloworld", "mg2", "stream"] {
        assert!(suites.contains(&expected), "missing suite {}", expected);
    }
    // Mg2SWStackTest is shipped disabled
    assert!(registry.get("Mg2SWStackTest").is_none());
    assert!(registry.get("Mg2ProdTest").is_some());
}

#[rstest]
fn test_instances_on_casper(registry: CheckRegistry) {
    let plan = casper_plan(&registry);
    assert!(plan.rejected.is_empty(), "{:?}", plan.rejected);
    assert!(plan.unresolved.is_empty(), "{:?}", plan.unresolved);

    let mut per_check: BTreeMap<&str, usize> = BTreeMap::new();
    for instance in &plan.instances {
        *per_check.entry(instance.check.as_str()).or_default() += 1;
    }
    assert_eq!(per_check["HelloTest"], 9);
    assert_eq!(per_check["STREAMCompileTest"], 1);
    assert_eq!(per_check["CM1FullTest"], 2);
    assert_eq!(per_check["CM1SupercellBenchmark"], 10);
    assert_eq!(per_check["CM1WeakScalingTest"], 10);
    assert_eq!(per_check["CM1StrongScalingTest"], 12);
    assert_eq!(per_check["Mg2ProdScalingTest"], 6);
    assert_eq!(per_check["FastEddyFullTest"], 1);
    assert_eq!(per_check["FastEddySWStackTest"], 3);
    assert_eq!(plan.len(), 67);
}

#[rstest]
fn test_stream_quick_waits_for_compile(registry: CheckRegistry) {
    let mut plan = casper_plan(&registry);
    let quick = "STREAMQuickTest @casper:compute-serial+gnu-serial";
    let deps = plan.graph.dependencies_of(quick).unwrap();
    assert!(deps.contains("STREAMCompileTest @casper:compute-serial+gnu-serial"));

    let run = instance(&plan, quick).run.clone().unwrap();
    assert_eq!(run.job_options, vec!["-Wblock=true"]);
    assert_eq!(run.poll_interval, Some(30.0));
    assert_eq!(run.prerun_cmds[0], "ls -lh");
    assert!(run.prerun_cmds[1].contains("${dependencies.STREAMCompileTest.stagedir}"));

    let levels = plan.levels().unwrap();
    let level_of = |name: &str| levels.iter().position(|l| l.iter().any(|n| n == name));
    assert!(
        level_of("STREAMCompileTest @casper:compute-serial+gnu-serial").unwrap()
            < level_of(quick).unwrap()
    );
}

#[rstest]
#[case(4, 7200)]
#[case(8, 7200)]
#[case(16, 3600)]
#[case(32, 3600)]
#[case(64, 1800)]
fn test_supercell_time_limit_steps(
    registry: CheckRegistry,
    #[case] tasks: u32,
    #[case] expected_secs: u64,
) {
    let plan = casper_plan(&registry);
    let name = format!(
        "CM1SupercellBenchmark %num_tasks={} @casper:compute+intel",
        tasks
    );
    let supercell = instance(&plan, &name);
    assert_eq!(supercell.run.as_ref().unwrap().num_tasks, tasks);
    assert_eq!(supercell.time_limit_secs, Some(expected_secs));
    assert_eq!(supercell.references["total_runtime"].value, 1800.0);
    assert_eq!(supercell.references["throughput"].lower, Some(-0.15));
}

#[rstest]
fn test_mg2_build_options_follow_tasks(registry: CheckRegistry) {
    let plan = casper_plan(&registry);
    let scaling = instance(&plan, "Mg2ProdScalingTest %num_tasks=8 @casper:compute+gnu");
    let build = scaling.build.as_ref().unwrap();
    assert_eq!(build.flags.options, vec!["pcols=8", "COMPILER=gnu"]);
    assert!(build.flags.fflags.iter().any(|f| f == "-D_MPI"));
    assert!(scaling.modules.iter().any(|m| m == "mkl"));

    let compile = instance(&plan, "Mg2CompileTest @casper:compute+intel");
    assert!(compile.is_compile_only());
    let build = compile.build.as_ref().unwrap();
    assert_eq!(build.flags.options, vec!["pcols=16", "COMPILER=intel"]);
    assert!(compile.performance.is_empty());
}

#[rstest]
fn test_fasteddy_targets_gpu_mpi(registry: CheckRegistry) {
    let plan = casper_plan(&registry);
    let fasteddy = instance(&plan, "FastEddyFullTest @casper:gpu-mpi+cuda");
    let run = fasteddy.run.as_ref().unwrap();
    assert_eq!(run.executable, "set_gpu_rank ./FastEddy");
    assert_eq!(run.num_gpus_per_node, Some(4));
    assert_eq!(fasteddy.time_limit_secs, Some(1200));
    assert_eq!(fasteddy.performance.len(), 2);
}

#[rstest]
fn test_quick_tag_selection(registry: CheckRegistry) {
    let filter = CheckFilter::new(&["quick".to_string()], &[], &[]).unwrap();
    let mut names: Vec<&str> = registry
        .select(&filter)
        .iter()
        .map(|d| d.name.as_str())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "CM1CompileTest",
            "CM1QuickTest",
            "HelloTest",
            "Mg2CompileTest",
            "STREAMCompileTest",
            "STREAMQuickTest",
        ]
    );
}

#[rstest]
fn test_exclude_pattern(registry: CheckRegistry) {
    let filter = CheckFilter::new(&[], &["^CM1".to_string()], &["Scaling".to_string()]).unwrap();
    let selected = registry.select(&filter);
    assert!(selected.iter().all(|d| d.name.starts_with("CM1")));
    assert!(selected.iter().all(|d| !d.name.contains("Scaling")));
    assert_eq!(selected.len(), 6);
}
