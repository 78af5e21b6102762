//! A session on a PBS partition, with qsub/qstat/qdel replaced by scripts
//! that run the job synchronously.
//!
//! The scheduler commands are chosen through process-wide environment
//! variables, so this file holds a single test.

#![cfg(unix)]

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;

use common::{plan_for, site_with_scheduler};
use hpc_regress::config::SchedulerKind;
use hpc_regress::pipeline::Orchestrator;

fn write_executable(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

fn install_fake_pbs(dir: &Path) {
    let d = dir.display();
    write_executable(
        &dir.join("qsub"),
        &format!(
            r#"#!/bin/bash
script="$1"
out=$(sed -n 's/^#PBS -o //p' "$script")
err=$(sed -n 's/^#PBS -e //p' "$script")
cp "$script" "{d}/submitted.sh"
bash "$script" >"$out" 2>"$err"
echo $? > "{d}/exit_status"
echo "4242.casper-pbs"
"#
        ),
    );
    write_executable(
        &dir.join("qstat"),
        &format!(
            r#"#!/bin/bash
echo "Job Id: $2"
echo "    job_state = F"
echo "    Exit_status = $(cat {d}/exit_status)"
"#
        ),
    );
    write_executable(&dir.join("qdel"), "#!/bin/bash\nexit 0\n");
    unsafe {
        std::env::set_var("HPC_REGRESS_FAKE_QSUB", dir.join("qsub"));
        std::env::set_var("HPC_REGRESS_FAKE_QSTAT", dir.join("qstat"));
        std::env::set_var("HPC_REGRESS_FAKE_QDEL", dir.join("qdel"));
    }
}

#[test]
fn test_stream_like_check_through_pbs() {
    let tmp = TempDir::new().unwrap();
    let fake = tmp.path().join("fake-pbs");
    fs::create_dir_all(&fake).unwrap();
    install_fake_pbs(&fake);

    let mut config = site_with_scheduler("fakepbs", SchedulerKind::Pbs);
    config.systems[0].partitions[0].access =
        vec!["-A SCSG0001".to_string(), "-q casper".to_string()];
    let plan = plan_for(
        &config,
        r#"
name: stream
checks:
  - name: STREAMQuickTest
    valid_systems: ['fakepbs:default']
    valid_prog_environs: [builtin]
    env_vars:
      OMP_NUM_THREADS: '4'
    run:
      executable: 'echo "Copy: $((3000 * OMP_NUM_THREADS)).5"; echo Solution Validates: avg error less than 1e-13'
      num_tasks: 4
      num_tasks_per_node: 4
      time_limit: 10m
      job_options: ['-Wblock=true']
      poll_interval: 0.05
    sanity:
      - {kind: assert_found, pattern: 'Solution Validates:'}
    performance:
      - {name: copy_bandwidth, unit: MB/s, kind: extract, pattern: 'Copy:\s+(\S+)'}
"#,
        &tmp.path().join("stage"),
    );

    let report = Orchestrator::new(plan, config.runner.clone()).run().unwrap();
    let stream = report
        .get("STREAMQuickTest @fakepbs:default+builtin")
        .unwrap();
    assert!(stream.passed(), "{:?}", stream.failure);
    assert_eq!(stream.job_id.as_deref(), Some("4242.casper-pbs"));
    assert_eq!(stream.exit_code, Some(0));
    assert_eq!(stream.metrics[0].value, Some(12000.5));

    let submitted = fs::read_to_string(fake.join("submitted.sh")).unwrap();
    assert!(submitted.contains("#PBS -l select=1:mpiprocs=4:ncpus=4\n"));
    assert!(submitted.contains("#PBS -l walltime=00:10:00\n"));
    assert!(submitted.contains("#PBS -A SCSG0001\n"));
    assert!(submitted.contains("#PBS -q casper\n"));
    assert!(submitted.contains("#PBS -Wblock=true\n"));
    assert!(submitted.contains("export OMP_NUM_THREADS="));
}
