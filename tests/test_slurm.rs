//! A session on a Slurm partition whose job is killed at its time limit.
//!
//! `sbatch` runs the script in place, `squeue` no longer lists the job and
//! `sacct` reports it as TIMEOUT. The commands are chosen through
//! process-wide environment variables, so this file holds a single test.

#![cfg(unix)]

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;

use common::{plan_for, site_with_scheduler};
use hpc_regress::FailureKind;
use hpc_regress::config::SchedulerKind;
use hpc_regress::pipeline::Orchestrator;

fn write_executable(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

fn install_fake_slurm(dir: &Path) {
    write_executable(
        &dir.join("sbatch"),
        r#"#!/bin/bash
script="$1"
out=$(sed -n 's/^#SBATCH --output=//p' "$script")
err=$(sed -n 's/^#SBATCH --error=//p' "$script")
bash "$script" >"$out" 2>"$err"
echo "Submitted batch job 777"
"#,
    );
    write_executable(&dir.join("squeue"), "#!/bin/bash\nexit 0\n");
    write_executable(&dir.join("sacct"), "#!/bin/bash\necho 'TIMEOUT|0:15'\n");
    write_executable(&dir.join("scancel"), "#!/bin/bash\nexit 0\n");
    unsafe {
        std::env::set_var("HPC_REGRESS_FAKE_SBATCH", dir.join("sbatch"));
        std::env::set_var("HPC_REGRESS_FAKE_SQUEUE", dir.join("squeue"));
        std::env::set_var("HPC_REGRESS_FAKE_SACCT", dir.join("sacct"));
        std::env::set_var("HPC_REGRESS_FAKE_SCANCEL", dir.join("scancel"));
    }
}

#[test]
fn test_job_killed_at_time_limit_is_a_timeout() {
    let tmp = TempDir::new().unwrap();
    let fake = tmp.path().join("fake-slurm");
    fs::create_dir_all(&fake).unwrap();
    install_fake_slurm(&fake);

    let config = site_with_scheduler("fakeslurm", SchedulerKind::Slurm);
    let plan = plan_for(
        &config,
        r#"
name: cm1
checks:
  - name: CM1QuickTest
    valid_systems: ['fakeslurm:default']
    valid_prog_environs: [builtin]
    run:
      executable: 'echo writing restart file'
      time_limit: 1m
      poll_interval: 0.05
    sanity:
      - {kind: assert_not_found, pattern: 'FATAL|ERROR', source: stderr}
"#,
        &tmp.path().join("stage"),
    );

    let report = Orchestrator::new(plan, config.runner.clone()).run().unwrap();
    let quick = report.get("CM1QuickTest @fakeslurm:default+builtin").unwrap();
    assert_eq!(quick.failure_kind(), Some(FailureKind::RunTimeoutError));
    assert!(
        quick
            .failure
            .as_ref()
            .unwrap()
            .message
            .contains("wall-clock limit")
    );
}
