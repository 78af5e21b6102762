//! Build step: writes `build.sh` into the stage and runs it.
//!
//! The script loads the environment's modules, exports the environment
//! variables, runs the pre-build steps, invokes the build tool with the
//! merged flag set and finally the post-build steps. Its output is captured
//! in `build.out` and `build.err`.

use log::{debug, info, warn};
use std::fs::{self, File};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::resolver::TestInstance;
use super::stage::StageLayout;
use crate::batch::common::{env_quote, shell_quote};
use crate::checks::{BuildRecipe, BuildSystem, FlagSet};
use crate::config::CompilerTriplet;
use crate::errors::PipelineError;

const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Result of a successful build
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub duration: Duration,
}

/// Language of a single source file, by extension
fn compiler_for<'a>(
    sourcepath: &str,
    compilers: &CompilerTriplet<'a>,
    flags: &FlagSet,
) -> Option<(&'a str, Vec<String>)> {
    let extension = Path::new(sourcepath).extension()?.to_str()?;
    let mut args = flags.cppflags.clone();
    let compiler = match extension {
        "c" => {
            args.extend(flags.cflags.iter().cloned());
            compilers.cc
        }
        "cc" | "cpp" | "cxx" | "C" | "c++" => {
            args.extend(flags.cxxflags.iter().cloned());
            compilers.cxx
        }
        "f" | "F" | "for" | "f77" | "f90" | "F90" | "f95" | "F95" | "f03" | "F03" => {
            args.extend(flags.fflags.iter().cloned());
            compilers.ftn
        }
        "cu" => {
            args.extend(flags.cxxflags.iter().cloned());
            "nvcc"
        }
        _ => return None,
    };
    Some((compiler, args))
}

/// `NAME="a b"` or nothing when the list is empty
fn make_variable(name: &str, values: &[String]) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        Some(format!("{}=\"{}\"", name, values.join(" ").replace('"', "\\\"")))
    }
}

/// Commands that invoke the build tool
pub fn build_commands(
    recipe: &BuildRecipe,
    compilers: &CompilerTriplet<'_>,
    flags: &FlagSet,
) -> Result<Vec<String>, PipelineError> {
    match &recipe.build_system {
        BuildSystem::Make {
            makefile,
            max_concurrency,
        } => {
            let mut cmd = vec![
                "make".to_string(),
                "-j".to_string(),
                max_concurrency.unwrap_or(1).to_string(),
            ];
            if let Some(makefile) = makefile {
                cmd.push("-f".to_string());
                cmd.push(makefile.clone());
            }
            cmd.push(format!("CC={}", compilers.cc));
            cmd.push(format!("CXX={}", compilers.cxx));
            cmd.push(format!("FC={}", compilers.ftn));
            cmd.extend(
                [
                    make_variable("CPPFLAGS", &flags.cppflags),
                    make_variable("CFLAGS", &flags.cflags),
                    make_variable("CXXFLAGS", &flags.cxxflags),
                    make_variable("FFLAGS", &flags.fflags),
                    make_variable("LDFLAGS", &flags.ldflags),
                ]
                .into_iter()
                .flatten(),
            );
            cmd.extend(flags.options.iter().cloned());
            Ok(vec![cmd.join(" ")])
        }
        BuildSystem::SingleSource {
            sourcepath,
            executable,
        } => {
            let (compiler, args) =
                compiler_for(sourcepath, compilers, flags).ok_or_else(|| {
                    PipelineError::Configuration(format!(
                        "cannot tell the language of source file '{}'",
                        sourcepath
                    ))
                })?;
            let executable = executable.clone().unwrap_or_else(|| {
                Path::new(sourcepath)
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "a.out".to_string())
            });
            let mut cmd = vec![compiler.to_string()];
            cmd.extend(args);
            cmd.push(sourcepath.clone());
            cmd.push("-o".to_string());
            cmd.push(executable);
            cmd.extend(flags.ldflags.iter().cloned());
            cmd.extend(flags.options.iter().cloned());
            Ok(vec![cmd.join(" ")])
        }
        BuildSystem::Custom { commands } => Ok(commands.clone()),
    }
}

/// Full text of `build.sh` for an instance
pub fn render_build_script(
    instance: &TestInstance,
    recipe: &BuildRecipe,
    layout: &StageLayout,
) -> Result<String, PipelineError> {
    let flags = recipe.flags_for(&instance.environ.name);
    let commands = build_commands(recipe, &instance.environ.compilers(), &flags)?;

    let mut script = String::from("#!/bin/bash\n\nset -e\n");
    script.push_str(&format!("cd {}\n", shell_quote(&layout.root().to_string_lossy())));
    for cmd in instance.modules_system.load_commands(&instance.modules) {
        script.push_str(&cmd);
        script.push('\n');
    }
    for (key, value) in &instance.env_vars {
        script.push_str(&format!("export {}={}\n", key, env_quote(value)));
    }
    for cmd in recipe
        .prebuild_cmds
        .iter()
        .chain(&commands)
        .chain(&recipe.postbuild_cmds)
    {
        script.push_str(cmd);
        script.push('\n');
    }
    Ok(script)
}

/// Write and run the build script. A non-zero exit is a build error; a
/// build still running at `timeout` (or when `cancel` is raised) is killed.
pub fn run_build(
    instance: &TestInstance,
    recipe: &BuildRecipe,
    layout: &StageLayout,
    timeout: Option<Duration>,
    cancel: &AtomicBool,
) -> Result<BuildOutcome, PipelineError> {
    let script = render_build_script(instance, recipe, layout)?;
    let script_path = layout.build_script();
    fs::write(&script_path, script)?;
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms)?;
    }

    info!(
        "Building check={} partition={} environ={} build_system={}",
        instance.check,
        instance.partition.name,
        instance.environ.name,
        recipe.build_system.name()
    );
    let start = Instant::now();
    let mut child = Command::new("bash")
        .arg(&script_path)
        .current_dir(layout.root())
        .stdin(Stdio::null())
        .stdout(File::create(layout.build_stdout())?)
        .stderr(File::create(layout.build_stderr())?)
        .spawn()?;

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        let elapsed = start.elapsed();
        let timed_out = timeout.is_some_and(|t| elapsed >= t);
        if timed_out || cancel.load(Ordering::SeqCst) {
            if let Err(e) = child.kill() {
                warn!("Failed to kill build of {}: {}", instance.name, e);
            }
            let _ = child.wait();
            let reason = if timed_out {
                format!(
                    "build exceeded {}s",
                    timeout.map(|t| t.as_secs()).unwrap_or_default()
                )
            } else {
                "build interrupted".to_string()
            };
            return Err(PipelineError::RunTimeout {
                elapsed_secs: elapsed.as_secs(),
                reason,
            });
        }
        thread::sleep(WAIT_SLICE);
    };

    let duration = start.elapsed();
    if !status.success() {
        let exit_code = status.code().unwrap_or(-1);
        warn!(
            "Build failed check={} environ={} exit_code={}",
            instance.check, instance.environ.name, exit_code
        );
        return Err(PipelineError::Build {
            exit_code,
            log: layout.build_stderr().display().to_string(),
        });
    }
    debug!(
        "Build finished instance={} duration={:.1}s",
        instance.name,
        duration.as_secs_f64()
    );
    Ok(BuildOutcome { duration })
}
