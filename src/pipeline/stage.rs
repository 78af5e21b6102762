//! Per-instance stage directories and the files kept in them

use log::debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::validate::CapturedOutput;

pub const BUILD_SCRIPT: &str = "build.sh";
pub const BUILD_STDOUT: &str = "build.out";
pub const BUILD_STDERR: &str = "build.err";
pub const JOB_SCRIPT: &str = "job.sh";
pub const JOB_STDOUT: &str = "job.out";
pub const JOB_STDERR: &str = "job.err";

/// Paths of the artifacts inside one stage directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLayout {
    root: PathBuf,
}

impl StageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn build_script(&self) -> PathBuf {
        self.root.join(BUILD_SCRIPT)
    }

    pub fn build_stdout(&self) -> PathBuf {
        self.root.join(BUILD_STDOUT)
    }

    pub fn build_stderr(&self) -> PathBuf {
        self.root.join(BUILD_STDERR)
    }

    pub fn job_script(&self) -> PathBuf {
        self.root.join(JOB_SCRIPT)
    }

    pub fn job_stdout(&self) -> PathBuf {
        self.root.join(JOB_STDOUT)
    }

    pub fn job_stderr(&self) -> PathBuf {
        self.root.join(JOB_STDERR)
    }

    /// Everything captured so far; missing files read as empty
    pub fn captured_output(&self) -> CapturedOutput {
        CapturedOutput::from_files(
            &self.root,
            &self.job_stdout(),
            &self.job_stderr(),
            &self.build_stdout(),
            &self.build_stderr(),
        )
    }

    /// Output of a compile-only instance: the build log doubles as the
    /// document sanity rules read from
    pub fn captured_build_output(&self) -> CapturedOutput {
        let mut output = self.captured_output();
        output.stdout = output.build_stdout.clone();
        output.stderr = output.build_stderr.clone();
        output
    }

    /// Start from an empty stage directory, then copy the contents of
    /// `sourcesdir` into it
    pub fn prepare(&self, sourcesdir: Option<&Path>) -> io::Result<()> {
        if self.root.exists() {
            debug!("Removing previous stage {}", self.root.display());
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.root)?;
        if let Some(src) = sourcesdir {
            if !src.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("sources directory {} does not exist", src.display()),
                ));
            }
            copy_dir_recursive(src, &self.root)?;
            debug!("Copied {} into {}", src.display(), self.root.display());
        }
        Ok(())
    }
}

/// Copy the contents of `src` into `dst`, creating `dst` if needed
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_copies_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("run")).unwrap();
        fs::write(src.join("hello.c"), "int main(void) { return 0; }\n").unwrap();
        fs::write(src.join("run/namelist.input"), "&param1\n/\n").unwrap();

        let layout = StageLayout::new(tmp.path().join("stage/HelloWorldTest"));
        layout.prepare(Some(&src)).unwrap();
        assert!(layout.root().join("hello.c").is_file());
        assert!(layout.root().join("run/namelist.input").is_file());
    }

    #[test]
    fn test_prepare_starts_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StageLayout::new(tmp.path().join("stage"));
        layout.prepare(None).unwrap();
        fs::write(layout.job_stdout(), "old output").unwrap();
        layout.prepare(None).unwrap();
        assert!(!layout.job_stdout().exists());
        assert_eq!(layout.captured_output().stdout, "");
    }

    #[test]
    fn test_missing_sourcesdir() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StageLayout::new(tmp.path().join("stage"));
        let err = layout.prepare(Some(&tmp.path().join("nope"))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
