//! Compiled output patterns and the captured output they run against.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// A regular expression applied to a whole captured document.
///
/// Patterns are compiled in multi-line mode, so `^` and `$` anchor at line
/// boundaries, and are compiled when the suite is loaded so a bad pattern is
/// reported before anything runs.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(source).multi_line(true).build()?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True if at least one substring of `text` matches
    pub fn is_found(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// The requested group of the first match in document order.
    ///
    /// `Ok(None)` means the pattern did not match at all; an error means it
    /// matched but the group did not participate.
    pub fn first_capture<'t>(
        &self,
        text: &'t str,
        group: &CaptureGroup,
    ) -> Result<Option<&'t str>, String> {
        let Some(caps) = self.regex.captures(text) else {
            return Ok(None);
        };
        let m = match group {
            CaptureGroup::Index(i) => caps.get(*i),
            CaptureGroup::Name(name) => caps.name(name),
        };
        match m {
            Some(m) => Ok(Some(m.as_str())),
            None => Err(format!(
                "pattern '{}' matched but group {} did not capture",
                self.source, group
            )),
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(&source).map_err(serde::de::Error::custom)
    }
}

/// Capture group selector: position or name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaptureGroup {
    Index(usize),
    Name(String),
}

impl Default for CaptureGroup {
    fn default() -> Self {
        CaptureGroup::Index(1)
    }
}

impl fmt::Display for CaptureGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureGroup::Index(i) => write!(f, "{}", i),
            CaptureGroup::Name(n) => write!(f, "'{}'", n),
        }
    }
}

/// Which captured document a rule reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    #[default]
    Stdout,
    Stderr,
    BuildStdout,
    BuildStderr,
}

impl fmt::Display for OutputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutputSource::Stdout => "stdout",
            OutputSource::Stderr => "stderr",
            OutputSource::BuildStdout => "build stdout",
            OutputSource::BuildStderr => "build stderr",
        };
        f.write_str(s)
    }
}

/// Everything a finished instance left behind for validation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub build_stdout: String,
    pub build_stderr: String,
    /// Run directory; file checks resolve relative to it
    pub stage_dir: PathBuf,
}

impl CapturedOutput {
    pub fn new(stage_dir: impl Into<PathBuf>) -> Self {
        Self {
            stage_dir: stage_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_build_output(
        mut self,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        self.build_stdout = stdout.into();
        self.build_stderr = stderr.into();
        self
    }

    pub fn text(&self, source: OutputSource) -> &str {
        match source {
            OutputSource::Stdout => &self.stdout,
            OutputSource::Stderr => &self.stderr,
            OutputSource::BuildStdout => &self.build_stdout,
            OutputSource::BuildStderr => &self.build_stderr,
        }
    }

    /// Read captured files from a stage directory. Missing files read as
    /// empty documents.
    pub fn from_files(
        stage_dir: &Path,
        stdout: &Path,
        stderr: &Path,
        build_stdout: &Path,
        build_stderr: &Path,
    ) -> Self {
        let read = |p: &Path| fs::read_to_string(p).unwrap_or_default();
        Self {
            stdout: read(stdout),
            stderr: read(stderr),
            build_stdout: read(build_stdout),
            build_stderr: read(build_stderr),
            stage_dir: stage_dir.to_path_buf(),
        }
    }
}
