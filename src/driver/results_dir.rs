use super::DriverError;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// The two phases of a run. Warmup artifacts carry a `-warmup-` infix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Warmup,
    Measured,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Warmup => "warmup",
            RunPhase::Measured => "measured",
        }
    }

    fn infix(self) -> &'static str {
        match self {
            RunPhase::Warmup => "-warmup-",
            RunPhase::Measured => "-",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output directory of a benchmark; every artifact is prefixed with the
/// benchmark name.
#[derive(Debug, Clone)]
pub struct ResultsDir {
    root: PathBuf,
    name: String,
}

impl ResultsDir {
    pub fn create(root: &Path, name: &str) -> Result<Self, DriverError> {
        fs::create_dir_all(root).map_err(|source| DriverError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            name: name.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact(&self, phase: RunPhase, suffix: &str) -> PathBuf {
        self.root
            .join(format!("{}{}{}", self.name, phase.infix(), suffix))
    }

    pub fn results_log(&self, phase: RunPhase) -> PathBuf {
        self.artifact(phase, "results_log.csv")
    }

    pub fn results(&self, phase: RunPhase) -> PathBuf {
        self.artifact(phase, "results.json")
    }

    pub fn validation(&self, phase: RunPhase) -> PathBuf {
        self.artifact(phase, "validation.json")
    }

    pub fn configuration(&self) -> PathBuf {
        self.artifact(RunPhase::Measured, "configuration.json")
    }

    pub fn tuning(&self) -> PathBuf {
        self.artifact(RunPhase::Measured, "tuning.json")
    }

    /// Writes `value` as pretty JSON and returns the path.
    pub fn write_json<T: Serialize>(&self, path: PathBuf, value: &T) -> Result<PathBuf, DriverError> {
        let text = serde_json::to_string_pretty(value)?;
        fs::write(&path, text).map_err(|source| DriverError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
