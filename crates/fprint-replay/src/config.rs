use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

/// Harness configuration. Every field can also be set on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Replay engine binary, a bare name or a path.
    pub engine: String,
    /// Interpreter for capture and non-TOML custom scripts.
    pub interpreter: String,
    /// Capture program; defaults to `capture.py` beside the harness binary.
    pub capture_script: Option<PathBuf>,
    /// Program that runs `custom.toml` session profiles.
    pub session_program: String,
    /// Root under which failed runs are preserved.
    pub errors_dir: PathBuf,
    /// Program and arguments prepended to every child, whitespace separated.
    pub wrapper: Option<String>,
    /// Environment variable that, holding `ci_project_name`, forces every
    /// replay capability on.
    pub ci_project_var: String,
    pub ci_project_name: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            engine: "umockdev-run".to_string(),
            interpreter: "python3".to_string(),
            capture_script: None,
            session_program: "fprint-session".to_string(),
            errors_dir: PathBuf::from("errors"),
            wrapper: None,
            ci_project_var: "CI_PROJECT_NAME".to_string(),
            ci_project_name: "libfprint".to_string(),
        }
    }
}

fn exe_sibling(name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join(name))
}

impl HarnessConfig {
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| HarnessError::Config(format!("{}: {}", path.display(), e))),
            "json" => serde_json::from_str(&contents)
                .map_err(|e| HarnessError::Config(format!("{}: {}", path.display(), e))),
            _ => Err(HarnessError::Config(format!(
                "unsupported config file extension: {}",
                ext
            ))),
        }
    }

    pub fn ci_override_active(&self) -> bool {
        std::env::var(&self.ci_project_var).is_ok_and(|v| v == self.ci_project_name)
    }

    pub fn capture_script_path(&self) -> PathBuf {
        self.capture_script
            .clone()
            .or_else(|| exe_sibling("capture.py"))
            .unwrap_or_else(|| PathBuf::from("capture.py"))
    }

    /// The session program, preferring a copy installed next to the harness.
    pub fn session_program_path(&self) -> PathBuf {
        if self.session_program.contains('/') {
            return PathBuf::from(&self.session_program);
        }
        exe_sibling(&self.session_program)
            .filter(|p| p.is_file())
            .unwrap_or_else(|| PathBuf::from(&self.session_program))
    }
}
