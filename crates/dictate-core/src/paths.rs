//! Resolution of the transcriber's interpreter, script and assets directory.

use std::env;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::logging::EventSink;

const APP_DIR: &str = "raycast-dictate";
const SCRIPT_NAME: &str = "transcribe.py";

/// Return the user's home directory path.
///
/// Uses HOME on Unix-like systems and USERPROFILE on Windows.
pub fn get_home_dir() -> Result<String, String> {
    ["HOME", "USERPROFILE"]
        .iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.is_empty())
        .ok_or_else(|| "Home directory not set".to_string())
}

/// Expand a leading `~` to the home directory.
///
/// Paths without a leading `~`, and `~user` forms, are returned unchanged.
pub fn expand_tilde(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') => rest,
        _ => return PathBuf::from(path),
    };
    match get_home_dir() {
        Ok(home) => PathBuf::from(format!("{}{}", home, rest)),
        Err(_) => PathBuf::from(path),
    }
}

/// Default virtualenv location, outside the assets directory.
pub fn default_venv_dir() -> Result<PathBuf, String> {
    Ok(PathBuf::from(get_home_dir()?)
        .join(".config")
        .join(APP_DIR)
        .join(".venv"))
}

fn has_dir_component(path: &Path) -> bool {
    path.parent().is_some_and(|p| !p.as_os_str().is_empty())
}

/// Where the transcriber lives and how to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriberEnv {
    pub interpreter: PathBuf,
    pub script: PathBuf,
    pub assets_dir: PathBuf,
}

impl TranscriberEnv {
    /// Standard layout: `<venv>/bin/python` running `<assets>/transcribe.py`
    /// from inside `assets_dir`.
    pub fn new(venv_dir: &Path, assets_dir: &Path) -> Self {
        Self {
            interpreter: venv_dir.join("bin").join("python"),
            script: assets_dir.join(SCRIPT_NAME),
            assets_dir: assets_dir.to_path_buf(),
        }
    }

    /// Standard layout with the default virtualenv.
    pub fn with_default_venv(assets_dir: &Path) -> Result<Self, String> {
        Ok(Self::new(&default_venv_dir()?, assets_dir))
    }

    pub fn interpreter(mut self, path: impl Into<PathBuf>) -> Self {
        self.interpreter = path.into();
        self
    }

    pub fn script(mut self, path: impl Into<PathBuf>) -> Self {
        self.script = path.into();
        self
    }

    /// Log `missing_interpreter` / `missing_script` for absent files.
    ///
    /// Never blocks startup; a missing interpreter surfaces later as a spawn
    /// failure. A bare interpreter name (`python3`) is left to PATH lookup.
    pub fn check(&self, sink: &dyn EventSink) -> bool {
        let mut ok = true;
        if has_dir_component(&self.interpreter) && !self.interpreter.exists() {
            sink.log(
                "missing_interpreter",
                json!({
                    "path": self.interpreter.display().to_string(),
                    "hint": "Run 'make install'",
                }),
            );
            ok = false;
        }
        if !self.script.exists() {
            sink.log(
                "missing_script",
                json!({ "path": self.script.display().to_string() }),
            );
            ok = false;
        }
        ok
    }
}
