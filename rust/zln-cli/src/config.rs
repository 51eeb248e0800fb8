//! Configuration file parsing for `zln.toml`.
//!
//! Searches the current directory then its ancestors. Command-line flags
//! override whatever the file sets.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "zln.toml";

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct ZlnConfig {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct RuntimeSection {
    /// Heap bytes to give programs that do not cap their own heap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_size: Option<usize>,
    /// Print every executed instruction.
    #[serde(default)]
    pub trace: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LogSection {
    /// `tracing` filter directives, used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "warn".to_string()
}

impl ZlnConfig {
    /// Load config from `zln.toml`, searching current dir then parents.
    /// Returns `Default` when no file is found.
    pub fn load() -> Self {
        Self::find_and_load()
            .map(|(_path, cfg)| cfg)
            .unwrap_or_default()
    }

    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
        toml::from_str(&content)
            .map_err(|e| format!("invalid toml in '{}': {}", path.display(), e))
    }

    fn find_and_load() -> Option<(PathBuf, Self)> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                let cfg = Self::load_from(&config_path).ok()?;
                return Some((config_path, cfg));
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Parse a TOML string directly.
    #[allow(dead_code)]
    pub fn from_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Generate a default `zln.toml` template.
    pub fn default_template() -> &'static str {
        r#"# zln configuration

[runtime]
# Heap bytes for programs whose header leaves the heap uncapped
# heap_size = 65536
# Print every executed instruction
trace = false

[log]
# Overridden by RUST_LOG
filter = "warn"
"#
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
