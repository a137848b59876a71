//! Detector configuration.
//!
//! Loaded from TOML (every key optional) and compiled into [`Settings`], which
//! holds the validated threshold and the compiled patterns.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprinter;
use crate::pattern::{Pattern, PatternSpec, DEFAULT_ALLOW_STACK_PATHS};

pub const DEFAULT_MIN_REPEAT: usize = 2;
pub const DEFAULT_DRIVER: &str = "mysql";
/// Dependency sources; their frames are hidden from reports unless overridden.
pub const DEFAULT_STACK_FILTER_PATHS: &[&str] = &["/.cargo/registry/", "/.cargo/git/"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub enabled: bool,
    pub raise_on_detect: bool,
    pub min_repeat: usize,
    pub ignore_pauses: bool,
    /// Active data-store driver, e.g. `"mysql2"` or `"postgresql"`.
    pub driver: String,
    pub allow_stack_paths: Vec<PatternSpec>,
    pub ignore_queries: Vec<PatternSpec>,
    /// Frames containing any of these are hidden from rendered reports.
    pub stack_filter_paths: Vec<String>,
    pub builtin_allow_stack_paths: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            raise_on_detect: false,
            min_repeat: DEFAULT_MIN_REPEAT,
            ignore_pauses: false,
            driver: DEFAULT_DRIVER.to_string(),
            allow_stack_paths: Vec::new(),
            ignore_queries: Vec::new(),
            stack_filter_paths: DEFAULT_STACK_FILTER_PATHS
                .iter()
                .map(|path| path.to_string())
                .collect(),
            builtin_allow_stack_paths: DEFAULT_ALLOW_STACK_PATHS
                .iter()
                .map(|path| path.to_string())
                .collect(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::Configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|err| Error::Configuration(format!("failed to parse TOML config: {err}")))
    }

    /// Validates the values and compiles every pattern.
    pub fn compile(&self) -> Result<Settings> {
        if self.min_repeat < DEFAULT_MIN_REPEAT {
            return Err(Error::Configuration(format!(
                "min_repeat must be at least {DEFAULT_MIN_REPEAT}, got {}",
                self.min_repeat
            )));
        }

        let mut allow_stack_paths = self
            .allow_stack_paths
            .iter()
            .map(Pattern::compile)
            .collect::<Result<Vec<_>>>()?;
        allow_stack_paths.extend(
            self.builtin_allow_stack_paths
                .iter()
                .map(|path| Pattern::literal(path.clone())),
        );

        let ignore_queries = self
            .ignore_queries
            .iter()
            .map(Pattern::compile)
            .collect::<Result<Vec<_>>>()?;

        Ok(Settings {
            enabled: self.enabled,
            raise_on_detect: self.raise_on_detect,
            min_repeat: self.min_repeat,
            ignore_pauses: self.ignore_pauses,
            fingerprinter: Fingerprinter::for_driver(&self.driver)?,
            allow_stack_paths,
            ignore_queries,
            stack_filter_paths: self.stack_filter_paths.clone(),
        })
    }
}

/// Validated, compiled configuration shared by every scanner of a detector.
#[derive(Debug, Clone)]
pub struct Settings {
    pub enabled: bool,
    pub raise_on_detect: bool,
    pub min_repeat: usize,
    pub ignore_pauses: bool,
    pub fingerprinter: Fingerprinter,
    /// User patterns followed by the built-in markers.
    pub allow_stack_paths: Vec<Pattern>,
    pub ignore_queries: Vec<Pattern>,
    pub stack_filter_paths: Vec<String>,
}

impl Settings {
    /// True when the frame should be hidden from rendered reports.
    pub fn is_filtered_frame(&self, frame: &str) -> bool {
        self.stack_filter_paths
            .iter()
            .any(|path| frame.contains(path.as_str()))
    }
}
