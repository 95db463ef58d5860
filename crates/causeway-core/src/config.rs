//! Tracker configuration and its loader.
//!
//! Configuration files may be RON, TOML or JSON; the format is detected from
//! the file extension. Every field has a default, so a file only needs to
//! name what it overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ===========================================================================
// Errors
// ===========================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported config format: {file}")]
    UnsupportedFormat { file: PathBuf },

    #[error("parse error in {source_name}: {detail}")]
    Parse { source_name: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ===========================================================================
// Format detection
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a config file from its extension.
pub fn detect_format(path: &Path) -> Result<Format, ConfigError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(ConfigError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// TrackerConfig
// ===========================================================================

/// Tunables of a [`PhaseTracker`](crate::tracker::PhaseTracker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Record the call site of every phase entry.
    pub capture_call_sites: bool,
    /// Include capture counts and call sites in every stack dump.
    pub verbose_diagnostics: bool,
    /// Log each (phase, diagnostic kind) pair only once.
    pub report_once: bool,
    /// Phase stack depth, root included, at which entry is refused.
    pub max_phase_depth: usize,
    /// How many levels of listener reactions are replayed before further
    /// reactions are dropped.
    pub max_reaction_depth: usize,
    /// Upper bound on pooled contexts kept for reuse.
    pub context_pool_size: usize,
    /// Restore a failed block group's applied positions.
    pub rollback_on_failure: bool,
    /// Refuse entry of thread-bound phases off the authoritative thread.
    pub enforce_authoritative_thread: bool,
    /// Capacity of the off-thread handoff queue.
    pub handoff_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capture_call_sites: false,
            verbose_diagnostics: false,
            report_once: true,
            max_phase_depth: 32,
            max_reaction_depth: 8,
            context_pool_size: 16,
            rollback_on_failure: false,
            enforce_authoritative_thread: true,
            handoff_capacity: 1024,
        }
    }
}

impl TrackerConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        let source_name = path.display().to_string();
        Self::parse(&content, format, &source_name)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, Format::Toml, "<toml>")
    }

    pub fn from_ron_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, Format::Ron, "<ron>")
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, Format::Json, "<json>")
    }

    fn parse(content: &str, format: Format, source_name: &str) -> Result<Self, ConfigError> {
        let parse_error = |detail: String| ConfigError::Parse {
            source_name: source_name.to_string(),
            detail,
        };
        let config: Self = match format {
            Format::Ron => ron::from_str(content).map_err(|e| parse_error(e.to_string()))?,
            Format::Toml => toml::from_str(content).map_err(|e| parse_error(e.to_string()))?,
            Format::Json => {
                serde_json::from_str(content).map_err(|e| parse_error(e.to_string()))?
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_phase_depth < 2 {
            return Err(ConfigError::Invalid(format!(
                "max_phase_depth must leave room above the root phase, got {}",
                self.max_phase_depth
            )));
        }
        if self.handoff_capacity == 0 {
            return Err(ConfigError::Invalid(
                "handoff_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
