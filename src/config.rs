//! Gateway configuration.
//!
//! Typed settings with serde defaults, loaded from an optional JSON file and
//! overridden by environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::engine::TESSERACT;
use crate::hardware;

/// Compute device an engine should target. `Auto` resolves through hardware
/// detection at the adapter layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceConfig {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Mps,
}

impl DeviceConfig {
    /// Resolve `auto` to the detected device name.
    pub fn resolve(self) -> &'static str {
        match self {
            DeviceConfig::Auto => hardware::detect_device().as_str(),
            DeviceConfig::Cpu => "cpu",
            DeviceConfig::Cuda => "cuda",
            DeviceConfig::Mps => "mps",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Markdown,
    Json,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "markdown" | "md" => Some(Self::Markdown),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Json => "json",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Json => "json",
        }
    }
}

/// Per-engine options.
///
/// Unknown JSON keys are ignored on purpose: a fallback engine receives the
/// originally-requested engine's config and must tolerate keys it does not
/// understand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    /// Release transient engine state after each processed item.
    #[serde(default = "default_true")]
    pub memory_cleanup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// VLM prompt selector: text, lines, words or latex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retry_attempts: u32,
    #[serde(default = "default_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub extract_tables: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: DeviceConfig::Auto,
            languages: default_languages(),
            memory_cleanup: true,
            endpoint: None,
            api_key: None,
            model: None,
            output_format: None,
            timeout_secs: default_timeout(),
            retry_attempts: default_retries(),
            retry_backoff_ms: default_backoff(),
            extract_tables: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_languages() -> Vec<String> {
    vec!["fr".to_string(), "en".to_string()]
}

fn default_timeout() -> u64 {
    60
}

fn default_retries() -> u32 {
    3
}

fn default_backoff() -> u64 {
    1000
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_engine")]
    pub default_engine: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_formats")]
    pub output_formats: Vec<OutputFormat>,
    #[serde(default)]
    pub engines: HashMap<String, EngineConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_engine: default_engine(),
            output_dir: default_output_dir(),
            output_formats: default_formats(),
            engines: HashMap::new(),
        }
    }
}

fn default_engine() -> String {
    TESSERACT.to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_formats() -> Vec<OutputFormat> {
    vec![OutputFormat::Markdown]
}

impl Settings {
    /// Load settings from a JSON file when given, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config: {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse config: {}", path.display()))?
            }
            None => Self::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(engine) = std::env::var("OCR_DEFAULT_ENGINE") {
            self.default_engine = engine;
        }
        if let Ok(dir) = std::env::var("OCR_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Ok(device) = std::env::var("OCR_DEVICE") {
            match serde_json::from_value::<DeviceConfig>(serde_json::Value::String(device.clone())) {
                Ok(parsed) => {
                    for config in self.engines.values_mut() {
                        config.device = parsed;
                    }
                }
                Err(_) => warn!("ignoring invalid OCR_DEVICE value: {device}"),
            }
        }
    }

    /// Config for one engine; engines absent from the map run on defaults.
    pub fn engine_config(&self, id: &str) -> EngineConfig {
        self.engines.get(id).cloned().unwrap_or_default()
    }
}
