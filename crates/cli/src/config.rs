//! Persistent defaults for the `speculator` binary.
//!
//! Values are resolved in order:
//! 1. command-line flags
//! 2. config file (`~/.config/mlp-speculator/config.toml`)
//! 3. built-in defaults

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use speculator_core::SpeculationConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Weight dtype (f32, f16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Compute device (cpu, cuda, cuda:N, metal).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Heads to run; defaults to the checkpoint's `n_predict`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_speculative_tokens: Option<usize>,

    /// Branching factor per head.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k_per_head: Option<Vec<usize>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_batch_for_speculation: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub norm_eps: Option<f64>,

    /// Seed for the synthetic hidden states of `speculator run`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// trace, debug, info, warn, error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl CliConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("mlp-speculator").join("config.toml"))
    }

    /// Load from the default path; a missing or unreadable file yields defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &CliConfig) {
        if other.dtype.is_some() {
            self.dtype = other.dtype.clone();
        }
        if other.device.is_some() {
            self.device = other.device.clone();
        }
        if other.num_speculative_tokens.is_some() {
            self.num_speculative_tokens = other.num_speculative_tokens;
        }
        if other.top_k_per_head.is_some() {
            self.top_k_per_head = other.top_k_per_head.clone();
        }
        if other.max_batch_for_speculation.is_some() {
            self.max_batch_for_speculation = other.max_batch_for_speculation;
        }
        if other.norm_eps.is_some() {
            self.norm_eps = other.norm_eps;
        }
        if other.seed.is_some() {
            self.seed = other.seed;
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
    }

    /// Speculation policy with unset fields left at the library defaults.
    pub fn speculation(&self) -> SpeculationConfig {
        let defaults = SpeculationConfig::default();
        SpeculationConfig {
            num_speculative_tokens: self.num_speculative_tokens,
            top_k_per_head: self.top_k_per_head.clone(),
            max_batch_for_speculation: self
                .max_batch_for_speculation
                .unwrap_or(defaults.max_batch_for_speculation),
            norm_eps: self.norm_eps.unwrap_or(defaults.norm_eps),
        }
    }
}

/// Weight dtype by name; unset means f32.
pub fn parse_dtype(name: Option<&str>) -> anyhow::Result<DType> {
    match name.unwrap_or("f32") {
        "f32" | "fp32" | "float32" => Ok(DType::F32),
        "f16" | "fp16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => anyhow::bail!("Unknown dtype '{}'. Supported: f32, f16, bf16", other),
    }
}

/// `cpu`, `cuda`, `cuda:N` or `metal`; unset means cpu.
pub fn parse_device(name: Option<&str>) -> anyhow::Result<Device> {
    match name.unwrap_or("cpu") {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        "metal" => Ok(Device::new_metal(0)?),
        other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
            Some(Ok(ordinal)) => Ok(Device::new_cuda(ordinal)?),
            _ => anyhow::bail!(
                "Unknown device '{}'. Supported: cpu, cuda, cuda:N, metal",
                other
            ),
        },
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}
