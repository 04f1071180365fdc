//! Run configuration
//!
//! Loaded from a TOML file. Every section except `calibration` can be left
//! out; missing values fall back to the defaults below.

use crate::error::{PbpError, Result};
use crate::planner::OverlapPolicy;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PbpConfig {
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub attributes: AttributesConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Segmenting and analysis parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_resolution_secs")]
    pub resolution_secs: u32,
    /// Applied to loaded samples before analysis
    #[serde(default)]
    pub voltage_multiplier: Option<f64>,
    /// Frequency window `[lower, upper)` kept in the product
    #[serde(default)]
    pub subset_to: Option<(f32, f32)>,
    /// Process only this many segments per day (0 = all)
    #[serde(default)]
    pub max_segments: usize,
    /// Channel analyzed in multi-channel recordings
    #[serde(default)]
    pub channel: usize,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            resolution_secs: default_resolution_secs(),
            voltage_multiplier: None,
            subset_to: None,
            max_segments: 0,
            channel: 0,
            overlap_policy: OverlapPolicy::default(),
        }
    }
}

fn default_resolution_secs() -> u32 {
    60
}

/// Hydrophone sensitivity, either a per-frequency curve or one flat value in dB
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CalibrationConfig {
    #[serde(default)]
    pub sensitivity_uri: Option<String>,
    #[serde(default)]
    pub sensitivity_flat_value: Option<f64>,
}

/// Where metadata and audio live
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root of the `{YYYY}/{YYYYMMDD}.json` tree
    #[serde(default = "default_json_base_dir")]
    pub json_base_dir: String,
    /// Base for relative audio locations
    #[serde(default)]
    pub audio_base_dir: Option<String>,
    /// `old~new` rewrite applied to every audio uri
    #[serde(default)]
    pub path_map_prefix: String,
    /// Prepended to absolute `file:///` paths
    #[serde(default)]
    pub path_prefix: String,
    /// `{bucket}` is replaced with the bucket name
    #[serde(default = "default_s3_endpoint")]
    pub s3_endpoint: String,
    #[serde(default = "default_gs_endpoint")]
    pub gs_endpoint: String,
    /// Bearer token sent to the s3 endpoint; anonymous when absent
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            json_base_dir: default_json_base_dir(),
            audio_base_dir: None,
            path_map_prefix: String::new(),
            path_prefix: String::new(),
            s3_endpoint: default_s3_endpoint(),
            gs_endpoint: default_gs_endpoint(),
            auth_token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_json_base_dir() -> String {
    "./json".to_string()
}
fn default_s3_endpoint() -> String {
    "https://{bucket}.s3.amazonaws.com".to_string()
}
fn default_gs_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}

/// Download cache behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Reuse files already in the download directory without fetching
    #[serde(default)]
    pub assume_downloaded_files: bool,
    /// Keep downloads after they are no longer needed
    #[serde(default)]
    pub retain_downloaded_files: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            assume_downloaded_files: false,
            retain_downloaded_files: false,
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Attribute files merged into the product metadata
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AttributesConfig {
    #[serde(default)]
    pub global_attrs_uri: Option<String>,
    #[serde(default)]
    pub variable_attrs_uri: Option<String>,
    /// Global attributes set or overridden by value; each key also works as
    /// a `{{key}}` snippet inside other values
    #[serde(default)]
    pub set_global_attrs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            output_prefix: default_output_prefix(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}
fn default_output_prefix() -> String {
    "milli_psd_".to_string()
}

impl PbpConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PbpError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PbpError::config(format!("invalid TOML: {e}")))
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        let p = &self.processing;
        if p.resolution_secs == 0 {
            return Err(PbpError::config("resolution_secs must be > 0"));
        }
        if p.resolution_secs > 86_400 {
            return Err(PbpError::config("resolution_secs must not exceed one day"));
        }
        if let Some((lower, upper)) = p.subset_to {
            if !(lower < upper) || lower < 0.0 {
                return Err(PbpError::config(format!(
                    "subset_to must satisfy 0 <= lower < upper, got ({lower}, {upper})"
                )));
            }
        }
        if let Some(m) = p.voltage_multiplier {
            if !m.is_finite() || m == 0.0 {
                return Err(PbpError::config("voltage_multiplier must be finite and non-zero"));
            }
        }

        let c = &self.calibration;
        if c.sensitivity_uri.is_none() && c.sensitivity_flat_value.is_none() {
            return Err(PbpError::config(
                "one of calibration.sensitivity_uri or calibration.sensitivity_flat_value is required",
            ));
        }

        let prefix = &self.storage.path_map_prefix;
        if !prefix.is_empty() && prefix.split('~').count() != 2 {
            return Err(PbpError::config(format!(
                "path_map_prefix must look like old~new, got '{prefix}'"
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(PbpError::config("retry.max_attempts must be >= 1"));
        }
        Ok(())
    }
}
