use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use labnav_core::{LabnavError, NoiseMechanism, PrivacyConfig};

use crate::cache::{CacheBackendKind, CacheConfig};
use crate::embedding::EmbeddingConfig;
use crate::pipeline::PipelineConfig;

const DEFAULT_CONFIG_PATH: &str = "labnav.toml";

/// Process-wide settings, built once at startup and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub privacy: PrivacyConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub embedding: EmbeddingConfig,
    pub store_path: String,
    pub bind_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            privacy: PrivacyConfig::default(),
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
            embedding: EmbeddingConfig::default(),
            store_path: "labnav.sqlite".to_string(),
            bind_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

impl AppConfig {
    /// Defaults, then `LABNAV_CONFIG` (or `labnav.toml` when present), then
    /// environment overrides. The result is validated before it is returned.
    pub fn load() -> Result<Self> {
        let explicit = env::var("LABNAV_CONFIG").ok();
        let path = explicit
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else if explicit.is_some() {
            bail!("config file {path} does not exist");
        } else {
            Self::default()
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Applies `LABNAV_*` style overrides from `lookup`. Privacy values are
    /// parsed strictly; a malformed one is an [`LabnavError::InvalidPrivacyConfig`].
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("LABNAV_DP_ENABLED") {
            self.privacy.enable_dp_protection = parse_flag(&raw).ok_or_else(|| {
                LabnavError::InvalidPrivacyConfig(format!(
                    "LABNAV_DP_ENABLED must be a boolean, got {raw}"
                ))
            })?;
        }
        if let Some(value) = privacy_value::<f32>(&lookup, "LABNAV_DP_EPSILON")? {
            self.privacy.epsilon = value;
        }
        if let Some(value) = privacy_value::<f32>(&lookup, "LABNAV_DP_SENSITIVITY")? {
            self.privacy.sensitivity = value;
        }
        if let Some(value) = privacy_value::<f32>(&lookup, "LABNAV_DP_CLIP_NORM")? {
            self.privacy.clip_norm = value;
        }
        if let Some(raw) = lookup("LABNAV_DP_MECHANISM") {
            self.privacy.mechanism = raw.parse::<NoiseMechanism>()?;
        }
        if let Some(raw) = lookup("LABNAV_CACHE_BACKEND") {
            self.cache.backend = raw.parse::<CacheBackendKind>()?;
        }
        if let Some(value) = setting_value::<f32>(&lookup, "LABNAV_CACHE_THRESHOLD")? {
            self.cache.admission_threshold = value;
        }
        if let Some(path) = lookup("LABNAV_CACHE_PATH") {
            self.cache.path = Some(path);
        }
        if let Some(path) = lookup("LABNAV_STORE") {
            self.store_path = path;
        }
        if let Some(provider) = lookup("EMBEDDING_PROVIDER") {
            self.embedding.provider = provider.to_lowercase();
        }
        if let Some(model) = lookup("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Some(dims) = setting_value::<usize>(&lookup, "HASH_EMBED_DIMENSIONS")? {
            self.embedding.dimensions = dims;
        }
        if let Some(addr) = lookup("BIND_ADDR") {
            self.bind_addr = addr;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.privacy.budget()?;
        let threshold = self.cache.admission_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            bail!("cache admission threshold must be within [0, 1], got {threshold}");
        }
        self.pipeline.validate()?;
        if self.embedding.dimensions == 0 {
            bail!("embedding dimensions must be > 0");
        }
        Ok(())
    }

    /// SQLite file for the sqlite cache backend; defaults to the passage store.
    pub fn cache_path(&self) -> &str {
        self.cache.path.as_deref().unwrap_or(&self.store_path)
    }
}

fn privacy_value<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            anyhow!(LabnavError::InvalidPrivacyConfig(format!(
                "{key} must be a number, got {raw}"
            )))
        }),
    }
}

fn setting_value<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{key} has an unparsable value {raw:?}")),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
