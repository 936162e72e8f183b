//! Process configuration, loaded from a JSON file named by an env var, with
//! built-in defaults for everything it doesn't set.

use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_data_dir() -> String {
    "data/".to_string()
}
fn default_embeddings_model() -> String {
    "all-MiniLM-L6-v2".to_string()
}
fn default_gpt_model() -> String {
    "gpt-4.1-mini".to_string()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_backend_port() -> u16 {
    8001
}
fn default_embedding_dimension() -> usize {
    384
}

/// Process-wide configuration. Constructed once at startup and threaded
/// through the components that need it, rather than read as a global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_embeddings_model")]
    pub embeddings_model: String,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    #[serde(default = "default_gpt_model")]
    pub gpt_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    /// Base URL of the external chunker HTTP service.
    pub chunker_base_url: Option<String>,
    /// LLM endpoint override, for Azure-style deployments.
    pub llm_endpoint: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_deployment: Option<String>,
    pub llm_api_version: Option<String>,
    /// Per-model `(input, output, cached_read)` USD-per-million-token overrides.
    #[serde(default)]
    pub pricing_overrides: indexmap::IndexMap<String, (f64, f64, f64)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            embeddings_model: default_embeddings_model(),
            embedding_dimension: default_embedding_dimension(),
            gpt_model: default_gpt_model(),
            temperature: default_temperature(),
            backend_port: default_backend_port(),
            chunker_base_url: None,
            llm_endpoint: None,
            llm_api_key: None,
            llm_deployment: None,
            llm_api_version: None,
            pricing_overrides: indexmap::IndexMap::new(),
        }
    }
}

impl Config {
    /// Load overrides from the JSON file named by `RESEARCH_SERVICE_CONFIG`,
    /// if set and readable. Errors are logged and swallowed; the process
    /// always starts with at least the defaults.
    pub fn load() -> Self {
        let mut config = Self::default();
        let Ok(path) = std::env::var("RESEARCH_SERVICE_CONFIG") else {
            return config;
        };
        match Self::load_from_file(&path) {
            Ok(overrides) => config = overrides,
            Err(err) => {
                tracing::warn!(path, %err, "failed to load config overrides, using defaults");
            }
        }
        config
    }

    fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        let partial: serde_json::Value = serde_json::from_slice(&bytes)?;
        let mut config = Self::default();
        let config_value = serde_json::to_value(&config)?;
        let merged = merge(config_value, partial);
        config = serde_json::from_value(merged)?;
        Ok(config)
    }
}

fn merge(mut base: serde_json::Value, overrides: serde_json::Value) -> serde_json::Value {
    if let (Some(base_obj), Some(overrides_obj)) = (base.as_object_mut(), overrides.as_object()) {
        for (key, value) in overrides_obj {
            base_obj.insert(key.clone(), value.clone());
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_source_settings() {
        let config = Config::default();
        assert_eq!(config.embeddings_model, "all-MiniLM-L6-v2");
        assert_eq!(config.gpt_model, "gpt-4.1-mini");
        assert_eq!(config.backend_port, 8001);
        assert!((config.temperature - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn missing_config_path_falls_back_to_defaults() {
        std::env::remove_var("RESEARCH_SERVICE_CONFIG");
        let config = Config::load();
        assert_eq!(config.data_dir, "data/");
    }
}
