use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which gateway implementation serves LLM calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Local `llm` command-line tool invoked as a subprocess
    Cli,
    /// Hosted OpenAI-compatible API
    Api,
}

/// Configuration for an evaluation run
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Gateway backend serving completion and embedding calls
    #[serde(default = "default_backend")]
    pub backend: Backend,
    /// Model used to generate candidate outputs
    pub model: String,
    /// Model used for the comparative grading call
    #[serde(default = "default_grading_model")]
    pub grading_model: String,
    /// Model used for text embeddings
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
    /// OpenAI-compatible API endpoint (api backend only)
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    /// Environment variable holding the API key (api backend only)
    #[serde(default = "default_env_var_api_key")]
    pub env_var_api_key: String,
    /// Temperature for candidate-output generation
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Maximum tokens for candidate-output generation
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Nucleus sampling cutoff, if the model should not use its default
    #[serde(default)]
    pub top_p: Option<f64>,
    /// Concurrent worker count for the task pool; defaults to the host's
    /// available parallelism when unset
    #[serde(default)]
    pub workers: Option<usize>,
}

fn default_backend() -> Backend {
    Backend::Cli
}

fn default_grading_model() -> String {
    "gpt-4o".to_string()
}

fn default_embed_model() -> String {
    "3-large".to_string()
}

fn default_api_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_env_var_api_key() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }
}
