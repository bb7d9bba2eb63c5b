use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub llm: LlmConfig,
    pub rules_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Minimum stored confidence for a pattern-memory lookup to count as a hit.
    pub memory_lookup_threshold: f64,
    /// Confidence at which a row is accepted without escalation (Layer 1).
    pub accept_threshold: f64,
    /// Confidence at which an LLM result is accepted (Layer 2).
    pub llm_accept_threshold: f64,
    /// Max rows per external classification call.
    pub llm_batch_size: usize,
    /// How many sub-batches may be in flight at once.
    pub llm_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    pub enabled: bool,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let pipeline = PipelineConfig {
            memory_lookup_threshold: env::var("MEMORY_LOOKUP_THRESHOLD")
                .unwrap_or_else(|_| "0.90".to_string())
                .parse()
                .unwrap_or(0.90),
            accept_threshold: env::var("ACCEPT_THRESHOLD")
                .unwrap_or_else(|_| "0.95".to_string())
                .parse()
                .unwrap_or(0.95),
            llm_accept_threshold: env::var("LLM_ACCEPT_THRESHOLD")
                .unwrap_or_else(|_| "0.85".to_string())
                .parse()
                .unwrap_or(0.85),
            llm_batch_size: env::var("LLM_BATCH_SIZE")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .unwrap_or(50),
            llm_concurrency: env::var("LLM_CONCURRENCY")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .unwrap_or(2),
        };

        let llm = LlmConfig {
            enabled: env::var("LLM_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            api_key: env::var("OPENROUTER_API_KEY").unwrap_or_default(),
            model: env::var("LLM_MODEL").unwrap_or_else(|_| "openai/gpt-4o-mini".to_string()),
            base_url: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1/chat/completions".to_string()),
            timeout_secs: env::var("LLM_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            max_retries: env::var("LLM_MAX_RETRIES")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .unwrap_or(2),
        };

        let rules_path = env::var("STRATEGY_RULES_PATH").ok();

        Ok(Config {
            pipeline,
            llm,
            rules_path,
        })
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            memory_lookup_threshold: 0.90,
            accept_threshold: 0.95,
            llm_accept_threshold: 0.85,
            llm_batch_size: 50,
            llm_concurrency: 2,
        }
    }
}
