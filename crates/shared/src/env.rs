use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::PipelineError;

fn required(key: &str) -> Result<String, PipelineError> {
  env::var(key).map_err(|_| PipelineError::InvalidInput(format!("env {key} must be set")))
}

fn parsed<T: FromStr>(key: &str, default: T) -> Result<T, PipelineError> {
  match env::var(key) {
    Ok(raw) => raw
      .parse()
      .map_err(|_| PipelineError::InvalidInput(format!("env {key} has invalid value {raw:?}"))),
    Err(_) => Ok(default),
  }
}

fn defaulted(key: &str, default: &str) -> String {
  env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Process configuration, read once at startup and threaded through the
/// pipeline explicitly.
#[derive(Debug, Clone)]
pub struct AppEnv {
  pub neo4j_uri: String,
  pub neo4j_user: String,
  pub neo4j_password: String,
  pub neo4j_database: String,

  /// One or more API keys, rotated round-robin under per-key quotas.
  pub llm_api_keys: Vec<String>,
  pub llm_base_url: String,
  pub llm_model: String,

  pub embedding_model: String,
  pub embedding_dimensions: usize,

  pub speaker_confidence_threshold: f32,
  pub pipeline_timeout_secs: u64,
  pub speaker_identification_timeout_secs: u64,
  pub conversation_analysis_timeout_secs: u64,
  pub knowledge_extraction_timeout_secs: u64,
  pub graph_storage_timeout_secs: u64,
  pub max_concurrent_units: usize,
  pub max_retries: u32,

  pub state_dir: PathBuf,
  pub checkpoint_dir: PathBuf,

  /// When set, embedding failures fall back to deterministic pseudo-embeddings
  /// instead of leaving units without a vector.
  pub offline_mode: bool,
}

impl AppEnv {
  pub fn from_env() -> Result<Self, PipelineError> {
    dotenvy::dotenv().ok();

    let llm_api_keys: Vec<String> = required("LLM_API_KEYS")?
      .split(',')
      .map(str::trim)
      .filter(|k| !k.is_empty())
      .map(str::to_owned)
      .collect();
    if llm_api_keys.is_empty() {
      return Err(PipelineError::InvalidInput(
        "env LLM_API_KEYS must contain at least one key".to_owned(),
      ));
    }

    Ok(Self {
      neo4j_uri: required("NEO4J_URI")?,
      neo4j_user: required("NEO4J_USER")?,
      neo4j_password: required("NEO4J_PASSWORD")?,
      neo4j_database: defaulted("NEO4J_DATABASE", "neo4j"),

      llm_api_keys,
      llm_base_url: defaulted("LLM_BASE_URL", "https://api.openai.com/v1"),
      llm_model: defaulted("LLM_MODEL", "gpt-4o-mini"),

      embedding_model: defaulted("EMBEDDING_MODEL", "text-embedding-3-small"),
      embedding_dimensions: parsed("EMBEDDING_DIMENSIONS", 768)?,

      speaker_confidence_threshold: parsed("SPEAKER_CONFIDENCE_THRESHOLD", 0.5)?,
      pipeline_timeout_secs: parsed("PIPELINE_TIMEOUT", 7200)?,
      speaker_identification_timeout_secs: parsed("SPEAKER_IDENTIFICATION_TIMEOUT", 120)?,
      conversation_analysis_timeout_secs: parsed("CONVERSATION_ANALYSIS_TIMEOUT", 300)?,
      knowledge_extraction_timeout_secs: parsed("KNOWLEDGE_EXTRACTION_TIMEOUT", 600)?,
      graph_storage_timeout_secs: parsed("GRAPH_STORAGE_TIMEOUT", 300)?,
      max_concurrent_units: parsed("MAX_CONCURRENT_UNITS", 5)?,
      max_retries: parsed("MAX_RETRIES", 3)?,

      state_dir: PathBuf::from(defaulted("STATE_DIR", "data")),
      checkpoint_dir: PathBuf::from(defaulted("CHECKPOINT_DIR", "checkpoints")),

      offline_mode: parsed("OFFLINE_MODE", false)?,
    })
  }
}
