mod error;
pub use error::PipelineError;

mod env;
pub use env::AppEnv;

mod id;
pub use id::{
  content_fingerprint, entity_id, episode_id, insight_id, podcast_id, quote_id, speaker_id,
  unit_id,
};

mod text;
pub use text::{
  estimate_tokens, normalize_speaker_name, normalize_whitespace, truncate_chars, word_count,
};
