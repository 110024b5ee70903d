mod provider;
pub use provider::{CompletionProvider, CompletionRequest, OpenAiProvider, ProviderError};

mod keys;
pub use keys::{KeyPool, KeyQuota, KeySnapshot};

mod client;
pub use client::{CompletionOptions, LlmClient, RetryPolicy};

mod json_repair;
pub use json_repair::{extract_json, parse_lenient, parse_lenient_value, repair_json};

mod schema;
pub use schema::strict_schema_for;

mod embedding;
pub use embedding::{EMBED_BATCH_SIZE, Embedder, EmbeddingProvider, OpenAiEmbeddings};
