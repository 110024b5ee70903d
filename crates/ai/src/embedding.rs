use std::sync::Arc;

use async_openai::{
  Client, config::OpenAIConfig, error::OpenAIError,
  types::embeddings::CreateEmbeddingRequestArgs,
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use podseed_shared::PipelineError;

use crate::provider::ProviderError;

/// Maximum number of texts per provider request.
pub const EMBED_BATCH_SIZE: usize = 32;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
  /// One vector per input, in input order.
  async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

// ──────────────────────────────────────────────────
// OpenAI-compatible embedding provider
// ──────────────────────────────────────────────────

pub struct OpenAiEmbeddings {
  base_url: String,
  api_key: String,
  model: String,
  dimensions: usize,
}

impl OpenAiEmbeddings {
  pub fn new(
    base_url: impl Into<String>,
    api_key: impl Into<String>,
    model: impl Into<String>,
    dimensions: usize,
  ) -> Self {
    Self {
      base_url: base_url.into(),
      api_key: api_key.into(),
      model: model.into(),
      dimensions,
    }
  }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
  async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
    let config = OpenAIConfig::new()
      .with_api_key(&self.api_key)
      .with_api_base(&self.base_url);
    let client = Client::with_config(config);

    let request = CreateEmbeddingRequestArgs::default()
      .model(&self.model)
      .input(texts.to_vec())
      .dimensions(self.dimensions as u32)
      .build()
      .map_err(|err| ProviderError::Permanent(err.to_string()))?;

    let response = client
      .embeddings()
      .create(request)
      .await
      .map_err(classify_embedding_error)?;

    // Sort by index so ordering matches input
    let mut data = response.data;
    data.sort_by_key(|e| e.index);
    if data.len() != texts.len() {
      return Err(ProviderError::Transient(format!(
        "embedding count mismatch: expected {}, got {}",
        texts.len(),
        data.len()
      )));
    }
    Ok(data.into_iter().map(|e| e.embedding).collect())
  }
}

fn classify_embedding_error(err: OpenAIError) -> ProviderError {
  match err {
    OpenAIError::ApiError(api) => {
      let message = api.message.to_lowercase();
      if message.contains("quota") || message.contains("rate limit") {
        ProviderError::Quota(api.message)
      } else {
        ProviderError::Transient(api.message)
      }
    }
    other => ProviderError::Transient(other.to_string()),
  }
}

// ──────────────────────────────────────────────────
// Embedder
// ──────────────────────────────────────────────────

/// Produces fixed-dimension, L2-normalized unit vectors.
///
/// Empty text maps to the zero vector without a provider call. When the
/// provider fails, offline mode substitutes deterministic hashed
/// pseudo-embeddings; otherwise the affected texts come back as `None` and
/// the caller persists the unit without a vector.
pub struct Embedder {
  provider: Arc<dyn EmbeddingProvider>,
  dimensions: usize,
  offline_mode: bool,
}

impl Embedder {
  pub fn new(provider: Arc<dyn EmbeddingProvider>, dimensions: usize, offline_mode: bool) -> Self {
    Self {
      provider,
      dimensions,
      offline_mode,
    }
  }

  pub const fn dimensions(&self) -> usize {
    self.dimensions
  }

  pub async fn embed(
    &self,
    text: &str,
    cancel: &CancellationToken,
  ) -> Result<Option<Vec<f32>>, PipelineError> {
    let mut vectors = self.embed_batch(&[text.to_owned()], cancel).await?;
    Ok(vectors.pop().flatten())
  }

  /// Embed many texts, batching provider calls at [`EMBED_BATCH_SIZE`].
  /// Cancellation is observed between batches.
  pub async fn embed_batch(
    &self,
    texts: &[String],
    cancel: &CancellationToken,
  ) -> Result<Vec<Option<Vec<f32>>>, PipelineError> {
    let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

    // Empty inputs resolve locally to the zero vector.
    let pending: Vec<usize> = texts
      .iter()
      .enumerate()
      .filter_map(|(i, text)| {
        if text.trim().is_empty() {
          results[i] = Some(vec![0.0; self.dimensions]);
          None
        } else {
          Some(i)
        }
      })
      .collect();

    for chunk in pending.chunks(EMBED_BATCH_SIZE) {
      if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
      }
      let batch: Vec<String> = chunk.iter().map(|&i| texts[i].clone()).collect();
      match self.provider.embed_batch(&batch).await {
        Ok(vectors) => {
          for (&i, vector) in chunk.iter().zip(vectors) {
            results[i] = self.fit(vector);
          }
        }
        Err(err) if self.offline_mode => {
          tracing::warn!(error = %err, "embedding provider failed; using offline pseudo-embeddings");
          for &i in chunk {
            results[i] = Some(self.pseudo_embedding(&texts[i]));
          }
        }
        Err(err) => {
          tracing::warn!(error = %err, count = chunk.len(), "embedding provider failed; units will have no vector");
        }
      }
    }

    Ok(results)
  }

  /// Force a provider vector into dimension D, L2-normalized. A short vector
  /// means the provider ignored the dimension request; that unit gets no
  /// embedding rather than a corrupt one.
  fn fit(&self, mut vector: Vec<f32>) -> Option<Vec<f32>> {
    if vector.len() < self.dimensions {
      tracing::warn!(
        got = vector.len(),
        want = self.dimensions,
        "embedding dimension too small; dropping vector"
      );
      return None;
    }
    vector.truncate(self.dimensions);
    l2_normalize(&mut vector);
    Some(vector)
  }

  /// Deterministic stand-in vector: tokens hashed into D buckets, then
  /// normalized. Only reached in offline mode after a provider failure.
  fn pseudo_embedding(&self, text: &str) -> Vec<f32> {
    let mut vector = vec![0.0_f32; self.dimensions];
    for token in text.to_lowercase().split_whitespace() {
      let bucket = (fnv1a(token.as_bytes()) as usize) % self.dimensions;
      vector[bucket] += 1.0;
    }
    l2_normalize(&mut vector);
    vector
  }
}

fn l2_normalize(vector: &mut [f32]) {
  let norm_sq: f32 = vector.iter().map(|x| x * x).sum();
  let norm = norm_sq.sqrt();
  if norm > 1e-12 {
    for x in vector.iter_mut() {
      *x /= norm;
    }
  }
}

/// FNV-1a, inlined so pseudo-embeddings stay stable across platforms and
/// releases (std's hasher is not).
fn fnv1a(bytes: &[u8]) -> u64 {
  let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
  for &b in bytes {
    hash ^= u64::from(b);
    hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
  }
  hash
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  struct FixedProvider {
    dimensions: usize,
    calls: AtomicUsize,
  }

  #[async_trait]
  impl EmbeddingProvider for FixedProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(texts.iter().map(|_| vec![3.0; self.dimensions]).collect())
    }
  }

  struct FailingProvider;

  #[async_trait]
  impl EmbeddingProvider for FailingProvider {
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
      Err(ProviderError::Transient("down".to_owned()))
    }
  }

  #[tokio::test]
  async fn vectors_come_back_normalized() {
    let provider = Arc::new(FixedProvider {
      dimensions: 4,
      calls: AtomicUsize::new(0),
    });
    let embedder = Embedder::new(provider, 4, false);
    let vector = embedder
      .embed("hello world", &CancellationToken::new())
      .await
      .unwrap()
      .unwrap();
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
  }

  #[tokio::test]
  async fn empty_text_yields_the_zero_vector_without_a_call() {
    let provider = Arc::new(FixedProvider {
      dimensions: 4,
      calls: AtomicUsize::new(0),
    });
    let embedder = Embedder::new(
      Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
      4,
      false,
    );
    let vector = embedder
      .embed("   ", &CancellationToken::new())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(vector, vec![0.0; 4]);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn batches_cap_at_thirty_two() {
    let provider = Arc::new(FixedProvider {
      dimensions: 4,
      calls: AtomicUsize::new(0),
    });
    let embedder = Embedder::new(
      Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
      4,
      false,
    );
    let texts: Vec<String> = (0..70).map(|i| format!("text {i}")).collect();
    let vectors = embedder
      .embed_batch(&texts, &CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(vectors.len(), 70);
    assert!(vectors.iter().all(Option::is_some));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3); // 32 + 32 + 6
  }

  #[tokio::test]
  async fn provider_failure_without_offline_mode_drops_vectors() {
    let embedder = Embedder::new(Arc::new(FailingProvider), 4, false);
    let vectors = embedder
      .embed_batch(&["a".to_owned()], &CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(vectors, vec![None]);
  }

  #[tokio::test]
  async fn provider_failure_in_offline_mode_uses_pseudo_embeddings() {
    let embedder = Embedder::new(Arc::new(FailingProvider), 8, true);
    let first = embedder
      .embed("the same text", &CancellationToken::new())
      .await
      .unwrap()
      .unwrap();
    let second = embedder
      .embed("the same text", &CancellationToken::new())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(first, second);
    let norm: f32 = first.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
  }
}
