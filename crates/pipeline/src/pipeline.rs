use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use podseed_ai::{Embedder, LlmClient};
use podseed_core::{
  Episode, KnowledgeExtractor, MeaningfulUnit, Podcast, SegmenterConfig, SpeakerIdentifier,
  UnitKnowledge, UnitSegmenter, assemble_episode, deterministic_units, fallback_speaker_map,
};
use podseed_graph::GraphStore;
use podseed_shared::{AppEnv, PipelineError, content_fingerprint, episode_id, podcast_id};
use podseed_vtt::{ParseOptions, parse_vtt, validate_vtt_file};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::report::{EpisodeReport, compute_status};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub pipeline_timeout: Duration,
  pub speaker_identification_timeout: Duration,
  pub conversation_analysis_timeout: Duration,
  /// Per-unit extraction deadline.
  pub knowledge_extraction_timeout: Duration,
  /// Per-transaction graph write deadline.
  pub graph_storage_timeout: Duration,
  pub max_concurrent_units: usize,
  pub max_retries: u32,
  pub speaker_confidence_threshold: f32,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      pipeline_timeout: Duration::from_secs(7200),
      speaker_identification_timeout: Duration::from_secs(120),
      conversation_analysis_timeout: Duration::from_secs(300),
      knowledge_extraction_timeout: Duration::from_secs(600),
      graph_storage_timeout: Duration::from_secs(300),
      max_concurrent_units: 5,
      max_retries: 3,
      speaker_confidence_threshold: 0.5,
    }
  }
}

impl PipelineConfig {
  pub fn from_env(env: &AppEnv) -> Self {
    Self {
      pipeline_timeout: Duration::from_secs(env.pipeline_timeout_secs),
      speaker_identification_timeout: Duration::from_secs(
        env.speaker_identification_timeout_secs,
      ),
      conversation_analysis_timeout: Duration::from_secs(env.conversation_analysis_timeout_secs),
      knowledge_extraction_timeout: Duration::from_secs(env.knowledge_extraction_timeout_secs),
      graph_storage_timeout: Duration::from_secs(env.graph_storage_timeout_secs),
      max_concurrent_units: env.max_concurrent_units,
      max_retries: env.max_retries,
      speaker_confidence_threshold: env.speaker_confidence_threshold,
    }
  }
}

/// One VTT file to ingest.
#[derive(Debug, Clone)]
pub struct EpisodeRequest {
  pub vtt_path: PathBuf,
  pub podcast_name: String,
  pub episode_title: String,
  pub episode_description: String,
  pub published_date: Option<String>,
  pub youtube_url: Option<String>,
}

/// The per-episode pipeline: parse → speakers → segmentation → extraction →
/// embedding → graph upsert. Collaborators are constructed at startup and
/// threaded through; one instance can run episodes back to back, and a
/// caller-supplied pool may run several instances in parallel.
pub struct Pipeline {
  llm: Arc<LlmClient>,
  embedder: Arc<Embedder>,
  store: Arc<GraphStore>,
  checkpoints: CheckpointStore,
  config: PipelineConfig,
}

impl Pipeline {
  pub fn new(
    llm: Arc<LlmClient>,
    embedder: Arc<Embedder>,
    store: Arc<GraphStore>,
    checkpoints: CheckpointStore,
    config: PipelineConfig,
  ) -> Self {
    Self {
      llm,
      embedder,
      store,
      checkpoints,
      config,
    }
  }

  /// Replace the stage configuration (e.g. a CLI timeout override).
  pub fn with_config(mut self, config: PipelineConfig) -> Self {
    self.config = config;
    self
  }

  /// Process one episode end to end.
  ///
  /// The overall deadline cancels in-flight work; whatever units committed
  /// stay committed and the episode is finalized with a degraded status.
  pub async fn process_episode(
    &self,
    request: EpisodeRequest,
    cancel: CancellationToken,
  ) -> Result<EpisodeReport, PipelineError> {
    tokio::select! {
      result = self.run_episode(&request, &cancel) => result,
      () = tokio::time::sleep(self.config.pipeline_timeout) => {
        tracing::warn!(
          timeout_secs = self.config.pipeline_timeout.as_secs(),
          "pipeline deadline exceeded; cancelling in-flight work"
        );
        cancel.cancel();
        self.flush_after_timeout(&request).await
      }
    }
  }

  /// The retrieval primitive over the populated graph, for the external
  /// chat collaborator.
  pub async fn search(
    &self,
    query: &str,
    top_k: usize,
    cancel: &CancellationToken,
  ) -> Result<Vec<podseed_graph::RetrievedUnit>, PipelineError> {
    self
      .store
      .search_units(&self.embedder, query, top_k, cancel)
      .await
  }

  pub fn key_snapshot(&self) -> Vec<podseed_ai::KeySnapshot> {
    self.llm.key_snapshot()
  }

  async fn run_episode(
    &self,
    request: &EpisodeRequest,
    cancel: &CancellationToken,
  ) -> Result<EpisodeReport, PipelineError> {
    // ── C1: parse ──
    validate_vtt_file(&request.vtt_path)?;
    let bytes = tokio::fs::read(&request.vtt_path).await?;
    let text = String::from_utf8(bytes.clone())
      .map_err(|_| PipelineError::InvalidInput("VTT file is not valid UTF-8".to_owned()))?;
    let captions = parse_vtt(&text, &ParseOptions::default())?;
    if captions.is_empty() {
      return Err(PipelineError::InvalidInput(
        "VTT file contains no cues".to_owned(),
      ));
    }

    let podcast_node_id = podcast_id(&request.podcast_name);
    let discriminator = request
      .published_date
      .clone()
      .unwrap_or_else(|| content_fingerprint(&bytes));
    let episode_node_id = episode_id(&podcast_node_id, &request.episode_title, &discriminator);
    let duration_seconds = captions.last().expect("non-empty").end_time;

    let podcast = Podcast {
      id: podcast_node_id.clone(),
      name: request.podcast_name.clone(),
      description: String::new(),
    };
    let episode = Episode {
      id: episode_node_id.clone(),
      title: request.episode_title.clone(),
      podcast_name: request.podcast_name.clone(),
      published_date: request.published_date.clone(),
      duration_seconds,
      vtt_path: request.vtt_path.display().to_string(),
      youtube_url: request.youtube_url.clone(),
    };

    tracing::info!(
      episode_id = %episode_node_id,
      captions = captions.len(),
      duration_seconds,
      "episode parsed"
    );

    let mut checkpoint = self
      .checkpoints
      .load(&episode_node_id)
      .unwrap_or_else(|| Checkpoint::new(&episode_node_id));
    checkpoint.stage = "parsed".to_owned();
    self.checkpoints.save(&checkpoint)?;

    // ── C2: speaker identification ──
    let identifier = SpeakerIdentifier::new(&self.llm, self.config.speaker_confidence_threshold);
    let speaker_map = match tokio::time::timeout(
      self.config.speaker_identification_timeout,
      identifier.identify(
        &podcast_node_id,
        &request.episode_title,
        &request.episode_description,
        &captions,
        cancel,
      ),
    )
    .await
    {
      Ok(result) => result?,
      Err(_elapsed) => {
        tracing::warn!("speaker identification timed out; using fallback roles");
        fallback_speaker_map(&podcast_node_id, &captions)
      }
    };
    checkpoint.stage = "speakers".to_owned();
    self.checkpoints.save(&checkpoint)?;

    // ── C3: segmentation ──
    let segmenter_config = SegmenterConfig::default();
    let segmenter = UnitSegmenter::new(&self.llm, segmenter_config.clone());
    let mut units = match tokio::time::timeout(
      self.config.conversation_analysis_timeout,
      segmenter.segment(&episode, &captions, &speaker_map, cancel),
    )
    .await
    {
      Ok(result) => result?,
      Err(_elapsed) => {
        tracing::warn!("segmentation timed out; using deterministic splitter");
        deterministic_units(&segmenter_config, &episode, &captions, &speaker_map)
      }
    };
    checkpoint.stage = "segmented".to_owned();
    checkpoint.units_total = units.len();
    self.checkpoints.save(&checkpoint)?;
    tracing::info!(units = units.len(), "segmentation complete");

    // ── Episode shell before any unit lands ──
    let unit_ids: Vec<String> = units.iter().map(|u| u.id.clone()).collect();
    tokio::time::timeout(
      self.config.graph_storage_timeout,
      self.store.upsert_episode_shell(&podcast, &episode, &unit_ids),
    )
    .await
    .map_err(|_| PipelineError::Store("episode upsert timed out".to_owned()))??;

    // ── C4: extraction fan-out over pending units ──
    let pending: Vec<usize> = (0..units.len())
      .filter(|&i| !checkpoint.is_committed(&units[i].id))
      .collect();
    let knowledge_by_index = self
      .extract_units(request, &units, &pending, cancel)
      .await?;
    let combined_extraction_calls = knowledge_by_index
      .values()
      .filter(|k| !k.extraction_failed)
      .count();

    // ── C5: embeddings, batched ──
    let texts: Vec<String> = pending.iter().map(|&i| embedding_input(&units[i])).collect();
    match self.embedder.embed_batch(&texts, cancel).await {
      Ok(vectors) => {
        for (&i, vector) in pending.iter().zip(vectors) {
          units[i].embedding = vector;
        }
      }
      Err(PipelineError::Cancelled) => {
        tracing::warn!("embedding cancelled; continuing to flush");
      }
      Err(err) => {
        tracing::warn!(error = %err, "embedding failed; units will have no vector");
      }
    }

    // ── Assemble the episode graph ──
    let mut knowledge_by_index = knowledge_by_index;
    let extracted: Vec<(MeaningfulUnit, UnitKnowledge)> = units
      .into_iter()
      .enumerate()
      .map(|(i, unit)| {
        let knowledge = knowledge_by_index.remove(&i).unwrap_or_default();
        (unit, knowledge)
      })
      .collect();
    let graph = assemble_episode(podcast, episode, speaker_map.speakers(), extracted);

    // ── C6: serialized, in-order unit writes ──
    checkpoint.stage = "writing".to_owned();
    self.checkpoints.save(&checkpoint)?;

    let mut prev_committed: Option<String> = None;
    let mut units_write_failed = 0usize;
    for graph_unit in &graph.units {
      let unit_id = graph_unit.unit.id.clone();
      if checkpoint.is_committed(&unit_id) {
        prev_committed = Some(unit_id);
        continue;
      }
      if cancel.is_cancelled() {
        break;
      }
      let write = tokio::time::timeout(
        self.config.graph_storage_timeout,
        self
          .store
          .write_unit(prev_committed.as_deref(), graph_unit, &graph.speakers),
      )
      .await;
      match write {
        Ok(Ok(())) => {
          checkpoint.committed_units.push(unit_id.clone());
          self.checkpoints.save(&checkpoint)?;
          prev_committed = Some(unit_id);
        }
        Ok(Err(err)) => {
          tracing::warn!(unit_id = %unit_id, error = %err, "unit skipped after write retries");
          units_write_failed += 1;
        }
        Err(_elapsed) => {
          tracing::warn!(unit_id = %unit_id, "unit write timed out; skipping");
          units_write_failed += 1;
        }
      }
    }

    // ── Finalize ──
    let units_total = graph.units.len();
    let units_extraction_failed = graph.units.iter().filter(|u| u.extraction_failed).count();
    let units_not_committed = graph
      .units
      .iter()
      .filter(|u| !checkpoint.is_committed(&u.unit.id) && !u.extraction_failed)
      .count();
    let status = compute_status(units_total, units_extraction_failed, units_not_committed);

    if let Err(err) = self
      .store
      .finalize_episode(&graph.episode.id, status)
      .await
    {
      tracing::warn!(error = %err, "failed to finalize episode status");
    }
    checkpoint.stage = "done".to_owned();
    self.checkpoints.save(&checkpoint)?;

    let report = EpisodeReport {
      episode_id: graph.episode.id.clone(),
      status,
      units_total,
      units_committed: checkpoint.committed_units.len(),
      units_extraction_failed,
      units_write_failed,
      combined_extraction_calls,
      timed_out: false,
    };
    tracing::info!(
      episode_id = %report.episode_id,
      status = %report.status,
      units_total = report.units_total,
      units_committed = report.units_committed,
      units_extraction_failed = report.units_extraction_failed,
      "episode processed"
    );

    if cancel.is_cancelled() {
      return Err(PipelineError::Cancelled);
    }
    Ok(report)
  }

  async fn extract_units(
    &self,
    request: &EpisodeRequest,
    units: &[MeaningfulUnit],
    pending: &[usize],
    cancel: &CancellationToken,
  ) -> Result<HashMap<usize, UnitKnowledge>, PipelineError> {
    let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_units));
    let mut join_set: JoinSet<(usize, Result<UnitKnowledge, PipelineError>)> = JoinSet::new();

    for &index in pending {
      let unit = units[index].clone();
      let llm = Arc::clone(&self.llm);
      let semaphore = Arc::clone(&semaphore);
      let cancel = cancel.clone();
      let podcast_name = request.podcast_name.clone();
      let episode_title = request.episode_title.clone();
      let extraction_timeout = self.config.knowledge_extraction_timeout;
      let max_retries = self.config.max_retries;

      join_set.spawn(async move {
        let _permit = semaphore.acquire_owned().await.expect("semaphore open");
        if cancel.is_cancelled() {
          return (index, Err(PipelineError::Cancelled));
        }
        let extractor = KnowledgeExtractor::new(&llm, max_retries);
        let result = match tokio::time::timeout(
          extraction_timeout,
          extractor.extract(&podcast_name, &episode_title, &unit, &cancel),
        )
        .await
        {
          Ok(result) => result,
          Err(_elapsed) => {
            tracing::warn!(unit_id = %unit.id, "unit extraction timed out");
            Ok(UnitKnowledge {
              extraction_failed: true,
              ..UnitKnowledge::default()
            })
          }
        };
        (index, result)
      });
    }

    let mut knowledge_by_index: HashMap<usize, UnitKnowledge> = HashMap::new();
    while let Some(joined) = join_set.join_next().await {
      let (index, result) =
        joined.map_err(|err| PipelineError::Other(anyhow::anyhow!("extraction task: {err}")))?;
      let knowledge = match result {
        Ok(knowledge) => knowledge,
        Err(PipelineError::Cancelled) => UnitKnowledge {
          extraction_failed: true,
          ..UnitKnowledge::default()
        },
        Err(err) => {
          tracing::warn!(error = %err, "unit extraction errored; storing empty");
          UnitKnowledge {
            extraction_failed: true,
            ..UnitKnowledge::default()
          }
        }
      };
      knowledge_by_index.insert(index, knowledge);
    }
    Ok(knowledge_by_index)
  }

  /// Best-effort finalization after the overall deadline fired: the units
  /// that committed are already durable, so derive a status from the
  /// checkpoint and stamp the episode.
  async fn flush_after_timeout(
    &self,
    request: &EpisodeRequest,
  ) -> Result<EpisodeReport, PipelineError> {
    let bytes = tokio::fs::read(&request.vtt_path).await?;
    let podcast_node_id = podcast_id(&request.podcast_name);
    let discriminator = request
      .published_date
      .clone()
      .unwrap_or_else(|| content_fingerprint(&bytes));
    let episode_node_id = episode_id(&podcast_node_id, &request.episode_title, &discriminator);

    let checkpoint = self
      .checkpoints
      .load(&episode_node_id)
      .unwrap_or_else(|| Checkpoint::new(&episode_node_id));
    let units_total = checkpoint.units_total;
    let units_committed = checkpoint.committed_units.len();
    let status = compute_status(units_total, 0, units_total.saturating_sub(units_committed));

    let finalize = tokio::time::timeout(
      self.config.graph_storage_timeout,
      self.store.finalize_episode(&episode_node_id, status),
    )
    .await;
    if !matches!(finalize, Ok(Ok(()))) {
      tracing::warn!("failed to finalize episode after timeout");
    }

    Ok(EpisodeReport {
      episode_id: episode_node_id,
      status,
      units_total,
      units_committed,
      units_extraction_failed: 0,
      units_write_failed: units_total.saturating_sub(units_committed),
      combined_extraction_calls: 0,
      timed_out: true,
    })
  }
}

/// What C5 embeds for a unit: the summary (when present) ahead of the full
/// caption text.
fn embedding_input(unit: &MeaningfulUnit) -> String {
  if unit.summary.is_empty() {
    unit.text.clone()
  } else {
    format!("{}\n{}", unit.summary, unit.text)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn embedding_input_prefixes_the_summary() {
    let mut unit = MeaningfulUnit {
      id: "u".to_owned(),
      episode_id: "e".to_owned(),
      unit_type: podseed_core::UnitType::Other,
      summary: "A summary.".to_owned(),
      themes: Vec::new(),
      start_time: 0.0,
      end_time: 1.0,
      segment_start: 0,
      segment_end: 0,
      segment_count: 1,
      text: "caption text".to_owned(),
      primary_speaker: String::new(),
      speaker_distribution: HashMap::new(),
      embedding: None,
    };
    assert_eq!(embedding_input(&unit), "A summary.\ncaption text");
    unit.summary.clear();
    assert_eq!(embedding_input(&unit), "caption text");
  }

  #[test]
  fn config_defaults_match_the_stage_budgets() {
    let config = PipelineConfig::default();
    assert_eq!(config.pipeline_timeout, Duration::from_secs(7200));
    assert_eq!(config.speaker_identification_timeout, Duration::from_secs(120));
    assert_eq!(config.conversation_analysis_timeout, Duration::from_secs(300));
    assert_eq!(config.knowledge_extraction_timeout, Duration::from_secs(600));
    assert_eq!(config.graph_storage_timeout, Duration::from_secs(300));
    assert_eq!(config.max_concurrent_units, 5);
  }
}
