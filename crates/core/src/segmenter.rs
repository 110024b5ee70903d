use std::collections::HashMap;

use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use podseed_ai::{CompletionOptions, LlmClient};
use podseed_shared::{PipelineError, normalize_whitespace, truncate_chars, unit_id, word_count};
use podseed_vtt::Caption;

use crate::model::{Episode, MeaningfulUnit, UnitType};
use crate::prompts;
use crate::speakers::SpeakerMap;

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
  /// Expected captions per unit; the target count is N divided by this.
  pub target_captions_per_unit: usize,
  /// Allowed deviation from the target unit count.
  pub count_tolerance: f64,
  pub min_unit_captions: usize,
  pub max_unit_captions: usize,
  /// Giant-unit detection only applies above this caption count.
  pub giant_unit_threshold: usize,
  /// Deterministic splitter chunk bounds.
  pub fallback_min: usize,
  pub fallback_max: usize,
  /// Silence gap the deterministic splitter treats as a boundary.
  pub fallback_silence_secs: f64,
  /// Below this caption count the LLM is skipped entirely.
  pub min_captions_for_llm: usize,
  pub summary_max_chars: usize,
  pub max_themes: usize,
  pub theme_max_chars: usize,
}

impl Default for SegmenterConfig {
  fn default() -> Self {
    Self {
      target_captions_per_unit: 20,
      count_tolerance: 0.3,
      min_unit_captions: 5,
      max_unit_captions: 60,
      giant_unit_threshold: 30,
      fallback_min: 15,
      fallback_max: 25,
      fallback_silence_secs: 15.0,
      min_captions_for_llm: 10,
      summary_max_chars: 300,
      max_themes: 8,
      theme_max_chars: 64,
    }
  }
}

// ──────────────────────────────────────────────────
// LLM plan shape
// ──────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct SegmentationPlan {
  units: Vec<PlannedUnit>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct PlannedUnit {
  start_index: usize,
  end_index: usize,
  unit_type: String,
  summary: String,
  #[serde(default)]
  themes: Vec<String>,
}

/// A validated, repaired plan entry with inclusive caption bounds.
#[derive(Debug, Clone)]
struct PlanUnit {
  start: usize,
  end: usize,
  unit_type: UnitType,
  summary: String,
  themes: Vec<String>,
}

// ──────────────────────────────────────────────────
// Segmenter
// ──────────────────────────────────────────────────

pub struct UnitSegmenter<'a> {
  llm: &'a LlmClient,
  config: SegmenterConfig,
}

impl<'a> UnitSegmenter<'a> {
  pub fn new(llm: &'a LlmClient, config: SegmenterConfig) -> Self {
    Self { llm, config }
  }

  /// Group captions into meaningful units.
  ///
  /// Plan source order: LLM → LLM with a strict re-prompt → deterministic
  /// splitter. Whatever the source, the result covers every caption exactly
  /// once, in order, with bounded unit sizes.
  pub async fn segment(
    &self,
    episode: &Episode,
    captions: &[Caption],
    speakers: &SpeakerMap,
    cancel: &CancellationToken,
  ) -> Result<Vec<MeaningfulUnit>, PipelineError> {
    if captions.is_empty() {
      return Err(PipelineError::InvalidInput(
        "transcript has no captions".to_owned(),
      ));
    }
    let n = captions.len();
    let expected = expected_units(&self.config, n);

    let plan = 'plan: {
      if n >= self.config.min_captions_for_llm {
        for strict in [false, true] {
          if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
          }
          match self.llm_plan(episode, captions, expected, strict, cancel).await {
            Ok(planned) => match validate_and_repair(&self.config, planned, n) {
              Ok(valid) => break 'plan valid,
              Err(reason) => {
                tracing::warn!(strict, reason, "segmentation plan rejected");
              }
            },
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
              tracing::warn!(strict, error = %err, "segmentation LLM call failed");
            }
          }
        }
        tracing::warn!("segmentation falling back to deterministic splitter");
      }
      fallback_plan(&self.config, captions)
    };

    Ok(build_units(plan, episode, captions, speakers))
  }

  async fn llm_plan(
    &self,
    episode: &Episode,
    captions: &[Caption],
    expected: usize,
    strict: bool,
    cancel: &CancellationToken,
  ) -> Result<Vec<PlannedUnit>, PipelineError> {
    let prompt = if strict {
      prompts::segmentation_prompt_strict(&episode.title, captions, expected)
    } else {
      prompts::segmentation_prompt(&episode.title, captions, expected)
    };
    let options = CompletionOptions {
      temperature: if strict { 0.1 } else { 0.3 },
      max_tokens: 8192,
      ..CompletionOptions::default()
    };
    let plan: SegmentationPlan = self
      .llm
      .complete_json("segmentation_plan", &prompt, &options, cancel)
      .await?;
    Ok(plan.units)
  }
}

/// Deterministic segmentation without the LLM, used directly when the
/// analysis stage times out.
pub fn deterministic_units(
  config: &SegmenterConfig,
  episode: &Episode,
  captions: &[Caption],
  speakers: &SpeakerMap,
) -> Vec<MeaningfulUnit> {
  build_units(fallback_plan(config, captions), episode, captions, speakers)
}

fn expected_units(config: &SegmenterConfig, n: usize) -> usize {
  ((n as f64 / config.target_captions_per_unit as f64).round() as usize).max(1)
}

/// Enforce the segmentation contract on an LLM plan: coverage, contiguity,
/// bounded unit sizes, and a sane unit count. Small boundary errors are
/// repaired; structural failures reject the plan.
fn validate_and_repair(
  config: &SegmenterConfig,
  mut planned: Vec<PlannedUnit>,
  n: usize,
) -> Result<Vec<PlanUnit>, &'static str> {
  if planned.is_empty() {
    return Err("plan contains no units");
  }
  planned.sort_by_key(|u| u.start_index);

  // The classic degenerate answer: one unit swallowing the episode.
  if planned.len() == 1 && n > config.giant_unit_threshold {
    let only = &planned[0];
    if only.end_index.saturating_sub(only.start_index) + 1 > config.max_unit_captions {
      return Err("single unit covers the whole transcript");
    }
  }

  // Snap boundaries: first unit starts at 0, each start follows the previous
  // end, the last unit runs to the final caption.
  let mut repaired: Vec<PlanUnit> = Vec::with_capacity(planned.len());
  let mut cursor = 0usize;
  for unit in &planned {
    if cursor > n - 1 {
      break;
    }
    let end = unit.end_index.clamp(cursor, n - 1);
    repaired.push(PlanUnit {
      start: cursor,
      end,
      unit_type: UnitType::coerce(&unit.unit_type),
      summary: clean_summary(config, &unit.summary),
      themes: clean_themes(config, &unit.themes),
    });
    cursor = end + 1;
  }
  if let Some(last) = repaired.last_mut()
    && last.end < n - 1
  {
    last.end = n - 1;
  }

  // Fold runts into their predecessor.
  let mut folded: Vec<PlanUnit> = Vec::with_capacity(repaired.len());
  for unit in repaired {
    let count = unit.end - unit.start + 1;
    match folded.last_mut() {
      Some(prev) if count < config.min_unit_captions => {
        prev.end = unit.end;
      }
      _ => folded.push(unit),
    }
  }

  for unit in &folded {
    if unit.end - unit.start + 1 > config.max_unit_captions {
      return Err("unit exceeds the maximum caption count");
    }
  }

  let expected = expected_units(config, n);
  let lower = ((expected as f64) * (1.0 - config.count_tolerance)).floor() as usize;
  let upper = ((expected as f64) * (1.0 + config.count_tolerance)).ceil() as usize;
  if folded.len() < lower.max(1) || folded.len() > upper {
    return Err("unit count outside the expected range");
  }

  Ok(folded)
}

/// Deterministic splitter: chunks of `fallback_min..=fallback_max` captions,
/// closed early at a speaker change or a long silence.
fn fallback_plan(config: &SegmenterConfig, captions: &[Caption]) -> Vec<PlanUnit> {
  let n = captions.len();
  let mut units: Vec<PlanUnit> = Vec::new();
  let mut start = 0usize;

  for i in 1..n {
    let count = i - start;
    let speaker_changed = captions[i].speaker_tag != captions[i - 1].speaker_tag;
    let silence = captions[i].start_time - captions[i - 1].end_time;
    let at_boundary = speaker_changed || silence >= config.fallback_silence_secs;
    if count >= config.fallback_max || (count >= config.fallback_min && at_boundary) {
      units.push(fallback_unit(config, captions, start, i - 1));
      start = i;
    }
  }
  units.push(fallback_unit(config, captions, start, n - 1));

  // An undersized tail joins the previous chunk.
  if units.len() >= 2 {
    let tail_count = {
      let last = units.last().expect("non-empty");
      last.end - last.start + 1
    };
    if tail_count < config.min_unit_captions {
      let tail = units.pop().expect("non-empty");
      units.last_mut().expect("non-empty").end = tail.end;
    }
  }
  units
}

fn fallback_unit(config: &SegmenterConfig, captions: &[Caption], start: usize, end: usize) -> PlanUnit {
  PlanUnit {
    start,
    end,
    unit_type: UnitType::Other,
    summary: clean_summary(config, &captions[start].text),
    themes: Vec::new(),
  }
}

fn clean_summary(config: &SegmenterConfig, raw: &str) -> String {
  truncate_chars(&normalize_whitespace(raw), config.summary_max_chars)
}

fn clean_themes(config: &SegmenterConfig, raw: &[String]) -> Vec<String> {
  let mut themes: Vec<String> = Vec::new();
  for theme in raw {
    let cleaned = truncate_chars(
      &normalize_whitespace(&theme.to_lowercase()),
      config.theme_max_chars,
    );
    if !cleaned.is_empty() && !themes.contains(&cleaned) {
      themes.push(cleaned);
    }
    if themes.len() == config.max_themes {
      break;
    }
  }
  themes
}

fn build_units(
  plan: Vec<PlanUnit>,
  episode: &Episode,
  captions: &[Caption],
  speakers: &SpeakerMap,
) -> Vec<MeaningfulUnit> {
  plan
    .into_iter()
    .map(|planned| {
      let covered = &captions[planned.start..=planned.end];
      let start_time = covered.first().expect("unit covers captions").start_time;
      let mut end_time = covered.last().expect("unit covers captions").end_time;
      if end_time <= start_time {
        // Zero-duration cues exist in the wild; keep the interval open.
        end_time = start_time + 0.001;
      }

      let text = covered
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

      let (primary_speaker, speaker_distribution) = speaker_stats(covered, speakers);

      MeaningfulUnit {
        id: unit_id(&episode.id, start_time, end_time),
        episode_id: episode.id.clone(),
        unit_type: planned.unit_type,
        summary: planned.summary,
        themes: planned.themes,
        start_time,
        end_time,
        segment_start: planned.start,
        segment_end: planned.end,
        segment_count: planned.end - planned.start + 1,
        text,
        primary_speaker,
        speaker_distribution,
        embedding: None,
      }
    })
    .collect()
}

/// Per-speaker token fractions over the covered captions, from token counts
/// rather than anything LLM-reported.
fn speaker_stats(captions: &[Caption], speakers: &SpeakerMap) -> (String, HashMap<String, f64>) {
  let mut counts: HashMap<String, usize> = HashMap::new();
  let mut total = 0usize;
  for caption in captions {
    let speaker = speakers.resolve(caption.speaker_tag.as_deref());
    let words = word_count(&caption.text);
    *counts.entry(speaker.name.clone()).or_default() += words;
    total += words;
  }
  if total == 0 {
    return (String::new(), HashMap::new());
  }

  let distribution: HashMap<String, f64> = counts
    .iter()
    .map(|(name, count)| (name.clone(), *count as f64 / total as f64))
    .collect();
  let primary = counts
    .into_iter()
    .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
    .map(|(name, _)| name)
    .unwrap_or_default();
  (primary, distribution)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn caption(index: usize, tag: &str, text: &str) -> Caption {
    Caption {
      index,
      start_time: index as f64 * 5.0,
      end_time: index as f64 * 5.0 + 4.5,
      speaker_tag: Some(tag.to_owned()),
      text: text.to_owned(),
    }
  }

  fn conversation(n: usize) -> Vec<Caption> {
    (0..n)
      .map(|i| {
        let tag = if (i / 12) % 2 == 0 { "Host" } else { "Guest" };
        caption(i, tag, "some words spoken here by the speaker")
      })
      .collect()
  }

  fn planned(start: usize, end: usize) -> PlannedUnit {
    PlannedUnit {
      start_index: start,
      end_index: end,
      unit_type: "discussion".to_owned(),
      summary: "A summary.".to_owned(),
      themes: vec!["Theme".to_owned()],
    }
  }

  #[test]
  fn rejects_one_giant_unit() {
    let config = SegmenterConfig::default();
    let err = validate_and_repair(&config, vec![planned(0, 312)], 313).unwrap_err();
    assert!(err.contains("whole transcript"));
  }

  #[test]
  fn rejects_empty_plans() {
    let config = SegmenterConfig::default();
    assert!(validate_and_repair(&config, vec![], 100).is_err());
  }

  #[test]
  fn repairs_gaps_and_overlaps_into_full_coverage() {
    let config = SegmenterConfig::default();
    // Gap between 39 and 45, overlap between 80 and 75.
    let plan = vec![planned(0, 39), planned(45, 80), planned(75, 99)];
    let units = validate_and_repair(&config, plan, 100).unwrap();
    assert_eq!(units.first().unwrap().start, 0);
    assert_eq!(units.last().unwrap().end, 99);
    for pair in units.windows(2) {
      assert_eq!(pair[1].start, pair[0].end + 1);
    }
  }

  #[test]
  fn rejects_unit_counts_far_from_target() {
    let config = SegmenterConfig::default();
    // 200 captions → expected 10 units; 2 units is outside ±30 %.
    let plan = vec![planned(0, 59), planned(60, 199)];
    assert!(validate_and_repair(&config, plan, 200).is_err());
  }

  #[test]
  fn folds_runt_units_into_their_predecessor() {
    let config = SegmenterConfig {
      count_tolerance: 0.5,
      ..SegmenterConfig::default()
    };
    let plan = vec![
      planned(0, 19),
      planned(20, 22), // 3 captions, below the minimum of 5
      planned(23, 39),
    ];
    let units = validate_and_repair(&config, plan, 40).unwrap();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0].end, 22);
  }

  #[test]
  fn normalizes_unit_types_and_themes() {
    let config = SegmenterConfig::default();
    let mut unit = planned(0, 39);
    unit.unit_type = "MONOLOGUE".to_owned();
    unit.themes = vec!["  Sleep   Science ".to_owned(), "sleep science".to_owned()];
    let units = validate_and_repair(&config, vec![unit], 40).unwrap();
    assert_eq!(units[0].unit_type, UnitType::Other);
    assert_eq!(units[0].themes, vec!["sleep science".to_owned()]);
  }

  #[test]
  fn fallback_splits_long_episodes_into_bounded_chunks() {
    let config = SegmenterConfig::default();
    let captions = conversation(313);
    let units = fallback_plan(&config, &captions);

    assert!(units.len() >= 10, "got {} units", units.len());
    assert_eq!(units.first().unwrap().start, 0);
    assert_eq!(units.last().unwrap().end, 312);
    for pair in units.windows(2) {
      assert_eq!(pair[1].start, pair[0].end + 1);
    }
    for unit in &units {
      let count = unit.end - unit.start + 1;
      assert!((5..=25).contains(&count), "chunk of {count} captions");
    }
  }

  #[test]
  fn fallback_on_a_single_caption_yields_one_unit() {
    let config = SegmenterConfig::default();
    let captions = conversation(1);
    let units = fallback_plan(&config, &captions);
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].start, 0);
    assert_eq!(units[0].end, 0);
  }

  fn episode() -> Episode {
    Episode {
      id: "ep-1".to_owned(),
      title: "Test".to_owned(),
      podcast_name: "Pod".to_owned(),
      published_date: None,
      duration_seconds: 100.0,
      vtt_path: "test.vtt".to_owned(),
      youtube_url: None,
    }
  }

  #[test]
  fn built_units_carry_time_bounds_text_and_distribution() {
    let config = SegmenterConfig::default();
    let captions = conversation(20);
    let episode = episode();
    let speakers = crate::speakers::SpeakerMap::fallback_for_tests();
    let plan = vec![
      fallback_unit(&config, &captions, 0, 9),
      fallback_unit(&config, &captions, 10, 19),
    ];
    let units = build_units(plan, &episode, &captions, &speakers);

    assert_eq!(units.len(), 2);
    assert_eq!(units[0].start_time, captions[0].start_time);
    assert_eq!(units[0].end_time, captions[9].end_time);
    assert_eq!(units[0].segment_count, 10);
    assert!(units[0].text.contains("some words spoken"));
    let total: f64 = units[0].speaker_distribution.values().sum();
    assert!((total - 1.0).abs() < 0.01);
    assert!(!units[0].primary_speaker.is_empty());
  }

  // ── end-to-end through a scripted LLM ──

  mod scripted {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use podseed_ai::{
      CompletionProvider, CompletionRequest, KeyPool, KeyQuota, ProviderError, RetryPolicy,
    };

    use super::*;

    struct ScriptedProvider {
      responses: Vec<String>,
      calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
      async fn complete(
        &self,
        _api_key: &str,
        _request: &CompletionRequest,
      ) -> Result<String, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        Ok(
          self
            .responses
            .get(call.min(self.responses.len() - 1))
            .expect("scripted response")
            .clone(),
        )
      }
    }

    fn scripted_client(
      responses: Vec<String>,
      dir: &std::path::Path,
    ) -> (LlmClient, Arc<AtomicU32>) {
      let calls = Arc::new(AtomicU32::new(0));
      let pool = KeyPool::new(vec!["test-key".to_owned()], KeyQuota::default(), dir).unwrap();
      let client = LlmClient::new(
        Arc::new(ScriptedProvider {
          responses,
          calls: Arc::clone(&calls),
        }),
        pool,
        RetryPolicy::default(),
      );
      (client, calls)
    }

    fn giant_plan(n: usize) -> String {
      format!(
        r#"{{"units": [{{"start_index": 0, "end_index": {}, "unit_type": "discussion", "summary": "The entire episode.", "themes": []}}]}}"#,
        n - 1
      )
    }

    #[tokio::test]
    async fn giant_unit_plans_retry_strictly_then_fall_back() {
      let dir = tempfile::tempdir().unwrap();
      let captions = conversation(313);
      let (client, calls) =
        scripted_client(vec![giant_plan(313), giant_plan(313)], dir.path());
      let segmenter = UnitSegmenter::new(&client, SegmenterConfig::default());

      let units = segmenter
        .segment(
          &episode(),
          &captions,
          &crate::speakers::SpeakerMap::fallback_for_tests(),
          &CancellationToken::new(),
        )
        .await
        .unwrap();

      // Normal prompt, then the strict re-prompt, then no more LLM calls.
      assert_eq!(calls.load(Ordering::SeqCst), 2);
      assert!(units.len() >= 10, "got {} units", units.len());
      assert_eq!(units.first().unwrap().segment_start, 0);
      assert_eq!(units.last().unwrap().segment_end, 312);
      for unit in &units {
        assert!(unit.segment_count <= 25);
      }
      // Units are emitted in time order with monotone boundaries.
      for pair in units.windows(2) {
        assert!(pair[1].start_time >= pair[0].end_time);
        assert_eq!(pair[1].segment_start, pair[0].segment_end + 1);
      }
    }

    #[tokio::test]
    async fn a_valid_plan_is_used_as_is() {
      let dir = tempfile::tempdir().unwrap();
      let captions = conversation(40);
      let plan = r#"{"units": [
        {"start_index": 0, "end_index": 19, "unit_type": "story", "summary": "An opening story.", "themes": ["Openers"]},
        {"start_index": 20, "end_index": 39, "unit_type": "q_and_a", "summary": "Questions.", "themes": []}
      ]}"#;
      let (client, calls) = scripted_client(vec![plan.to_owned()], dir.path());
      let segmenter = UnitSegmenter::new(&client, SegmenterConfig::default());

      let units = segmenter
        .segment(
          &episode(),
          &captions,
          &crate::speakers::SpeakerMap::fallback_for_tests(),
          &CancellationToken::new(),
        )
        .await
        .unwrap();

      assert_eq!(calls.load(Ordering::SeqCst), 1);
      assert_eq!(units.len(), 2);
      assert_eq!(units[0].unit_type, UnitType::Story);
      assert_eq!(units[0].summary, "An opening story.");
      assert_eq!(units[0].themes, vec!["openers".to_owned()]);
      assert_eq!(units[1].unit_type, UnitType::QAndA);
      assert_eq!(units[1].segment_count, 20);
    }

    #[tokio::test]
    async fn tiny_episodes_never_call_the_llm() {
      let dir = tempfile::tempdir().unwrap();
      let captions = conversation(1);
      let (client, calls) = scripted_client(vec!["unused".to_owned()], dir.path());
      let segmenter = UnitSegmenter::new(&client, SegmenterConfig::default());

      let units = segmenter
        .segment(
          &episode(),
          &captions,
          &crate::speakers::SpeakerMap::fallback_for_tests(),
          &CancellationToken::new(),
        )
        .await
        .unwrap();

      assert_eq!(calls.load(Ordering::SeqCst), 0);
      assert_eq!(units.len(), 1);
      assert_eq!(units[0].segment_count, 1);
    }
  }
}
