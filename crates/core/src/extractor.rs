use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use podseed_ai::{CompletionOptions, LlmClient, parse_lenient_value};
use podseed_shared::{
  PipelineError, entity_id, insight_id, normalize_whitespace, quote_id, truncate_chars,
};

use crate::model::{
  Entity, EntityType, Insight, InsightType, MeaningfulUnit, Quote, QuoteType, UnitKnowledge,
  ValueRelationship,
};
use crate::prompts;

const ENTITY_VALUE_MAX_CHARS: usize = 200;
const INSIGHT_TITLE_MAX_CHARS: usize = 150;
const INSIGHT_DESCRIPTION_MAX_CHARS: usize = 1000;
const QUOTE_CONTEXT_MAX_CHARS: usize = 300;
const TOPIC_MAX_CHARS: usize = 64;
const MAX_TOPICS: usize = 10;

// ──────────────────────────────────────────────────
// Raw response shape
// ──────────────────────────────────────────────────
//
// Deliberately loose: every field the model might omit has a default, and
// numbers arrive as f64 because models emit `2.0` where an integer belongs.

fn default_score() -> f64 {
  0.5
}

fn default_frequency() -> f64 {
  1.0
}

#[derive(Debug, Default, Deserialize)]
struct RawExtraction {
  #[serde(default)]
  entities: Vec<RawEntity>,
  #[serde(default)]
  quotes: Vec<RawQuote>,
  #[serde(default)]
  insights: Vec<RawInsight>,
  #[serde(default)]
  relationships: Vec<RawRelationship>,
  #[serde(default)]
  topics: Vec<String>,
}

impl RawExtraction {
  fn is_empty(&self) -> bool {
    self.entities.is_empty()
      && self.quotes.is_empty()
      && self.insights.is_empty()
      && self.relationships.is_empty()
      && self.topics.is_empty()
  }
}

#[derive(Debug, Deserialize)]
struct RawEntity {
  value: String,
  #[serde(rename = "type", default)]
  entity_type: String,
  #[serde(default = "default_score")]
  confidence: f64,
  #[serde(default)]
  description: Option<String>,
  #[serde(default = "default_score")]
  importance: f64,
  #[serde(default = "default_frequency")]
  frequency: f64,
}

#[derive(Debug, Deserialize)]
struct RawQuote {
  text: String,
  #[serde(default)]
  speaker: String,
  #[serde(default)]
  context: Option<String>,
  #[serde(default)]
  quote_type: String,
  #[serde(default = "default_score")]
  importance: f64,
}

#[derive(Debug, Deserialize)]
struct RawInsight {
  title: String,
  #[serde(default)]
  description: String,
  #[serde(rename = "type", default)]
  insight_type: String,
  #[serde(default = "default_score")]
  confidence: f64,
  #[serde(default)]
  supporting_entities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
  source: String,
  target: String,
  #[serde(rename = "type", default)]
  relation: String,
  #[serde(default = "default_score")]
  confidence: f64,
}

// ──────────────────────────────────────────────────
// Extractor
// ──────────────────────────────────────────────────

pub struct KnowledgeExtractor<'a> {
  llm: &'a LlmClient,
  max_retries: u32,
  retry_backoff: Duration,
}

impl<'a> KnowledgeExtractor<'a> {
  pub fn new(llm: &'a LlmClient, max_retries: u32) -> Self {
    Self {
      llm,
      max_retries,
      retry_backoff: Duration::from_secs(5),
    }
  }

  #[cfg(test)]
  fn with_backoff(mut self, backoff: Duration) -> Self {
    self.retry_backoff = backoff;
    self
  }

  /// Extract entities, quotes, insights, relationships and topics from one
  /// unit. Schema failures are retried with a stricter re-prompt; after the
  /// last retry the unit comes back empty with `extraction_failed` set.
  /// Only cancellation propagates as an error.
  pub async fn extract(
    &self,
    podcast_name: &str,
    episode_title: &str,
    unit: &MeaningfulUnit,
    cancel: &CancellationToken,
  ) -> Result<UnitKnowledge, PipelineError> {
    let speakers: Vec<String> = unit.speaker_distribution.keys().cloned().collect();
    let mut backoff = self.retry_backoff;

    for attempt in 0..=self.max_retries {
      if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
      }

      let prompt = prompts::extraction_prompt(
        podcast_name,
        episode_title,
        (unit.start_time, unit.end_time),
        &unit.text,
        &speakers,
        attempt > 0,
      );
      let options = CompletionOptions {
        temperature: 0.3,
        max_tokens: 8192,
        json_mode: true,
        ..CompletionOptions::default()
      };

      let response = match self.llm.complete(&prompt, &options, cancel).await {
        Ok(response) => response,
        Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
        Err(err) => {
          // Transport retries already happened inside the client; a provider
          // error here is final for this unit.
          tracing::warn!(unit_id = %unit.id, error = %err, "extraction call failed");
          break;
        }
      };

      match parse_extraction(&response) {
        // A well-formed but empty object is the model refusing the task,
        // not a unit with nothing in it; it goes through the retry path.
        Ok(raw) if raw.is_empty() => {
          tracing::warn!(
            unit_id = %unit.id,
            attempt,
            max_retries = self.max_retries,
            "extraction response was empty"
          );
        }
        Ok(raw) => return Ok(normalize_extraction(raw, unit)),
        Err(reason) => {
          tracing::warn!(
            unit_id = %unit.id,
            attempt,
            max_retries = self.max_retries,
            reason,
            "extraction response rejected"
          );
        }
      }

      if attempt < self.max_retries {
        tokio::select! {
          () = cancel.cancelled() => return Err(PipelineError::Cancelled),
          () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(Duration::from_secs(60));
      }
    }

    tracing::warn!(unit_id = %unit.id, "extraction failed; storing unit empty");
    Ok(UnitKnowledge {
      extraction_failed: true,
      ..UnitKnowledge::default()
    })
  }
}

/// Lenient parse of the raw response: code fences and prose tolerated, a
/// single object where a list is expected is coerced to a one-element list.
fn parse_extraction(response: &str) -> Result<RawExtraction, String> {
  let mut value = parse_lenient_value(response)?;

  if let Some(obj) = value.as_object_mut() {
    for key in ["entities", "quotes", "insights", "relationships", "topics"] {
      if let Some(field) = obj.get_mut(key) {
        if field.is_object() || field.is_string() {
          tracing::warn!(key, "coercing single value to one-element list");
          let single = field.take();
          *field = serde_json::Value::Array(vec![single]);
        }
      }
    }
  }

  serde_json::from_value(value).map_err(|err| format!("response did not match schema: {err}"))
}

fn clamp01(value: f64) -> f32 {
  value.clamp(0.0, 1.0) as f32
}

/// Apply the normalization rules and build the typed knowledge for a unit.
fn normalize_extraction(raw: RawExtraction, unit: &MeaningfulUnit) -> UnitKnowledge {
  let unit_text = normalize_whitespace(&unit.text);

  // Entities: clean, then merge duplicates (same normalized value + type)
  // by max confidence/importance and summed frequency.
  let mut merged: HashMap<(String, EntityType), Entity> = HashMap::new();
  let mut order: Vec<(String, EntityType)> = Vec::new();
  for raw_entity in raw.entities {
    let value = truncate_chars(
      &normalize_whitespace(&raw_entity.value),
      ENTITY_VALUE_MAX_CHARS,
    );
    if value.is_empty() {
      continue;
    }
    let entity_type = EntityType::coerce(&raw_entity.entity_type);
    let key = (value.to_lowercase(), entity_type);
    let frequency = raw_entity.frequency.max(1.0).round() as u32;
    let description = raw_entity
      .description
      .map(|d| normalize_whitespace(&d))
      .filter(|d| !d.is_empty());

    match merged.get_mut(&key) {
      Some(existing) => {
        existing.confidence = existing.confidence.max(clamp01(raw_entity.confidence));
        existing.importance = existing.importance.max(clamp01(raw_entity.importance));
        existing.frequency += frequency;
        if existing.description.is_none() {
          existing.description = description;
        }
      }
      None => {
        merged.insert(
          key.clone(),
          Entity {
            id: entity_id(&unit.id, &key.0, &entity_type.to_string()),
            value,
            entity_type,
            confidence: clamp01(raw_entity.confidence),
            description,
            importance: clamp01(raw_entity.importance),
            frequency,
          },
        );
        order.push(key);
      }
    }
  }
  let entities: Vec<Entity> = order
    .iter()
    .map(|key| merged[key].clone())
    .collect();
  let entity_values: std::collections::HashSet<String> =
    entities.iter().map(|e| e.value.to_lowercase()).collect();

  // Quotes must be verbatim: substring of the whitespace-normalized unit
  // text, or they are dropped.
  let mut quotes: Vec<Quote> = Vec::new();
  for raw_quote in raw.quotes {
    let text = normalize_whitespace(&raw_quote.text);
    if text.is_empty() {
      continue;
    }
    let Some(offset) = unit_text.find(&text) else {
      tracing::warn!(
        unit_id = %unit.id,
        quote = %truncate_chars(&text, 80),
        "dropping quote not found verbatim in unit"
      );
      continue;
    };

    let (timestamp_start, timestamp_end) = locate_span(unit, &unit_text, offset, text.len());
    let speaker = if raw_quote.speaker.trim().is_empty() {
      unit.primary_speaker.clone()
    } else {
      raw_quote.speaker.trim().to_owned()
    };
    quotes.push(Quote {
      id: quote_id(&unit.id, &text),
      text,
      speaker,
      context: raw_quote
        .context
        .map(|c| truncate_chars(&normalize_whitespace(&c), QUOTE_CONTEXT_MAX_CHARS))
        .filter(|c| !c.is_empty()),
      quote_type: QuoteType::coerce(&raw_quote.quote_type),
      importance: clamp01(raw_quote.importance),
      timestamp_start,
      timestamp_end,
    });
  }

  let insights: Vec<Insight> = raw
    .insights
    .into_iter()
    .filter_map(|raw_insight| {
      let title = truncate_chars(
        &normalize_whitespace(&raw_insight.title),
        INSIGHT_TITLE_MAX_CHARS,
      );
      if title.is_empty() {
        return None;
      }
      Some(Insight {
        id: insight_id(&unit.id, &title),
        title,
        description: truncate_chars(
          &normalize_whitespace(&raw_insight.description),
          INSIGHT_DESCRIPTION_MAX_CHARS,
        ),
        insight_type: InsightType::coerce(&raw_insight.insight_type),
        confidence: clamp01(raw_insight.confidence),
        supporting_entities: raw_insight
          .supporting_entities
          .into_iter()
          .map(|e| normalize_whitespace(&e))
          .filter(|e| !e.is_empty())
          .collect(),
      })
    })
    .collect();

  // Relationships may only connect entities this unit actually extracted.
  let relationships: Vec<ValueRelationship> = raw
    .relationships
    .into_iter()
    .filter_map(|raw_rel| {
      let source = normalize_whitespace(&raw_rel.source);
      let target = normalize_whitespace(&raw_rel.target);
      if !entity_values.contains(&source.to_lowercase())
        || !entity_values.contains(&target.to_lowercase())
      {
        tracing::warn!(
          unit_id = %unit.id,
          source = %source,
          target = %target,
          "dropping relationship with unknown endpoint"
        );
        return None;
      }
      let relation = raw_rel
        .relation
        .trim()
        .to_uppercase()
        .replace([' ', '-'], "_");
      Some(ValueRelationship {
        source,
        target,
        relation: if relation.is_empty() {
          "RELATED_TO".to_owned()
        } else {
          relation
        },
        confidence: clamp01(raw_rel.confidence),
      })
    })
    .collect();

  let mut topics: Vec<String> = Vec::new();
  for raw_topic in raw.topics {
    let topic = truncate_chars(
      &normalize_whitespace(&raw_topic.to_lowercase()),
      TOPIC_MAX_CHARS,
    );
    if !topic.is_empty() && !topics.contains(&topic) {
      topics.push(topic);
    }
    if topics.len() == MAX_TOPICS {
      break;
    }
  }

  UnitKnowledge {
    entities,
    quotes,
    insights,
    relationships,
    topics,
    extraction_failed: false,
  }
}

/// Timestamps for a span of the unit text, by linear interpolation over the
/// unit's time range. Captions are gone by this stage, so position within
/// the text is the best available signal.
fn locate_span(
  unit: &MeaningfulUnit,
  unit_text: &str,
  offset: usize,
  span_len: usize,
) -> (f64, f64) {
  let total = unit_text.len().max(1) as f64;
  let duration = unit.end_time - unit.start_time;
  let start_frac = offset as f64 / total;
  let end_frac = ((offset + span_len) as f64 / total).min(1.0);
  (
    unit.start_time + start_frac * duration,
    unit.start_time + end_frac * duration,
  )
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicU32, Ordering};

  use async_trait::async_trait;

  use podseed_ai::{
    CompletionProvider, CompletionRequest, KeyPool, KeyQuota, ProviderError, RetryPolicy,
  };

  use crate::model::UnitType;

  use super::*;

  fn unit() -> MeaningfulUnit {
    let text = "The brain needs sleep to consolidate memories. \
                Matthew Walker said sleep is your superpower and the data backs it up."
      .to_owned();
    MeaningfulUnit {
      id: "unit-1".to_owned(),
      episode_id: "ep-1".to_owned(),
      unit_type: UnitType::Discussion,
      summary: "Sleep and memory.".to_owned(),
      themes: vec!["sleep".to_owned()],
      start_time: 100.0,
      end_time: 200.0,
      segment_start: 0,
      segment_end: 9,
      segment_count: 10,
      text,
      primary_speaker: "Matthew Walker".to_owned(),
      speaker_distribution: HashMap::from([("Matthew Walker".to_owned(), 1.0)]),
      embedding: None,
    }
  }

  fn raw_json(quote: &str) -> String {
    format!(
      r#"{{
        "entities": [
          {{"value": "Matthew Walker", "type": "person", "confidence": 0.9, "importance": 0.8, "frequency": 2}},
          {{"value": "matthew walker", "type": "PERSON", "confidence": 0.6, "importance": 0.95, "frequency": 1}},
          {{"value": "sleep", "type": "concept", "confidence": 1.4, "importance": -0.2}}
        ],
        "quotes": [{{"text": "{quote}", "speaker": "", "quote_type": "key_point", "importance": 0.9}}],
        "insights": [{{"title": "Sleep consolidates memory", "description": "Discussed at length.", "type": "fact", "confidence": 0.8, "supporting_entities": ["sleep"]}}],
        "relationships": [
          {{"source": "Matthew Walker", "target": "sleep", "type": "studies", "confidence": 0.7}},
          {{"source": "Matthew Walker", "target": "caffeine", "type": "warns about", "confidence": 0.7}}
        ],
        "topics": ["Sleep", "sleep", "Neuroscience "]
      }}"#
    )
  }

  #[test]
  fn normalization_merges_clamps_and_filters() {
    let raw = parse_extraction(&raw_json("sleep is your superpower")).unwrap();
    let knowledge = normalize_extraction(raw, &unit());

    // Duplicate Matthew Walker entries merged: max scores, summed frequency.
    assert_eq!(knowledge.entities.len(), 2);
    let walker = &knowledge.entities[0];
    assert_eq!(walker.value, "Matthew Walker");
    assert_eq!(walker.entity_type, EntityType::Person);
    assert_eq!(walker.frequency, 3);
    assert!((walker.confidence - 0.9).abs() < 1e-6);
    assert!((walker.importance - 0.95).abs() < 1e-6);

    // Out-of-range scores clamp into [0, 1].
    let sleep = &knowledge.entities[1];
    assert_eq!(sleep.confidence, 1.0);
    assert_eq!(sleep.importance, 0.0);

    // The verbatim quote survives, attributed to the primary speaker, with
    // timestamps inside the unit.
    assert_eq!(knowledge.quotes.len(), 1);
    let quote = &knowledge.quotes[0];
    assert_eq!(quote.speaker, "Matthew Walker");
    assert!(quote.timestamp_start >= 100.0);
    assert!(quote.timestamp_end <= 200.0);
    assert!(quote.timestamp_end > quote.timestamp_start);

    // The relationship to an unextracted entity is dropped; the other is
    // kept with a normalized relation name.
    assert_eq!(knowledge.relationships.len(), 1);
    assert_eq!(knowledge.relationships[0].relation, "STUDIES");

    // Topics: lowercased, deduplicated.
    assert_eq!(knowledge.topics, vec!["sleep".to_owned(), "neuroscience".to_owned()]);
  }

  #[test]
  fn non_verbatim_quotes_are_dropped() {
    let raw = parse_extraction(&raw_json("something never actually said")).unwrap();
    let knowledge = normalize_extraction(raw, &unit());
    assert!(knowledge.quotes.is_empty());
  }

  #[test]
  fn single_dict_is_coerced_to_a_list() {
    let response = r#"{"entities": {"value": "Sleep", "type": "concept"}, "topics": "sleep"}"#;
    let raw = parse_extraction(response).unwrap();
    assert_eq!(raw.entities.len(), 1);
    assert_eq!(raw.topics.len(), 1);
  }

  #[test]
  fn empty_objects_are_flagged_as_empty() {
    assert!(parse_extraction("{}").unwrap().is_empty());
    assert!(
      !parse_extraction(r#"{"topics": ["sleep"]}"#)
        .unwrap()
        .is_empty()
    );
  }

  // ── retry behaviour through a fake provider ──

  struct ScriptedProvider {
    responses: Vec<&'static str>,
    calls: AtomicU32,
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
          .to_string(),
      )
    }
  }

  fn scripted_client(responses: Vec<&'static str>, dir: &std::path::Path) -> LlmClient {
    let pool = KeyPool::new(vec!["test-key".to_owned()], KeyQuota::default(), dir).unwrap();
    LlmClient::new(
      Arc::new(ScriptedProvider {
        responses,
        calls: AtomicU32::new(0),
      }),
      pool,
      RetryPolicy::default(),
    )
  }

  #[tokio::test]
  async fn schema_failure_retries_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let client = scripted_client(
      vec![
        "this is not json at all",
        r#"{"entities": [{"value": "Sleep", "type": "concept"}]}"#,
      ],
      dir.path(),
    );
    let extractor = KnowledgeExtractor::new(&client, 3).with_backoff(Duration::from_millis(1));
    let knowledge = extractor
      .extract("Pod", "Episode", &unit(), &CancellationToken::new())
      .await
      .unwrap();
    assert!(!knowledge.extraction_failed);
    assert_eq!(knowledge.entities.len(), 1);
  }

  #[tokio::test]
  async fn a_model_that_keeps_returning_empty_objects_flags_the_unit() {
    let dir = tempfile::tempdir().unwrap();
    let client = scripted_client(vec!["{}"], dir.path());
    let extractor = KnowledgeExtractor::new(&client, 2).with_backoff(Duration::from_millis(1));
    let knowledge = extractor
      .extract("Pod", "Episode", &unit(), &CancellationToken::new())
      .await
      .unwrap();
    assert!(knowledge.extraction_failed);
    assert!(knowledge.entities.is_empty());
  }

  #[tokio::test]
  async fn persistent_schema_failure_yields_an_empty_flagged_unit() {
    let dir = tempfile::tempdir().unwrap();
    let client = scripted_client(vec!["still not json"], dir.path());
    let extractor = KnowledgeExtractor::new(&client, 2).with_backoff(Duration::from_millis(1));
    let knowledge = extractor
      .extract("Pod", "Episode", &unit(), &CancellationToken::new())
      .await
      .unwrap();
    assert!(knowledge.extraction_failed);
    assert!(knowledge.entities.is_empty());
  }
}
