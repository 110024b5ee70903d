use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ──────────────────────────────────────────────────
// Closed enums
// ──────────────────────────────────────────────────
//
// LLM output is coerced into these; anything unrecognized becomes `Other`
// (or `Unknown` for roles) rather than leaking free-form strings into the
// graph.

macro_rules! coerce_from_str {
  ($ty:ty, $fallback:expr) => {
    impl $ty {
      /// Parse a (possibly noisy) LLM-provided label, falling back instead
      /// of failing.
      pub fn coerce(raw: &str) -> Self {
        Self::from_str(raw.trim().to_lowercase().as_str()).unwrap_or($fallback)
      }
    }
  };
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRole {
  Host,
  RecurringHost,
  Guest,
  BriefContributor,
  Unknown,
}
coerce_from_str!(SpeakerRole, Self::Unknown);

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
  Story,
  Explanation,
  QAndA,
  Discussion,
  Example,
  Transition,
  Other,
}
coerce_from_str!(UnitType, Self::Other);

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
  Person,
  Organization,
  Place,
  Product,
  Concept,
  Event,
  Technology,
  Other,
}
coerce_from_str!(EntityType, Self::Other);

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QuoteType {
  KeyPoint,
  Funny,
  Provocative,
  Personal,
  Other,
}
coerce_from_str!(QuoteType, Self::Other);

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
  KeyPoint,
  Summary,
  Fact,
  Other,
}
coerce_from_str!(InsightType, Self::Other);

/// Outcome of one episode ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
  /// Every unit extracted and committed.
  Ok,
  /// At least one unit failed extraction or write.
  Partial,
  /// Fewer than half of the units succeeded.
  Failed,
}

impl EpisodeStatus {
  pub const fn exit_code(self) -> i32 {
    match self {
      Self::Ok => 0,
      Self::Partial => 3,
      Self::Failed => 4,
    }
  }
}

// ──────────────────────────────────────────────────
// Graph node records
// ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Podcast {
  pub id: String,
  pub name: String,
  pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
  pub id: String,
  pub title: String,
  pub podcast_name: String,
  pub published_date: Option<String>,
  pub duration_seconds: f64,
  pub vtt_path: String,
  pub youtube_url: Option<String>,
}

/// A named speaker, shared across episodes within a podcast by normalized
/// name. A lower-confidence identification never replaces a higher one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaker {
  pub id: String,
  pub name: String,
  pub role: SpeakerRole,
  pub confidence: f32,
}

/// A contiguous group of captions forming one topical chunk; the unit of
/// extraction and embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeaningfulUnit {
  pub id: String,
  pub episode_id: String,
  pub unit_type: UnitType,
  /// One-sentence summary from segmentation.
  pub summary: String,
  pub themes: Vec<String>,
  pub start_time: f64,
  pub end_time: f64,
  /// First caption index covered (inclusive).
  pub segment_start: usize,
  /// Last caption index covered (inclusive).
  pub segment_end: usize,
  pub segment_count: usize,
  /// Concatenated caption text, verbatim. The extraction and embedding input,
  /// and what retrieval returns.
  pub text: String,
  pub primary_speaker: String,
  /// Fraction of tokens per speaker name; sums to 1.0 ± 0.01.
  pub speaker_distribution: HashMap<String, f64>,
  pub embedding: Option<Vec<f32>>,
}

impl MeaningfulUnit {
  pub fn covers(&self, caption_index: usize) -> bool {
    caption_index >= self.segment_start && caption_index <= self.segment_end
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
  pub id: String,
  pub value: String,
  pub entity_type: EntityType,
  pub confidence: f32,
  pub description: Option<String>,
  pub importance: f32,
  pub frequency: u32,
}

impl Entity {
  /// Key used to merge duplicate mentions within an episode.
  pub fn merge_key(&self) -> (String, EntityType) {
    (self.value.to_lowercase(), self.entity_type)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
  pub id: String,
  /// Verbatim from the captions (whitespace-normalized).
  pub text: String,
  pub speaker: String,
  pub context: Option<String>,
  pub quote_type: QuoteType,
  pub importance: f32,
  pub timestamp_start: f64,
  pub timestamp_end: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
  pub id: String,
  pub title: String,
  pub description: String,
  pub insight_type: InsightType,
  pub confidence: f32,
  pub supporting_entities: Vec<String>,
}

/// Relationship between two entities, by value, as extracted. Resolved to
/// node IDs during episode assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueRelationship {
  pub source: String,
  pub target: String,
  pub relation: String,
  pub confidence: f32,
}

/// Relationship between two entity nodes, by ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelationship {
  pub source_id: String,
  pub target_id: String,
  pub relation: String,
  pub confidence: f32,
}

// ──────────────────────────────────────────────────
// Extraction output
// ──────────────────────────────────────────────────

/// Everything C4 extracted from one unit, before episode-level assembly.
#[derive(Debug, Clone, Default)]
pub struct UnitKnowledge {
  pub entities: Vec<Entity>,
  pub quotes: Vec<Quote>,
  pub insights: Vec<Insight>,
  pub relationships: Vec<ValueRelationship>,
  pub topics: Vec<String>,
  /// Set when every retry was spent; the unit is stored with an empty
  /// extraction.
  pub extraction_failed: bool,
}

/// An entity as mentioned by one unit: the episode-merged record plus this
/// unit's own confidence for the `MENTIONS` edge.
#[derive(Debug, Clone)]
pub struct EntityMention {
  pub entity: Entity,
  pub mention_confidence: f32,
}

/// One unit, assembled and ready for the graph writer.
#[derive(Debug, Clone)]
pub struct GraphUnit {
  pub unit: MeaningfulUnit,
  pub mentions: Vec<EntityMention>,
  pub quotes: Vec<Quote>,
  pub insights: Vec<Insight>,
  pub topics: Vec<String>,
  pub relationships: Vec<EntityRelationship>,
  pub extraction_failed: bool,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn enum_coercion_accepts_known_and_defaults_unknown() {
    assert_eq!(UnitType::coerce("q_and_a"), UnitType::QAndA);
    assert_eq!(UnitType::coerce(" Story "), UnitType::Story);
    assert_eq!(UnitType::coerce("monologue"), UnitType::Other);
    assert_eq!(EntityType::coerce("PERSON"), EntityType::Person);
    assert_eq!(EntityType::coerce("widget"), EntityType::Other);
    assert_eq!(SpeakerRole::coerce("nonsense"), SpeakerRole::Unknown);
  }

  #[test]
  fn enums_render_snake_case_for_the_graph() {
    assert_eq!(UnitType::QAndA.to_string(), "q_and_a");
    assert_eq!(SpeakerRole::BriefContributor.to_string(), "brief_contributor");
    assert_eq!(EpisodeStatus::Partial.to_string(), "partial");
  }

  #[test]
  fn episode_status_maps_to_exit_codes() {
    assert_eq!(EpisodeStatus::Ok.exit_code(), 0);
    assert_eq!(EpisodeStatus::Partial.exit_code(), 3);
    assert_eq!(EpisodeStatus::Failed.exit_code(), 4);
  }
}
