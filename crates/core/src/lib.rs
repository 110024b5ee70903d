mod model;
pub use model::{
  Entity, EntityMention, EntityRelationship, EntityType, Episode, EpisodeStatus, GraphUnit,
  Insight, InsightType, MeaningfulUnit, Podcast, Quote, QuoteType, Speaker, SpeakerRole,
  UnitKnowledge, UnitType, ValueRelationship,
};

mod speakers;
pub use speakers::{SpeakerIdentifier, SpeakerMap, fallback_speaker_map};

mod segmenter;
pub use segmenter::{SegmenterConfig, UnitSegmenter, deterministic_units};

mod extractor;
pub use extractor::KnowledgeExtractor;

mod episode;
pub use episode::{EpisodeGraph, assemble_episode};

mod prompts;
