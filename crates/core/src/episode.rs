use std::collections::HashMap;

use crate::model::{
  Entity, EntityMention, EntityRelationship, EntityType, Episode, GraphUnit, MeaningfulUnit,
  Podcast, Speaker, UnitKnowledge,
};

/// Everything the graph writer needs for one episode, assembled and
/// de-duplicated.
#[derive(Debug, Clone)]
pub struct EpisodeGraph {
  pub podcast: Podcast,
  pub episode: Episode,
  pub speakers: Vec<Speaker>,
  pub units: Vec<GraphUnit>,
}

/// Merge per-unit extractions into an episode-level graph.
///
/// Entities with the same `(normalized value, type)` anywhere in the episode
/// collapse onto one node: the ID assigned at first appearance (keyed by the
/// owning unit), confidence and importance by max, frequency summed. Every
/// mention keeps its own per-unit confidence for the `MENTIONS` edge, and
/// relationship endpoints resolve to the merged node IDs.
pub fn assemble_episode(
  podcast: Podcast,
  episode: Episode,
  speakers: Vec<Speaker>,
  extracted: Vec<(MeaningfulUnit, UnitKnowledge)>,
) -> EpisodeGraph {
  // Pass 1: merge entity records across units.
  let mut registry: HashMap<(String, EntityType), Entity> = HashMap::new();
  for (_, knowledge) in &extracted {
    for entity in &knowledge.entities {
      registry
        .entry(entity.merge_key())
        .and_modify(|existing| {
          existing.confidence = existing.confidence.max(entity.confidence);
          existing.importance = existing.importance.max(entity.importance);
          existing.frequency += entity.frequency;
          if existing.description.is_none() {
            existing.description = entity.description.clone();
          }
        })
        .or_insert_with(|| entity.clone());
    }
  }

  // Pass 2: rebuild each unit against the merged records.
  let units: Vec<GraphUnit> = extracted
    .into_iter()
    .map(|(unit, knowledge)| {
      let mentions: Vec<EntityMention> = knowledge
        .entities
        .iter()
        .map(|entity| EntityMention {
          entity: registry[&entity.merge_key()].clone(),
          mention_confidence: entity.confidence,
        })
        .collect();

      let resolve = |value: &str| -> Option<String> {
        knowledge
          .entities
          .iter()
          .find(|e| e.value.eq_ignore_ascii_case(value))
          .map(|e| registry[&e.merge_key()].id.clone())
      };
      let relationships: Vec<EntityRelationship> = knowledge
        .relationships
        .iter()
        .filter_map(|rel| {
          Some(EntityRelationship {
            source_id: resolve(&rel.source)?,
            target_id: resolve(&rel.target)?,
            relation: rel.relation.clone(),
            confidence: rel.confidence,
          })
        })
        .collect();

      GraphUnit {
        unit,
        mentions,
        quotes: knowledge.quotes,
        insights: knowledge.insights,
        topics: knowledge.topics,
        relationships,
        extraction_failed: knowledge.extraction_failed,
      }
    })
    .collect();

  EpisodeGraph {
    podcast,
    episode,
    speakers,
    units,
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use podseed_shared::entity_id;

  use crate::model::{UnitType, ValueRelationship};

  use super::*;

  fn unit(id: &str, start: f64) -> MeaningfulUnit {
    MeaningfulUnit {
      id: id.to_owned(),
      episode_id: "ep".to_owned(),
      unit_type: UnitType::Discussion,
      summary: String::new(),
      themes: Vec::new(),
      start_time: start,
      end_time: start + 60.0,
      segment_start: 0,
      segment_end: 9,
      segment_count: 10,
      text: String::new(),
      primary_speaker: "Host".to_owned(),
      speaker_distribution: HashMap::new(),
      embedding: None,
    }
  }

  fn entity(unit_id: &str, value: &str, confidence: f32, frequency: u32) -> Entity {
    Entity {
      id: entity_id(unit_id, &value.to_lowercase(), "person"),
      value: value.to_owned(),
      entity_type: EntityType::Person,
      confidence,
      description: None,
      importance: 0.5,
      frequency,
    }
  }

  fn podcast() -> Podcast {
    Podcast {
      id: "pod".to_owned(),
      name: "Pod".to_owned(),
      description: String::new(),
    }
  }

  fn episode() -> Episode {
    Episode {
      id: "ep".to_owned(),
      title: "Ep".to_owned(),
      podcast_name: "Pod".to_owned(),
      published_date: None,
      duration_seconds: 600.0,
      vtt_path: "ep.vtt".to_owned(),
      youtube_url: None,
    }
  }

  #[test]
  fn repeated_entities_share_the_first_units_id_and_merge_stats() {
    let first = UnitKnowledge {
      entities: vec![entity("u1", "Jane Smith", 0.6, 2)],
      ..UnitKnowledge::default()
    };
    let second = UnitKnowledge {
      entities: vec![entity("u2", "jane smith", 0.9, 3)],
      ..UnitKnowledge::default()
    };

    let graph = assemble_episode(
      podcast(),
      episode(),
      Vec::new(),
      vec![(unit("u1", 0.0), first), (unit("u2", 60.0), second)],
    );

    let expected_id = entity_id("u1", "jane smith", "person");
    let first_mention = &graph.units[0].mentions[0];
    let second_mention = &graph.units[1].mentions[0];
    assert_eq!(first_mention.entity.id, expected_id);
    assert_eq!(second_mention.entity.id, expected_id);
    assert_eq!(second_mention.entity.frequency, 5);
    assert!((second_mention.entity.confidence - 0.9).abs() < 1e-6);

    // Per-mention confidence stays per-unit.
    assert!((first_mention.mention_confidence - 0.6).abs() < 1e-6);
    assert!((second_mention.mention_confidence - 0.9).abs() < 1e-6);
  }

  #[test]
  fn relationships_resolve_to_merged_entity_ids() {
    let knowledge = UnitKnowledge {
      entities: vec![
        entity("u1", "Jane Smith", 0.8, 1),
        entity("u1", "Acme", 0.7, 1),
      ],
      relationships: vec![ValueRelationship {
        source: "Jane Smith".to_owned(),
        target: "Acme".to_owned(),
        relation: "WORKS_FOR".to_owned(),
        confidence: 0.7,
      }],
      ..UnitKnowledge::default()
    };

    let graph = assemble_episode(
      podcast(),
      episode(),
      Vec::new(),
      vec![(unit("u1", 0.0), knowledge)],
    );
    let rel = &graph.units[0].relationships[0];
    assert_eq!(rel.source_id, entity_id("u1", "jane smith", "person"));
    assert_eq!(rel.target_id, entity_id("u1", "acme", "person"));
  }
}
