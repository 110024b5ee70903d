use neo4rs::{Query, query};

use podseed_core::{Episode, EpisodeStatus, GraphUnit, Podcast, Speaker};
use podseed_shared::PipelineError;

use crate::store::{GraphStore, store_err};

impl GraphStore {
  /// Merge the Podcast and Episode nodes, drop units that no longer exist
  /// in the incoming segmentation, and clear stale analytics attached to
  /// the episode's units. Cluster nodes are deleted, never archived, and
  /// never recreated here.
  ///
  /// `unit_ids` are the deterministic IDs about to be written; an unchanged
  /// re-ingest deletes nothing, a changed one removes the orphans.
  pub async fn upsert_episode_shell(
    &self,
    podcast: &Podcast,
    episode: &Episode,
    unit_ids: &[String],
  ) -> Result<(), PipelineError> {
    let merge = query(
      "MERGE (p:Podcast {id: $podcast_id}) \
       SET p.name = $podcast_name, p.description = $podcast_description \
       MERGE (e:Episode {id: $episode_id}) \
       SET e.title = $title, e.podcast_name = $episode_podcast_name, \
           e.published_date = $published_date, e.duration_seconds = $duration_seconds, \
           e.vtt_path = $vtt_path, e.youtube_url = $youtube_url \
       MERGE (p)-[:HAS_EPISODE]->(e)",
    )
    .param("podcast_id", podcast.id.as_str())
    .param("podcast_name", podcast.name.as_str())
    .param("podcast_description", podcast.description.as_str())
    .param("episode_id", episode.id.as_str())
    .param("title", episode.title.as_str())
    .param("episode_podcast_name", episode.podcast_name.as_str())
    .param("published_date", episode.published_date.clone().unwrap_or_default())
    .param("duration_seconds", episode.duration_seconds)
    .param("vtt_path", episode.vtt_path.as_str())
    .param("youtube_url", episode.youtube_url.clone().unwrap_or_default());
    self.graph.run(merge).await.map_err(store_err)?;

    let drop_clusters = query(
      "MATCH (e:Episode {id: $episode_id})-[:HAS_UNIT]->(:MeaningfulUnit)\
       -[:IN_CLUSTER]->(c:Cluster) \
       DETACH DELETE c",
    )
    .param("episode_id", episode.id.as_str());
    self.graph.run(drop_clusters).await.map_err(store_err)?;

    let drop_stale_units = query(
      "MATCH (e:Episode {id: $episode_id})-[:HAS_UNIT]->(u:MeaningfulUnit) \
       WHERE NOT u.id IN $unit_ids \
       OPTIONAL MATCH (u)-[:CONTAINS_QUOTE]->(q:Quote) \
       OPTIONAL MATCH (u)-[:CONTAINS_INSIGHT]->(i:Insight) \
       DETACH DELETE q, i, u",
    )
    .param("episode_id", episode.id.as_str())
    .param("unit_ids", unit_ids.to_vec());
    self.graph.run(drop_stale_units).await.map_err(store_err)?;

    // Entities only exist through mentions; sweep any left orphaned above.
    let drop_orphan_entities =
      query("MATCH (n:Entity) WHERE NOT (()-[:MENTIONS]->(n)) DETACH DELETE n");
    self
      .graph
      .run(drop_orphan_entities)
      .await
      .map_err(store_err)?;

    Ok(())
  }

  /// Write one unit and everything hanging off it in a single transaction.
  ///
  /// The `NEXT` edge is only created from an already-committed predecessor,
  /// so readers always see a prefix-consistent chain. A failed transaction
  /// rolls back and is retried once; the second failure surfaces as
  /// `StoreError` and the caller skips the unit.
  pub async fn write_unit(
    &self,
    prev_unit_id: Option<&str>,
    unit: &GraphUnit,
    speakers: &[Speaker],
  ) -> Result<(), PipelineError> {
    let mut last_err = None;
    for attempt in 0..2 {
      match self.try_write_unit(prev_unit_id, unit, speakers).await {
        Ok(()) => return Ok(()),
        Err(err) => {
          tracing::warn!(unit_id = %unit.unit.id, attempt, error = %err, "unit write failed");
          last_err = Some(err);
        }
      }
    }
    Err(last_err.expect("two attempts always record an error"))
  }

  async fn try_write_unit(
    &self,
    prev_unit_id: Option<&str>,
    unit: &GraphUnit,
    speakers: &[Speaker],
  ) -> Result<(), PipelineError> {
    let statements = build_unit_statements(prev_unit_id, unit, speakers);
    let mut txn = self.graph.start_txn().await.map_err(store_err)?;
    if let Err(err) = txn.run_queries(statements).await {
      let _ = txn.rollback().await;
      return Err(store_err(err));
    }
    txn.commit().await.map_err(store_err)
  }

  /// Stamp the episode with its processing outcome.
  pub async fn finalize_episode(
    &self,
    episode_id: &str,
    status: EpisodeStatus,
  ) -> Result<(), PipelineError> {
    let finalize = query(
      "MATCH (e:Episode {id: $episode_id}) \
       SET e.processing_timestamp = datetime(), e.status = $status",
    )
    .param("episode_id", episode_id)
    .param("status", status.to_string());
    self.graph.run(finalize).await.map_err(store_err)
  }
}

fn embedding_params(unit: &GraphUnit) -> Option<Vec<f64>> {
  unit
    .unit
    .embedding
    .as_ref()
    .map(|v| v.iter().map(|&x| f64::from(x)).collect())
}

fn build_unit_statements(
  prev_unit_id: Option<&str>,
  unit: &GraphUnit,
  speakers: &[Speaker],
) -> Vec<Query> {
  let mut statements: Vec<Query> = Vec::new();
  let unit_id = unit.unit.id.as_str();

  // Neo4j has no map properties; the distribution goes in as JSON.
  let distribution_json =
    serde_json::to_string(&unit.unit.speaker_distribution).unwrap_or_else(|_| "{}".to_owned());

  let embedding = embedding_params(unit);
  let set_embedding = if embedding.is_some() {
    "u.embedding = $embedding,"
  } else {
    ""
  };
  let mut merge_unit = query(&format!(
    "MATCH (e:Episode {{id: $episode_id}}) \
     MERGE (u:MeaningfulUnit {{id: $unit_id}}) \
     SET {set_embedding} \
         u.unit_type = $unit_type, u.summary = $summary, u.themes = $themes, \
         u.start_time = $start_time, u.end_time = $end_time, \
         u.segment_count = $segment_count, u.text = $text, \
         u.primary_speaker = $primary_speaker, \
         u.speaker_distribution = $speaker_distribution, \
         u.extraction_failed = $extraction_failed \
     MERGE (e)-[:HAS_UNIT]->(u)"
  ))
  .param("episode_id", unit.unit.episode_id.as_str())
  .param("unit_id", unit_id)
  .param("unit_type", unit.unit.unit_type.to_string())
  .param("summary", unit.unit.summary.as_str())
  .param("themes", unit.unit.themes.clone())
  .param("start_time", unit.unit.start_time)
  .param("end_time", unit.unit.end_time)
  .param("segment_count", unit.unit.segment_count as i64)
  .param("text", unit.unit.text.as_str())
  .param("primary_speaker", unit.unit.primary_speaker.as_str())
  .param("speaker_distribution", distribution_json)
  .param("extraction_failed", unit.extraction_failed);
  if let Some(embedding) = embedding {
    merge_unit = merge_unit.param("embedding", embedding);
  }
  statements.push(merge_unit);

  if let Some(prev_id) = prev_unit_id {
    statements.push(
      query(
        "MATCH (p:MeaningfulUnit {id: $prev_id}), (u:MeaningfulUnit {id: $unit_id}) \
         MERGE (p)-[:NEXT]->(u)",
      )
      .param("prev_id", prev_id)
      .param("unit_id", unit_id),
    );
  }

  // Speakers present in this unit's distribution. A lower-confidence
  // identification never downgrades an existing speaker node.
  for speaker in speakers {
    if !unit.unit.speaker_distribution.contains_key(&speaker.name) {
      continue;
    }
    statements.push(
      query(
        "MATCH (u:MeaningfulUnit {id: $unit_id}) \
         MERGE (s:Speaker {id: $speaker_id}) \
         ON CREATE SET s.name = $name, s.role = $role, s.confidence = $confidence \
         ON MATCH SET \
           s.role = CASE WHEN $confidence > s.confidence THEN $role ELSE s.role END, \
           s.confidence = CASE WHEN $confidence > s.confidence \
                          THEN $confidence ELSE s.confidence END \
         MERGE (s)-[:SPEAKS_IN]->(u)",
      )
      .param("unit_id", unit_id)
      .param("speaker_id", speaker.id.as_str())
      .param("name", speaker.name.as_str())
      .param("role", speaker.role.to_string())
      .param("confidence", f64::from(speaker.confidence)),
    );
  }

  // Entity nodes carry episode-merged stats (idempotent SET); the MENTIONS
  // edge carries this unit's own confidence.
  for mention in &unit.mentions {
    let entity = &mention.entity;
    statements.push(
      query(
        "MATCH (u:MeaningfulUnit {id: $unit_id}) \
         MERGE (n:Entity {id: $entity_id}) \
         SET n.name = $name, n.type = $type, n.description = $description, \
             n.confidence = $confidence, n.importance = $importance, \
             n.frequency = $frequency \
         MERGE (u)-[m:MENTIONS]->(n) \
         SET m.confidence = $mention_confidence",
      )
      .param("unit_id", unit_id)
      .param("entity_id", entity.id.as_str())
      .param("name", entity.value.as_str())
      .param("type", entity.entity_type.to_string())
      .param("description", entity.description.clone().unwrap_or_default())
      .param("confidence", f64::from(entity.confidence))
      .param("importance", f64::from(entity.importance))
      .param("frequency", i64::from(entity.frequency))
      .param("mention_confidence", f64::from(mention.mention_confidence)),
    );
  }

  for quote in &unit.quotes {
    statements.push(
      query(
        "MATCH (u:MeaningfulUnit {id: $unit_id}) \
         MERGE (q:Quote {id: $quote_id}) \
         SET q.text = $text, q.speaker = $speaker, q.context = $context, \
             q.quote_type = $quote_type, q.importance = $importance, \
             q.timestamp_start = $timestamp_start, q.timestamp_end = $timestamp_end \
         MERGE (u)-[:CONTAINS_QUOTE]->(q)",
      )
      .param("unit_id", unit_id)
      .param("quote_id", quote.id.as_str())
      .param("text", quote.text.as_str())
      .param("speaker", quote.speaker.as_str())
      .param("context", quote.context.clone().unwrap_or_default())
      .param("quote_type", quote.quote_type.to_string())
      .param("importance", f64::from(quote.importance))
      .param("timestamp_start", quote.timestamp_start)
      .param("timestamp_end", quote.timestamp_end),
    );
  }

  for insight in &unit.insights {
    statements.push(
      query(
        "MATCH (u:MeaningfulUnit {id: $unit_id}) \
         MERGE (i:Insight {id: $insight_id}) \
         SET i.title = $title, i.description = $description, i.type = $type, \
             i.confidence = $confidence, i.supporting_entities = $supporting_entities \
         MERGE (u)-[:CONTAINS_INSIGHT]->(i)",
      )
      .param("unit_id", unit_id)
      .param("insight_id", insight.id.as_str())
      .param("title", insight.title.as_str())
      .param("description", insight.description.as_str())
      .param("type", insight.insight_type.to_string())
      .param("confidence", f64::from(insight.confidence))
      .param("supporting_entities", insight.supporting_entities.clone()),
    );
  }

  for topic in &unit.topics {
    statements.push(
      query(
        "MATCH (u:MeaningfulUnit {id: $unit_id}) \
         MERGE (t:Topic {name: $name}) \
         MERGE (u)-[:DISCUSSES]->(t)",
      )
      .param("unit_id", unit_id)
      .param("name", topic.as_str()),
    );
  }

  for rel in &unit.relationships {
    statements.push(
      query(
        "MATCH (a:Entity {id: $source_id}), (b:Entity {id: $target_id}) \
         MERGE (a)-[r:RELATED_TO]->(b) \
         SET r.type = $type, r.confidence = $confidence",
      )
      .param("source_id", rel.source_id.as_str())
      .param("target_id", rel.target_id.as_str())
      .param("type", rel.relation.as_str())
      .param("confidence", f64::from(rel.confidence)),
    );
  }

  statements
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use podseed_core::{
    Entity, EntityMention, EntityType, MeaningfulUnit, Quote, QuoteType, SpeakerRole, UnitType,
  };

  use super::*;

  fn graph_unit() -> GraphUnit {
    let unit = MeaningfulUnit {
      id: "u1".to_owned(),
      episode_id: "ep".to_owned(),
      unit_type: UnitType::Discussion,
      summary: "s".to_owned(),
      themes: vec!["t".to_owned()],
      start_time: 0.0,
      end_time: 60.0,
      segment_start: 0,
      segment_end: 9,
      segment_count: 10,
      text: "text".to_owned(),
      primary_speaker: "Host".to_owned(),
      speaker_distribution: HashMap::from([("Host".to_owned(), 1.0)]),
      embedding: Some(vec![0.1; 8]),
    };
    GraphUnit {
      unit,
      mentions: vec![EntityMention {
        entity: Entity {
          id: "e1".to_owned(),
          value: "Sleep".to_owned(),
          entity_type: EntityType::Concept,
          confidence: 0.9,
          description: None,
          importance: 0.8,
          frequency: 2,
        },
        mention_confidence: 0.9,
      }],
      quotes: vec![Quote {
        id: "q1".to_owned(),
        text: "quote".to_owned(),
        speaker: "Host".to_owned(),
        context: None,
        quote_type: QuoteType::KeyPoint,
        importance: 0.9,
        timestamp_start: 1.0,
        timestamp_end: 2.0,
      }],
      insights: Vec::new(),
      topics: vec!["sleep".to_owned()],
      relationships: Vec::new(),
      extraction_failed: false,
    }
  }

  fn speakers() -> Vec<Speaker> {
    vec![
      Speaker {
        id: "s1".to_owned(),
        name: "Host".to_owned(),
        role: SpeakerRole::Host,
        confidence: 0.9,
      },
      Speaker {
        id: "s2".to_owned(),
        name: "Absent Guest".to_owned(),
        role: SpeakerRole::Guest,
        confidence: 0.9,
      },
    ]
  }

  #[test]
  fn one_statement_per_graph_element() {
    // unit + NEXT + 1 speaker (the absent one is filtered) + 1 entity
    // + 1 quote + 1 topic = 6
    let statements = build_unit_statements(Some("u0"), &graph_unit(), &speakers());
    assert_eq!(statements.len(), 6);
  }

  #[test]
  fn first_unit_has_no_next_edge() {
    let statements = build_unit_statements(None, &graph_unit(), &speakers());
    assert_eq!(statements.len(), 5);
  }

  #[test]
  fn units_without_an_embedding_still_build() {
    let mut unit = graph_unit();
    unit.unit.embedding = None;
    let statements = build_unit_statements(None, &unit, &speakers());
    assert_eq!(statements.len(), 5);
  }
}
