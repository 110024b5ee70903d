use neo4rs::query;
use tokio_util::sync::CancellationToken;

use podseed_ai::Embedder;
use podseed_shared::PipelineError;

use crate::store::{GraphStore, VECTOR_INDEX, store_err};

/// One vector-search hit, with everything the chat collaborator needs to
/// compose an answer.
#[derive(Debug, Clone)]
pub struct RetrievedUnit {
  pub unit_id: String,
  pub summary: String,
  pub text: String,
  pub episode_title: String,
  pub start_time: f64,
  pub end_time: f64,
  pub score: f64,
}

impl GraphStore {
  /// Embed the query and return the `top_k` nearest units by cosine
  /// similarity. Answer composition is the caller's business.
  pub async fn search_units(
    &self,
    embedder: &Embedder,
    query_text: &str,
    top_k: usize,
    cancel: &CancellationToken,
  ) -> Result<Vec<RetrievedUnit>, PipelineError> {
    let embedding = embedder
      .embed(query_text, cancel)
      .await?
      .ok_or_else(|| {
        PipelineError::TransientProvider("query embedding unavailable".to_owned())
      })?;
    let embedding: Vec<f64> = embedding.iter().map(|&x| f64::from(x)).collect();

    let search = query(&format!(
      "CALL db.index.vector.queryNodes('{VECTOR_INDEX}', $top_k, $embedding) \
       YIELD node, score \
       MATCH (e:Episode)-[:HAS_UNIT]->(node) \
       RETURN node.id AS unit_id, node.summary AS summary, node.text AS text, \
              e.title AS episode_title, node.start_time AS start_time, \
              node.end_time AS end_time, score \
       ORDER BY score DESC"
    ))
    .param("top_k", top_k as i64)
    .param("embedding", embedding);

    let mut rows = self.graph.execute(search).await.map_err(store_err)?;
    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(store_err)? {
      results.push(RetrievedUnit {
        unit_id: row.get("unit_id").map_err(store_err)?,
        summary: row.get("summary").map_err(store_err)?,
        text: row.get("text").map_err(store_err)?,
        episode_title: row.get("episode_title").map_err(store_err)?,
        start_time: row.get("start_time").map_err(store_err)?,
        end_time: row.get("end_time").map_err(store_err)?,
        score: row.get("score").map_err(store_err)?,
      });
    }
    Ok(results)
  }
}
