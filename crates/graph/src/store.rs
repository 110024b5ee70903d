use neo4rs::{ConfigBuilder, Graph, query};

use podseed_shared::{AppEnv, PipelineError};

/// Index name the retrieval primitive queries against.
pub(crate) const VECTOR_INDEX: &str = "unit_embedding";

pub(crate) fn store_err(err: impl std::fmt::Display) -> PipelineError {
  PipelineError::Store(err.to_string())
}

/// Connection to the labeled property graph.
///
/// The driver is shared; every unit write opens its own transaction and no
/// session outlives a single unit's write.
pub struct GraphStore {
  pub(crate) graph: Graph,
  pub(crate) dimensions: usize,
}

impl GraphStore {
  pub async fn connect(env: &AppEnv) -> Result<Self, PipelineError> {
    let config = ConfigBuilder::default()
      .uri(&env.neo4j_uri)
      .user(&env.neo4j_user)
      .password(&env.neo4j_password)
      .db(env.neo4j_database.as_str())
      .build()
      .map_err(store_err)?;
    let graph = Graph::connect(config).await.map_err(store_err)?;
    Ok(Self {
      graph,
      dimensions: env.embedding_dimensions,
    })
  }

  /// Create constraints and indexes, including the vector index over unit
  /// embeddings. Every statement is `IF NOT EXISTS`, so this runs on every
  /// connect.
  pub async fn setup_schema(&self) -> Result<(), PipelineError> {
    let statements = [
      // Uniqueness constraints: the deterministic IDs are the merge keys.
      "CREATE CONSTRAINT podcast_id IF NOT EXISTS FOR (p:Podcast) REQUIRE p.id IS UNIQUE",
      "CREATE CONSTRAINT episode_id IF NOT EXISTS FOR (e:Episode) REQUIRE e.id IS UNIQUE",
      "CREATE CONSTRAINT unit_id IF NOT EXISTS FOR (u:MeaningfulUnit) REQUIRE u.id IS UNIQUE",
      "CREATE CONSTRAINT entity_id IF NOT EXISTS FOR (n:Entity) REQUIRE n.id IS UNIQUE",
      "CREATE CONSTRAINT topic_name IF NOT EXISTS FOR (t:Topic) REQUIRE t.name IS UNIQUE",
      // Secondary indexes for the read paths.
      "CREATE INDEX episode_title IF NOT EXISTS FOR (e:Episode) ON (e.title)",
      "CREATE INDEX episode_published_date IF NOT EXISTS FOR (e:Episode) ON (e.published_date)",
      "CREATE INDEX unit_start_time IF NOT EXISTS FOR (u:MeaningfulUnit) ON (u.start_time)",
      "CREATE INDEX unit_primary_speaker IF NOT EXISTS FOR (u:MeaningfulUnit) ON (u.primary_speaker)",
      "CREATE INDEX entity_name IF NOT EXISTS FOR (n:Entity) ON (n.name)",
      "CREATE INDEX entity_type IF NOT EXISTS FOR (n:Entity) ON (n.type)",
    ];
    for statement in statements {
      self.graph.run(query(statement)).await.map_err(store_err)?;
    }

    let vector_index = format!(
      "CREATE VECTOR INDEX {VECTOR_INDEX} IF NOT EXISTS \
       FOR (u:MeaningfulUnit) ON (u.embedding) \
       OPTIONS {{indexConfig: {{`vector.dimensions`: {}, `vector.similarity_function`: 'cosine'}}}}",
      self.dimensions
    );
    self.graph.run(query(&vector_index)).await.map_err(store_err)?;

    tracing::info!(dimensions = self.dimensions, "graph schema ready");
    Ok(())
  }
}
