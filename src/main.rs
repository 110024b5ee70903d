use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use podseed_ai::{Embedder, KeyPool, KeyQuota, LlmClient, OpenAiEmbeddings, OpenAiProvider,
  RetryPolicy};
use podseed_graph::GraphStore;
use podseed_pipeline::{CheckpointStore, EpisodeRequest, Pipeline, PipelineConfig};
use podseed_shared::{AppEnv, PipelineError};

#[derive(Parser)]
#[command(name = "podseed", about = "Seed a podcast knowledge graph from WebVTT transcripts")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Process one VTT transcript into the knowledge graph
  Process {
    /// Path to the .vtt transcript
    vtt_path: PathBuf,
    /// Podcast name (also the podcast's stable key)
    #[arg(long)]
    podcast: String,
    /// Episode title
    #[arg(long)]
    title: String,
    /// Episode description, used for speaker identification
    #[arg(long, default_value = "")]
    description: String,
    /// Published date (YYYY-MM-DD); the file hash is used when absent
    #[arg(long)]
    published: Option<String>,
    /// Source video URL
    #[arg(long)]
    url: Option<String>,
    /// Overall pipeline timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
  },
  /// Query the vector index for the nearest units
  Search {
    query: String,
    #[arg(long, default_value_t = 5)]
    top_k: usize,
  },
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let cli = Cli::parse();

  let env = match AppEnv::from_env() {
    Ok(env) => env,
    Err(err) => {
      tracing::error!(error = %err, "configuration error");
      return ExitCode::from(4);
    }
  };

  let code = match run(cli, env).await {
    Ok(code) => code,
    Err(err) => {
      tracing::error!(error = %err, "episode processing aborted");
      err.exit_code()
    }
  };
  ExitCode::from(code.clamp(0, 255) as u8)
}

async fn run(cli: Cli, env: AppEnv) -> Result<i32, PipelineError> {
  let pipeline = build_pipeline(&env).await?;

  // Ctrl-C propagates as cooperative cancellation; committed units are
  // flushed before the process exits 130.
  let cancel = CancellationToken::new();
  {
    let cancel = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("interrupt received; cancelling");
        cancel.cancel();
      }
    });
  }

  match cli.command {
    Command::Process {
      vtt_path,
      podcast,
      title,
      description,
      published,
      url,
      timeout,
    } => {
      let mut config = PipelineConfig::from_env(&env);
      if let Some(secs) = timeout {
        config.pipeline_timeout = Duration::from_secs(secs);
      }
      let pipeline = pipeline.with_config(config);

      let request = EpisodeRequest {
        vtt_path,
        podcast_name: podcast,
        episode_title: title,
        episode_description: description,
        published_date: published,
        youtube_url: url,
      };
      let report = pipeline.process_episode(request, cancel).await?;

      for key in pipeline.key_snapshot() {
        tracing::info!(
          key = %key.fingerprint,
          minute_requests = key.minute_requests,
          day_requests = key.day_requests,
          cooled_down = key.cooled_down,
          "key usage"
        );
      }
      Ok(report.exit_code())
    }
    Command::Search { query, top_k } => {
      let results = pipeline.search(&query, top_k, &cancel).await?;
      for (rank, unit) in results.iter().enumerate() {
        println!(
          "{}. [{:.3}] {} ({:.0}s-{:.0}s): {}",
          rank + 1,
          unit.score,
          unit.episode_title,
          unit.start_time,
          unit.end_time,
          unit.summary,
        );
      }
      Ok(0)
    }
  }
}

async fn build_pipeline(env: &AppEnv) -> Result<Pipeline, PipelineError> {
  let keys = KeyPool::new(env.llm_api_keys.clone(), KeyQuota::default(), &env.state_dir)?;
  let provider = Arc::new(OpenAiProvider::new(
    env.llm_base_url.as_str(),
    env.llm_model.as_str(),
  ));
  let retry = RetryPolicy {
    max_retries: env.max_retries,
    ..RetryPolicy::default()
  };
  let llm = Arc::new(LlmClient::new(provider, keys, retry));

  let embedding_key = env
    .llm_api_keys
    .first()
    .cloned()
    .unwrap_or_default();
  let embeddings = Arc::new(OpenAiEmbeddings::new(
    env.llm_base_url.as_str(),
    embedding_key,
    env.embedding_model.as_str(),
    env.embedding_dimensions,
  ));
  let embedder = Arc::new(Embedder::new(
    embeddings,
    env.embedding_dimensions,
    env.offline_mode,
  ));

  let store = Arc::new(GraphStore::connect(env).await?);
  store.setup_schema().await?;

  let checkpoints = CheckpointStore::new(env.checkpoint_dir.clone())?;
  Ok(Pipeline::new(
    llm,
    embedder,
    store,
    checkpoints,
    PipelineConfig::from_env(env),
  ))
}
