mod checkpoint;
pub use checkpoint::{Checkpoint, CheckpointStore};

mod report;
pub use report::EpisodeReport;

mod pipeline;
pub use pipeline::{EpisodeRequest, Pipeline, PipelineConfig};
