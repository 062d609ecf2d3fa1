pub mod input;
pub mod pipeline;
pub mod validate;

pub use input::{IngestRequest, MetricInput};
pub use pipeline::{IngestConfig, IngestPipeline, PipelineHandle, SubmitError, SubmitSummary};
pub use validate::Validator;
