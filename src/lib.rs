pub mod error;
pub mod process;
pub mod source;

pub use error::{ConfigError, PipelineError, Stage};
pub use process::{
    process, process_by_chunks, process_into_channel, Dialect, Hooks, ProcessingOptions,
    ProcessingSummary, Record,
};
