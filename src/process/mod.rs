//! Streaming CSV processing.
//!
//! Bytes flow through [`RowDecoder`] → [`RowValidator`] → [`BatchAccumulator`]
//! and out to the caller's `on_chunk`, one record at a time. Every hook is
//! awaited before the next record is decoded, so memory stays bounded by one
//! batch plus the reader's buffer.

mod accumulator;
mod decoder;
mod options;
mod pipeline;
mod quotes;
mod record;
mod validator;

pub use accumulator::BatchAccumulator;
pub use decoder::{DecodedRow, RowDecoder};
pub use options::{Dialect, HookFuture, Hooks, ProcessingOptions};
pub use pipeline::{
    process, process_by_chunks, process_into_channel, CsvPipeline, PipelineState,
    ProcessingSummary,
};
pub use record::{FieldKey, Header, InvalidReason, InvalidRow, Record, RowOutcome};
pub use validator::{Predicate, RowValidator};
