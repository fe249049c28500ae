use anyhow::anyhow;
use serde::Serialize;
use std::{fmt, future::Future};
use tokio::{io::AsyncRead, sync::mpsc};
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
    accumulator::BatchAccumulator,
    decoder::{DecodedRow, RowDecoder},
    options::{Hooks, ProcessingOptions},
    record::{InvalidRow, Record, RowOutcome},
    validator::RowValidator,
};
use crate::error::{PipelineError, Stage};

/// Lifecycle of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Streaming,
    Finished,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Finished | PipelineState::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Idle, Streaming | Finished | Failed) | (Streaming, Finished | Failed)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Counters returned by a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingSummary {
    /// Data rows decoded, valid or not.
    pub rows: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub skipped_invalid: u64,
    pub batches: u64,
}

/// Consumer type used when a run delivers no batches.
type NoChunks = fn(Vec<Record>) -> std::future::Ready<anyhow::Result<()>>;

/// Decoder → validator → accumulator over a single input stream.
///
/// A pipeline runs once: `run` consumes it and ends `Finished` or `Failed`.
/// Each stage is awaited before the next record is decoded, so at most one
/// batch of accepted records is held at a time.
#[derive(Debug)]
pub struct CsvPipeline {
    options: ProcessingOptions,
    hooks: Hooks,
    state: PipelineState,
    summary: ProcessingSummary,
}

impl CsvPipeline {
    pub fn new(options: ProcessingOptions, hooks: Hooks) -> Result<Self, PipelineError> {
        options.dialect.validate()?;
        Ok(Self {
            options,
            hooks,
            state: PipelineState::Idle,
            summary: ProcessingSummary::default(),
        })
    }

    /// Run in batched mode, awaiting `on_chunk` for every batch.
    pub async fn run<R, F, Fut>(
        self,
        reader: R,
        on_chunk: F,
    ) -> Result<ProcessingSummary, PipelineError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(Vec<Record>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.drive(reader, Some(on_chunk)).await
    }

    /// Run without batching; accepted rows are only counted.
    pub async fn run_unbatched<R>(self, reader: R) -> Result<ProcessingSummary, PipelineError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.drive(reader, None::<NoChunks>).await
    }

    async fn drive<R, F, Fut>(
        mut self,
        reader: R,
        mut on_chunk: Option<F>,
    ) -> Result<ProcessingSummary, PipelineError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(Vec<Record>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        match self.stream(reader, &mut on_chunk).await {
            Ok(()) => {
                self.advance(PipelineState::Finished);
                let s = self.summary;
                info!(
                    rows = s.rows,
                    accepted = s.accepted,
                    rejected = s.rejected,
                    skipped_invalid = s.skipped_invalid,
                    batches = s.batches,
                    "csv stream finished"
                );
                Ok(s)
            }
            Err(err) => {
                self.advance(PipelineState::Failed);
                error!(
                    stage = %err.stage(),
                    row_number = ?err.row_number(),
                    "csv stream failed: {}",
                    err
                );
                Err(err)
            }
        }
    }

    async fn stream<R, F, Fut>(
        &mut self,
        reader: R,
        on_chunk: &mut Option<F>,
    ) -> Result<(), PipelineError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(Vec<Record>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut decoder = RowDecoder::new(reader, self.options.headers, &self.options.dialect)?;
        let validator = RowValidator::new(self.hooks.on_validate.take());
        let mut accumulator = BatchAccumulator::new(self.options.batch_size);

        while let Some(row) = decoder.next_row().await? {
            if self.state == PipelineState::Idle {
                self.advance(PipelineState::Streaming);
            }

            let data = match row {
                DecodedRow::Header(header) => {
                    if let Some(on_headers) = self.hooks.on_headers.as_mut() {
                        on_headers(&header);
                    }
                    continue;
                }
                DecodedRow::Data(data) => data,
            };

            self.summary.rows += 1;
            if let (Ok(record), Some(on_row)) = (&data, self.hooks.on_row.as_mut()) {
                on_row(record)
                    .await
                    .map_err(|e| PipelineError::consumer(Stage::Row, e))?;
            }

            match validator.classify(data) {
                RowOutcome::Accepted(record) => {
                    self.summary.accepted += 1;
                    if let Some(deliver) = on_chunk.as_mut() {
                        if let Some(batch) = accumulator.push(record) {
                            self.deliver(deliver, batch).await?;
                        }
                    }
                }
                RowOutcome::RejectedByValidator(_) => {
                    self.summary.rejected += 1;
                    trace!(row_number = decoder.rows_read(), "row rejected by validator");
                }
                RowOutcome::Invalid(invalid) => self.handle_invalid(invalid)?,
            }
        }

        if let Some(on_finish) = self.hooks.on_finish.take() {
            on_finish()
                .await
                .map_err(|e| PipelineError::consumer(Stage::Finish, e))?;
        }
        if let Some(deliver) = on_chunk.as_mut() {
            if let Some(batch) = accumulator.finish() {
                self.deliver(deliver, batch).await?;
            }
        }
        Ok(())
    }

    async fn deliver<F, Fut>(
        &mut self,
        on_chunk: &mut F,
        batch: Vec<Record>,
    ) -> Result<(), PipelineError>
    where
        F: FnMut(Vec<Record>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let len = batch.len();
        on_chunk(batch)
            .await
            .map_err(|e| PipelineError::consumer(Stage::Chunk, e))?;
        self.summary.batches += 1;
        debug!(batch = self.summary.batches, len, "delivered batch");
        Ok(())
    }

    fn handle_invalid(&mut self, invalid: InvalidRow) -> Result<(), PipelineError> {
        warn!(
            row_number = invalid.row_number,
            fields = ?invalid.fields,
            "invalid row: {}",
            invalid.reason
        );
        if let Some(on_data_invalid) = self.hooks.on_data_invalid.as_mut() {
            on_data_invalid(&invalid);
        }

        if self.options.skip_invalid_rows {
            self.summary.skipped_invalid += 1;
            return Ok(());
        }
        Err(PipelineError::InvalidRow {
            row_number: invalid.row_number,
            reason: invalid.reason,
        })
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "pipeline state");
        self.state = next;
    }
}

/// Stream `reader` through the pipeline, handing each full batch to `on_chunk`.
#[instrument(level = "debug", skip_all, fields(batch_size = options.batch_size.get(), headers = options.headers))]
pub async fn process_by_chunks<R, F, Fut>(
    reader: R,
    options: ProcessingOptions,
    hooks: Hooks,
    on_chunk: F,
) -> Result<ProcessingSummary, PipelineError>
where
    R: AsyncRead + Unpin + Send,
    F: FnMut(Vec<Record>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    CsvPipeline::new(options, hooks)?.run(reader, on_chunk).await
}

/// Stream `reader` through decoder, validator and hooks without batching.
/// `options.batch_size` is ignored.
#[instrument(level = "debug", skip_all, fields(headers = options.headers))]
pub async fn process<R>(
    reader: R,
    options: ProcessingOptions,
    hooks: Hooks,
) -> Result<ProcessingSummary, PipelineError>
where
    R: AsyncRead + Unpin + Send,
{
    CsvPipeline::new(options, hooks)?.run_unbatched(reader).await
}

/// Batched mode whose consumer is a bounded channel.
/// A full channel holds the pipeline back; a dropped receiver fails the run.
pub async fn process_into_channel<R>(
    reader: R,
    options: ProcessingOptions,
    hooks: Hooks,
    tx: mpsc::Sender<Vec<Record>>,
) -> Result<ProcessingSummary, PipelineError>
where
    R: AsyncRead + Unpin + Send,
{
    process_by_chunks(reader, options, hooks, move |batch| {
        let tx = tx.clone();
        async move {
            tx.send(batch)
                .await
                .map_err(|_| anyhow!("batch receiver dropped"))
        }
    })
    .await
}
