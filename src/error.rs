use std::fmt;

use thiserror::Error;

use crate::process::InvalidReason;

/// Boxed error returned by a failing hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The part of the pipeline an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Stream,
    Decode,
    Row,
    Chunk,
    Finish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "config",
            Stage::Stream => "stream",
            Stage::Decode => "decode",
            Stage::Row => "on_row",
            Stage::Chunk => "on_chunk",
            Stage::Finish => "on_finish",
        };
        f.write_str(name)
    }
}

/// Rejected processing options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("batch size must be a positive integer")]
    ZeroBatchSize,

    #[error("dialect option `{option}` must be an ASCII character, got {value:?}")]
    NonAscii { option: &'static str, value: char },

    #[error("delimiter and quote must differ (both {0:?})")]
    DelimiterIsQuote(char),

    #[error("reader buffer capacity must be positive")]
    ZeroBufferCapacity,
}

/// Terminal failure of a processing invocation.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A structurally invalid row while `skip_invalid_rows` is off.
    #[error("invalid row [row_number={row_number}]: {reason}")]
    InvalidRow {
        row_number: u64,
        reason: InvalidReason,
    },

    /// The input could not be decoded at all (bad header, CSV engine failure).
    #[error("failed to decode csv input: {message}")]
    Decode {
        row_number: Option<u64>,
        message: String,
    },

    #[error("failed to read csv input: {0}")]
    StreamIo(#[from] std::io::Error),

    #[error("{stage} hook failed: {source}")]
    Consumer {
        stage: Stage,
        #[source]
        source: HookError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    pub(crate) fn consumer(stage: Stage, err: anyhow::Error) -> Self {
        PipelineError::Consumer {
            stage,
            source: err.into(),
        }
    }

    /// Which stage failed.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::InvalidRow { .. } | PipelineError::Decode { .. } => Stage::Decode,
            PipelineError::StreamIo(_) => Stage::Stream,
            PipelineError::Consumer { stage, .. } => *stage,
            PipelineError::Config(_) => Stage::Config,
        }
    }

    /// The 1-based data row the error refers to, when known.
    pub fn row_number(&self) -> Option<u64> {
        match self {
            PipelineError::InvalidRow { row_number, .. } => Some(*row_number),
            PipelineError::Decode { row_number, .. } => *row_number,
            _ => None,
        }
    }
}
