use anyhow::{Context, Result};
use csv_async::{AsyncReaderBuilder, Trim};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, future::Future, num::NonZeroUsize, path::Path};

use super::record::{Header, InvalidRow, Record};
use crate::error::ConfigError;

const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Settings for one processing invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingOptions {
    /// Records per delivered batch. Zero is rejected on deserialization.
    pub batch_size: NonZeroUsize,
    /// Treat the first record as column names.
    #[serde(default = "default_headers")]
    pub headers: bool,
    /// Drop structurally invalid rows instead of failing.
    #[serde(default)]
    pub skip_invalid_rows: bool,
    #[serde(default)]
    pub dialect: Dialect,
}

fn default_headers() -> bool {
    true
}

impl ProcessingOptions {
    pub fn new(batch_size: NonZeroUsize) -> Self {
        Self {
            batch_size,
            headers: default_headers(),
            skip_invalid_rows: false,
            dialect: Dialect::default(),
        }
    }

    /// Same as [`ProcessingOptions::new`] for a plain integer.
    pub fn with_batch_size(batch_size: usize) -> Result<Self, ConfigError> {
        NonZeroUsize::new(batch_size)
            .map(Self::new)
            .ok_or(ConfigError::ZeroBatchSize)
    }

    pub fn headers(mut self, headers: bool) -> Self {
        self.headers = headers;
        self
    }

    pub fn skip_invalid_rows(mut self, skip: bool) -> Self {
        self.skip_invalid_rows = skip;
        self
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Load options from a `.json` file, or YAML for any other extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading options file {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("json"));

        let options: Self = if is_json {
            serde_json::from_str(&text)
                .with_context(|| format!("parsing JSON options {}", path.display()))?
        } else {
            serde_yaml::from_str(&text)
                .with_context(|| format!("parsing YAML options {}", path.display()))?
        };
        options.dialect.validate()?;
        Ok(options)
    }
}

/// Delimiter and quoting convention handed to the CSV reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Dialect {
    pub delimiter: char,
    pub quote: char,
    /// Escape character inside quotes. `None` means doubled quotes (`""`).
    pub escape: Option<char>,
    /// Trim whitespace around headers and fields.
    pub trim: bool,
    /// Lines starting with this character are ignored.
    pub comment: Option<char>,
    /// Size of the reader's internal buffer, in bytes.
    pub buffer_capacity: usize,
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote: '"',
            escape: None,
            trim: false,
            comment: None,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl Dialect {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ascii("delimiter", self.delimiter)?;
        ascii("quote", self.quote)?;
        if let Some(escape) = self.escape {
            ascii("escape", escape)?;
        }
        if let Some(comment) = self.comment {
            ascii("comment", comment)?;
        }
        if self.delimiter == self.quote {
            return Err(ConfigError::DelimiterIsQuote(self.delimiter));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::ZeroBufferCapacity);
        }
        Ok(())
    }

    /// Reader builder for this dialect. Headers and column counts are left to the decoder.
    pub(crate) fn reader_builder(&self) -> Result<AsyncReaderBuilder, ConfigError> {
        self.validate()?;

        let mut builder = AsyncReaderBuilder::new();
        builder
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter as u8)
            .quote(self.quote as u8)
            .escape(self.escape.map(|c| c as u8))
            .double_quote(self.escape.is_none())
            .comment(self.comment.map(|c| c as u8))
            .trim(if self.trim { Trim::All } else { Trim::None })
            .buffer_capacity(self.buffer_capacity);
        Ok(builder)
    }
}

fn ascii(option: &'static str, value: char) -> Result<(), ConfigError> {
    if value.is_ascii() {
        Ok(())
    } else {
        Err(ConfigError::NonAscii { option, value })
    }
}

/// Future returned by the async hooks.
pub type HookFuture = BoxFuture<'static, anyhow::Result<()>>;

type HeadersHook = Box<dyn FnMut(&Header) + Send>;
type RowHook = Box<dyn FnMut(&Record) -> HookFuture + Send>;
type ValidateHook = Box<dyn Fn(&Record) -> bool + Send + Sync>;
type InvalidHook = Box<dyn FnMut(&InvalidRow) + Send>;
type FinishHook = Box<dyn FnOnce() -> HookFuture + Send>;

/// Lifecycle callbacks. Every hook is optional; unset hooks are skipped.
#[derive(Default)]
pub struct Hooks {
    pub(crate) on_headers: Option<HeadersHook>,
    pub(crate) on_row: Option<RowHook>,
    pub(crate) on_validate: Option<ValidateHook>,
    pub(crate) on_data_invalid: Option<InvalidHook>,
    pub(crate) on_finish: Option<FinishHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once with the captured header.
    pub fn on_headers<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Header) + Send + 'static,
    {
        self.on_headers = Some(Box::new(f));
        self
    }

    /// Awaited for every decoded row, before validation.
    pub fn on_row<F, Fut>(mut self, mut f: F) -> Self
    where
        F: FnMut(&Record) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_row = Some(Box::new(move |record| f(record).boxed()));
        self
    }

    /// Rows for which this returns `false` are silently dropped.
    pub fn on_validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.on_validate = Some(Box::new(f));
        self
    }

    /// Called for every structurally invalid row, skipped or not.
    pub fn on_data_invalid<F>(mut self, f: F) -> Self
    where
        F: FnMut(&InvalidRow) + Send + 'static,
    {
        self.on_data_invalid = Some(Box::new(f));
        self
    }

    /// Awaited once at clean end of stream, before the last partial batch is flushed.
    pub fn on_finish<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_finish = Some(Box::new(move || f().boxed()));
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_headers", &self.on_headers.is_some())
            .field("on_row", &self.on_row.is_some())
            .field("on_validate", &self.on_validate.is_some())
            .field("on_data_invalid", &self.on_data_invalid.is_some())
            .field("on_finish", &self.on_finish.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_zero_batch_size_rejected() {
        assert_eq!(
            ProcessingOptions::with_batch_size(0).unwrap_err(),
            ConfigError::ZeroBatchSize
        );
        let opts = ProcessingOptions::with_batch_size(10).unwrap();
        assert_eq!(opts.batch_size.get(), 10);
        assert!(opts.headers);
        assert!(!opts.skip_invalid_rows);
    }

    #[test]
    fn test_yaml_defaults() {
        let opts: ProcessingOptions = serde_yaml::from_str("batch_size: 25\n").unwrap();
        assert_eq!(opts.batch_size.get(), 25);
        assert!(opts.headers);
        assert!(!opts.skip_invalid_rows);
        assert_eq!(opts.dialect, Dialect::default());

        assert!(serde_yaml::from_str::<ProcessingOptions>("batch_size: 0\n").is_err());
        assert!(serde_yaml::from_str::<ProcessingOptions>("headers: true\n").is_err());
    }

    #[test]
    fn test_from_path_json_and_yaml() -> Result<()> {
        let mut json = tempfile::Builder::new().suffix(".json").tempfile()?;
        write!(
            json,
            r#"{{"batch_size": 3, "headers": false, "dialect": {{"delimiter": ";"}}}}"#
        )?;
        let opts = ProcessingOptions::from_path(json.path())?;
        assert_eq!(opts.batch_size.get(), 3);
        assert!(!opts.headers);
        assert_eq!(opts.dialect.delimiter, ';');
        assert_eq!(opts.dialect.quote, '"');

        let mut yaml = NamedTempFile::new()?;
        writeln!(yaml, "batch_size: 2\nskip_invalid_rows: true")?;
        let opts = ProcessingOptions::from_path(yaml.path())?;
        assert!(opts.skip_invalid_rows);
        Ok(())
    }

    #[test]
    fn test_from_path_rejects_bad_dialect() -> Result<()> {
        let mut yaml = NamedTempFile::new()?;
        writeln!(yaml, "batch_size: 2\ndialect:\n  delimiter: '\"'")?;
        let err = ProcessingOptions::from_path(yaml.path()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::DelimiterIsQuote('"'))
        );
        Ok(())
    }

    #[test]
    fn test_dialect_validation() {
        let bad = Dialect {
            delimiter: '§',
            ..Dialect::default()
        };
        assert_eq!(
            bad.validate(),
            Err(ConfigError::NonAscii {
                option: "delimiter",
                value: '§'
            })
        );

        let bad = Dialect {
            buffer_capacity: 0,
            ..Dialect::default()
        };
        assert_eq!(bad.validate(), Err(ConfigError::ZeroBufferCapacity));

        let tabs = Dialect {
            delimiter: '\t',
            escape: Some('\\'),
            ..Dialect::default()
        };
        assert!(tabs.reader_builder().is_ok());
    }

    #[test]
    fn test_hooks_debug_shows_presence() {
        let hooks = Hooks::new().on_validate(|_| true);
        let text = format!("{:?}", hooks);
        assert!(text.contains("on_validate: true"));
        assert!(text.contains("on_row: false"));
    }
}
