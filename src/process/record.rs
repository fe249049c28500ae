use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::{collections::HashSet, fmt, sync::Arc};

/// Column names captured from the first record of a stream.
/// Shared by every record of that stream, so cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    columns: Arc<[String]>,
}

impl Header {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns: columns.into(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Index of `name` in the header, if present.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// First column name that appears more than once.
    pub fn first_duplicate(&self) -> Option<&str> {
        let mut seen = HashSet::with_capacity(self.columns.len());
        self.columns
            .iter()
            .find(|c| !seen.insert(c.as_str()))
            .map(String::as_str)
    }
}

/// How a field is addressed: by header column or by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKey<'a> {
    Column(&'a str),
    Index(usize),
}

impl fmt::Display for FieldKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKey::Column(name) => f.write_str(name),
            FieldKey::Index(idx) => write!(f, "{}", idx),
        }
    }
}

/// One decoded data row. Values are kept as the raw text from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    header: Option<Header>,
    values: Vec<String>,
}

impl Record {
    /// A record keyed by `header`. Returns `None` when the field count differs.
    pub fn keyed(header: &Header, values: Vec<String>) -> Option<Self> {
        if header.len() != values.len() {
            return None;
        }
        Some(Self {
            header: Some(header.clone()),
            values,
        })
    }

    /// Caller guarantees `values.len() == header.len()`.
    pub(crate) fn from_parts(header: Header, values: Vec<String>) -> Self {
        debug_assert_eq!(header.len(), values.len());
        Self {
            header: Some(header),
            values,
        }
    }

    /// A record keyed by field position.
    pub fn positional(values: Vec<String>) -> Self {
        Self {
            header: None,
            values,
        }
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Value of the column named `column`. Always `None` for positional records.
    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.header.as_ref()?.position(column)?;
        self.get_index(idx)
    }

    pub fn get_index(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).map(String::as_str)
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn into_values(self) -> Vec<String> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fields in column order.
    pub fn iter(&self) -> impl Iterator<Item = (FieldKey<'_>, &str)> {
        self.values.iter().enumerate().map(move |(idx, value)| {
            let key = match &self.header {
                Some(header) => FieldKey::Column(&header.columns[idx]),
                None => FieldKey::Index(idx),
            };
            (key, value.as_str())
        })
    }
}

// Keyed records serialize as objects, positional ones as arrays.
impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.header {
            Some(header) => {
                let mut map = serializer.serialize_map(Some(self.values.len()))?;
                for (column, value) in header.columns.iter().zip(&self.values) {
                    map.serialize_entry(column, value)?;
                }
                map.end()
            }
            None => {
                let mut seq = serializer.serialize_seq(Some(self.values.len()))?;
                for value in &self.values {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
        }
    }
}

/// Why a row could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    UnequalLengths { expected: usize, found: usize },
    InvalidUtf8 { field: usize },
    /// A quoted field was still open when the input ended.
    UnterminatedQuote,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::UnequalLengths { expected, found } => {
                write!(f, "expected {} fields, found {}", expected, found)
            }
            InvalidReason::InvalidUtf8 { field } => {
                write!(f, "field {} is not valid UTF-8", field)
            }
            InvalidReason::UnterminatedQuote => f.write_str("missing closing quote"),
        }
    }
}

/// A structurally invalid row, as handed to `on_data_invalid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRow {
    /// 1-based, counted from the first data row.
    pub row_number: u64,
    /// Raw field text; invalid UTF-8 is replaced lossily.
    pub fields: Vec<String>,
    pub reason: InvalidReason,
}

/// Classification of a single data row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Accepted(Record),
    RejectedByValidator(Record),
    Invalid(InvalidRow),
}
