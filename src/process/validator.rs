use super::record::{InvalidRow, Record, RowOutcome};

/// Caller-supplied acceptance test for a record.
pub type Predicate = Box<dyn Fn(&Record) -> bool + Send + Sync>;

/// Applies the caller's predicate to decoded records.
/// Structurally invalid rows pass straight through as `Invalid`.
#[derive(Default)]
pub struct RowValidator {
    predicate: Option<Predicate>,
}

impl RowValidator {
    pub fn new(predicate: Option<Predicate>) -> Self {
        Self { predicate }
    }

    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn classify(&self, data: Result<Record, InvalidRow>) -> RowOutcome {
        let record = match data {
            Ok(record) => record,
            Err(invalid) => return RowOutcome::Invalid(invalid),
        };
        match &self.predicate {
            Some(accepts) if !accepts(&record) => RowOutcome::RejectedByValidator(record),
            _ => RowOutcome::Accepted(record),
        }
    }
}
