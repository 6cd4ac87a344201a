use crate::{protocol::parts::ResultSetMetadata, RelayError, RelayResult, RelayValue};
use std::sync::Arc;

/// A single line of a result set.
#[derive(Clone, Debug)]
pub struct Row {
    metadata: Arc<ResultSetMetadata>,
    values: Vec<RelayValue>,
}

impl Row {
    pub fn new(metadata: Arc<ResultSetMetadata>, values: Vec<RelayValue>) -> Self {
        Self { metadata, values }
    }

    /// Number of columns.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// The column metadata shared by all rows of the result set.
    pub fn metadata(&self) -> &ResultSetMetadata {
        &self.metadata
    }

    /// The value at the given position.
    pub fn value(&self, index: usize) -> RelayResult<&RelayValue> {
        self.values
            .get(index)
            .ok_or_else(|| RelayError::UsageDetailed(format!("No column at index {index}")))
    }

    /// The value of the column with the given label.
    pub fn value_by_label(&self, label: &str) -> RelayResult<&RelayValue> {
        self.value(self.metadata.index_of(label)?)
    }

    /// Removes and returns the next value; rows are consumed left to right.
    pub fn next_value(&mut self) -> Option<RelayValue> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.values.remove(0))
        }
    }

    pub fn into_values(self) -> Vec<RelayValue> {
        self.values
    }
}

impl std::fmt::Display for Row {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        for value in &self.values {
            write!(fmt, "{value}, ")?;
        }
        Ok(())
    }
}
