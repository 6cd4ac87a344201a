use crate::{protocol::parts::ResultSetMetadata, RelayValue, Row};
use std::sync::Arc;

/// A fully materialized set of rows, as produced by convenience methods that
/// drain a cursor.
#[derive(Debug)]
pub struct Rows {
    metadata: Arc<ResultSetMetadata>,
    rows: Vec<Row>,
}

impl Rows {
    pub fn new(metadata: Arc<ResultSetMetadata>, raw_rows: Vec<Vec<RelayValue>>) -> Self {
        let rows = raw_rows
            .into_iter()
            .map(|values| Row::new(Arc::clone(&metadata), values))
            .collect();
        Self { metadata, rows }
    }

    pub fn metadata(&self) -> &ResultSetMetadata {
        &self.metadata
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }
}

impl IntoIterator for Rows {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;
    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl std::fmt::Display for Rows {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        for row in &self.rows {
            writeln!(fmt, "{row}")?;
        }
        Ok(())
    }
}
