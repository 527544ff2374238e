use serde::Serialize;
use serde_json::Value;

use crate::domains::export::types::RowRecord;
use crate::errors::ValidationError;

/// Cell value in header order, borrowed from the row it came from
#[derive(Debug, Clone, PartialEq)]
pub enum Cell<'a> {
    Empty,
    Bool(bool),
    Number(&'a serde_json::Number),
    Text(&'a str),
}

impl Cell<'_> {
    /// Render for text formats
    pub fn to_text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Bool(b) => b.to_string(),
            Cell::Number(n) => n.to_string(),
            Cell::Text(s) => s.to_string(),
        }
    }
}

/// Column layout of an export, fixed by the first non-empty chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowSchema {
    columns: Vec<String>,
}

impl RowSchema {
    pub fn from_row(row: &RowRecord) -> Self {
        Self {
            columns: row.keys().cloned().collect(),
        }
    }

    /// Schema of an export that produced no rows
    pub fn empty() -> Self {
        Self { columns: Vec::new() }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Check that a row has exactly this schema's columns and only scalar
    /// values.
    pub fn validate(&self, row: &RowRecord, chunk_index: u32) -> Result<(), ValidationError> {
        let same_keys = row.len() == self.columns.len()
            && self.columns.iter().all(|c| row.contains_key(c));
        if !same_keys {
            return Err(ValidationError::SchemaMismatch {
                chunk_index,
                expected: self.columns.clone(),
                found: row.keys().cloned().collect(),
            });
        }

        if let Some((column, _)) = row.iter().find(|(_, v)| !is_scalar(v)) {
            return Err(ValidationError::NonScalarValue {
                chunk_index,
                column: column.clone(),
            });
        }

        Ok(())
    }

    pub fn validate_chunk(&self, rows: &[RowRecord], chunk_index: u32) -> Result<(), ValidationError> {
        rows.iter().try_for_each(|row| self.validate(row, chunk_index))
    }

    /// Values of `row` in header order. Fails on a missing column or a
    /// non-scalar value.
    pub fn project<'a>(&self, row: &'a RowRecord) -> Result<Vec<Cell<'a>>, ValidationError> {
        self.columns
            .iter()
            .map(|column| match row.get(column) {
                None => Err(ValidationError::SchemaMismatch {
                    chunk_index: 0,
                    expected: self.columns.clone(),
                    found: row.keys().cloned().collect(),
                }),
                Some(value) => to_cell(value).ok_or_else(|| ValidationError::NonScalarValue {
                    chunk_index: 0,
                    column: column.clone(),
                }),
            })
            .collect()
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn to_cell(value: &Value) -> Option<Cell<'_>> {
    match value {
        Value::Null => Some(Cell::Empty),
        Value::Bool(b) => Some(Cell::Bool(*b)),
        Value::Number(n) => Some(Cell::Number(n)),
        Value::String(s) => Some(Cell::Text(s)),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Approximate encoded width of one row in a text format: every value plus
/// one separator per column (the last one stands in for the line break).
pub fn encoded_width(row: &RowRecord) -> u64 {
    row.values()
        .map(|v| match to_cell(v) {
            Some(cell) => cell.to_text().len() as u64 + 1,
            None => v.to_string().len() as u64 + 1,
        })
        .sum()
}
