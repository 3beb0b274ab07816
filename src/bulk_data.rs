//! Tabular data exchanged between steps and backends.
//!
//! A [`BulkData`] is an ordered list of unique column names plus rows whose
//! arity matches the header. It is the only shape that crosses an executor
//! boundary and the only shape persisted as a local table file.
//!
//! The delimited-text form is comma separated with a header line. Fields are
//! quoted when they contain a comma, a quote, a line break or surrounding
//! spaces; quotes inside a quoted field are doubled.

use std::collections::HashSet;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TabularError {
    #[error("duplicate column name '{0}'")]
    DuplicateField(String),

    #[error("row {row} has {found} values, expected {expected}")]
    Arity {
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("unterminated quoted field starting on record {0}")]
    UnterminatedQuote(usize),

    #[error("header mismatch: expected [{expected}], found [{found}]")]
    HeaderMismatch { expected: String, found: String },
}

/// Immutable table: column names and rows.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BulkData {
    fields: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl BulkData {
    /// Build a table, checking that field names are unique and every row has
    /// one value per field.
    pub fn new(fields: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, TabularError> {
        let mut seen = HashSet::with_capacity(fields.len());
        for field in &fields {
            if !seen.insert(field.as_str()) {
                return Err(TabularError::DuplicateField(field.clone()));
            }
        }
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != fields.len() {
                return Err(TabularError::Arity {
                    row: idx + 1,
                    found: row.len(),
                    expected: fields.len(),
                });
            }
        }
        Ok(Self { fields, rows })
    }

    /// A table with no columns and no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    /// Value of the first column of the first row.
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first().and_then(|row| row.first()).map(String::as_str)
    }

    /// Split into tables of at most `max_rows` rows, each with the full header.
    pub fn chunks(&self, max_rows: usize) -> Vec<BulkData> {
        let max_rows = max_rows.max(1);
        self.rows
            .chunks(max_rows)
            .map(|rows| BulkData {
                fields: self.fields.clone(),
                rows: rows.to_vec(),
            })
            .collect()
    }

    /// Concatenate tables that share a header, keeping the first header.
    ///
    /// Tables without any columns (an empty result chunk) are skipped.
    pub fn concat(parts: Vec<BulkData>) -> Result<BulkData, TabularError> {
        let mut parts = parts.into_iter().filter(|p| !p.fields.is_empty());
        let Some(mut combined) = parts.next() else {
            return Ok(BulkData::empty());
        };
        for part in parts {
            if part.fields != combined.fields {
                return Err(TabularError::HeaderMismatch {
                    expected: combined.fields.join(","),
                    found: part.fields.join(","),
                });
            }
            combined.rows.extend(part.rows);
        }
        Ok(combined)
    }

    /// Render as delimited text: header line, then one line per row.
    pub fn to_csv(&self) -> String {
        if self.fields.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        write_record(&mut out, &self.fields);
        for row in &self.rows {
            write_record(&mut out, row);
        }
        out
    }

    /// Render rows only, without the header line.
    pub fn rows_to_csv(&self) -> String {
        let mut out = String::new();
        for row in &self.rows {
            write_record(&mut out, row);
        }
        out
    }

    /// Parse delimited text whose first record is the header.
    pub fn from_csv(text: &str) -> Result<Self, TabularError> {
        let mut records = read_records(text)?.into_iter();
        let Some(fields) = records.next() else {
            return Ok(BulkData::empty());
        };
        BulkData::new(fields, records.collect())
    }
}

/// Parse header-less delimited text into raw records.
pub fn parse_records(text: &str) -> Result<Vec<Vec<String>>, TabularError> {
    read_records(text)
}

fn needs_quotes(value: &str) -> bool {
    value.contains([',', '"', '\n', '\r'])
        || value.starts_with(' ')
        || value.ends_with(' ')
}

fn write_record(out: &mut String, values: &[String]) {
    // a lone empty value would otherwise render as a blank line
    let quote_empty = values.len() == 1;
    for (idx, value) in values.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        if needs_quotes(value) || (quote_empty && value.is_empty()) {
            out.push('"');
            out.push_str(&value.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(value);
        }
    }
    out.push('\n');
}

fn read_records(text: &str) -> Result<Vec<Vec<String>>, TabularError> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    // true once the current record has any content, quoted empties included
    let mut started = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(ch),
            }
            continue;
        }
        match ch {
            '"' => {
                in_quotes = true;
                started = true;
            }
            ',' => {
                record.push(std::mem::take(&mut field));
                started = true;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                if started || !field.is_empty() {
                    record.push(std::mem::take(&mut field));
                    records.push(std::mem::take(&mut record));
                }
                started = false;
            }
            _ => {
                field.push(ch);
                started = true;
            }
        }
    }

    if in_quotes {
        return Err(TabularError::UnterminatedQuote(records.len() + 1));
    }
    if started || !field.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
#[path = "bulk_data_tests.rs"]
mod tests;
