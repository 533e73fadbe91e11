//! Tables and table diffs
//!
//! A [`Table`] is a header row plus data rows of string cells, all padded
//! to the same width. [`TableParser`] builds one from delimited text and
//! [`diff`] compares two snapshots cell by cell.
//!
//! Row indices everywhere in this module address data rows: the header
//! is not row 0.

mod diff;
mod parser;

pub use diff::{diff, headers_changed, CellChange, DiffSet};
pub use parser::{MetadataFilter, ParseOptions, TableParser};

use serde::{Deserialize, Serialize};

/// A normalized table snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Build a table, right-padding every row (and the header) to the
    /// widest row observed
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self::with_min_width(headers, rows, 0)
    }

    /// Like [`Table::new`], but at least `min_width` columns wide
    pub fn with_min_width(headers: Vec<String>, rows: Vec<Vec<String>>, min_width: usize) -> Self {
        let width = rows
            .iter()
            .map(Vec::len)
            .chain([headers.len(), min_width])
            .max()
            .unwrap_or(0);

        let pad = |mut row: Vec<String>| {
            row.resize(width, String::new());
            row
        };

        Self {
            headers: pad(headers),
            rows: rows.into_iter().map(pad).collect(),
        }
    }

    /// Convenience constructor from string slices
    pub fn from_rows(headers: &[&str], rows: &[&[&str]]) -> Self {
        Self::new(
            headers.iter().map(|s| s.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
        )
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Number of columns
    pub fn width(&self) -> usize {
        self.headers.len()
    }

    /// Number of data rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Cell value, with absent cells read as the empty string
    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Serialize back to delimited text
    ///
    /// Fields are quoted when they contain the delimiter, a quote, a line
    /// break, or surrounding whitespace; embedded quotes are doubled.
    pub fn to_delimited(&self, delimiter: char) -> String {
        let mut out = String::new();
        for row in std::iter::once(&self.headers).chain(self.rows.iter()) {
            let line: Vec<String> = row.iter().map(|f| quote_field(f, delimiter)).collect();
            out.push_str(&line.join(&delimiter.to_string()));
            out.push('\n');
        }
        out
    }
}

fn quote_field(field: &str, delimiter: char) -> String {
    let needs_quotes = field.contains(delimiter)
        || field.contains('"')
        || field.contains('\n')
        || field.contains('\r')
        || field.trim() != field;

    if needs_quotes {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
