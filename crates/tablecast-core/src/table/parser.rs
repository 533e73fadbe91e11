//! Delimited text parser
//!
//! A per-character scanner that only treats delimiters and line breaks as
//! structural outside quoted fields, so one field may hold delimiters and
//! whole paragraphs. Human instruction rows (as found at the top of
//! exported sheets) are filtered out by a [`MetadataFilter`].

use std::iter::Peekable;
use std::str::Chars;

use crate::error::ParseError;
use crate::table::Table;

/// Predicate deciding whether a data row is a human-facing metadata row
///
/// Matches on the row's first cell, case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFilter {
    /// Substrings that mark a metadata row
    pub keywords: Vec<String>,
    /// Prefixes that mark a metadata row
    pub prefixes: Vec<String>,
    /// Drop rows whose first cell is blank
    pub drop_blank_first_cell: bool,
}

impl Default for MetadataFilter {
    fn default() -> Self {
        Self {
            keywords: ["figma", "design", "note", "file here", "instructions", "comment"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            prefixes: vec!["(".to_string()],
            drop_blank_first_cell: true,
        }
    }
}

impl MetadataFilter {
    /// A filter that keeps every row
    pub fn none() -> Self {
        Self {
            keywords: Vec::new(),
            prefixes: Vec::new(),
            drop_blank_first_cell: false,
        }
    }

    /// Whether a row with this first cell should be dropped
    pub fn matches(&self, first_cell: &str) -> bool {
        let cell = first_cell.trim().to_lowercase();
        if cell.is_empty() {
            return self.drop_blank_first_cell;
        }
        self.keywords
            .iter()
            .any(|k| cell.contains(&k.to_lowercase()))
            || self
                .prefixes
                .iter()
                .any(|p| cell.starts_with(&p.to_lowercase()))
    }
}

/// Parser options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOptions {
    /// Field delimiter
    pub delimiter: char,
    /// Trim whitespace around unquoted fields (quoted content is verbatim)
    pub trim_unquoted: bool,
    /// Metadata row filter applied to data rows
    pub metadata: MetadataFilter,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            trim_unquoted: true,
            metadata: MetadataFilter::default(),
        }
    }
}

/// Builds [`Table`]s from delimited text
#[derive(Debug, Clone, Default)]
pub struct TableParser {
    options: ParseOptions,
}

impl TableParser {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Parse text into a normalized table
    ///
    /// The first non-blank row is the header. Data rows matching the
    /// metadata filter are dropped, then every row is padded to the
    /// widest remaining row.
    pub fn parse(&self, text: &str) -> Result<Table, ParseError> {
        let rows = Scanner::new(&self.options).scan(text)?;
        // Dropped metadata rows still count towards the width
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);

        let mut rows = rows.into_iter();
        let headers = rows.next().ok_or(ParseError::Empty)?;
        let data: Vec<Vec<String>> = rows
            .filter(|row| {
                let first = row.first().map(String::as_str).unwrap_or("");
                !self.options.metadata.matches(first)
            })
            .collect();

        Ok(Table::with_min_width(headers, data, width))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Unquoted,
    InQuotedField,
    /// Saw a quote inside a quoted field: either `""` or the closing quote
    QuoteInQuotedField,
}

struct Scanner<'a> {
    options: &'a ParseOptions,
    state: ScanState,
    rows: Vec<Vec<String>>,
    row: Vec<String>,
    field: String,
    field_quoted: bool,
    /// Byte length of `field` at the most recent closing quote
    closed_at: usize,
    line: usize,
    quote_line: usize,
}

impl<'a> Scanner<'a> {
    fn new(options: &'a ParseOptions) -> Self {
        Self {
            options,
            state: ScanState::Unquoted,
            rows: Vec::new(),
            row: Vec::new(),
            field: String::new(),
            field_quoted: false,
            closed_at: 0,
            line: 1,
            quote_line: 1,
        }
    }

    fn scan(mut self, text: &str) -> Result<Vec<Vec<String>>, ParseError> {
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match self.state {
                ScanState::Unquoted => self.unquoted(c, &mut chars),
                ScanState::InQuotedField => match c {
                    '"' => self.state = ScanState::QuoteInQuotedField,
                    '\n' => {
                        self.field.push(c);
                        self.line += 1;
                    }
                    _ => self.field.push(c),
                },
                ScanState::QuoteInQuotedField => {
                    if c == '"' {
                        self.field.push('"');
                        self.state = ScanState::InQuotedField;
                    } else {
                        self.state = ScanState::Unquoted;
                        self.closed_at = self.field.len();
                        self.unquoted(c, &mut chars);
                    }
                }
            }
        }

        match self.state {
            ScanState::InQuotedField => Err(ParseError::UnterminatedQuote {
                line: self.quote_line,
            }),
            ScanState::QuoteInQuotedField => {
                self.closed_at = self.field.len();
                self.end_row();
                Ok(self.rows)
            }
            ScanState::Unquoted => {
                self.end_row();
                Ok(self.rows)
            }
        }
    }

    fn unquoted(&mut self, c: char, chars: &mut Peekable<Chars<'_>>) {
        match c {
            '"' => {
                if self.options.trim_unquoted && !self.field_quoted && self.field.trim().is_empty() {
                    self.field.clear();
                }
                self.field_quoted = true;
                self.quote_line = self.line;
                self.state = ScanState::InQuotedField;
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                self.end_row();
                self.line += 1;
            }
            '\n' => {
                self.end_row();
                self.line += 1;
            }
            c if c == self.options.delimiter => self.end_field(),
            _ => self.field.push(c),
        }
    }

    fn end_field(&mut self) {
        let mut field = std::mem::take(&mut self.field);
        if self.options.trim_unquoted {
            if self.field_quoted {
                let kept = self.closed_at + field[self.closed_at..].trim_end().len();
                field.truncate(kept);
            } else {
                field = field.trim().to_string();
            }
        }
        self.row.push(field);
        self.field_quoted = false;
        self.closed_at = 0;
    }

    fn end_row(&mut self) {
        self.end_field();
        let row = std::mem::take(&mut self.row);
        if row.iter().any(|f| !f.is_empty()) {
            self.rows.push(row);
        }
    }
}
