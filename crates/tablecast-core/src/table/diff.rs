//! Cell-level table diff

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::table::Table;

/// One changed cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellChange {
    pub row: usize,
    pub col: usize,
    pub value: String,
}

/// Sparse set of changed cells, keyed by data row then column
///
/// Serializes as `{"<row>": {"<col>": "<value>"}}`. Ordered maps keep
/// iteration and encoding deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DiffSet(BTreeMap<usize, BTreeMap<usize, String>>);

// Keys are decoded as strings: inside a tagged message serde buffers the
// payload, and buffered map keys no longer convert to integers.
impl<'de> Deserialize<'de> for DiffSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, BTreeMap<String, String>>::deserialize(deserializer)?;
        let mut set = DiffSet::new();
        for (row, cols) in raw {
            let row = parse_index::<D::Error>(&row)?;
            for (col, value) in cols {
                set.insert(row, parse_index::<D::Error>(&col)?, value);
            }
        }
        Ok(set)
    }
}

fn parse_index<E: de::Error>(key: &str) -> Result<usize, E> {
    key.parse()
        .map_err(|_| E::custom(format!("invalid cell index '{}'", key)))
}

impl DiffSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, row: usize, col: usize, value: impl Into<String>) {
        self.0.entry(row).or_default().insert(col, value.into());
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&str> {
        self.0.get(&row)?.get(&col).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of changed cells
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    /// Number of rows with at least one change
    pub fn row_count(&self) -> usize {
        self.0.len()
    }

    /// Changes in (row, column) order
    pub fn iter(&self) -> impl Iterator<Item = CellChange> + '_ {
        self.0.iter().flat_map(|(&row, cols)| {
            cols.iter().map(move |(&col, value)| CellChange {
                row,
                col,
                value: value.clone(),
            })
        })
    }
}

impl FromIterator<CellChange> for DiffSet {
    fn from_iter<I: IntoIterator<Item = CellChange>>(iter: I) -> Self {
        let mut set = DiffSet::new();
        for change in iter {
            set.insert(change.row, change.col, change.value);
        }
        set
    }
}

/// Compare two snapshots of the same source
///
/// Walks the union of both tables' data rows and columns, reading absent
/// cells as the empty string, and records the `next` value wherever the
/// two differ byte for byte.
pub fn diff(previous: &Table, next: &Table) -> DiffSet {
    let mut changes = DiffSet::new();
    let rows = previous.row_count().max(next.row_count());
    let cols = previous.width().max(next.width());

    for row in 0..rows {
        for col in 0..cols {
            let after = next.cell(row, col);
            if previous.cell(row, col) != after {
                changes.insert(row, col, after);
            }
        }
    }

    changes
}

/// Whether the header row differs between two snapshots
pub fn headers_changed(previous: &Table, next: &Table) -> bool {
    previous.headers() != next.headers()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn colors() -> Table {
        Table::from_rows(&["Name", "Color"], &[&["A", "#FF0000"], &["B", "#0000FF"]])
    }

    #[test]
    fn test_identical_tables_have_no_diff() {
        let table = colors();
        assert!(diff(&table, &table).is_empty());
        assert!(diff(&Table::default(), &Table::default()).is_empty());
    }

    #[test]
    fn test_single_cell_change() {
        let next = Table::from_rows(&["Name", "Color"], &[&["A", "#00FF00"], &["B", "#0000FF"]]);
        let changes = diff(&colors(), &next);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes.get(0, 1), Some("#00FF00"));
    }

    #[test]
    fn test_added_row_and_column() {
        let next = Table::from_rows(
            &["Name", "Color", "Size"],
            &[&["A", "#FF0000", "L"], &["B", "#0000FF", ""], &["C", "#FFFFFF", "S"]],
        );
        let changes = diff(&colors(), &next);

        let cells: Vec<(usize, usize)> = changes.iter().map(|c| (c.row, c.col)).collect();
        assert_eq!(cells, vec![(0, 2), (2, 0), (2, 1), (2, 2)]);
    }

    #[test]
    fn test_removed_row_becomes_empty_values() {
        let next = Table::from_rows(&["Name", "Color"], &[&["A", "#FF0000"]]);
        let changes = diff(&colors(), &next);

        assert_eq!(changes.get(1, 0), Some(""));
        assert_eq!(changes.get(1, 1), Some(""));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_no_trimming_or_coercion() {
        let prev = Table::from_rows(&["n"], &[&["1"], &["a"]]);
        let next = Table::from_rows(&["n"], &[&["1.0"], &["a "]]);
        let changes = diff(&prev, &next);

        assert_eq!(changes.get(0, 0), Some("1.0"));
        assert_eq!(changes.get(1, 0), Some("a "));
    }

    #[test]
    fn test_diff_is_deterministic() {
        let next = Table::from_rows(&["Name", "Color"], &[&["Z", "#000000"]]);
        let first = diff(&colors(), &next);
        let second = diff(&colors(), &next);

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_header_change_is_not_a_cell_change() {
        let next = Table::from_rows(&["Name", "Hex"], &[&["A", "#FF0000"], &["B", "#0000FF"]]);

        assert!(diff(&colors(), &next).is_empty());
        assert!(headers_changed(&colors(), &next));
    }

    #[test]
    fn test_wire_encoding_uses_string_keys() {
        let mut changes = DiffSet::new();
        changes.insert(0, 1, "#00FF00");

        let json = serde_json::to_value(&changes).unwrap();
        assert_eq!(json, serde_json::json!({"0": {"1": "#00FF00"}}));

        let decoded: DiffSet = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, changes);
    }

    #[test]
    fn test_non_numeric_index_is_rejected() {
        let result: Result<DiffSet, _> =
            serde_json::from_value(serde_json::json!({"row": {"1": "x"}}));
        assert!(result.is_err());

        let result: Result<DiffSet, _> =
            serde_json::from_value(serde_json::json!({"0": {"-1": "x"}}));
        assert!(result.is_err());
    }
}
