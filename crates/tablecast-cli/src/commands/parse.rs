//! Parse command handler
//!
//! Runs the table parser locally, optionally diffing against a second
//! file, without a server.

use std::path::Path;

use anyhow::{Context, Result};

use tablecast_core::{diff, Config, Table, TableParser};

use crate::output::Output;

fn parse_file(parser: &TableParser, file: &Path) -> Result<Table> {
    let text =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {:?}", file))?;
    parser
        .parse(&text)
        .with_context(|| format!("Failed to parse {:?}", file))
}

/// Print a parsed file, or the changes from `file` to `against`
pub fn run(config: &Config, file: &Path, against: Option<&Path>, output: &Output) -> Result<()> {
    let parser = TableParser::new(config.parse_options());
    let table = parse_file(&parser, file)?;

    match against {
        None => {
            let title = file.display().to_string();
            output.print_table(&title, table.headers(), table.rows());
        }
        Some(next_file) => {
            let next = parse_file(&parser, next_file)?;
            let changes = diff(&table, &next);
            let label = format!("{} -> {}", file.display(), next_file.display());
            output.print_changes(&label, &changes, next.headers());
            if table.headers() != next.headers() {
                output.message(&format!("Header row changed: {}", next.headers().join(", ")));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.csv");
        std::fs::write(&path, "Name\n\"open\n").unwrap();

        let parser = TableParser::default();
        let err = parse_file(&parser, &path).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.csv"));
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("colors.csv");
        std::fs::write(&path, "Name,Color\nApple,#FF0000\n").unwrap();

        let table = parse_file(&TableParser::default(), &path).unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.cell(0, 1), "#FF0000");
    }
}
