//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use tablecast_core::source::SourceSummary;
use tablecast_core::DiffSet;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Check if output is in JSON mode
    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to encode output: {}", e),
        }
    }

    /// Print a list of data sources
    pub fn print_sources(&self, sources: &[SourceSummary]) {
        match self.format {
            OutputFormat::Human => {
                if sources.is_empty() {
                    println!("No data sources.");
                    return;
                }
                for source in sources {
                    println!(
                        "{} | {} | {} rows | {} subscriber(s) | {}",
                        truncate(&source.id, 32),
                        truncate(&source.title, 24),
                        source.row_count,
                        source.subscribers,
                        source.last_modified.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!("\n{} source(s)", sources.len());
            }
            OutputFormat::Json => self.print_json(sources),
            OutputFormat::Quiet => {
                for source in sources {
                    println!("{}", source.id);
                }
            }
        }
    }

    /// Print a table with its header row
    pub fn print_table(&self, title: &str, headers: &[String], rows: &[Vec<String>]) {
        match self.format {
            OutputFormat::Human => {
                println!("{}", title);
                println!();
                println!("{}", render_row(headers));
                println!("{}", "─".repeat(render_row(headers).chars().count()));
                for row in rows {
                    println!("{}", render_row(row));
                }
                println!("\n{} row(s), {} column(s)", rows.len(), headers.len());
            }
            OutputFormat::Json => {
                self.print_json(&serde_json::json!({
                    "title": title,
                    "headers": headers,
                    "rows": rows,
                }));
            }
            OutputFormat::Quiet => {
                for row in rows {
                    println!("{}", row.join("\t"));
                }
            }
        }
    }

    /// Print a set of cell changes
    ///
    /// Column names come from `headers` when known.
    pub fn print_changes(&self, label: &str, changes: &DiffSet, headers: &[String]) {
        match self.format {
            OutputFormat::Human => {
                if changes.is_empty() {
                    println!("{}: no changes", label);
                    return;
                }
                println!("{}: {} cell(s) in {} row(s)", label, changes.len(), changes.row_count());
                for change in changes.iter() {
                    let column = headers
                        .get(change.col)
                        .cloned()
                        .unwrap_or_else(|| format!("#{}", change.col));
                    println!(
                        "  row {} | {} = {}",
                        change.row,
                        column,
                        truncate_line(&change.value, 60)
                    );
                }
            }
            OutputFormat::Json => self.print_json(changes),
            OutputFormat::Quiet => {
                for change in changes.iter() {
                    println!("{}\t{}\t{}", change.row, change.col, change.value);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn render_row(cells: &[String]) -> String {
    cells
        .iter()
        .map(|c| format!("{:<16}", truncate_line(c, 16)))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Truncate to first line and max length
fn truncate_line(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    truncate(first_line, max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        // Multi-byte characters are never split
        assert_eq!(truncate("ééééééééééé", 5), "éé...");
    }

    #[test]
    fn test_truncate_line() {
        assert_eq!(truncate_line("single line", 20), "single line");
        assert_eq!(truncate_line("line one\nline two", 20), "line one");
    }

    #[test]
    fn test_render_row_pads_cells() {
        let row = vec!["Name".to_string(), "Color".to_string()];
        assert_eq!(
            render_row(&row),
            format!("{:<16} | {:<16}", "Name", "Color")
        );
    }
}
