//! Snapshot command handler

use anyhow::{Context, Result};

use tablecast_core::source::SourceSnapshot;

use super::{api_url, read_response};
use crate::output::Output;

/// Print the current table of a data source
pub async fn run(api: &str, source: &str, output: &Output) -> Result<()> {
    let response = reqwest::get(api_url(api, &format!("/api/sources/{}", source)))
        .await
        .with_context(|| format!("Failed to reach {}", api))?;
    let snapshot: SourceSnapshot = read_response(response).await?;

    if output.is_json() {
        output.print_json(&snapshot);
    } else {
        output.print_table(&snapshot.title, &snapshot.headers, &snapshot.rows);
    }
    Ok(())
}
