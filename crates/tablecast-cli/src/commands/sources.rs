//! Sources command handler

use anyhow::{Context, Result};

use tablecast_core::source::SourceSummary;

use super::{api_url, read_response};
use crate::output::Output;

/// List the server's data sources
pub async fn list(api: &str, output: &Output) -> Result<()> {
    let response = reqwest::get(api_url(api, "/api/sources"))
        .await
        .with_context(|| format!("Failed to reach {}", api))?;
    let sources: Vec<SourceSummary> = read_response(response).await?;

    output.print_sources(&sources);
    Ok(())
}
