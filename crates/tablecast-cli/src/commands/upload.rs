//! Upload command handler

use std::path::Path;

use anyhow::{Context, Result};

use tablecast_core::server::api::UploadRequest;
use tablecast_core::source::SourceSummary;

use super::{api_url, read_response};
use crate::output::{Output, OutputFormat};

/// Upload a file as a new data source
pub async fn run(api: &str, file: &Path, output: &Output) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {:?}", file))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Not a file: {:?}", file))?;

    let response = reqwest::Client::new()
        .post(api_url(api, "/api/sources"))
        .json(&UploadRequest { file_name, content })
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", api))?;
    let summary: SourceSummary = read_response(response).await?;

    match output.format {
        OutputFormat::Json => output.print_json(&summary),
        OutputFormat::Quiet => println!("{}", summary.id),
        OutputFormat::Human => {
            output.success(&format!("Uploaded as {}", summary.id));
            println!("  Title:   {}", summary.title);
            println!("  Rows:    {}", summary.row_count);
            println!("  Columns: {}", summary.headers.join(", "));
        }
    }

    Ok(())
}
