//! Serve command handler

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use tablecast_core::config::SourceEntry;
use tablecast_core::{server, Config};

use crate::output::Output;

/// Parse a `--source id=path` argument
pub fn parse_source_arg(arg: &str) -> Result<SourceEntry> {
    let Some((id, path)) = arg.split_once('=') else {
        bail!("Invalid source '{}', expected <id>=<path>", arg);
    };
    if id.trim().is_empty() || path.trim().is_empty() {
        bail!("Invalid source '{}', expected <id>=<path>", arg);
    }

    Ok(SourceEntry {
        id: id.trim().to_string(),
        title: None,
        path: path.trim().into(),
    })
}

/// Run the server until interrupted
pub async fn run(
    config: &Config,
    ws_addr: Option<String>,
    http_addr: Option<String>,
    extra_sources: Vec<String>,
    output: &Output,
) -> Result<()> {
    let ws_addr = ws_addr.unwrap_or_else(|| config.server.ws_addr.clone());
    let http_addr = http_addr.unwrap_or_else(|| config.server.http_addr.clone());

    let mut sources = config.sources.clone();
    for arg in &extra_sources {
        sources.push(parse_source_arg(arg)?);
    }

    let mut running = server::start(config.hub_options(), &ws_addr, &http_addr)
        .await
        .with_context(|| format!("Failed to start server on {} / {}", ws_addr, http_addr))?;

    // A source that fails to load is reported but does not stop the server
    let mut loaded = 0;
    for entry in &sources {
        match running
            .hub
            .register_file(entry.id.clone(), entry.display_title(), entry.path.clone())
            .await
        {
            Ok(summary) => {
                loaded += 1;
                info!(source = %summary.id, rows = summary.row_count, "Loaded source");
            }
            Err(e) => warn!(source = %entry.id, "Failed to load source: {}", e),
        }
    }

    if output.is_json() {
        println!(
            "{}",
            serde_json::json!({
                "ws_url": running.ws_url(),
                "http_url": running.http_url(),
                "sources": loaded,
            })
        );
    } else if !output.is_quiet() {
        println!("tablecast server running");
        println!("  WebSocket: {}", running.ws_url());
        println!("  HTTP API:  {}", running.http_url());
        println!("  Sources:   {} of {}", loaded, sources.len());
        println!();
        println!("Press Ctrl+C to stop.");
    }

    let result = tokio::select! {
        result = running.wait() => result.context("Server stopped unexpectedly"),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    running.shutdown();
    output.success("Server stopped");
    result
}
