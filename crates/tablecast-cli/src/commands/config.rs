//! Config command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};

use tablecast_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.print_json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:    {}", config.data_dir.display());
            println!("  upload_dir:  {}", config.upload_dir().display());
            println!("  log_level:   {}", config.log_level);
            println!(
                "  log_file:    {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(stderr)".to_string())
            );
            println!();
            println!("Server:");
            println!("  ws_addr:     {}", config.server.ws_addr);
            println!("  http_addr:   {}", config.server.http_addr);
            println!("  debounce:    {}ms", config.server.debounce_ms);
            println!(
                "  sessions:    ping every {}s, drop after {}s silent",
                config.server.ping_interval_secs, config.server.session_timeout_secs
            );
            println!();
            println!("Client:");
            println!("  server_url:  {}", config.client.server_url);
            println!("  api_url:     {}", config.client.api_url);
            println!(
                "  backoff:     {}ms doubling to {}ms, {} attempts",
                config.client.backoff_base_ms,
                config.client.backoff_cap_ms,
                config.client.max_attempts
            );
            println!();
            if config.sources.is_empty() {
                println!("Sources: (none)");
            } else {
                println!("Sources:");
                for source in &config.sources {
                    println!("  {} = {}", source.id, source.path.display());
                }
            }
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    config.set(&key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}
