//! Command handlers

pub mod config;
pub mod parse;
pub mod serve;
pub mod snapshot;
pub mod sources;
pub mod upload;
pub mod watch;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;

use tablecast_core::server::api::ErrorResponse;

/// Turn an HTTP API response into a value or a readable error
async fn read_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .context("Failed to decode server response");
    }

    match response.json::<ErrorResponse>().await {
        Ok(body) => bail!("{} ({})", body.message, status),
        Err(_) => bail!("Server returned {}", status),
    }
}

/// Join the API base URL and a path
fn api_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_joins_without_double_slash() {
        assert_eq!(
            api_url("http://127.0.0.1:3002/", "/api/sources"),
            "http://127.0.0.1:3002/api/sources"
        );
        assert_eq!(
            api_url("http://127.0.0.1:3002", "/health"),
            "http://127.0.0.1:3002/health"
        );
    }
}
