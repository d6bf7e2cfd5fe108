// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

const METADATA_TOKEN_PATH: &str =
    "/computeMetadata/v1/instance/service-accounts/default/token";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const TOKEN_REFRESH_MARGIN_SECONDS: i64 = 60;

/// Bearer tokens for Google REST APIs.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> anyhow::Result<String> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Service account token from the metadata server of the hosting platform.
pub struct MetadataTokenSource {
    client: reqwest::Client,
    token_url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataTokenSource {
    pub fn new(client: reqwest::Client, metadata_base_url: &str) -> Self {
        Self {
            client,
            token_url: format!(
                "{}{}",
                metadata_base_url.trim_end_matches('/'),
                METADATA_TOKEN_PATH
            ),
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> anyhow::Result<CachedToken> {
        let response = self
            .client
            .get(&self.token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("failed to reach metadata server")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("metadata server returned {}: {}", status, body);
        }
        let token = response
            .json::<MetadataTokenResponse>()
            .await
            .context("invalid metadata token payload")?;
        debug!(expires_in = token.expires_in, "fetched access token from metadata server");
        Ok(CachedToken {
            token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn access_token(&self) -> anyhow::Result<String> {
        let mut cached = self.cached.lock().await;
        let refresh_at = Utc::now() + Duration::seconds(TOKEN_REFRESH_MARGIN_SECONDS);
        if let Some(token) = cached.as_ref().filter(|token| token.expires_at > refresh_at) {
            return Ok(token.token.clone());
        }

        let token = self.fetch().await?;
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }
}

/// `GOOGLE_ACCESS_TOKEN` wins when set; otherwise the metadata server at
/// `GCE_METADATA_HOST` (or the well-known host) is used.
pub fn token_source_from_env(client: reqwest::Client) -> Arc<dyn TokenSource> {
    if let Some(token) = std::env::var("GOOGLE_ACCESS_TOKEN")
        .ok()
        .filter(|value| !value.trim().is_empty())
    {
        return Arc::new(StaticTokenSource::new(token.trim()));
    }

    let host = std::env::var("GCE_METADATA_HOST")
        .ok()
        .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string());
    Arc::new(MetadataTokenSource::new(client, &format!("http://{host}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn metadata_token_is_cached_until_near_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(METADATA_TOKEN_PATH))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.token",
                "expires_in": 3599,
                "token_type": "Bearer",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = MetadataTokenSource::new(reqwest::Client::new(), &server.uri());
        assert_eq!(source.access_token().await.unwrap(), "ya29.token");
        assert_eq!(source.access_token().await.unwrap(), "ya29.token");
    }

    #[tokio::test]
    async fn metadata_token_refetches_when_about_to_expire() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(METADATA_TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "short-lived",
                "expires_in": 10,
            })))
            .expect(2)
            .mount(&server)
            .await;

        let source = MetadataTokenSource::new(reqwest::Client::new(), &server.uri());
        source.access_token().await.unwrap();
        source.access_token().await.unwrap();
    }

    #[tokio::test]
    async fn metadata_errors_surface_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no service account"))
            .mount(&server)
            .await;

        let source = MetadataTokenSource::new(reqwest::Client::new(), &server.uri());
        let error = source.access_token().await.unwrap_err();
        assert!(error.to_string().contains("404"));
    }

    #[tokio::test]
    async fn static_token_source_returns_configured_token() {
        let source = StaticTokenSource::new("local-token");
        assert_eq!(source.access_token().await.unwrap(), "local-token");
    }
}
