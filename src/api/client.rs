//! Authenticated HTTP client for the REST backend
//!
//! Wraps reqwest::Client with the API key and bearer token the table
//! endpoints expect.

use anyhow::{bail, Context, Result};

use crate::auth::TokenStore;
use crate::config::Config;

/// Client for the `/rest/v1` table endpoints.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    token: String,
}

impl RestClient {
    /// Build a client from the stored login.
    pub fn from_config(config: &Config) -> Result<Self> {
        let token = config
            .get_access_token()
            .context("No access token. Run 'peercall login' first.")?;
        if token.is_expired() {
            bail!("Access token expired. Run 'peercall login'.");
        }
        Ok(Self::new(config.api_url()?, config.api_key.clone(), token.token))
    }

    pub fn new(base_url: &str, api_key: Option<String>, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            token,
        }
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = req.bearer_auth(&self.token);
        match self.api_key {
            Some(ref key) => req.header("apikey", key),
            None => req,
        }
    }

    /// GET a table with a PostgREST query string.
    pub async fn get(&self, table: &str, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        let url = self.table_url(table);
        tracing::debug!("REST GET {}", url);

        let resp = self
            .authorize(self.http.get(&url).query(query))
            .send()
            .await
            .with_context(|| format!("REST GET {} failed", url))?;

        check_response(resp, &url).await
    }

    /// POST rows into a table without asking for them back.
    pub async fn insert(&self, table: &str, rows: &serde_json::Value) -> Result<()> {
        let url = self.table_url(table);
        tracing::debug!("REST POST {}", url);

        let resp = self
            .authorize(self.http.post(&url))
            .header("Prefer", "return=minimal")
            .json(rows)
            .send()
            .await
            .with_context(|| format!("REST POST {} failed", url))?;

        check_response(resp, &url).await?;
        Ok(())
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Token may be invalid -- run 'peercall login'.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_url_trims_trailing_slash() {
        let client = RestClient::new("https://db.example.com/", None, "t".to_string());
        assert_eq!(
            client.table_url("messages"),
            "https://db.example.com/rest/v1/messages"
        );
    }

    #[test]
    fn test_from_config_requires_login() {
        let mut config = Config::default();
        config.api_url = Some("https://db.example.com".to_string());
        assert!(RestClient::from_config(&config).is_err());

        config.set_access_token("tok".to_string(), None);
        assert!(RestClient::from_config(&config).is_ok());
    }
}
