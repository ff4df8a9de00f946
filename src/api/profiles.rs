//! Display-name lookup for call participants

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::client::RestClient;
use crate::models::UserId;

/// Resolves a participant identifier to a human-readable name.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn display_name(&self, id: &UserId) -> Result<Option<String>>;
}

/// Name to show when a profile has none.
pub const FALLBACK_NAME: &str = "User";

/// Look up a name, falling back to a placeholder on miss or error.
pub async fn display_name_or_fallback(profiles: &dyn ProfileLookup, id: &UserId) -> String {
    match profiles.display_name(id).await {
        Ok(Some(name)) if !name.trim().is_empty() => name,
        Ok(_) => FALLBACK_NAME.to_string(),
        Err(e) => {
            tracing::warn!("Profile lookup for {} failed: {:#}", id, e);
            FALLBACK_NAME.to_string()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    full_name: Option<String>,
}

/// Profiles read from the `profiles` table.
pub struct RestProfiles {
    client: RestClient,
}

impl RestProfiles {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProfileLookup for RestProfiles {
    async fn display_name(&self, id: &UserId) -> Result<Option<String>> {
        let filter = format!("eq.{}", id);
        let resp = self
            .client
            .get("profiles", &[("id", filter.as_str()), ("select", "full_name")])
            .await?;
        let rows: Vec<ProfileRow> = resp
            .json()
            .await
            .context("Failed to parse profiles response")?;
        Ok(rows.into_iter().next().and_then(|r| r.full_name))
    }
}

/// Fixed id-to-name table (the `[contacts]` section of the config).
#[derive(Debug, Clone, Default)]
pub struct StaticProfiles {
    names: HashMap<String, String>,
}

impl StaticProfiles {
    pub fn new(names: HashMap<String, String>) -> Self {
        Self { names }
    }
}

#[async_trait]
impl ProfileLookup for StaticProfiles {
    async fn display_name(&self, id: &UserId) -> Result<Option<String>> {
        Ok(self.names.get(id.as_str()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fallback_name_for_unknown_user() {
        let mut names = HashMap::new();
        names.insert("u-1".to_string(), "Ada".to_string());
        names.insert("u-2".to_string(), "  ".to_string());
        let profiles = StaticProfiles::new(names);

        assert_eq!(
            display_name_or_fallback(&profiles, &UserId::new("u-1")).await,
            "Ada"
        );
        assert_eq!(
            display_name_or_fallback(&profiles, &UserId::new("u-2")).await,
            FALLBACK_NAME
        );
        assert_eq!(
            display_name_or_fallback(&profiles, &UserId::new("nobody")).await,
            FALLBACK_NAME
        );
    }

    #[test]
    fn test_profile_row_parses_null_name() {
        let rows: Vec<ProfileRow> =
            serde_json::from_str(r#"[{"full_name": null}]"#).unwrap();
        assert!(rows[0].full_name.is_none());
    }
}
