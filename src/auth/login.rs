//! Login commands
//!
//! Tokens are issued by the backend's identity service; `login` only
//! stores one together with the participant id it belongs to.

use anyhow::{bail, Result};

use super::TokenStore;
use crate::config::Config;

/// Store a token and the participant id it authenticates.
pub async fn login(
    user_id: &str,
    token: &str,
    expires_in: Option<u64>,
    display_name: Option<String>,
) -> Result<()> {
    if user_id.trim().is_empty() {
        bail!("User id must not be empty");
    }
    let mut config = Config::load()?;
    config.user_id = Some(user_id.trim().to_string());
    config.set_access_token(token.to_string(), expires_in);
    if display_name.is_some() {
        config.display_name = display_name;
    }
    config.save()?;
    println!("Logged in as {}.", user_id.trim());
    Ok(())
}

/// Clear cached credentials.
pub async fn logout() -> Result<()> {
    let mut config = Config::load()?;
    config.clear_tokens();
    config.save()?;
    println!("Logged out.");
    Ok(())
}

/// Display current auth status.
pub async fn status() -> Result<()> {
    let config = Config::load()?;

    println!(
        "User id:     {}",
        config.user_id.as_deref().unwrap_or("(none)")
    );
    println!(
        "Name:        {}",
        config.display_name.as_deref().unwrap_or("(none)")
    );
    match config.get_access_token() {
        Some(token) if !token.is_expired() => {
            println!("Token:       valid");
            if let Some(exp) = token.expires_at {
                println!("  expires_at: {}", exp);
            }
        }
        Some(_) => println!("Token:       expired"),
        None => println!("Token:       none"),
    }
    println!(
        "Bus:         {}",
        config.bus_url.as_deref().unwrap_or("(not configured)")
    );
    println!(
        "REST API:    {}",
        config.api_url.as_deref().unwrap_or("(not configured)")
    );
    Ok(())
}
