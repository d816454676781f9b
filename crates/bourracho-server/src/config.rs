use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub media_dir: PathBuf,
    /// Remote analysis service; the built-in generator is used when unset.
    pub analysis_url: Option<String>,
    pub analysis_timeout: Duration,
    pub subscriber_queue: usize,
    pub send_timeout: Duration,
    pub announce_rejoin: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = var("BOURRACHO_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("BOURRACHO_JWT_SECRET is unset or still a placeholder");
        }

        let parse = |key: &str, default: &str| var(key).unwrap_or_else(|| default.into());

        Ok(Self {
            host: parse("BOURRACHO_HOST", "0.0.0.0"),
            port: parse("BOURRACHO_PORT", "3000")
                .parse()
                .context("BOURRACHO_PORT must be a port number")?,
            db_path: parse("BOURRACHO_DB_PATH", "bourracho.db").into(),
            jwt_secret,
            media_dir: parse("BOURRACHO_MEDIA_DIR", "./media-files").into(),
            analysis_url: var("BOURRACHO_ANALYSIS_URL").filter(|u| !u.trim().is_empty()),
            analysis_timeout: Duration::from_secs(
                parse("BOURRACHO_ANALYSIS_TIMEOUT_SECS", "60")
                    .parse()
                    .context("BOURRACHO_ANALYSIS_TIMEOUT_SECS must be an integer")?,
            ),
            subscriber_queue: parse("BOURRACHO_SUBSCRIBER_QUEUE", "256")
                .parse()
                .context("BOURRACHO_SUBSCRIBER_QUEUE must be an integer")?,
            send_timeout: Duration::from_millis(
                parse("BOURRACHO_SEND_TIMEOUT_MS", "5000")
                    .parse()
                    .context("BOURRACHO_SEND_TIMEOUT_MS must be an integer")?,
            ),
            announce_rejoin: matches!(
                parse("BOURRACHO_ANNOUNCE_REJOIN", "false").to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
        })
    }
}
