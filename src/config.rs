use std::path::PathBuf;

use crate::db::Database;
use crate::mailer::MailConfig;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;

/// Runtime settings. `main` loads `.env` first, then builds this from the
/// process environment; CLI flags override individual fields afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub cron_secret: Option<String>,
    pub mail: MailConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads every setting through `lookup`; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            db_path: get("APPTRACK_DB")
                .map(PathBuf::from)
                .unwrap_or_else(Database::default_path),
            host: get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: get("PORT").map_or(DEFAULT_PORT, |raw| parse_port(&raw)),
            cron_secret: get("CRON_SECRET"),
            mail: MailConfig {
                api_url: get("MAIL_API_URL"),
                api_key: get("MAIL_API_KEY"),
                from: get("MAIL_FROM"),
            },
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_port(raw: &str) -> u16 {
    raw.trim().parse().unwrap_or_else(|_| {
        tracing::warn!(port = raw, default = DEFAULT_PORT, "Invalid PORT, using default");
        DEFAULT_PORT
    })
}
