use anyhow::Result;

use super::database::Database;
use crate::config::DEFAULT_SERVER_BASE_URL;

const KEY_SERVER_BASE_URL: &str = "server_base_url";

#[derive(Debug, Clone)]
pub struct SettingsService {
    db: Database,
}

impl SettingsService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stored server endpoint, or the default when unset or unreadable.
    pub async fn server_base_url(&self) -> String {
        match self.db.get_setting(KEY_SERVER_BASE_URL).await {
            Ok(Some(url)) if !url.trim().is_empty() => url,
            Ok(_) => DEFAULT_SERVER_BASE_URL.to_string(),
            Err(e) => {
                tracing::error!("Failed to read server URL, using default: {}", e);
                DEFAULT_SERVER_BASE_URL.to_string()
            }
        }
    }

    pub async fn set_server_base_url(&self, url: &str) -> Result<()> {
        self.db.set_setting(KEY_SERVER_BASE_URL, url).await
    }
}
