use std::path::PathBuf;

use anyhow::{bail, Result};

pub const APP_NAME: &str = "Murmur";

/// Endpoint used until the user configures another server.
pub const DEFAULT_SERVER_BASE_URL: &str = "http://localhost:1234";

/// Placeholder title of a conversation that has not been named yet.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New conversation";

/// Title used when neither the model nor the prompt yields one.
pub const FALLBACK_CONVERSATION_TITLE: &str = "Conversation";

/// Maximum length, in characters, of a title derived from a prompt.
pub const TITLE_MAX_CHARS: usize = 42;

pub const NO_MODEL_REPLY: &str = "Select a model and try again.";

pub const HISTORY_FILE_NAME: &str = "chat_history.json";
pub const DATABASE_FILE_NAME: &str = "murmur.db";

/// Directory holding the database and the history document.
///
/// `MURMUR_DATA_DIR` wins, then `$XDG_DATA_HOME/murmur`, then
/// `$HOME/.local/share/murmur`.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("MURMUR_DATA_DIR") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.trim().is_empty() {
            return Ok(PathBuf::from(xdg).join("murmur"));
        }
    }
    match std::env::var("HOME") {
        Ok(home) => Ok(PathBuf::from(home).join(".local/share").join("murmur")),
        Err(_) => bail!("Neither MURMUR_DATA_DIR, XDG_DATA_HOME nor HOME is set"),
    }
}
