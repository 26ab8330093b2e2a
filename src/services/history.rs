use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task;

use super::database::Database;
use crate::config::{DEFAULT_CONVERSATION_TITLE, FALLBACK_CONVERSATION_TITLE};
use crate::models::{Conversation, Message, Role};

const HISTORY_DOCUMENT: &str = "chat_history";

/// Durable home of the whole conversation set, written wholesale.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Stored conversations in stored order. Missing storage is an empty set.
    async fn load_all(&self) -> Result<Vec<Conversation>>;

    async fn save_all(&self, conversations: &[Conversation]) -> Result<()>;
}

// --- Document format ---

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryDocument {
    #[serde(default)]
    conversations: Vec<StoredConversation>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredConversation {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auto_title: Option<bool>,
    #[serde(default)]
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
}

impl From<&Conversation> for StoredConversation {
    fn from(conv: &Conversation) -> Self {
        Self {
            id: conv.id.clone(),
            title: Some(conv.title.clone()),
            updated_at: conv.updated_at,
            auto_title: Some(conv.auto_title),
            messages: conv
                .messages
                .iter()
                .map(|m| StoredMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
        }
    }
}

impl StoredConversation {
    fn into_conversation(self) -> Option<Conversation> {
        if self.id.trim().is_empty() {
            return None;
        }
        let title = self
            .title
            .unwrap_or_else(|| FALLBACK_CONVERSATION_TITLE.to_string());
        // Documents written before the flag existed only have the title to go on.
        let auto_title = self
            .auto_title
            .unwrap_or(title == DEFAULT_CONVERSATION_TITLE);
        let messages = self
            .messages
            .into_iter()
            .map(|m| Message {
                role: Role::from_str(&m.role).unwrap_or(Role::Assistant),
                content: m.content,
            })
            .collect();

        Some(Conversation {
            id: self.id,
            title,
            messages,
            updated_at: self.updated_at,
            auto_title,
        })
    }
}

pub fn encode_history(conversations: &[Conversation]) -> Result<String> {
    let document = HistoryDocument {
        conversations: conversations.iter().map(StoredConversation::from).collect(),
    };
    serde_json::to_string(&document).context("Failed to serialize chat history")
}

pub fn decode_history(raw: &str) -> Result<Vec<Conversation>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let document: HistoryDocument =
        serde_json::from_str(raw).context("Failed to parse chat history")?;
    Ok(document
        .conversations
        .into_iter()
        .filter_map(StoredConversation::into_conversation)
        .collect())
}

// --- JSON file ---

/// History kept as one JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileHistoryStore {
    path: PathBuf,
}

impl JsonFileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryStore for JsonFileHistoryStore {
    async fn load_all(&self) -> Result<Vec<Conversation>> {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let raw = match std::fs::read(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {}", path.display()))
                }
            };

            let decoded = std::str::from_utf8(&raw)
                .context("History file is not valid UTF-8")
                .and_then(decode_history);
            match decoded {
                Ok(conversations) => Ok(conversations),
                Err(e) => {
                    // Keep the unreadable file out of the way of the next save.
                    let mut aside = path.clone().into_os_string();
                    aside.push(".corrupt");
                    if let Err(rename_err) = std::fs::rename(&path, &aside) {
                        tracing::error!("Failed to move corrupt history aside: {}", rename_err);
                    } else {
                        tracing::warn!("Moved corrupt history to {:?}", aside);
                    }
                    Err(e)
                }
            }
        })
        .await?
    }

    async fn save_all(&self, conversations: &[Conversation]) -> Result<()> {
        let body = encode_history(conversations)?;
        let path = self.path.clone();
        task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory: {}", parent.display())
                })?;
            }
            let mut tmp = path.clone().into_os_string();
            tmp.push(".tmp");
            std::fs::write(&tmp, body)
                .with_context(|| format!("Failed to write {:?}", tmp))?;
            std::fs::rename(&tmp, &path)
                .with_context(|| format!("Failed to replace {}", path.display()))?;
            Ok(())
        })
        .await?
    }
}

// --- SQLite ---

/// History kept as a single document row in the application database.
#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    db: Database,
}

impl SqliteHistoryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn load_all(&self) -> Result<Vec<Conversation>> {
        match self.db.get_document(HISTORY_DOCUMENT).await? {
            Some(raw) => decode_history(&raw),
            None => Ok(Vec::new()),
        }
    }

    async fn save_all(&self, conversations: &[Conversation]) -> Result<()> {
        let body = encode_history(conversations)?;
        self.db.put_document(HISTORY_DOCUMENT, &body).await
    }
}
