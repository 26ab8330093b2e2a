use url::Url;
use uuid::Uuid;

use crate::config::{DEFAULT_CONVERSATION_TITLE, FALLBACK_CONVERSATION_TITLE, TITLE_MAX_CHARS};
use crate::models::{Conversation, ConversationSummary};

/// Empty conversation carrying the placeholder title.
pub fn new_conversation(updated_at: i64) -> Conversation {
    Conversation {
        id: Uuid::new_v4().to_string(),
        title: DEFAULT_CONVERSATION_TITLE.to_string(),
        messages: Vec::new(),
        updated_at,
        auto_title: true,
    }
}

/// Truncate a prompt to a conversation title of at most `TITLE_MAX_CHARS`
/// characters.
pub fn truncate_title(text: &str) -> String {
    let title: String = text.trim().chars().take(TITLE_MAX_CHARS).collect();
    let title = title.trim_end();
    if title.is_empty() {
        FALLBACK_CONVERSATION_TITLE.to_string()
    } else {
        title.to_string()
    }
}

/// Turn user input into a server base URL: trimmed, no trailing slash,
/// `http://` when no scheme was given. `None` if nothing usable remains.
pub fn normalize_base_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let (scheme, rest) = if lower.starts_with("http://") {
        trimmed.split_at(7)
    } else if lower.starts_with("https://") {
        trimmed.split_at(8)
    } else {
        ("http://", trimmed)
    };

    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return None;
    }
    let normalized = format!("{}{}", scheme, rest);

    match Url::parse(&normalized) {
        Ok(url) if url.host_str().is_some_and(|h| !h.is_empty()) => Some(normalized),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("Rejected server URL {:?}: {}", normalized, e);
            None
        }
    }
}

/// Newest first. Stable, so equal stamps keep their relative order.
pub fn sort_by_recency(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

/// History rows: only conversations that have messages.
pub fn summaries(conversations: &[Conversation]) -> Vec<ConversationSummary> {
    conversations
        .iter()
        .filter(|c| !c.messages.is_empty())
        .map(Conversation::summary)
        .collect()
}
