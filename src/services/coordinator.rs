use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::conversation::{
    new_conversation, normalize_base_url, sort_by_recency, summaries, truncate_title,
};
use super::history::HistoryStore;
use super::settings::SettingsService;
use crate::config::NO_MODEL_REPLY;
use crate::engine::{EngineError, ModelEngine};
use crate::models::{Conversation, ConversationSummary, Message};

/// Everything the UI needs to draw, republished after each change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiSnapshot {
    pub is_model_ready: bool,
    pub server_base_url: String,
    pub available_models: Vec<String>,
    pub selected_model: Option<String>,
    pub is_loading_models: bool,
    pub status_message: Option<String>,
    pub history: Vec<ConversationSummary>,
    pub current_conversation_id: Option<String>,
    pub messages: Vec<Message>,
}

/// The conversation set. Never empty once the coordinator has started,
/// always newest first.
struct ConversationSet {
    conversations: Vec<Conversation>,
    last_stamp: i64,
}

impl ConversationSet {
    /// Strictly increasing millisecond stamps, even within one millisecond.
    fn stamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }

    fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    /// Returns true when a conversation had to be created.
    fn ensure_not_empty(&mut self) -> bool {
        if !self.conversations.is_empty() {
            return false;
        }
        let stamp = self.stamp();
        self.conversations.push(new_conversation(stamp));
        true
    }

    fn head_id(&self) -> Option<String> {
        self.conversations.first().map(|c| c.id.clone())
    }
}

struct Inner {
    engine: Arc<dyn ModelEngine>,
    history: Arc<dyn HistoryStore>,
    settings: SettingsService,
    state: Mutex<ConversationSet>,
    snapshot: watch::Sender<UiSnapshot>,
    persist_lock: tokio::sync::Mutex<()>,
    save_failed: AtomicBool,
    /// Set while the stored history has not been read successfully.
    load_failed: AtomicBool,
    model_generation: AtomicU64,
}

/// Single authority over the conversation set.
///
/// Every read-modify-write of the set happens under one lock together with
/// the publish it causes; the lock is never held across an await. Engine
/// and storage calls run outside of it, so the UI sees optimistic state
/// before any I/O completes. Clones share the same state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Load settings and history and publish the most recent conversation.
    /// An empty or unreadable store starts with one fresh conversation. When
    /// the store could not be read, that conversation stays in memory until a
    /// later load succeeds, so the stored history is never overwritten.
    pub async fn start(
        engine: Arc<dyn ModelEngine>,
        history: Arc<dyn HistoryStore>,
        settings: SettingsService,
    ) -> Self {
        let base_url = settings.server_base_url().await;
        engine.set_base_url(&base_url);

        let (mut conversations, load_failed) = match history.load_all().await {
            Ok(conversations) => (conversations, false),
            Err(e) => {
                tracing::error!("Failed to load chat history, starting empty: {:#}", e);
                (Vec::new(), true)
            }
        };
        sort_by_recency(&mut conversations);
        tracing::info!("Loaded {} conversations", conversations.len());

        let last_stamp = conversations.iter().map(|c| c.updated_at).max().unwrap_or(0);
        let mut set = ConversationSet {
            conversations,
            last_stamp,
        };
        let created = set.ensure_not_empty();

        let (snapshot, _) = watch::channel(UiSnapshot {
            server_base_url: base_url,
            ..UiSnapshot::default()
        });

        let coordinator = Self {
            inner: Arc::new(Inner {
                engine,
                history,
                settings,
                state: Mutex::new(set),
                snapshot,
                persist_lock: tokio::sync::Mutex::new(()),
                save_failed: AtomicBool::new(false),
                load_failed: AtomicBool::new(load_failed),
                model_generation: AtomicU64::new(0),
            }),
        };

        {
            let set = coordinator.lock_state();
            if let Some(head) = set.head_id() {
                coordinator.publish_view(&set, &head);
            }
        }
        if created && !load_failed {
            coordinator.persist().await;
        }

        coordinator
    }

    pub fn subscribe(&self) -> watch::Receiver<UiSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> UiSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Read-only copy of one conversation.
    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.lock_state().get(id).cloned()
    }

    // --- Model ---

    /// Ask the engine for its models and pick the first one when nothing
    /// is selected. Failures end up in `status_message`.
    pub async fn initialize_model(&self) {
        let generation = self.inner.model_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.snapshot.send_modify(|s| {
            s.is_loading_models = true;
            s.status_message = None;
        });

        let engine = &self.inner.engine;
        let result = async {
            let ready = engine.initialize().await?;
            let models = engine.list_models().await?;
            if engine.selected_model().is_none() {
                if let Some(first) = models.first() {
                    engine.select_model(first);
                }
            }
            Ok::<_, EngineError>((ready, models))
        }
        .await;

        // A newer refresh (e.g. after a server change) owns the outcome.
        if self.inner.model_generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("Discarding stale model refresh");
            return;
        }

        match result {
            Ok((ready, models)) => {
                let ready = ready && !models.is_empty();
                let selected = engine.selected_model();
                tracing::info!(
                    "Model refresh: {} models, selected {:?}",
                    models.len(),
                    selected
                );
                self.inner.snapshot.send_modify(|s| {
                    s.is_model_ready = ready;
                    s.available_models = models;
                    s.selected_model = selected;
                    s.is_loading_models = false;
                    s.status_message = if ready {
                        None
                    } else {
                        Some("No models found.".to_string())
                    };
                });
            }
            Err(e) => {
                tracing::warn!("Model refresh failed: {}", e);
                self.inner.snapshot.send_modify(|s| {
                    s.is_model_ready = false;
                    s.is_loading_models = false;
                    s.status_message = Some(format!("Error querying models: {}", e));
                });
            }
        }
    }

    pub fn select_model(&self, model_id: &str) {
        self.inner.engine.select_model(model_id);
        let model_id = model_id.to_string();
        self.inner.snapshot.send_modify(|s| s.selected_model = Some(model_id));
    }

    /// Point the engine at another server, remember it, reload models.
    /// Input that does not normalise to a usable URL only sets a status.
    pub async fn update_server_base_url(&self, raw: &str) {
        let Some(normalized) = normalize_base_url(raw) else {
            let message = format!("Invalid server address: {}", raw.trim());
            self.inner.snapshot.send_modify(|s| s.status_message = Some(message));
            return;
        };

        if let Err(e) = self.inner.settings.set_server_base_url(&normalized).await {
            tracing::error!("Failed to save server URL: {:#}", e);
        }
        self.inner.engine.set_base_url(&normalized);
        tracing::info!("Server URL set to {}", normalized);

        self.inner.snapshot.send_modify(|s| {
            s.server_base_url = normalized;
            s.is_model_ready = false;
            s.available_models.clear();
            s.selected_model = None;
            s.status_message = Some("Server updated. Reloading models...".to_string());
        });

        self.initialize_model().await;
    }

    // --- Conversations ---

    /// Create an empty conversation, make it current and return its id.
    pub async fn start_new_conversation(&self) -> String {
        let id = {
            let mut set = self.lock_state();
            let conversation = new_conversation(set.stamp());
            let id = conversation.id.clone();
            set.conversations.insert(0, conversation);
            self.publish_view(&set, &id);
            id
        };
        self.persist().await;
        id
    }

    /// Show a conversation. Unknown ids are ignored.
    pub fn open_conversation(&self, id: &str) {
        let set = self.lock_state();
        if set.get(id).is_some() {
            self.publish_view(&set, id);
        } else {
            tracing::debug!("Ignoring open of unknown conversation {}", id);
        }
    }

    /// Remove a conversation and show the most recent remaining one. The set
    /// is refilled with a fresh conversation when this empties it.
    pub async fn delete_conversation(&self, id: &str) {
        {
            let mut set = self.lock_state();
            let before = set.conversations.len();
            set.conversations.retain(|c| c.id != id);
            if set.conversations.len() == before {
                tracing::debug!("Ignoring delete of unknown conversation {}", id);
                return;
            }
            set.ensure_not_empty();
            if let Some(head) = set.head_id() {
                self.publish_view(&set, &head);
            }
        }
        self.persist().await;
    }

    /// Set an explicit title. This also rules out any later generated title.
    pub async fn rename_conversation(&self, id: &str, new_title: &str) {
        let title = new_title.trim();
        if title.is_empty() {
            return;
        }

        {
            let mut set = self.lock_state();
            let stamp = set.stamp();
            let Some(conversation) = set.find_mut(id) else {
                tracing::debug!("Ignoring rename of unknown conversation {}", id);
                return;
            };
            conversation.title = title.to_string();
            conversation.auto_title = false;
            conversation.updated_at = stamp;
            sort_by_recency(&mut set.conversations);

            let view = self.resolve_view(&set);
            self.publish_view(&set, &view);
        }
        self.persist().await;
    }

    /// Append the user's message and publish it right away, then finish the
    /// exchange in the background: reply, one-time title, publish, persist.
    ///
    /// Returns `None` without touching anything for a blank prompt or an
    /// unknown conversation; otherwise the handle of the background task.
    /// Must be called from within a tokio runtime.
    pub fn send_message(&self, conversation_id: &str, user_prompt: &str) -> Option<JoinHandle<()>> {
        if user_prompt.trim().is_empty() {
            return None;
        }

        let context = {
            let mut set = self.lock_state();
            let stamp = set.stamp();
            let conversation = set.find_mut(conversation_id)?;
            conversation.messages.push(Message::user(user_prompt));
            conversation.updated_at = stamp;
            let context = conversation.messages.clone();
            sort_by_recency(&mut set.conversations);
            self.publish_view(&set, conversation_id);
            context
        };

        let this = self.clone();
        let id = conversation_id.to_string();
        let prompt = user_prompt.to_string();
        Some(tokio::spawn(async move {
            this.complete_exchange(id, prompt, context).await;
        }))
    }

    /// Save once more so a failed save is retried before the app exits.
    pub async fn shutdown(&self) {
        self.persist().await;
    }

    async fn complete_exchange(&self, id: String, prompt: String, context: Vec<Message>) {
        self.persist().await;

        let model_available = {
            let s = self.inner.snapshot.borrow();
            s.is_model_ready
                && s.selected_model
                    .as_deref()
                    .is_some_and(|m| !m.trim().is_empty())
        };

        let reply = if model_available {
            match self.inner.engine.generate_reply(&prompt, &context).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Reply for conversation {} failed: {}", id, e);
                    format!("Error querying the model: {}", e)
                }
            }
        } else {
            NO_MODEL_REPLY.to_string()
        };

        let wants_title = self
            .lock_state()
            .get(&id)
            .is_some_and(|c| c.auto_title);
        let title = if wants_title {
            Some(self.generate_title(&prompt, model_available).await)
        } else {
            None
        };

        {
            let mut set = self.lock_state();
            let stamp = set.stamp();
            let Some(conversation) = set.find_mut(&id) else {
                tracing::debug!("Conversation {} was deleted before its reply arrived", id);
                return;
            };
            conversation.messages.push(Message::assistant(reply));
            // Re-checked here: a rename may have landed while we were waiting.
            if conversation.auto_title {
                if let Some(title) = title {
                    conversation.title = title;
                    conversation.auto_title = false;
                }
            }
            conversation.updated_at = stamp;
            sort_by_recency(&mut set.conversations);

            let view = self.resolve_view(&set);
            self.publish_view(&set, &view);
        }

        self.persist().await;
    }

    async fn generate_title(&self, prompt: &str, model_available: bool) -> String {
        if model_available {
            match self.inner.engine.generate_conversation_title(prompt).await {
                Ok(title) if !title.trim().is_empty() => return title.trim().to_string(),
                Ok(_) => tracing::debug!("Model returned a blank title"),
                Err(e) => tracing::warn!("Title generation failed: {}", e),
            }
        }
        truncate_title(prompt)
    }

    // --- Internals ---

    fn lock_state(&self) -> MutexGuard<'_, ConversationSet> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The conversation the UI shows, or the head if that one is gone.
    fn resolve_view(&self, set: &ConversationSet) -> String {
        let current = self.inner.snapshot.borrow().current_conversation_id.clone();
        current
            .filter(|id| set.get(id).is_some())
            .or_else(|| set.head_id())
            .unwrap_or_default()
    }

    fn publish_view(&self, set: &ConversationSet, conversation_id: &str) {
        let Some(conversation) = set.get(conversation_id) else {
            return;
        };
        let history = summaries(&set.conversations);
        let messages = conversation.messages.clone();
        let id = conversation.id.clone();
        self.inner.snapshot.send_modify(|s| {
            s.history = history;
            s.current_conversation_id = Some(id);
            s.messages = messages;
        });
    }

    /// Write the set as it is now. Saves are serialized and each one takes
    /// the latest state, so an older write never lands after a newer one.
    async fn persist(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        if self.inner.load_failed.load(Ordering::SeqCst) && !self.recover_history().await {
            self.inner.save_failed.store(true, Ordering::SeqCst);
            tracing::error!("Not saving chat history: stored history is still unreadable");
            return;
        }
        let conversations = self.lock_state().conversations.clone();
        match self.inner.history.save_all(&conversations).await {
            Ok(()) => {
                if self.inner.save_failed.swap(false, Ordering::SeqCst) {
                    tracing::info!("Chat history saved after earlier failure");
                }
            }
            Err(e) => {
                self.inner.save_failed.store(true, Ordering::SeqCst);
                tracing::error!("Failed to save chat history: {:#}", e);
            }
        }
    }

    /// Retry the load that failed at startup and fold the stored
    /// conversations into the set. Ids already in memory keep their
    /// in-memory version. Returns false while the store stays unreadable.
    async fn recover_history(&self) -> bool {
        let stored = match self.inner.history.load_all().await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Chat history still unreadable: {:#}", e);
                return false;
            }
        };

        let mut set = self.lock_state();
        let before = set.conversations.len();
        for conversation in stored {
            if set.get(&conversation.id).is_none() {
                set.last_stamp = set.last_stamp.max(conversation.updated_at);
                set.conversations.push(conversation);
            }
        }
        sort_by_recency(&mut set.conversations);
        tracing::info!(
            "Recovered {} stored conversations",
            set.conversations.len() - before
        );

        let view = self.resolve_view(&set);
        self.publish_view(&set, &view);
        self.inner.load_failed.store(false, Ordering::SeqCst);
        true
    }
}
