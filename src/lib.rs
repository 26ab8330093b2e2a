//! Conversation core of a chat client for locally-hosted language models.
//!
//! The [`Coordinator`] owns every conversation, talks to a [`ModelEngine`]
//! and a [`HistoryStore`], and publishes a [`UiSnapshot`] after each change
//! for the UI layer to render.

pub mod config;
pub mod engine;
pub mod models;
pub mod services;

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

pub use engine::{EngineError, LocalEngine, ModelEngine, StubEngine};
pub use models::{Conversation, ConversationSummary, Message, Role};
pub use services::{
    Coordinator, Database, HistoryStore, JsonFileHistoryStore, SettingsService,
    SqliteHistoryStore, UiSnapshot,
};

/// Install a `RUST_LOG`-driven fmt subscriber. Does nothing if the host
/// application already installed one.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Wire the default stack: settings in the app database, history as a JSON
/// document next to it, and the OpenAI-compatible local engine. Model
/// discovery starts in the background.
pub async fn launch() -> Result<Coordinator> {
    let data_dir = config::data_dir()?;
    let db = Database::open_default().await?;
    let history = JsonFileHistoryStore::new(data_dir.join(config::HISTORY_FILE_NAME));
    let engine = LocalEngine::new(config::DEFAULT_SERVER_BASE_URL);

    let coordinator =
        Coordinator::start(Arc::new(engine), Arc::new(history), SettingsService::new(db)).await;

    let background = coordinator.clone();
    tokio::spawn(async move {
        background.initialize_model().await;
    });

    Ok(coordinator)
}
