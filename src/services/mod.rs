pub mod conversation;
pub mod coordinator;
pub mod database;
pub mod history;
pub mod settings;

pub use coordinator::{Coordinator, UiSnapshot};
pub use database::Database;
pub use history::{HistoryStore, JsonFileHistoryStore, SqliteHistoryStore};
pub use settings::SettingsService;
