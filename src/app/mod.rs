pub mod config;
pub mod state;

pub use config::{AppConfig, CatalogConfig, RetentionConfig};
pub use state::AppState;
