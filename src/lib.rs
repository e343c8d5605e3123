pub mod error;
pub mod identity;
pub mod models;
pub mod repo;
pub mod routes;

// Re-export commonly used items for tests / external users
pub use routes::{config, AppState};
