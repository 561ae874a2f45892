// Core modules
pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod execution;
pub mod feed;
pub mod indicators;
pub mod models;
pub mod notify;
pub mod persistence;

// Re-export commonly used types
pub use error::GuardError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
