//! `mistral-core`: configuration, auth context and time helpers shared by
//! the persistence and scheduling crates.

pub mod config;
pub mod context;
pub mod error;
pub mod time;

pub use config::MistralConfig;
pub use context::AuthContext;
pub use error::{CoreError, Result};
