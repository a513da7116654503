//! # Zapflow Core
//! Error types, configuration, and clock helpers shared across the workspace.

pub mod clock;
pub mod config;
pub mod error;

pub use config::ZapflowConfig;
pub use error::{Result, ZapflowError};
