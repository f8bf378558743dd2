//! Lateen Core - Foundational Types and Abstractions
//!
//! Error taxonomy, the build event stream, and the behavior flags shared
//! across the Lateen workspace.

pub mod config;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::BehaviorFlags;
pub use error::{BuildError, Result, ISSUE_TRACKER};
pub use event::{BuildEvent, EventEmitter};

/// Tool name recorded in image history entries.
pub const TOOL_NAME: &str = "lateen";

/// Lateen version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
