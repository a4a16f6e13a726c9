//! API Publisher Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging for the API Publisher workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`PublisherError`] and the crate-wide [`Result`] alias
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`]
//!
//! # Example
//!
//! ```no_run
//! use apipub_common::{PublisherError, Result};
//!
//! fn require_url(url: &str) -> Result<()> {
//!     if url.is_empty() {
//!         return Err(PublisherError::config("connection url is empty"));
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{PublisherError, Result};
