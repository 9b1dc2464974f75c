//! # qubesctl Common
//!
//! Shared utilities for the qubesctl binaries.
//!
//! ```rust,ignore
//! use qubesctl_common::{init, LogFormat};
//!
//! init("info", LogFormat::Json).unwrap();
//! tracing::info!(domain = "work", "Converging");
//! ```

pub mod logging;

pub use logging::{init, init_logging, init_logging_json, LogFormat};
