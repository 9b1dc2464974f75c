//! # qubesctl core
//!
//! Reconciliation engine converging Qubes OS domains to a declared state.
//!
//! A request names a domain and what it should look like: its power state,
//! its properties and features, its tags and its assigned devices. The engine
//! reads the current state once, validates the request against it, and
//! applies only the mutations needed to close the gap.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Orchestrator               │
//! │   (request → directive → response)      │
//! └───┬──────────┬───────────┬──────────┬───┘
//!     ▼          ▼           ▼          ▼
//! Validator  Properties   Devices    Power
//!     │          │           │          │
//!     └──────────┴─────┬─────┴──────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │             QubesApi Trait              │
//! │   (State Query Interface + mutations)   │
//! └─────────────────────┬───────────────────┘
//!                       ▼
//!          MockQubes (in-memory host)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use qubesctl_core::{EngineConfig, MockQubes, Orchestrator, Request};
//!
//! #[tokio::main]
//! async fn main() {
//!     let orchestrator = Orchestrator::new(Arc::new(MockQubes::with_defaults()), EngineConfig::default());
//!
//!     let request: Request = serde_yaml::from_str("name: work\nstate: running").unwrap();
//!     let response = orchestrator.handle(&request).await;
//!     std::process::exit(response.status().code() as i32);
//! }
//! ```

pub mod config;
pub mod devices;
pub mod error;
pub mod inventory;
pub mod mock;
pub mod orchestrator;
pub mod power;
pub mod properties;
pub mod request;
pub mod schema;
pub mod snapshot;
pub mod traits;
pub mod types;
pub mod validator;

pub use config::{ConfigError, CreateDefaults, EngineConfig, PollPolicy};
pub use devices::{DeviceEntry, DeviceFacts, DeviceOutcome, DevicePolicy, Strategy};
pub use error::{BackendError, ErrorKind, ReconcileError};
pub use mock::{MockQubes, World};
pub use orchestrator::{Orchestrator, Reply, Response, Status};
pub use power::{PowerAction, PowerMachine, Transition};
pub use request::{Command, Directive, DomainCommand, HostCommand, Request};
pub use schema::{PropertyKey, ValueKind};
pub use traits::{NewDomain, QubesApi};
pub use types::*;
