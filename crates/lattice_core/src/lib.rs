#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Space configuration
pub mod config;

/// Engine session layer (storage, handles, repo, relay bridge)
pub mod engine;

/// Error (common error types)
pub mod error;

/// Event callback registry
pub mod event;

/// Cancellation scopes
pub mod scope;

/// Space layer (document loader, object binding cores, registry)
pub mod space;

/// Core data model types
pub mod types;

pub use config::SpaceConfig;
pub use error::{LatticeError, Result};
