//! Core types for the quota engine.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (EntityId, ActorId, GrantId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for server, engine, and retention

mod config;
mod errors;
mod ids;

pub use config::{
    Config, EngineConfig, IpcConfig, ObservabilityConfig, RetentionConfig, ServerConfig,
};
pub use errors::{Error, Result};
pub use ids::{ActorId, EntityId, GrantId};
