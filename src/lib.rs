//! # Quota Engine - multi-tenant quota allocation and enforcement
//!
//! - Organization → Department → Member allocation tree whose children never
//!   jointly exceed their parent, per resource dimension
//! - Usage ledger bucketed by UTC hour, day, ISO week and calendar month
//! - Atomic authorize gate: check-then-record per (entity, dimension)
//! - Emergency stops on organizations and departments, inherited downward
//! - Msgpack-over-TCP command/query service and JSON snapshots
//!
//! ## Architecture
//!
//! No single actor owns everything; each store synchronizes itself and the
//! gate composes them:
//! ```text
//!                     ┌──────────────────────────────────────┐
//!   IPC requests  →   │             QuotaEngine              │
//!                     │  ┌────────────┐    ┌──────────────┐  │
//!                     │  │ Allocation │    │ Usage Ledger │  │
//!                     │  │    Tree    │    │ (per-series  │  │
//!                     │  │  (RwLock)  │    │    mutex)    │  │
//!                     │  └─────▲──────┘    └──────▲───────┘  │
//!                     │        │   Enforcement    │          │
//!                     │        └──────  Gate  ────┘          │
//!                     │                  │                   │
//!                     │          ┌───────▼───────┐           │
//!                     │          │ Emergency Stop│           │
//!                     │          │  Controller   │           │
//!                     │          └───────────────┘           │
//!                     └──────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod engine;
pub mod ipc;
pub mod quota;
pub mod store;
pub mod types;

// Internal utilities
pub mod observability;

pub use engine::QuotaEngine;
pub use types::{Config, Error, Result};
