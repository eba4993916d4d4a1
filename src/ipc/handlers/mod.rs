//! Per-service request handlers.

pub mod allocation;
pub mod emergency;
pub mod enforcement;
pub mod usage;
