//! Quota types and policy: resource dimensions, limits, and usage periods.

mod dimension;
mod period;

pub use dimension::{Limit, Quota, QuotaUpdate, ResourceDimension, UNLIMITED_SENTINEL};
pub use period::PeriodType;
