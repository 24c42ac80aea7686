//! Shared utilities

pub mod coalesce;
pub mod hash;
pub mod rate_limit;
pub mod time;
