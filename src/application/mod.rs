//! Application capabilities shared by the upstream and the cache.

pub mod error;
pub mod repos;
pub mod tokens;
