//! Domain layer types and invariants.

pub mod allow_list;
pub mod credentials;
pub mod error;
pub mod modules;
