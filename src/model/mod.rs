//! Core data model types for howto

mod hash;
mod revision;

pub use hash::Hash;
pub use revision::{Heads, Revision};
