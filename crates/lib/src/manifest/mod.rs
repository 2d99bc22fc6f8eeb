//! Declared desired-state manifest.
//!
//! A manifest is the deserialized configuration for one planning cycle: the
//! ordered list of resource declarations. How it was produced (parsed from a
//! configuration language, generated by tooling) is outside this crate; it
//! only needs to reach the core as structured data.

mod types;

pub use types::*;
