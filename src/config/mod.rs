//! # Configuration Module
//!
//! Centralizes the compile-time constants of the cache. Values that depend
//! on each other are co-located and their relationships are enforced through
//! compile-time assertions.

pub mod constants;
pub use constants::*;
