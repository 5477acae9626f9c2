//! Device Classification Module
//!
//! Compiles pool selectors and sorts device bus events into pools.

pub mod classifier;
pub mod selector;

pub use classifier::*;
pub use selector::*;
