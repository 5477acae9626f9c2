//! Device Registry Module
//!
//! Single ownership point for pool, device and reservation state.

pub mod device_registry;

pub use device_registry::*;
