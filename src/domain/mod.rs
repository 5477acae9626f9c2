//! Domain layer - Core types and port definitions
//!
//! Devices, raw bus events and slots, plus the traits (ports) the device bus
//! and kubelet adapters implement.

pub mod device;
pub mod ports;

pub use device::*;
pub use ports::*;
