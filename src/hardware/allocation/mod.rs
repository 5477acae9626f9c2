//! Allocation Module
//!
//! Reserves slots for kubelet requests, keeps the resulting grants and
//! reconciles reservations with what running containers actually hold.

pub mod allocator;
pub mod reconciler;

pub use allocator::*;
pub use reconciler::*;
