//! Device Discovery Module
//!
//! Kernel uevent subscription plus sysfs enumeration and attribute
//! enrichment.

pub mod sysfs;
pub mod uevent;

pub use sysfs::*;
pub use uevent::*;
