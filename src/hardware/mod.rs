//! Hardware Module
//!
//! Device discovery, classification into pools, the device registry and
//! slot allocation.

pub mod discovery;
pub mod classification;
pub mod allocation;
pub mod registry;

pub use discovery::*;
pub use classification::*;
pub use allocation::*;
pub use registry::*;
