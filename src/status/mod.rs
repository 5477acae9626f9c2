//! Status Module
//!
//! HTTP surface for operators: health and readiness probes, pool and
//! allocation inspection, manual release and Prometheus metrics.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
