//! Core of the multi-identity bot router.
//!
//! Framework-agnostic: the messaging service and the update handlers live
//! behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod domain;
pub mod errors;
pub mod identity;
pub mod logging;
pub mod orchestrator;
pub mod polling;
pub mod ports;
pub mod registry;
pub mod transport;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
