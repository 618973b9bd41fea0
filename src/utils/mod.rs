//! Pure utility functions.
//!
//! Stateless helpers shared by the bus, the transports, and the binaries.

pub mod bootstrap;
pub mod retry;
