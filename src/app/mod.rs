//! Application layer — the master instance and its boundary.
//!
//! [`service::Master`] owns every engine; all I/O flows through the port
//! traits defined in [`ports`], keeping the whole stack testable against
//! the in-memory network simulator.

pub mod events;
pub mod ports;
pub mod service;
