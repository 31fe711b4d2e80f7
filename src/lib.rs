//! Sercos III soft-master stack.
//!
//! The core of an Ethernet-based motion/IO master: the CP0→CP4 phase
//! handler, the hard-real-time cyclic engine, and the segmented service
//! channel, layered over two raw Ethernet ports.
//!
//! ```text
//!              ┌──────────────────────────────────────────┐
//!  PacketPort  │  phase handler ──▶ cyclic engine         │
//!  ClockPort ─▶│       │                │     │           │
//!              │  descriptor mgr   conn engine  svc engine │──▶ EventSink
//!              │       └──── telegram codec ────┘          │
//!              └──────────────────────────────────────────┘
//! ```
//!
//! Everything is instantiable per hardware channel — entry points hang
//! off [`app::service::Master`]; there is no process-wide state. The
//! platform is injected through the port traits in [`app::ports`], and
//! the in-memory simulator in [`adapters::sim`] drives the full stack on
//! any host.

#![deny(unused_must_use)]

pub mod app;
pub mod bincfg;
pub mod config;
pub mod conn;
pub mod context;
pub mod cyclic;
pub mod error;
pub mod hotplug;
pub mod phase;
pub mod sercos_time;
pub mod slave;
pub mod svc;
pub mod telegram;
pub mod topology;

pub mod adapters;

pub use app::service::{Master, SercosStatus};
pub use error::{Error, Result};
pub use phase::{Phase, PhaseTarget};
