//! Events the master surfaces to the host.
//!
//! Delivered through the [`EventSink`](super::ports::EventSink) port once
//! per occurrence; the matching conditions stay readable at any time
//! through the status snapshot and counters.

use crate::phase::Phase;
use crate::topology::Topology;

/// One master event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterEvent {
    /// The reported communication phase changed.
    PhaseChanged { from: Phase, to: Phase },
    /// The topology classification changed.
    TopologyChanged(Topology),
    /// An intact ring degraded (CP4 only).
    RingBroken,
    /// The ring is whole again; recovery may be requested.
    RingRestored,
    /// A connection exceeded its accepted telegram losses and tripped.
    CyclicDataError { connection: u16 },
    /// The cyclic task missed its deadline.
    Overrun { consecutive: u16 },
    /// Hot-plug admission failed; the slave stays inactive.
    HotPlugFailed { slave: u16 },
    /// A hot-plug slave reached CP4 and produces its connections.
    HotPlugged { slave: u16 },
    /// The host stopped calling the cyclic entry point for longer than
    /// the armed watchdog allows.
    WatchdogExpired,
}
