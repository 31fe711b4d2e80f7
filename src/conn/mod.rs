//! Connection table: uni-directional cyclic data objects.
//!
//! Every connection payload region starts with the 2-byte C-CON word; the
//! producer-ready bit gates whether a consumer may use the bytes behind
//! it. State transitions are evaluated once per cycle by the
//! [`engine`](self::engine):
//!
//! ```text
//!                application marks the slave valid
//!    Ready ─────────────────────────────────────────▶ Producing
//!     ▲                                                  │
//!     │                        no data / flow control    │
//!     │                                                  ▼
//!     ├───────────────────◀──────────────────────── Stopping
//!     │
//!     └──── clear_connection_error ──── Error ◀── loss limit reached
//! ```

pub mod engine;

use crate::config::TelegramClass;
use crate::telegram::descriptor::ConnPlacement;

/// Producer-ready bit in the C-CON word.
pub const C_CON_PROD_RDY: u16 = 0x0001;

/// Per-connection state, evaluated every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Configured but not yet installed (before CP3).
    Preparing,
    /// Installed; no data flowing yet.
    Ready,
    /// Master-produced bytes go out with producer-ready set.
    Producing,
    /// Slave-produced bytes are arriving and being applied.
    Consuming,
    /// Producer-ready withdrawn; consumers ride on last valid data.
    Stopping,
    /// Loss limit exceeded; needs an explicit error clear.
    Error,
}

/// Run-time state of one installed connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub placement: ConnPlacement,
    pub state: ConnState,
    /// Consecutive cycles without usable producer data (consumer side).
    pub miss_count: u16,
    pub accepted_losses: u16,
    /// Produce/consume only every n-th cycle.
    pub cycle_multiple: u16,
}

impl Connection {
    pub fn new(placement: ConnPlacement, accepted_losses: u16, cycle_multiple: u16) -> Self {
        Self {
            placement,
            state: ConnState::Preparing,
            miss_count: 0,
            accepted_losses,
            cycle_multiple: cycle_multiple.max(1),
        }
    }

    pub fn class(&self) -> TelegramClass {
        self.placement.class
    }

    /// This connection participates in the given cycle (sub-cycling).
    pub fn due(&self, cycle: u64) -> bool {
        cycle % u64::from(self.cycle_multiple) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::descriptor::ConnPlacement;

    fn placement() -> ConnPlacement {
        ConnPlacement {
            slave_idx: 0,
            conn_idx: 0,
            class: TelegramClass::Mdt,
            slot: 0,
            length: 8,
            telegram_offset: 34,
            buffer_offset: 0,
        }
    }

    #[test]
    fn sub_cycling() {
        let conn = Connection::new(placement(), 3, 4);
        assert!(conn.due(0));
        assert!(!conn.due(1));
        assert!(conn.due(4));
    }

    #[test]
    fn zero_multiple_is_clamped() {
        let conn = Connection::new(placement(), 3, 0);
        assert!(conn.due(0) && conn.due(1));
    }
}
