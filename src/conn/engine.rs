//! Producer/consumer passes over the connection table.
//!
//! Runs inside the cyclic task. The producer pass copies application MDT
//! bytes into the Tx image and gates the C-CON producer-ready bit on the
//! per-slave validity flags; the consumer pass applies received AT bytes
//! to the application buffer and drives the loss accounting.

use log::{info, warn};

use super::{ConnState, Connection, C_CON_PROD_RDY};
use crate::config::{TelegramClass, MAX_SLAVES};
use crate::telegram::buffer::{rx_region, tx_region, BufferBank};
use crate::app::ports::Port;

/// The connection engine: owns the connection table and validity flags.
pub struct ConnEngine {
    conns: Vec<Connection>,
    /// Per-slave validity for the upcoming cycle; re-cleared every prepare.
    valid: Vec<bool>,
}

impl ConnEngine {
    pub fn new(slaves: usize) -> Self {
        Self {
            conns: Vec::new(),
            valid: vec![false; slaves.min(MAX_SLAVES)],
        }
    }

    /// Install the placed connection table (CP3). Connections come up in
    /// `Ready`.
    pub fn install(&mut self, mut conns: Vec<Connection>) {
        for conn in &mut conns {
            conn.state = ConnState::Ready;
        }
        info!("connection engine: installed {} connections", conns.len());
        self.conns = conns;
    }

    /// Drop the table (switch-back below CP3).
    pub fn clear(&mut self) {
        self.conns.clear();
    }

    pub fn connections(&self) -> &[Connection] {
        &self.conns
    }

    pub fn connection(&self, idx: usize) -> Option<&Connection> {
        self.conns.get(idx)
    }

    /// Mark the slave's data valid for the current cycle. Called from
    /// cyclic callbacks.
    pub fn mark_valid(&mut self, slave: usize) {
        if let Some(flag) = self.valid.get_mut(slave) {
            *flag = true;
        }
    }

    pub fn is_valid(&self, slave: usize) -> bool {
        self.valid.get(slave).copied().unwrap_or(false)
    }

    /// Re-clear the validity flags. Called at cycle prepare.
    pub fn clear_valid(&mut self) {
        self.valid.iter_mut().for_each(|v| *v = false);
    }

    /// Clear an `Error` connection back to `Ready`.
    pub fn clear_error(&mut self, idx: usize) -> bool {
        match self.conns.get_mut(idx) {
            Some(conn) if conn.state == ConnState::Error => {
                conn.miss_count = 0;
                conn.state = ConnState::Ready;
                info!("connection {idx}: error cleared");
                true
            }
            _ => false,
        }
    }

    /// True when any connection sits in `Error`.
    pub fn any_error(&self) -> bool {
        self.conns.iter().any(|c| c.state == ConnState::Error)
    }

    // ── Producer pass ─────────────────────────────────────────

    /// Copy application MDT bytes into the Tx image and set/clear the
    /// producer-ready bit per slave validity. `app_mdt` is the buffer the
    /// application writes through its stable data pointers; `active`
    /// masks out slaves that are not participating (absent hot-plug
    /// devices).
    pub fn producer_pass(&mut self, app_mdt: &[u8], tx: &mut BufferBank, cycle: u64, active: &[bool]) {
        for conn in &mut self.conns {
            if conn.class() != TelegramClass::Mdt || !conn.due(cycle) {
                continue;
            }
            if !active
                .get(conn.placement.slave_idx as usize)
                .copied()
                .unwrap_or(false)
            {
                continue;
            }
            if matches!(conn.state, ConnState::Preparing | ConnState::Error) {
                continue;
            }

            let region = tx.region_mut(tx_region(TelegramClass::Mdt, conn.placement.slot));
            let tel = conn.placement.telegram_offset as usize;
            let buf = conn.placement.buffer_offset as usize;
            let len = conn.placement.length as usize;

            if self.valid[conn.placement.slave_idx as usize] {
                region[tel..tel + len].copy_from_slice(&app_mdt[buf..buf + len]);
                let mut c_con = u16::from_le_bytes([region[tel], region[tel + 1]]);
                c_con |= C_CON_PROD_RDY;
                region[tel..tel + 2].copy_from_slice(&c_con.to_le_bytes());
                conn.state = ConnState::Producing;
            } else {
                // Withdraw producer-ready; stale payload bytes stay for
                // the consumer's grace window.
                let mut c_con = u16::from_le_bytes([region[tel], region[tel + 1]]);
                c_con &= !C_CON_PROD_RDY;
                region[tel..tel + 2].copy_from_slice(&c_con.to_le_bytes());
                if conn.state == ConnState::Producing {
                    conn.state = ConnState::Stopping;
                } else if conn.state == ConnState::Stopping {
                    conn.state = ConnState::Ready;
                }
            }
        }
    }

    // ── Consumer pass ─────────────────────────────────────────

    /// Apply received AT bytes. A connection counts as served when either
    /// port delivered a fresh AT whose C-CON carries producer-ready;
    /// otherwise the miss counter runs and trips the producer to `Error`
    /// at the loss limit. `on_error` fires once per tripped connection
    /// with its table index.
    pub fn consumer_pass(
        &mut self,
        rx: &BufferBank,
        app_at: &mut [u8],
        cycle: u64,
        active: &[bool],
        mut on_error: impl FnMut(usize),
    ) {
        for (idx, conn) in self.conns.iter_mut().enumerate() {
            if conn.class() != TelegramClass::At || !conn.due(cycle) {
                continue;
            }
            if !active
                .get(conn.placement.slave_idx as usize)
                .copied()
                .unwrap_or(false)
            {
                continue;
            }
            if matches!(conn.state, ConnState::Preparing | ConnState::Error) {
                continue;
            }

            let tel = conn.placement.telegram_offset as usize;
            let buf = conn.placement.buffer_offset as usize;
            let len = conn.placement.length as usize;

            let mut served = false;
            for port in [Port::P1, Port::P2] {
                let region_idx = rx_region(port, TelegramClass::At, conn.placement.slot);
                let Some(fresh) = rx.fresh_len(region_idx) else {
                    continue;
                };
                if fresh < tel + len {
                    continue;
                }
                let region = rx.region(region_idx);
                let c_con = u16::from_le_bytes([region[tel], region[tel + 1]]);
                if c_con & C_CON_PROD_RDY == 0 {
                    continue;
                }
                app_at[buf..buf + len].copy_from_slice(&region[tel..tel + len]);
                served = true;
                break;
            }

            if served {
                conn.miss_count = 0;
                conn.state = ConnState::Consuming;
            } else {
                conn.miss_count = conn.miss_count.saturating_add(1);
                if conn.miss_count > conn.accepted_losses {
                    warn!(
                        "connection {idx} (slave {}): loss limit {} exceeded",
                        conn.placement.slave_idx, conn.accepted_losses
                    );
                    conn.state = ConnState::Error;
                    on_error(idx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::descriptor::ConnPlacement;

    fn placement(class: TelegramClass, tel_off: u16, buf_off: u16, len: u16) -> ConnPlacement {
        ConnPlacement {
            slave_idx: 0,
            conn_idx: 0,
            class,
            slot: 0,
            length: len,
            telegram_offset: tel_off,
            buffer_offset: buf_off,
        }
    }

    fn engine_with(class: TelegramClass) -> ConnEngine {
        let mut eng = ConnEngine::new(2);
        eng.install(vec![Connection::new(placement(class, 10, 0, 8), 2, 1)]);
        eng
    }

    #[test]
    fn producer_sets_ready_bit_only_when_valid() {
        let mut eng = engine_with(TelegramClass::Mdt);
        let mut tx = BufferBank::new(256);
        let mut app = vec![0u8; 16];
        app[2..8].copy_from_slice(&[1, 2, 3, 4, 5, 6]);

        // Not valid: bit stays clear.
        eng.producer_pass(&app, &mut tx, 0, &[true, true]);
        let region = tx.region(tx_region(TelegramClass::Mdt, 0));
        assert_eq!(region[10] & C_CON_PROD_RDY as u8, 0);

        // Valid: payload copied, bit set.
        eng.mark_valid(0);
        eng.producer_pass(&app, &mut tx, 1, &[true, true]);
        let region = tx.region(tx_region(TelegramClass::Mdt, 0));
        assert_eq!(region[10] & C_CON_PROD_RDY as u8, 1);
        assert_eq!(&region[12..18], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(eng.connections()[0].state, ConnState::Producing);
    }

    #[test]
    fn producer_stops_when_validity_lapses() {
        let mut eng = engine_with(TelegramClass::Mdt);
        let mut tx = BufferBank::new(256);
        let app = vec![0u8; 16];

        eng.mark_valid(0);
        eng.producer_pass(&app, &mut tx, 0, &[true, true]);
        assert_eq!(eng.connections()[0].state, ConnState::Producing);

        eng.clear_valid();
        eng.producer_pass(&app, &mut tx, 1, &[true, true]);
        assert_eq!(eng.connections()[0].state, ConnState::Stopping);
        let region = tx.region(tx_region(TelegramClass::Mdt, 0));
        assert_eq!(region[10] & C_CON_PROD_RDY as u8, 0);

        eng.producer_pass(&app, &mut tx, 2, &[true, true]);
        assert_eq!(eng.connections()[0].state, ConnState::Ready);
    }

    fn serve_at(rx: &mut BufferBank, tel_off: usize, payload: &[u8], ready: bool) {
        let region_idx = rx_region(Port::P1, TelegramClass::At, 0);
        let region = rx.region_mut(region_idx);
        let c_con: u16 = if ready { C_CON_PROD_RDY } else { 0 };
        region[tel_off..tel_off + 2].copy_from_slice(&c_con.to_le_bytes());
        region[tel_off + 2..tel_off + 2 + payload.len()].copy_from_slice(payload);
        rx.mark_fresh(region_idx, 64);
    }

    #[test]
    fn consumer_applies_ready_data() {
        let mut eng = engine_with(TelegramClass::At);
        let mut rx = BufferBank::new(256);
        let mut app = vec![0u8; 16];

        serve_at(&mut rx, 10, &[9, 9, 9, 9, 9, 9], true);
        eng.consumer_pass(&rx, &mut app, 0, &[true, true], |_| panic!("no error expected"));
        assert_eq!(&app[2..8], &[9, 9, 9, 9, 9, 9]);
        assert_eq!(eng.connections()[0].state, ConnState::Consuming);
    }

    #[test]
    fn consumer_ignores_data_without_ready_bit() {
        let mut eng = engine_with(TelegramClass::At);
        let mut rx = BufferBank::new(256);
        let mut app = vec![0u8; 16];

        serve_at(&mut rx, 10, &[9; 6], false);
        eng.consumer_pass(&rx, &mut app, 0, &[true, true], |_| {});
        assert_eq!(&app[2..8], &[0; 6]);
        assert_eq!(eng.connections()[0].miss_count, 1);
    }

    #[test]
    fn loss_limit_trips_error_and_clear_restores() {
        let mut eng = engine_with(TelegramClass::At);
        let rx = BufferBank::new(256); // never fresh
        let mut app = vec![0u8; 16];

        let mut tripped = Vec::new();
        for cycle in 0..5 {
            eng.consumer_pass(&rx, &mut app, cycle, &[true, true], |idx| tripped.push(idx));
        }
        // accepted_losses = 2: misses 1, 2 tolerated, third trips.
        assert_eq!(tripped, vec![0]);
        assert_eq!(eng.connections()[0].state, ConnState::Error);
        assert!(eng.any_error());

        assert!(eng.clear_error(0));
        assert_eq!(eng.connections()[0].state, ConnState::Ready);
        assert!(!eng.clear_error(0));
    }

    #[test]
    fn clear_valid_resets_every_slave() {
        let mut eng = ConnEngine::new(3);
        eng.mark_valid(0);
        eng.mark_valid(2);
        assert!(eng.is_valid(0) && eng.is_valid(2));
        eng.clear_valid();
        assert!(!eng.is_valid(0) && !eng.is_valid(2));
    }
}
