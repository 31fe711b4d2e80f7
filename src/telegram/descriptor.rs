//! Descriptor & buffer manager: realize connection bytes in Tx/Rx RAM.
//!
//! At the CP2→CP3 transition every active connection is packed into its
//! telegram slot and into the master-side cyclic buffer:
//!
//! 1. enumerate active connections in configuration order,
//! 2. bucket by (telegram class, slot),
//! 3. pack each bucket from the slot's connection-area start,
//! 4. emit one Tx/Rx descriptor pair per connection.
//!
//! After placement, `telegram_offset` and `buffer_offset` are deterministic
//! and stable for the lifetime of the connection. Overflow aborts the
//! transition with `ConfigError::TooLarge` — the phase handler surfaces it.

use log::debug;

use super::PayloadLayout;
use crate::config::{TelegramClass, MAX_TEL};
use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Descriptor types
// ---------------------------------------------------------------------------

/// Which master-side buffer a descriptor maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSystem {
    /// The master's Tx RAM image (MDT payload under construction).
    TxImage,
    /// Rx RAM of port 1.
    RxPort1,
    /// Rx RAM of port 2.
    RxPort2,
    /// The other end of the connection lives in a slave; the master holds
    /// no buffer for this side.
    Remote,
}

/// Direction of one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Tx,
    Rx,
}

/// Where a connection's bytes live inside a telegram and inside the
/// master-side buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub buffer_offset: u16,
    pub buffer_system: BufferSystem,
    pub telegram_offset: u16,
    pub kind: DescriptorKind,
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// A connection awaiting placement, in configuration order.
#[derive(Debug, Clone, Copy)]
pub struct PendingConn {
    pub slave_idx: u16,
    /// Index within the slave's connection table.
    pub conn_idx: u16,
    pub class: TelegramClass,
    pub slot: u8,
    pub length: u16,
}

/// The result of placing one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnPlacement {
    pub slave_idx: u16,
    pub conn_idx: u16,
    pub class: TelegramClass,
    pub slot: u8,
    pub length: u16,
    /// Offset inside the telegram payload.
    pub telegram_offset: u16,
    /// Offset inside the master's cyclic MDT or AT buffer.
    pub buffer_offset: u16,
}

impl ConnPlacement {
    /// The Tx/Rx descriptor pair for this connection. For an MDT
    /// connection the master owns the Tx side; for an AT connection it
    /// owns the Rx side (port 1 primary — port 2 mirrors the same
    /// telegram offset by construction).
    pub fn descriptors(&self) -> (Descriptor, Descriptor) {
        match self.class {
            TelegramClass::Mdt => (
                Descriptor {
                    buffer_offset: self.buffer_offset,
                    buffer_system: BufferSystem::TxImage,
                    telegram_offset: self.telegram_offset,
                    kind: DescriptorKind::Tx,
                },
                Descriptor {
                    buffer_offset: 0,
                    buffer_system: BufferSystem::Remote,
                    telegram_offset: self.telegram_offset,
                    kind: DescriptorKind::Rx,
                },
            ),
            TelegramClass::At => (
                Descriptor {
                    buffer_offset: 0,
                    buffer_system: BufferSystem::Remote,
                    telegram_offset: self.telegram_offset,
                    kind: DescriptorKind::Tx,
                },
                Descriptor {
                    buffer_offset: self.buffer_offset,
                    buffer_system: BufferSystem::RxPort1,
                    telegram_offset: self.telegram_offset,
                    kind: DescriptorKind::Rx,
                },
            ),
        }
    }
}

/// Pack all pending connections. Input order is configuration order and
/// decides the packing order inside each bucket.
pub fn place(
    pending: &[PendingConn],
    layout: &PayloadLayout,
) -> Result<Vec<ConnPlacement>, ConfigError> {
    // Per-(class, slot) cursors inside the telegram payloads.
    let mut tel_cursor = [[0usize; MAX_TEL]; 2];
    for slot in 0..MAX_TEL as u8 {
        tel_cursor[0][slot as usize] = layout.conn_area_start(TelegramClass::Mdt, slot);
        tel_cursor[1][slot as usize] = layout.conn_area_start(TelegramClass::At, slot);
    }
    // Per-class cursors inside the master-side cyclic buffers.
    let mut buf_cursor = [0usize; 2];

    let mut placements = Vec::with_capacity(pending.len());

    for conn in pending {
        let class_idx = match conn.class {
            TelegramClass::Mdt => 0,
            TelegramClass::At => 1,
        };
        let slot = conn.slot as usize;
        let tel_off = tel_cursor[class_idx][slot];
        let end = tel_off + conn.length as usize;

        if end > layout.payload_limit {
            debug!(
                "placement overflow: slave {} conn {} needs {}..{} of {}",
                conn.slave_idx, conn.conn_idx, tel_off, end, layout.payload_limit
            );
            return Err(ConfigError::TooLarge);
        }

        let buf_off = buf_cursor[class_idx];
        tel_cursor[class_idx][slot] = end;
        buf_cursor[class_idx] += conn.length as usize;

        placements.push(ConnPlacement {
            slave_idx: conn.slave_idx,
            conn_idx: conn.conn_idx,
            class: conn.class,
            slot: conn.slot,
            length: conn.length,
            telegram_offset: tel_off as u16,
            buffer_offset: buf_off as u16,
        });
    }

    debug!(
        "placed {} connections ({} B MDT, {} B AT)",
        placements.len(),
        buf_cursor[0],
        buf_cursor[1]
    );
    Ok(placements)
}

/// Total master-buffer bytes needed per class after placement.
pub fn buffer_demand(placements: &[ConnPlacement], class: TelegramClass) -> usize {
    placements
        .iter()
        .filter(|p| p.class == class)
        .map(|p| p.buffer_offset as usize + p.length as usize)
        .max()
        .unwrap_or(0)
}
