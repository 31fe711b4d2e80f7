//! Telegram codec: wire constants, Sercos header, payload geometry.
//!
//! Wire format (all multi-byte fields little-endian unless noted):
//!
//! ```text
//! ┌──────────────┬──────────────┬───────────┬──────┬───────┬───────┬──────┐
//! │ dst MAC (6B) │ src MAC (6B) │ 0x88CD BE │ type │ phase │ cycle │ rsvd │
//! └──────────────┴──────────────┴───────────┴──────┴───────┴───────┴──────┘
//!                                            high nibble = telegram kind
//!                                            low  nibble = slot 0..3
//! ```
//!
//! Payload geometry per slot (n = projected slave count):
//!
//! ```text
//! MDT0: [ MST 6B ][ ext. time 8B ][ hot-plug 8B ][ SVC 4B×n ][ connections ]
//! MDTk: [ connections ]
//! AT0:  [ S-DEV 2B×n ][ hot-plug 8B ][ SVC 4B×n ][ connections ]
//! ATk:  [ connections ]
//! ```
//!
//! Encoded frames are byte-identical across hosts of any endianness: every
//! multi-byte field goes through the explicit `to_le_bytes`/`from_le_bytes`
//! paths in this module, never through struct aliasing.

pub mod buffer;
pub mod descriptor;
pub mod frame;

use crate::config::TelegramClass;

// ---------------------------------------------------------------------------
// Wire constants
// ---------------------------------------------------------------------------

/// Sercos III EtherType (big-endian on the wire).
pub const ETHERTYPE_SERCOS: u16 = 0x88CD;

/// Destination MAC for non-UC Sercos telegrams.
pub const BROADCAST_MAC: [u8; 6] = [0xFF; 6];

/// Ethernet II header length.
pub const ETH_HEADER_LEN: usize = 14;

/// Sercos header length (type, phase, cycle count, reserved).
pub const SERCOS_HEADER_LEN: usize = 4;

/// Total header ahead of the telegram payload.
pub const HEADER_LEN: usize = ETH_HEADER_LEN + SERCOS_HEADER_LEN;

/// Master sync telegram length (first bytes of MDT0 payload).
pub const MST_LEN: usize = 6;

/// Extended MST field carrying Sercos time (4 B seconds + 4 B nanoseconds).
pub const EXT_TIME_LEN: usize = 8;

/// Hot-plug field (2 B control, 2 B address, 4 B data) in MDT0/AT0.
pub const HOTPLUG_FIELD_LEN: usize = 8;

/// Per-slave service-channel bytes per telegram (2 B control/status + 2 B data).
pub const SVC_FIELD_LEN: usize = 4;

/// Telegram-kind nibble for MDT.
pub const KIND_MDT: u8 = 0x8;

/// Telegram-kind nibble for AT.
pub const KIND_AT: u8 = 0xA;

/// Phase-byte bit: phase-switch announcement active.
pub const PHASE_SWITCH_BIT: u8 = 0x08;

// ---------------------------------------------------------------------------
// Sercos header
// ---------------------------------------------------------------------------

/// Type-byte bit marking a telegram emitted from the secondary port
/// (P2). Distinguishes a frame that traversed the whole ring from one
/// that looped back at a line end.
pub const SECONDARY_CHANNEL_BIT: u8 = 0x08;

/// Decoded Sercos header of one telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SercosHeader {
    pub class: TelegramClass,
    /// Telegram slot 0..3.
    pub slot: u8,
    /// Port the master emitted this telegram from.
    pub channel: crate::app::ports::Port,
    /// Communication phase 0..4 announced by the master.
    pub phase: u8,
    /// Phase-switch announcement bit.
    pub phase_switch: bool,
    /// Cycle count modulo 16.
    pub cycle_count: u8,
}

impl SercosHeader {
    /// Pack into the four Sercos header bytes.
    pub fn pack(&self) -> [u8; SERCOS_HEADER_LEN] {
        let kind = match self.class {
            TelegramClass::Mdt => KIND_MDT,
            TelegramClass::At => KIND_AT,
        };
        let mut low = self.slot & 0x07;
        if self.channel == crate::app::ports::Port::P2 {
            low |= SECONDARY_CHANNEL_BIT;
        }
        let mut phase = self.phase & 0x07;
        if self.phase_switch {
            phase |= PHASE_SWITCH_BIT;
        }
        [(kind << 4) | low, phase, self.cycle_count & 0x0F, 0]
    }

    /// Parse the four Sercos header bytes; `None` on an unknown kind nibble
    /// or out-of-range slot.
    pub fn parse(bytes: &[u8; SERCOS_HEADER_LEN]) -> Option<Self> {
        let class = match bytes[0] >> 4 {
            KIND_MDT => TelegramClass::Mdt,
            KIND_AT => TelegramClass::At,
            _ => return None,
        };
        let slot = bytes[0] & 0x07;
        if slot > 3 {
            return None;
        }
        let phase = bytes[1] & 0x07;
        if phase > 4 {
            return None;
        }
        let channel = if bytes[0] & SECONDARY_CHANNEL_BIT != 0 {
            crate::app::ports::Port::P2
        } else {
            crate::app::ports::Port::P1
        };
        Some(Self {
            class,
            slot,
            channel,
            phase,
            phase_switch: bytes[1] & PHASE_SWITCH_BIT != 0,
            cycle_count: bytes[2] & 0x0F,
        })
    }
}

// ---------------------------------------------------------------------------
// Payload geometry
// ---------------------------------------------------------------------------

/// Fixed per-slot payload geometry, derived from the projected slave count.
/// Computed once per startup; connection placement (see [`descriptor`])
/// starts where the fixed areas end.
#[derive(Debug, Clone, Copy)]
pub struct PayloadLayout {
    slaves: usize,
    /// Payload budget per telegram (MTU minus headers).
    pub payload_limit: usize,
}

impl PayloadLayout {
    pub fn new(slaves: usize, mtu: u16) -> Self {
        Self {
            slaves,
            payload_limit: mtu as usize - HEADER_LEN,
        }
    }

    /// Offset of the MST inside MDT0.
    pub const fn mst_offset(&self) -> usize {
        0
    }

    /// Offset of the extended Sercos-time field inside MDT0.
    pub const fn ext_time_offset(&self) -> usize {
        MST_LEN
    }

    /// Offset of the hot-plug field inside MDT0.
    pub const fn mdt_hotplug_offset(&self) -> usize {
        MST_LEN + EXT_TIME_LEN
    }

    /// Offset of slave `idx`'s SVC write half inside MDT0.
    pub fn mdt_svc_offset(&self, idx: usize) -> usize {
        MST_LEN + EXT_TIME_LEN + HOTPLUG_FIELD_LEN + idx * SVC_FIELD_LEN
    }

    /// Offset of slave `idx`'s S-DEV word inside AT0.
    pub fn sdev_offset(&self, idx: usize) -> usize {
        idx * 2
    }

    /// Offset of the hot-plug field inside AT0.
    pub fn at_hotplug_offset(&self) -> usize {
        self.slaves * 2
    }

    /// Offset of slave `idx`'s SVC read half inside AT0.
    pub fn at_svc_offset(&self, idx: usize) -> usize {
        self.slaves * 2 + HOTPLUG_FIELD_LEN + idx * SVC_FIELD_LEN
    }

    /// First byte available for connection regions in a slot.
    pub fn conn_area_start(&self, class: TelegramClass, slot: u8) -> usize {
        match (class, slot) {
            (TelegramClass::Mdt, 0) => self.mdt_svc_offset(self.slaves),
            (TelegramClass::At, 0) => self.at_svc_offset(self.slaves),
            _ => 0,
        }
    }
}
