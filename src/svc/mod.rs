//! Service channel: segmented parameter access multiplexed into every cycle.
//!
//! ```text
//!              submit / cancel                per cycle, per slave
//!  caller ───▶ ┌──────────────┐  2 B + ctrl ┌─────────────────────┐
//!              │  SvcEngine   │────────────▶│ MDT0 write half     │
//!              │  (per-slave  │             └─────────────────────┘
//!              │  transaction │  2 B + stat ┌─────────────────────┐
//!              │  slots)      │◀────────────│ AT0 read half       │
//!              └──────────────┘             └─────────────────────┘
//! ```
//!
//! One transaction per slave at a time; requests to the same slave are
//! served in submission order, requests to different slaves interleave
//! freely. Each transferred word crosses one Sercos cycle.

pub mod container;
pub mod engine;
pub mod handle;
pub mod responder;

use core::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EIDN — extended parameter address
// ---------------------------------------------------------------------------

/// Extended IDN: structural element, structural instance, S/P flag,
/// parameter set, and 12-bit number packed into 32 bits:
///
/// ```text
/// 31      24 23      16 15 14  12 11         0
/// ┌─────────┬──────────┬──┬──────┬────────────┐
/// │   SE    │    SI    │SP│ set  │   number   │
/// └─────────┴──────────┴──┴──────┴────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Eidn(u32);

impl Eidn {
    pub fn new(set: u8, vendor: bool, number: u16, si: u8, se: u8) -> Self {
        let mut raw = u32::from(number & 0x0FFF);
        raw |= u32::from(set & 0x07) << 12;
        if vendor {
            raw |= 1 << 15;
        }
        raw |= u32::from(si) << 16;
        raw |= u32::from(se) << 24;
        Self(raw)
    }

    /// Shorthand for a standard parameter of set 0 without structure,
    /// e.g. `Eidn::s(32)` for S-0-0032.
    pub fn s(number: u16) -> Self {
        Self::new(0, false, number, 0, 0)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn number(self) -> u16 {
        (self.0 & 0x0FFF) as u16
    }

    pub fn param_set(self) -> u8 {
        ((self.0 >> 12) & 0x07) as u8
    }

    pub fn is_vendor(self) -> bool {
        self.0 & (1 << 15) != 0
    }

    pub fn si(self) -> u8 {
        ((self.0 >> 16) & 0xFF) as u8
    }

    pub fn se(self) -> u8 {
        ((self.0 >> 24) & 0xFF) as u8
    }
}

impl fmt::Display for Eidn {
    /// Canonical Sercos notation, e.g. `S-0-0032.0.0`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{:04}.{}.{}",
            if self.is_vendor() { 'P' } else { 'S' },
            self.param_set(),
            self.number(),
            self.si(),
            self.se()
        )
    }
}

// ---------------------------------------------------------------------------
// Elements and access modes
// ---------------------------------------------------------------------------

/// Data block element of a parameter. Element 1 addresses the IDN itself
/// and opens every transaction on the wire; callers request elements 2..7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SvcElement {
    Idn = 1,
    Name = 2,
    Attribute = 3,
    Unit = 4,
    Minimum = 5,
    Maximum = 6,
    Value = 7,
}

impl SvcElement {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Idn),
            2 => Some(Self::Name),
            3 => Some(Self::Attribute),
            4 => Some(Self::Unit),
            5 => Some(Self::Minimum),
            6 => Some(Self::Maximum),
            7 => Some(Self::Value),
            _ => None,
        }
    }
}

/// Access mode of a service channel transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcAccess {
    Read,
    Write,
    Command,
}

/// Result of a completed procedure command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Finished,
    Stopped,
    Error,
}

// ---------------------------------------------------------------------------
// Attribute word
// ---------------------------------------------------------------------------

/// Data-length field of the attribute (element 3).
pub const ATTR_LEN_MASK: u32 = 0x0007_0000;
/// Fixed 2-byte value.
pub const ATTR_LEN_WORD: u32 = 0x0000_0000;
/// Fixed 4-byte value.
pub const ATTR_LEN_LONG: u32 = 0x0001_0000;
/// Variable-length list of words.
pub const ATTR_LEN_LIST: u32 = 0x0004_0000;

/// The IDN is a procedure command.
pub const ATTR_PROC_CMD: u32 = 0x0008_0000;

// ---------------------------------------------------------------------------
// Procedure command words
// ---------------------------------------------------------------------------

/// Activation word written to a command's value element: set + enable.
pub const CMD_ACTIVATE: u16 = 0x0003;
/// Clear word written after the command completed.
pub const CMD_CLEAR: u16 = 0x0000;

/// Command acknowledgement (status read from the value element).
pub const CMD_STATUS_BUSY: u16 = 0x0007;
pub const CMD_STATUS_FINISHED: u16 = 0x0003;
pub const CMD_STATUS_STOPPED: u16 = 0x0005;
pub const CMD_STATUS_ERROR: u16 = 0x000F;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eidn_packing_round_trips() {
        let eidn = Eidn::new(3, true, 1023, 7, 9);
        assert_eq!(eidn.param_set(), 3);
        assert!(eidn.is_vendor());
        assert_eq!(eidn.number(), 1023);
        assert_eq!(eidn.si(), 7);
        assert_eq!(eidn.se(), 9);
        assert_eq!(Eidn::from_raw(eidn.raw()), eidn);
    }

    #[test]
    fn eidn_display_is_canonical() {
        assert_eq!(Eidn::s(32).to_string(), "S-0-0032.0.0");
        assert_eq!(Eidn::new(1, true, 7, 2, 3).to_string(), "P-1-0007.2.3");
    }

    #[test]
    fn number_is_masked_to_12_bits() {
        let eidn = Eidn::new(0, false, 0xFFFF, 0, 0);
        assert_eq!(eidn.number(), 0x0FFF);
    }

    #[test]
    fn element_codes() {
        assert_eq!(SvcElement::from_code(7), Some(SvcElement::Value));
        assert_eq!(SvcElement::from_code(3), Some(SvcElement::Attribute));
        assert_eq!(SvcElement::from_code(1), Some(SvcElement::Idn));
        assert_eq!(SvcElement::from_code(0), None);
        assert_eq!(SvcElement::Value as u8, 7);
    }
}
