//! Slave device table.
//!
//! One [`SlaveDevice`] per discovered device, indexed by the dense
//! zero-based slave index assigned at CP0 in discovery order. The index is
//! stable across a phase-switch cycle; the table is rebuilt only when the
//! network returns to NRT.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Control / status word constants
// ---------------------------------------------------------------------------

/// C-DEV value that enables a drive (bits 15|14|13).
pub const SLAVE_ENABLE: u16 = 0xE000;

/// C-DEV value that disables a drive.
pub const SLAVE_DISABLE: u16 = 0x0000;

/// S-DEV bit: slave reports its cyclic data as valid.
pub const S_DEV_VALID: u16 = 0x8000;

/// S-DEV bit: slave acknowledges the commanded topology/phase.
pub const S_DEV_TOPOLOGY_ACK: u16 = 0x4000;

/// S-DEV bit: slave signals a class-1 diagnostic error.
pub const S_DEV_C1D: u16 = 0x2000;

/// S-DEV bits 0..2: communication phase the slave is operating in.
pub const S_DEV_PHASE_MASK: u16 = 0x0007;

// ---------------------------------------------------------------------------
// Function-specific profile
// ---------------------------------------------------------------------------

/// Function-specific profile reported in S-0-1302.0.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum FspProfile {
    Io = 1,
    Drive = 2,
    Encoder = 3,
}

impl FspProfile {
    /// Decode the S-0-1302.0.1 value; unknown codes are rejected.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::Io),
            2 => Some(Self::Drive),
            3 => Some(Self::Encoder),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Slave device
// ---------------------------------------------------------------------------

/// Run-time state of one slave device.
#[derive(Debug, Clone)]
pub struct SlaveDevice {
    /// Sercos address 1..=511.
    pub address: u16,
    /// Dense zero-based index, assigned at CP0 in discovery order.
    pub index: u16,
    /// Seen in AT0 during CP0 discovery.
    pub discovered: bool,
    /// Participates in cyclic traffic (reached CP4, or admitted by hot-plug).
    pub active: bool,
    /// Configured as a hot-plug device (may be absent at startup).
    pub hot_plug: bool,
    /// Last device status word received in AT0.
    pub s_dev: u16,
    /// Consecutive cycles without a valid AT contribution.
    pub miss_count: u16,
    /// Function-specific profile, read via SVC during CP2.
    pub fsp: Option<FspProfile>,
}

impl SlaveDevice {
    pub fn new(address: u16, index: u16) -> Self {
        Self {
            address,
            index,
            discovered: false,
            active: false,
            hot_plug: false,
            s_dev: 0,
            miss_count: 0,
            fsp: None,
        }
    }

    /// Slave reports valid cyclic data in its last S-DEV.
    pub fn s_dev_valid(&self) -> bool {
        self.s_dev & S_DEV_VALID != 0
    }

    /// Record a received S-DEV word and clear the miss counter.
    pub fn update_s_dev(&mut self, word: u16) {
        self.s_dev = word;
        self.miss_count = 0;
    }

    /// Count a cycle in which this slave's AT contribution was missing.
    /// Returns the new consecutive-miss count.
    pub fn count_miss(&mut self) -> u16 {
        self.miss_count = self.miss_count.saturating_add(1);
        self.miss_count
    }
}
