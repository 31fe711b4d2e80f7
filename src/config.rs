//! Master configuration parameters.
//!
//! All tunable parameters for one master instance. Values can be loaded
//! from a JSON file by the shell binary or filled in by the host
//! controller before `Master::init`. Validation rejects bad values —
//! nothing is silently clamped.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::phase::Phase;

// ---------------------------------------------------------------------------
// Capacity limits (arena sizing)
// ---------------------------------------------------------------------------

/// Maximum number of slave devices on one network (Sercos address space).
pub const MAX_SLAVES: usize = 511;

/// Telegram slots per class (MDT0..MDT3, AT0..AT3).
pub const MAX_TEL: usize = 4;

/// Maximum connections per slave device.
pub const MAX_CONN_PER_SLAVE: usize = 8;

/// Device index selector meaning "every projected slave".
pub const ALL_DEVICES: u16 = 999;

// ---------------------------------------------------------------------------
// Cycle time grid
// ---------------------------------------------------------------------------

/// Shortest legal Sercos cycle (31.25 µs).
pub const TSCYC_MIN_NS: u32 = 31_250;
/// 62.5 µs step of the sub-250 µs grid.
pub const TSCYC_62_5_US_NS: u32 = 62_500;
/// 125 µs step of the sub-250 µs grid.
pub const TSCYC_125_US_NS: u32 = 125_000;
/// Granularity above 250 µs.
pub const TSCYC_250_US_NS: u32 = 250_000;
/// 1 ms floor for CP0..CP2.
pub const TSCYC_1_MS_NS: u32 = 1_000_000;
/// Longest legal Sercos cycle (65 ms).
pub const TSCYC_MAX_NS: u32 = 65_000_000;

/// Check a cycle time against the validity rule for a phase.
///
/// Below 250 µs only the three fixed values are legal; at or above it the
/// time must sit on the 250 µs grid and stay under 65 ms. CP0..CP2
/// additionally require at least 1 ms.
pub fn check_cycle_time(cycle_time_ns: u32, phase: Phase) -> Result<(), ConfigError> {
    if matches!(phase, Phase::Nrt) {
        return Err(ConfigError::CycleTimeInvalid);
    }

    if matches!(phase, Phase::Cp0 | Phase::Cp1 | Phase::Cp2) && cycle_time_ns < TSCYC_1_MS_NS {
        return Err(ConfigError::CycleTimeInvalid);
    }

    if cycle_time_ns >= TSCYC_250_US_NS {
        if cycle_time_ns % TSCYC_250_US_NS != 0 || cycle_time_ns > TSCYC_MAX_NS {
            return Err(ConfigError::CycleTimeInvalid);
        }
        Ok(())
    } else if cycle_time_ns == TSCYC_MIN_NS
        || cycle_time_ns == TSCYC_62_5_US_NS
        || cycle_time_ns == TSCYC_125_US_NS
    {
        Ok(())
    } else {
        Err(ConfigError::CycleTimeInvalid)
    }
}

// ---------------------------------------------------------------------------
// Timing method and communication version
// ---------------------------------------------------------------------------

/// Placement of the UC channel inside the Sercos cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingMethod {
    /// MDT window, then AT window, UC channel at the end of the cycle.
    MdtAtUcc,
    /// MDT window, UC channel, AT window at the end of the cycle.
    MdtUccAt,
    /// AT window placed at the cycle end, UC channel between MDT and AT.
    AtCycleEnd,
}

/// Sercos communication version advertised by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommVersion {
    /// Sercos III V1.1.x
    V1_1,
    /// Sercos III V1.3.x
    V1_3,
}

impl CommVersion {
    /// Wire encoding used in the version-check parameter.
    pub fn wire(self) -> u32 {
        match self {
            Self::V1_1 => 0x0001_0100,
            Self::V1_3 => 0x0001_0300,
        }
    }

    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0x0001_0100 => Some(Self::V1_1),
            0x0001_0300 => Some(Self::V1_3),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Communication parameters
// ---------------------------------------------------------------------------

/// Core communication parameters for one master instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommParams {
    // --- Cycle times (ns) ---
    /// Cycle time in CP0. Must be ≥ 1 ms.
    pub cycle_time_cp0_ns: u32,
    /// Cycle time in CP1/CP2. Must be ≥ 1 ms.
    pub cycle_time_cp1_2_ns: u32,
    /// Cycle time in CP3/CP4.
    pub cycle_time_cp3_4_ns: u32,

    // --- Service channel ---
    /// Per-slave SVC busy timeout (ms).
    pub svc_busy_timeout_ms: u32,

    // --- Loss tolerance ---
    /// Consecutive-loss threshold for both the master and each connection.
    pub accepted_tel_losses: u16,

    // --- Telegram layout ---
    /// Sercos III timing method (UC-channel placement).
    pub timing_method: TimingMethod,
    /// Maximum Ethernet frame size (bytes).
    pub mtu: u16,
    /// Duration (ns) per cycle reserved for the UC channel.
    pub ucc_bandwidth_ns: u32,

    // --- Identity ---
    /// Communication version advertised to the slaves.
    pub comm_version: CommVersion,
    /// Declared soft-master jitter (ns), disseminated for the slaves'
    /// synchronisation-margin computation.
    pub soft_master_jitter_ns: u32,

    // --- Startup behaviour ---
    /// Adopt the discovered slave list instead of requiring explicit config.
    pub detect_slave_config: bool,
    /// Clear all slave errors during CP2 entry.
    pub clear_errors_on_startup: bool,
    /// Power-off to phase-command delay for switch-back (µs).
    pub switch_back_delay_us: u32,

    // --- SVC container geometry ---
    /// Per-slave service-channel container length (bytes). The length
    /// minus the 14-byte overhead must be a multiple of 4 so both buffer
    /// halves come out 4-byte aligned.
    pub svc_container_len: u16,
}

impl Default for CommParams {
    fn default() -> Self {
        Self {
            cycle_time_cp0_ns: TSCYC_1_MS_NS,
            cycle_time_cp1_2_ns: TSCYC_1_MS_NS,
            cycle_time_cp3_4_ns: TSCYC_1_MS_NS,

            svc_busy_timeout_ms: 1_000,

            accepted_tel_losses: 3,

            timing_method: TimingMethod::MdtAtUcc,
            mtu: 1500,
            ucc_bandwidth_ns: 0,

            comm_version: CommVersion::V1_3,
            soft_master_jitter_ns: 50_000,

            detect_slave_config: true,
            clear_errors_on_startup: false,
            switch_back_delay_us: 10_000,

            svc_container_len: 126,
        }
    }
}

impl CommParams {
    /// Validate every field. Called at `Master::init` and again before a
    /// phase switch picks up new cycle times.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_cycle_time(self.cycle_time_cp0_ns, Phase::Cp0)?;
        check_cycle_time(self.cycle_time_cp1_2_ns, Phase::Cp1)?;
        check_cycle_time(self.cycle_time_cp3_4_ns, Phase::Cp3)?;

        if self.mtu < 576 || self.mtu > 1518 {
            return Err(ConfigError::Validation("mtu outside 576..=1518"));
        }
        if self.accepted_tel_losses == 0 {
            return Err(ConfigError::Validation("accepted_tel_losses must be > 0"));
        }
        if u64::from(self.ucc_bandwidth_ns) >= u64::from(self.cycle_time_cp3_4_ns) {
            return Err(ConfigError::Validation("ucc_bandwidth >= cycle time"));
        }
        let svc_len = self.svc_container_len as usize;
        let svc_min = crate::svc::container::CONTAINER_OVERHEAD
            + 2 * crate::svc::container::MIN_HALF_LEN;
        if svc_len < svc_min
            || (svc_len - crate::svc::container::CONTAINER_OVERHEAD) % 4 != 0
        {
            return Err(ConfigError::Validation(
                "svc_container_len too small or halves unaligned",
            ));
        }
        Ok(())
    }

    /// Cycle time (ns) that applies in the given phase.
    pub fn cycle_time_for(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Nrt | Phase::Cp0 => self.cycle_time_cp0_ns,
            Phase::Cp1 | Phase::Cp2 => self.cycle_time_cp1_2_ns,
            Phase::Cp3 | Phase::Cp4 => self.cycle_time_cp3_4_ns,
        }
    }
}

// ---------------------------------------------------------------------------
// Slave and connection configuration
// ---------------------------------------------------------------------------

/// Telegram class of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelegramClass {
    /// Master data telegram (master → slaves).
    Mdt,
    /// Acknowledge telegram (slaves → master).
    At,
}

/// Static description of one uni-directional connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnConfig {
    /// Telegram class this connection rides in.
    pub class: TelegramClass,
    /// Telegram slot 0..3.
    pub slot: u8,
    /// Payload length in bytes, including the 2-byte C-CON prefix.
    pub length: u16,
    /// Cycle-time multiple (1 = every cycle).
    pub cycle_multiple: u16,
    /// Accepted consecutive telegram losses before the producer trips.
    pub accepted_losses: u16,
    /// IDNs carried by this connection (semantic contents, reserved at CP3).
    pub idns: Vec<u32>,
}

/// Static description of one slave device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    /// Sercos address 1..=511.
    pub address: u16,
    /// Expected function-specific profile; `None` accepts whatever the
    /// slave reports.
    pub fsp: Option<crate::slave::FspProfile>,
    /// Slave is allowed to join after CP4 via hot-plug.
    pub hot_plug: bool,
    /// Connections of this slave, in configuration order.
    pub connections: Vec<ConnConfig>,
}

impl SlaveConfig {
    /// Range-check address and connection geometry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address == 0 || self.address as usize > MAX_SLAVES {
            return Err(ConfigError::Validation("slave address outside 1..=511"));
        }
        if self.connections.len() > MAX_CONN_PER_SLAVE {
            return Err(ConfigError::Validation("too many connections for slave"));
        }
        for conn in &self.connections {
            if conn.slot as usize >= MAX_TEL {
                return Err(ConfigError::Validation("telegram slot outside 0..=3"));
            }
            if conn.length < 2 {
                return Err(ConfigError::Validation("connection shorter than C-CON"));
            }
            if conn.cycle_multiple == 0 {
                return Err(ConfigError::Validation("cycle_multiple must be > 0"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_validate() {
        assert!(CommParams::default().validate().is_ok());
    }

    #[test]
    fn cycle_time_grid_above_250us() {
        // 300 µs is off the 250 µs grid.
        assert!(check_cycle_time(300_000, Phase::Cp3).is_err());
        assert!(check_cycle_time(500_000, Phase::Cp3).is_ok());
        assert!(check_cycle_time(250_000, Phase::Cp4).is_ok());
        assert!(check_cycle_time(65_000_000, Phase::Cp3).is_ok());
        assert!(check_cycle_time(65_250_000, Phase::Cp3).is_err());
    }

    #[test]
    fn cycle_time_fixed_values_below_250us() {
        assert!(check_cycle_time(31_250, Phase::Cp4).is_ok());
        assert!(check_cycle_time(62_500, Phase::Cp4).is_ok());
        assert!(check_cycle_time(125_000, Phase::Cp3).is_ok());
        assert!(check_cycle_time(100_000, Phase::Cp3).is_err());
        assert!(check_cycle_time(31_251, Phase::Cp4).is_err());
    }

    #[test]
    fn cp0_to_cp2_require_one_millisecond() {
        assert!(check_cycle_time(31_250, Phase::Cp0).is_err());
        assert!(check_cycle_time(500_000, Phase::Cp1).is_err());
        assert!(check_cycle_time(1_000_000, Phase::Cp2).is_ok());
    }

    #[test]
    fn container_grid_requires_aligned_halves() {
        let with_len = |svc_container_len| CommParams {
            svc_container_len,
            ..CommParams::default()
        };
        // 128 - 14 is off the 4-byte grid.
        assert!(with_len(128).validate().is_err());
        assert!(with_len(126).validate().is_ok());
        // Below two 32-byte halves.
        assert!(with_len(60).validate().is_err());
    }

    #[test]
    fn slave_config_rejects_bad_address() {
        let cfg = SlaveConfig {
            address: 0,
            fsp: None,
            hot_plug: false,
            connections: Vec::new(),
        };
        assert!(cfg.validate().is_err());

        let cfg = SlaveConfig {
            address: 512,
            fsp: None,
            hot_plug: false,
            connections: Vec::new(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn conn_config_rejects_bad_slot_and_length() {
        let conn = ConnConfig {
            class: TelegramClass::Mdt,
            slot: 4,
            length: 8,
            cycle_multiple: 1,
            accepted_losses: 3,
            idns: vec![],
        };
        let cfg = SlaveConfig {
            address: 5,
            fsp: None,
            hot_plug: false,
            connections: vec![conn],
        };
        assert!(cfg.validate().is_err());
    }
}
