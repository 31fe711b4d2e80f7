//! Sercos time and network counters.
//!
//! Sercos time is programmed by the host in CP3/CP4, disseminated in the
//! extended MST field of MDT0, and advanced locally by whole cycles.
//! Programming takes one code path regardless of the packet backend.

use core::fmt;

use crate::app::ports::Port;

/// Sercos network time: seconds plus nanoseconds since the host-chosen
/// epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SercosTime {
    pub seconds: u32,
    pub nanos: u32,
}

impl SercosTime {
    pub fn new(seconds: u32, nanos: u32) -> Self {
        let mut t = Self { seconds, nanos };
        t.normalize();
        t
    }

    fn normalize(&mut self) {
        while self.nanos >= 1_000_000_000 {
            self.nanos -= 1_000_000_000;
            self.seconds = self.seconds.wrapping_add(1);
        }
    }

    /// Advance by one cycle.
    pub fn advance(&mut self, cycle_time_ns: u32) {
        self.nanos += cycle_time_ns;
        self.normalize();
    }

    /// The eight bytes of the extended MST field.
    pub fn to_wire(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&self.seconds.to_le_bytes());
        out[4..8].copy_from_slice(&self.nanos.to_le_bytes());
        out
    }

    pub fn from_wire(bytes: &[u8]) -> Self {
        Self {
            seconds: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            nanos: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

impl fmt::Display for SercosTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.seconds, self.nanos)
    }
}

/// Per-port frame counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortCounters {
    pub frames_ok: u32,
    pub fcs_errors: u32,
    pub alignment_errors: u32,
    pub discarded: u32,
    pub ucc_violations: u32,
}

/// Clock-adjacent state of one master instance: Sercos time, per-port
/// counters, and the measured ring delays.
#[derive(Debug, Default)]
pub struct ClockAndCounters {
    /// Programmed Sercos time; `None` until `activate_sercos_time`.
    time: Option<SercosTime>,
    pub counters: [PortCounters; 2],
    /// Emission-to-far-port receipt time, ns, measured in CP0.
    pub ring_delay_ns: [u32; 2],
}

impl ClockAndCounters {
    /// The single programming path for Sercos time.
    pub fn program_sercos_time(&mut self, seconds: u32, nanos: u32) {
        self.time = Some(SercosTime::new(seconds, nanos));
    }

    pub fn sercos_time(&self) -> Option<SercosTime> {
        self.time
    }

    /// Advance the programmed time by one cycle.
    pub fn tick(&mut self, cycle_time_ns: u32) {
        if let Some(t) = &mut self.time {
            t.advance(cycle_time_ns);
        }
    }

    pub fn counters_mut(&mut self, port: Port) -> &mut PortCounters {
        &mut self.counters[port as usize]
    }

    pub fn counters(&self, port: Port) -> &PortCounters {
        &self.counters[port as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_advances_and_carries() {
        let mut t = SercosTime::new(1, 999_999_000);
        t.advance(2_000);
        assert_eq!(t, SercosTime::new(2, 1_000));
    }

    #[test]
    fn wire_round_trip() {
        let t = SercosTime::new(0x01020304, 123_456_789);
        assert_eq!(SercosTime::from_wire(&t.to_wire()), t);
    }

    #[test]
    fn unprogrammed_clock_does_not_tick() {
        let mut clk = ClockAndCounters::default();
        clk.tick(1_000_000);
        assert_eq!(clk.sercos_time(), None);

        clk.program_sercos_time(10, 0);
        clk.tick(1_000_000);
        assert_eq!(clk.sercos_time(), Some(SercosTime::new(10, 1_000_000)));
    }

    #[test]
    fn per_port_counters_are_independent(){
        let mut clk = ClockAndCounters::default();
        clk.counters_mut(Port::P1).frames_ok += 1;
        clk.counters_mut(Port::P2).fcs_errors += 2;
        assert_eq!(clk.counters(Port::P1).frames_ok, 1);
        assert_eq!(clk.counters(Port::P1).fcs_errors, 0);
        assert_eq!(clk.counters(Port::P2).fcs_errors, 2);
    }
}
