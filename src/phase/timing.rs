//! Cycle timing solver.
//!
//! At the end of CP2 the master knows every slave's timing contribution
//! (gathered over the service channel) and must fit the MDT window, the
//! AT window, and the UC channel into one cycle:
//!
//! ```text
//! MdtAtUcc:  │ MDTs │ AT window │ UC channel │ idle │ next cycle
//! MdtUccAt:  │ MDTs │ UC channel │ AT window │ idle │
//! AtCycleEnd:│ MDTs │ UC channel │ idle │ AT window ┤
//! ```
//!
//! Wire time is modelled at 100 Mbit/s: 80 ns per byte plus the standard
//! inter-frame gap. The solver fails — fatally for the phase switch —
//! when the windows do not fit the cycle time.

use log::{debug, info};

use crate::config::{CommParams, TimingMethod};
use crate::error::PhaseError;

/// Nanoseconds per byte at 100 Mbit/s.
const NS_PER_BYTE: u64 = 80;

/// Preamble + SFD + FCS + inter-frame gap, per frame.
const FRAME_OVERHEAD_BYTES: u64 = 8 + 4 + 12;

/// Timing contribution of one slave, read during `GetTimingData`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingInputs {
    /// Ring delay contribution (S-0-1015 analog), ns.
    pub ring_delay_ns: u32,
    /// Minimum feedback processing time (S-0-1005 analog), ns.
    pub feedback_processing_ns: u32,
    /// Jitter the slave tolerates (S-0-1037 analog), ns.
    pub jitter_ns: u32,
}

/// The solved schedule, transmitted to the slaves and installed into the
/// cyclic engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSchedule {
    pub cycle_time_ns: u32,
    /// Start offsets of the four MDTs inside the cycle.
    pub mdt_start_ns: [u32; 4],
    /// Start of the AT window.
    pub at_start_ns: u32,
    /// Start of the UC channel window; zero width when unused.
    pub ucc_start_ns: u32,
    pub ucc_end_ns: u32,
    /// Per-slave handshake window start (SVC sampling point).
    pub svc_window_ns: u32,
}

/// Wire time of one maximum-size telegram.
fn frame_time_ns(mtu: u16) -> u64 {
    (u64::from(mtu) + FRAME_OVERHEAD_BYTES) * NS_PER_BYTE
}

/// Solve the schedule for `active_mdts` telegram pairs and the given
/// slave contributions.
pub fn solve(
    params: &CommParams,
    active_mdts: usize,
    inputs: &[TimingInputs],
) -> Result<TimingSchedule, PhaseError> {
    let cycle = u64::from(params.cycle_time_cp3_4_ns);
    let frame = frame_time_ns(params.mtu);

    let worst_ring_delay: u64 = inputs.iter().map(|i| u64::from(i.ring_delay_ns)).sum();
    let worst_processing = inputs
        .iter()
        .map(|i| u64::from(i.feedback_processing_ns))
        .max()
        .unwrap_or(0);
    let jitter_margin = inputs
        .iter()
        .map(|i| u64::from(i.jitter_ns))
        .max()
        .unwrap_or(0)
        .max(u64::from(params.soft_master_jitter_ns));

    let mdt_window = frame * active_mdts.max(1) as u64;
    let at_window = frame * active_mdts.max(1) as u64 + worst_ring_delay + worst_processing;
    let ucc_window = u64::from(params.ucc_bandwidth_ns);

    let total = mdt_window + at_window + ucc_window + jitter_margin;
    if total > cycle {
        debug!(
            "timing solve failed: mdt {mdt_window} + at {at_window} + ucc {ucc_window} \
             + jitter {jitter_margin} = {total} ns > cycle {cycle} ns"
        );
        return Err(PhaseError::TimingUnsolvable);
    }

    let mut mdt_start_ns = [0u32; 4];
    for (i, start) in mdt_start_ns.iter_mut().enumerate() {
        *start = (frame * i as u64) as u32;
    }

    let (at_start, ucc_start) = match params.timing_method {
        TimingMethod::MdtAtUcc => (mdt_window, mdt_window + at_window),
        TimingMethod::MdtUccAt => (mdt_window + ucc_window, mdt_window),
        TimingMethod::AtCycleEnd => (cycle - at_window, mdt_window),
    };

    let schedule = TimingSchedule {
        cycle_time_ns: params.cycle_time_cp3_4_ns,
        mdt_start_ns,
        at_start_ns: at_start as u32,
        ucc_start_ns: ucc_start as u32,
        ucc_end_ns: (ucc_start + ucc_window) as u32,
        svc_window_ns: mdt_start_ns[0],
    };
    info!(
        "timing solved: AT at {} µs, UCC {}..{} µs of a {} µs cycle",
        schedule.at_start_ns / 1_000,
        schedule.ucc_start_ns / 1_000,
        schedule.ucc_end_ns / 1_000,
        cycle / 1_000
    );
    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommParams;

    fn inputs(n: usize) -> Vec<TimingInputs> {
        vec![
            TimingInputs {
                ring_delay_ns: 1_200,
                feedback_processing_ns: 25_000,
                jitter_ns: 1_000,
            };
            n
        ]
    }

    #[test]
    fn one_millisecond_cycle_fits_three_slaves() {
        let params = CommParams::default();
        let schedule = solve(&params, 1, &inputs(3)).unwrap();
        assert_eq!(schedule.cycle_time_ns, 1_000_000);
        assert!(schedule.at_start_ns > 0);
        assert!(schedule.at_start_ns < schedule.cycle_time_ns);
    }

    #[test]
    fn shortest_cycle_cannot_carry_full_frames() {
        let params = CommParams {
            cycle_time_cp3_4_ns: 31_250,
            ..CommParams::default()
        };
        // A 1500-byte MTU alone costs ~122 µs of wire time.
        assert_eq!(
            solve(&params, 4, &inputs(3)).unwrap_err(),
            PhaseError::TimingUnsolvable
        );
    }

    #[test]
    fn ucc_window_is_placed_by_method() {
        let mut params = CommParams {
            ucc_bandwidth_ns: 100_000,
            ..CommParams::default()
        };

        params.timing_method = TimingMethod::MdtAtUcc;
        let s = solve(&params, 1, &inputs(2)).unwrap();
        assert!(s.ucc_start_ns > s.at_start_ns);

        params.timing_method = TimingMethod::MdtUccAt;
        let s = solve(&params, 1, &inputs(2)).unwrap();
        assert!(s.ucc_start_ns < s.at_start_ns);
        assert_eq!(s.ucc_end_ns - s.ucc_start_ns, 100_000);

        params.timing_method = TimingMethod::AtCycleEnd;
        let s = solve(&params, 1, &inputs(2)).unwrap();
        assert!(s.at_start_ns > s.ucc_start_ns);
        assert!(s.at_start_ns < s.cycle_time_ns);
    }

    #[test]
    fn mdt_slots_are_spaced_by_frame_time() {
        let params = CommParams::default();
        let s = solve(&params, 4, &inputs(1)).unwrap();
        let spacing = s.mdt_start_ns[1] - s.mdt_start_ns[0];
        assert_eq!(s.mdt_start_ns[2] - s.mdt_start_ns[1], spacing);
        assert_eq!(s.mdt_start_ns[3] - s.mdt_start_ns[2], spacing);
        assert_eq!(u64::from(spacing), frame_time_ns(1500));
    }

    #[test]
    fn no_slaves_still_solves() {
        let params = CommParams::default();
        assert!(solve(&params, 1, &[]).is_ok());
    }
}
