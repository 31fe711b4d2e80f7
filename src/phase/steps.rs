//! Step table and handler for the startup ladder.
//!
//! Classic function-pointer state machine: each ladder step is a row with
//! an optional `on_enter` and a per-tick `on_poll` that reports
//! [`StepOutcome`]. The [`PhaseHandler`] walks the rows toward the
//! requested target, retrying a failed step while retries remain, and
//! handles the two special walks: switch-back (power-off, delay, then the
//! target step directly) and the CP4 excursions (hot-plug, ring
//! recovery) that return to `SetCp4`.
//!
//! The handler is polled once per Sercos cycle between cyclic runs, so
//! every `InProgress` below costs one cycle.

use log::{debug, info, warn};

use super::{HandlerState, Phase, PhaseState, PhaseTarget, Step};
use crate::config::CommVersion;
use crate::context::{
    MasterCore, IDN_AT_START, IDN_COMM_VERSION, IDN_CONN_TABLE, IDN_CYCLE_TIME,
    IDN_FEEDBACK_PROCESSING, IDN_JITTER, IDN_MASTER_JITTER, IDN_RESET_C1D, IDN_RING_DELAY,
    IDN_UCC_WINDOW,
};
use crate::error::{Error, PhaseError};
use crate::phase::timing;
use crate::svc::engine::SvcReply;
use crate::svc::Eidn;
use crate::telegram::descriptor::{self, PendingConn};
use crate::topology::Topology;

/// Consecutive identical discovery lists required to close CP0.
const DISCOVERY_STABLE_POLLS: u32 = 8;

/// Stability run required before accepting an empty bus.
const DISCOVERY_EMPTY_POLLS: u32 = 64;

/// Polls granted for every slave to acknowledge a phase announcement
/// before the step fails with `DeviceMissing`.
const ACK_POLL_LIMIT: u32 = 512;

// ---------------------------------------------------------------------------
// Step descriptor
// ---------------------------------------------------------------------------

/// Result of one step poll.
#[derive(Debug)]
pub enum StepOutcome {
    InProgress,
    Done,
    Failed(Error),
}

/// Signature of a step entry action; runs once per (re-)entry.
pub type StepEnterFn = fn(&mut MasterCore);

/// Signature of the per-tick poll.
pub type StepPollFn = fn(&mut MasterCore) -> StepOutcome;

/// One row of the step table. Stored in a fixed array — no heap, no
/// `dyn`.
pub struct StepDescriptor {
    pub id: Step,
    pub name: &'static str,
    pub on_enter: Option<StepEnterFn>,
    pub on_poll: StepPollFn,
}

/// Build the static step table, indexed by `Step as usize`.
pub fn build_step_table() -> [StepDescriptor; Step::COUNT] {
    [
        StepDescriptor {
            id: Step::Idle,
            name: "Idle",
            on_enter: None,
            on_poll: |_| StepOutcome::Done,
        },
        StepDescriptor {
            id: Step::Initialize,
            name: "Initialize",
            on_enter: Some(initialize_enter),
            on_poll: |_| StepOutcome::Done,
        },
        StepDescriptor {
            id: Step::InitHardware,
            name: "InitHardware",
            on_enter: None,
            on_poll: init_hardware_poll,
        },
        StepDescriptor {
            id: Step::SetCommParam,
            name: "SetCommParam",
            on_enter: None,
            on_poll: set_comm_param_poll,
        },
        StepDescriptor {
            id: Step::SetNrtMode,
            name: "SetNRT",
            on_enter: Some(set_nrt_enter),
            on_poll: |_| StepOutcome::Done,
        },
        StepDescriptor {
            id: Step::SetCp0,
            name: "SetCP0",
            on_enter: Some(set_cp0_enter),
            on_poll: set_cp0_poll,
        },
        StepDescriptor {
            id: Step::InitConfig,
            name: "InitConfig",
            on_enter: None,
            on_poll: init_config_poll,
        },
        StepDescriptor {
            id: Step::SetCp1,
            name: "SetCP1",
            on_enter: Some(announce_cp1),
            on_poll: set_cp1_poll,
        },
        StepDescriptor {
            id: Step::SetCp2,
            name: "SetCP2",
            on_enter: Some(announce_cp2),
            on_poll: set_cp2_poll,
        },
        StepDescriptor {
            id: Step::CheckVersion,
            name: "CheckVersion",
            on_enter: Some(check_version_enter),
            on_poll: check_version_poll,
        },
        StepDescriptor {
            id: Step::GetTimingData,
            name: "GetTimingData",
            on_enter: Some(get_timing_enter),
            on_poll: get_timing_poll,
        },
        StepDescriptor {
            id: Step::CalcTiming,
            name: "CalcTiming",
            on_enter: None,
            on_poll: calc_timing_poll,
        },
        StepDescriptor {
            id: Step::TransmitTiming,
            name: "TransmitTiming",
            on_enter: Some(transmit_timing_enter),
            on_poll: transmit_timing_poll,
        },
        StepDescriptor {
            id: Step::SetCp3,
            name: "SetCP3",
            on_enter: None,
            on_poll: set_cp3_poll,
        },
        StepDescriptor {
            id: Step::FillConnInfo,
            name: "FillConnInfo",
            on_enter: None,
            on_poll: fill_conn_info_poll,
        },
        StepDescriptor {
            id: Step::SetCp4,
            name: "SetCP4",
            on_enter: Some(announce_cp4),
            on_poll: set_cp4_poll,
        },
        StepDescriptor {
            id: Step::HotPlug,
            name: "HotPlug",
            on_enter: Some(crate::hotplug::admission_enter),
            on_poll: crate::hotplug::admission_poll,
        },
        StepDescriptor {
            id: Step::TransHp2Para,
            name: "TransHP2Para",
            on_enter: Some(crate::hotplug::param_transfer_enter),
            on_poll: crate::hotplug::param_transfer_poll,
        },
        StepDescriptor {
            id: Step::RingRecovery,
            name: "RingRecovery",
            on_enter: Some(crate::hotplug::ring_recovery_enter),
            on_poll: crate::hotplug::ring_recovery_poll,
        },
    ]
}

// ---------------------------------------------------------------------------
// Step handlers
// ---------------------------------------------------------------------------

fn initialize_enter(core: &mut MasterCore) {
    core.slaves.clear();
    core.effective_configs.clear();
    core.discovered.clear();
    core.placements.clear();
    core.conns.clear();
    core.svc.abort_all();
    core.timing = None;
    core.overruns.clear();
    core.ring_broken = false;
    core.net.emit_telegrams = false;
    core.net.announce = Phase::Nrt;
    core.net.phase_switch_active = false;
    info!("instance reset");
}

fn init_hardware_poll(core: &mut MasterCore) -> StepOutcome {
    // The port adapters are injected at init; all that can be verified
    // here is that at least one port reports link.
    if core.topology.current() != Topology::NoLink {
        StepOutcome::Done
    } else {
        StepOutcome::InProgress
    }
}

fn set_comm_param_poll(core: &mut MasterCore) -> StepOutcome {
    match core.params.validate() {
        Ok(()) => StepOutcome::Done,
        Err(e) => StepOutcome::Failed(e.into()),
    }
}

fn set_nrt_enter(core: &mut MasterCore) {
    core.net.emit_telegrams = false;
    core.net.announce = Phase::Nrt;
    core.net.phase_switch_active = false;
    core.conns.clear();
    info!("NRT mode: ports act as plain Ethernet");
}

fn set_cp0_enter(core: &mut MasterCore) {
    // Fresh discovery: MST-only MDT0, slaves answer with their addresses.
    core.slaves.clear();
    core.effective_configs.clear();
    core.placements.clear();
    core.conns.clear();
    core.discovered.clear();
    core.net.emit_telegrams = true;
    core.net.announce = Phase::Cp0;
    core.net.phase_switch_active = true;
    core.net.active_slots = 1;
}

fn set_cp0_poll(core: &mut MasterCore) -> StepOutcome {
    core.scratch.polls += 1;

    if core.discovered == core.scratch.discovery_last {
        core.scratch.discovery_stable += 1;
    } else {
        core.scratch.discovery_last = core.discovered.clone();
        core.scratch.discovery_stable = 0;
    }

    // An empty list needs a much longer run before it is believed —
    // the first answers arrive within a cycle or two of CP0 entry.
    let required = if core.scratch.discovery_last.is_empty() {
        DISCOVERY_EMPTY_POLLS
    } else {
        DISCOVERY_STABLE_POLLS
    };
    if core.scratch.polls < required || core.scratch.discovery_stable < required {
        return StepOutcome::InProgress;
    }

    let addresses = core.scratch.discovery_last.clone();
    match core.adopt_discovery(&addresses) {
        Ok(()) => {
            core.net.phase_switch_active = false;
            StepOutcome::Done
        }
        Err(e) => StepOutcome::Failed(e),
    }
}

fn init_config_poll(core: &mut MasterCore) -> StepOutcome {
    for cfg in &core.effective_configs {
        if let Err(e) = cfg.validate() {
            return StepOutcome::Failed(e.into());
        }
    }
    StepOutcome::Done
}

fn announce_cp1(core: &mut MasterCore) {
    core.net.announce = Phase::Cp1;
    core.net.phase_switch_active = true;
}

fn set_cp1_poll(core: &mut MasterCore) -> StepOutcome {
    wait_for_acks(core, Phase::Cp1)
}

fn announce_cp2(core: &mut MasterCore) {
    core.net.announce = Phase::Cp2;
    core.net.phase_switch_active = true;
}

fn set_cp2_poll(core: &mut MasterCore) -> StepOutcome {
    match wait_for_acks(core, Phase::Cp2) {
        StepOutcome::Done => {}
        other => return other,
    }

    // Optional clear-errors sweep once every slave arrived in CP2.
    if core.params.clear_errors_on_startup {
        if !core.scratch.batch.is_running() {
            info!("clearing slave errors (S-0-{IDN_RESET_C1D:04})");
            core.batch_command(Eidn::s(IDN_RESET_C1D));
            return StepOutcome::InProgress;
        }
        core.batch_poll();
        if !core.scratch.batch.done() {
            return StepOutcome::InProgress;
        }
        for (idx, result) in core.scratch.batch.results.iter().enumerate() {
            if let Some(Err(e)) = result {
                warn!("slave {idx}: error clear failed: {e}");
            }
        }
    }

    core.net.phase_switch_active = false;
    StepOutcome::Done
}

fn check_version_enter(core: &mut MasterCore) {
    core.scratch.reset();
    core.batch_read(Eidn::s(IDN_COMM_VERSION), 4);
}

fn check_version_poll(core: &mut MasterCore) -> StepOutcome {
    core.batch_poll();
    if !core.scratch.batch.done() {
        return StepOutcome::InProgress;
    }
    for &idx in &core.startup_slaves() {
        match &core.scratch.batch.results[idx] {
            Some(Ok(SvcReply::Data(bytes))) if bytes.len() >= 4 => {
                let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if CommVersion::from_wire(raw) != Some(core.params.comm_version) {
                    warn!(
                        "slave {idx} advertises version 0x{raw:08X}, master wants {:?}",
                        core.params.comm_version
                    );
                    return StepOutcome::Failed(PhaseError::VersionMismatch.into());
                }
            }
            Some(Err(e)) => return StepOutcome::Failed(Error::Svc(*e)),
            _ => return StepOutcome::Failed(PhaseError::VersionMismatch.into()),
        }
    }
    StepOutcome::Done
}

fn get_timing_enter(core: &mut MasterCore) {
    core.scratch.reset();
    core.batch_read(Eidn::s(IDN_RING_DELAY), 4);
}

fn get_timing_poll(core: &mut MasterCore) -> StepOutcome {
    core.batch_poll();
    if !core.scratch.batch.done() {
        return StepOutcome::InProgress;
    }

    // Harvest the finished sweep into the per-slave timing inputs.
    let startup = core.startup_slaves();
    for &idx in &startup {
        let value = match &core.scratch.batch.results[idx] {
            Some(Ok(SvcReply::Data(bytes))) if bytes.len() >= 4 => {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            Some(Err(e)) => return StepOutcome::Failed(Error::Svc(*e)),
            _ => return StepOutcome::Failed(Error::Svc(crate::error::SvcError::Protocol)),
        };
        match core.scratch.seq {
            0 => core.timing_inputs[idx].ring_delay_ns = value,
            1 => core.timing_inputs[idx].feedback_processing_ns = value,
            _ => core.timing_inputs[idx].jitter_ns = value,
        }
    }

    if core.scratch.seq == 0 {
        // The summed contributions are the per-port ring delay estimate.
        let total: u32 = core.timing_inputs.iter().map(|i| i.ring_delay_ns).sum();
        core.clock.ring_delay_ns = [total, total];
    }

    match core.scratch.seq {
        0 => {
            core.scratch.seq = 1;
            core.batch_read(Eidn::s(IDN_FEEDBACK_PROCESSING), 4);
            StepOutcome::InProgress
        }
        1 => {
            core.scratch.seq = 2;
            core.batch_read(Eidn::s(IDN_JITTER), 4);
            StepOutcome::InProgress
        }
        _ => StepOutcome::Done,
    }
}

fn calc_timing_poll(core: &mut MasterCore) -> StepOutcome {
    match timing::solve(&core.params, core.planned_slots(), &core.timing_inputs) {
        Ok(schedule) => {
            core.timing = Some(schedule);
            StepOutcome::Done
        }
        Err(e) => StepOutcome::Failed(e.into()),
    }
}

fn transmit_timing_enter(core: &mut MasterCore) {
    core.scratch.reset();
    let cycle = core.params.cycle_time_cp3_4_ns;
    core.batch_write(Eidn::s(IDN_CYCLE_TIME), &cycle.to_le_bytes());
}

fn transmit_timing_poll(core: &mut MasterCore) -> StepOutcome {
    core.batch_poll();
    if !core.scratch.batch.done() {
        return StepOutcome::InProgress;
    }
    for &idx in &core.startup_slaves() {
        if let Some(Err(e)) = &core.scratch.batch.results[idx] {
            return StepOutcome::Failed(Error::Svc(*e));
        }
    }

    let Some(schedule) = core.timing else {
        return StepOutcome::Failed(PhaseError::TimingUnsolvable.into());
    };
    match core.scratch.seq {
        0 => {
            core.scratch.seq = 1;
            core.batch_write(Eidn::s(IDN_AT_START), &schedule.at_start_ns.to_le_bytes());
            StepOutcome::InProgress
        }
        1 => {
            core.scratch.seq = 2;
            let mut window = [0u8; 8];
            window[0..4].copy_from_slice(&schedule.ucc_start_ns.to_le_bytes());
            window[4..8].copy_from_slice(&schedule.ucc_end_ns.to_le_bytes());
            core.batch_write(Eidn::s(IDN_UCC_WINDOW), &window);
            StepOutcome::InProgress
        }
        2 => {
            core.scratch.seq = 3;
            let jitter = core.params.soft_master_jitter_ns;
            core.batch_write(Eidn::s(IDN_MASTER_JITTER), &jitter.to_le_bytes());
            StepOutcome::InProgress
        }
        _ => StepOutcome::Done,
    }
}

fn set_cp3_poll(core: &mut MasterCore) -> StepOutcome {
    // Place the connection table once, before the switch is announced;
    // an overflow aborts the transition here.
    if core.scratch.seq == 0 {
        core.scratch.seq = 1;
        let mut pending = Vec::new();
        for (slave_idx, cfg) in core.effective_configs.iter().enumerate() {
            for (conn_idx, conn) in cfg.connections.iter().enumerate() {
                pending.push(PendingConn {
                    slave_idx: slave_idx as u16,
                    conn_idx: conn_idx as u16,
                    class: conn.class,
                    slot: conn.slot,
                    length: conn.length,
                });
            }
        }
        match descriptor::place(&pending, &core.layout) {
            Ok(placements) => {
                core.placements = placements;
                core.net.announce = Phase::Cp3;
                core.net.phase_switch_active = true;
                core.net.active_slots = core.planned_slots();
                return StepOutcome::InProgress;
            }
            Err(e) => return StepOutcome::Failed(e.into()),
        }
    }
    wait_for_acks(core, Phase::Cp3)
}

fn fill_conn_info_poll(core: &mut MasterCore) -> StepOutcome {
    // First pass: install the table and ship each slave its placements.
    if core.scratch.seq == 0 {
        debug_assert!(
            descriptor::buffer_demand(&core.placements, crate::config::TelegramClass::Mdt)
                <= core.app_mdt.len()
                && descriptor::buffer_demand(&core.placements, crate::config::TelegramClass::At)
                    <= core.app_at.len()
        );
        let mut conns = Vec::with_capacity(core.placements.len());
        for placement in &core.placements {
            let cfg = &core.effective_configs[placement.slave_idx as usize].connections
                [placement.conn_idx as usize];
            conns.push(crate::conn::Connection::new(
                *placement,
                cfg.accepted_losses,
                cfg.cycle_multiple,
            ));
        }
        core.conns.install(conns);
        core.batch_write_per(Eidn::s(IDN_CONN_TABLE), |c, idx| c.conn_table_blob(idx));
        core.scratch.seq = 1;
        return StepOutcome::InProgress;
    }

    core.batch_poll();
    if !core.scratch.batch.done() {
        return StepOutcome::InProgress;
    }
    for &idx in &core.startup_slaves() {
        if let Some(Err(e)) = &core.scratch.batch.results[idx] {
            return StepOutcome::Failed(Error::Svc(*e));
        }
    }

    core.net.phase_switch_active = false;
    // The service layer owes the application its connection-configuration
    // callbacks now that the offsets exist.
    core.config_cb_due = true;
    StepOutcome::Done
}

fn announce_cp4(core: &mut MasterCore) {
    core.net.announce = Phase::Cp4;
    core.net.phase_switch_active = true;
}

fn set_cp4_poll(core: &mut MasterCore) -> StepOutcome {
    match wait_for_acks(core, Phase::Cp4) {
        StepOutcome::Done => {
            core.net.phase_switch_active = false;
            for &idx in &core.startup_slaves() {
                core.slaves[idx].active = true;
            }
            info!("CP4 reached: cyclic operation active");
            StepOutcome::Done
        }
        other => other,
    }
}

/// Shared acknowledge wait for the phase-switch steps.
fn wait_for_acks(core: &mut MasterCore, phase: Phase) -> StepOutcome {
    core.scratch.polls += 1;
    if core.all_slaves_acked(phase) {
        return StepOutcome::Done;
    }
    if core.scratch.polls > ACK_POLL_LIMIT {
        let addr = core.first_unacked(phase).unwrap_or(0);
        warn!("phase {phase:?}: slave {addr} did not acknowledge");
        return StepOutcome::Failed(PhaseError::DeviceMissing(addr).into());
    }
    StepOutcome::InProgress
}

// ---------------------------------------------------------------------------
// Phase handler
// ---------------------------------------------------------------------------

/// Walks the step table toward the requested target; polled once per
/// cycle.
pub struct PhaseHandler {
    table: [StepDescriptor; Step::COUNT],
}

impl Default for PhaseHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseHandler {
    pub fn new() -> Self {
        Self {
            table: build_step_table(),
        }
    }

    /// Accept a phase-switch request. Switch-back requests power down
    /// every slave first and honour the configured delay before the
    /// target step runs.
    pub fn request(
        &self,
        core: &mut MasterCore,
        target: PhaseTarget,
        retries: u32,
    ) -> Result<(), Error> {
        let step = core.phase_state.check_target(target)?;
        let backward = step <= core.phase_state.current && core.phase_state.current != Step::Idle;

        core.phase_state.target = step;
        core.phase_state.handler = HandlerState::Running;
        core.phase_state.active = None;
        core.phase_state.retries_left = retries;

        if backward {
            info!("switch-back to {:?}: powering down first", step.phase());
            core.phase_state.switching_back = true;
            core.power_down_all();
            core.svc.abort_all();
            core.scratch.powered_off_at_cycle = Some(core.net.cycle_count);
            let cycle_ns = u64::from(core.current_cycle_time().max(1));
            let delay_ns = u64::from(core.params.switch_back_delay_us) * 1_000;
            core.phase_state.sleep_polls = delay_ns.div_ceil(cycle_ns) as u32;
        }
        Ok(())
    }

    /// Accept a CP4 excursion (hot-plug or ring recovery).
    pub fn request_excursion(
        &self,
        core: &mut MasterCore,
        target: Step,
        retries: u32,
    ) -> Result<(), Error> {
        debug_assert!(matches!(
            target,
            Step::HotPlug | Step::TransHp2Para | Step::RingRecovery
        ));
        if core.phase_state.handler != HandlerState::Idle {
            return Err(PhaseError::HandlerBusy.into());
        }
        if core.phase_state.current != Step::SetCp4 {
            return Err(Error::WrongPhase);
        }
        core.phase_state.target = target;
        core.phase_state.handler = HandlerState::Running;
        core.phase_state.active = None;
        core.phase_state.retries_left = retries;
        Ok(())
    }

    /// One handler tick. `Ok(true)` once the target is reached; on error
    /// the handler idles and the phase stays at the last completed step.
    pub fn poll(&self, core: &mut MasterCore) -> Result<bool, Error> {
        if core.phase_state.handler != HandlerState::Running {
            return Ok(true);
        }
        if core.phase_state.sleep_polls > 0 {
            core.phase_state.sleep_polls -= 1;
            return Ok(false);
        }

        if core.phase_state.active.is_none() {
            let Some(next) = choose_next(&core.phase_state) else {
                core.phase_state.handler = HandlerState::Idle;
                return Ok(true);
            };
            core.phase_state.active = Some(next);
            core.scratch.reset();
            let desc = &self.table[next as usize];
            debug!("phase step enter: {}", desc.name);
            if let Some(enter) = desc.on_enter {
                enter(core);
            }
        }

        let step = core.phase_state.active.expect("active step");
        let desc = &self.table[step as usize];
        match (desc.on_poll)(core) {
            StepOutcome::InProgress => Ok(false),
            StepOutcome::Done => {
                debug!("phase step done: {}", desc.name);
                core.phase_state.active = None;
                let reached = step == core.phase_state.target;
                core.phase_state.current = if step > Step::SetCp4 && reached {
                    // Excursions land back in steady state.
                    Step::SetCp4
                } else {
                    step
                };
                if reached {
                    core.phase_state.switching_back = false;
                    core.phase_state.handler = HandlerState::Idle;
                }
                Ok(reached)
            }
            StepOutcome::Failed(e) => {
                if core.phase_state.retries_left > 0 {
                    core.phase_state.retries_left -= 1;
                    warn!(
                        "phase step {} failed ({e}), retrying ({} left)",
                        desc.name, core.phase_state.retries_left
                    );
                    core.scratch.reset();
                    if let Some(enter) = desc.on_enter {
                        enter(core);
                    }
                    Ok(false)
                } else {
                    warn!("phase step {} failed: {e}", desc.name);
                    core.phase_state.active = None;
                    core.phase_state.switching_back = false;
                    core.phase_state.handler = HandlerState::Idle;
                    // A failed excursion falls back to steady state so a
                    // later attempt can start fresh.
                    if core.phase_state.current > Step::SetCp4 {
                        core.phase_state.current = Step::SetCp4;
                    }
                    Err(e)
                }
            }
        }
    }

    /// Abort a running request (caller-side timeout). The phase stays at
    /// the last completed step; an aborted excursion falls back to
    /// steady state.
    pub fn cancel(&self, core: &mut MasterCore) {
        core.phase_state.active = None;
        core.phase_state.switching_back = false;
        core.phase_state.handler = HandlerState::Idle;
        core.net.phase_switch_active = false;
        if core.phase_state.current > Step::SetCp4 {
            core.phase_state.current = Step::SetCp4;
        }
    }
}

/// Pick the step to run next, honouring switch-back and excursions.
fn choose_next(state: &PhaseState) -> Option<Step> {
    if state.switching_back {
        return Some(state.target);
    }
    if state.target > Step::SetCp4 {
        return match state.current {
            Step::SetCp4 => Some(if state.target == Step::RingRecovery {
                Step::RingRecovery
            } else {
                Step::HotPlug
            }),
            Step::HotPlug => Some(Step::TransHp2Para),
            _ => None,
        };
    }
    state.current.next().filter(|n| *n <= state.target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommParams;

    fn core() -> MasterCore {
        MasterCore::new(CommParams::default(), Vec::new()).unwrap()
    }

    #[test]
    fn table_rows_match_step_indices() {
        let table = build_step_table();
        for (i, row) in table.iter().enumerate() {
            assert_eq!(row.id as usize, i, "row {} out of place", row.name);
        }
    }

    #[test]
    fn choose_next_walks_the_ladder() {
        let mut state = PhaseState::default();
        state.target = Step::SetCp0;
        assert_eq!(choose_next(&state), Some(Step::Initialize));
        state.current = Step::SetNrtMode;
        assert_eq!(choose_next(&state), Some(Step::SetCp0));
        state.current = Step::SetCp0;
        assert_eq!(choose_next(&state), None);
    }

    #[test]
    fn choose_next_runs_excursions_from_cp4() {
        let mut state = PhaseState::default();
        state.current = Step::SetCp4;
        state.target = Step::TransHp2Para;
        assert_eq!(choose_next(&state), Some(Step::HotPlug));
        state.current = Step::HotPlug;
        assert_eq!(choose_next(&state), Some(Step::TransHp2Para));

        state.current = Step::SetCp4;
        state.target = Step::RingRecovery;
        assert_eq!(choose_next(&state), Some(Step::RingRecovery));
    }

    #[test]
    fn switch_back_powers_down_and_sleeps() {
        let handler = PhaseHandler::new();
        let mut c = core();
        c.phase_state.current = Step::SetCp4;

        handler
            .request(&mut c, PhaseTarget::Phase(Phase::Cp0), 0)
            .unwrap();
        assert!(c.phase_state.switching_back);
        assert!(c.phase_state.sleep_polls > 0);
        assert_eq!(c.scratch.powered_off_at_cycle, Some(0));

        // The delay consumes polls without running any step.
        let polls = c.phase_state.sleep_polls;
        for _ in 0..polls {
            assert!(!handler.poll(&mut c).unwrap());
            assert!(c.phase_state.active.is_none());
        }
    }

    #[test]
    fn failed_step_retries_then_surfaces() {
        let handler = PhaseHandler::new();
        let mut c = core();
        // CP1 from scratch with a config that cannot validate: force a
        // failure through SetCommParam by breaking the params first.
        c.params.mtu = 0;
        handler
            .request(&mut c, PhaseTarget::Phase(Phase::Nrt), 1)
            .unwrap();

        // Initialize and InitHardware need link; feed the monitor.
        c.topology
            .observe(crate::topology::LinkSample {
                link_p1: true,
                link_p2: false,
                frames_traversed: false,
            });

        let mut failures = 0;
        for _ in 0..64 {
            match handler.poll(&mut c) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    failures += 1;
                    assert!(matches!(e, Error::Config(_)));
                    break;
                }
            }
        }
        assert_eq!(failures, 1, "SetCommParam failure must surface after retry");
        assert_eq!(c.phase_state.handler, HandlerState::Idle);
        // Last successfully entered step is before SetCommParam.
        assert!(c.phase_state.current < Step::SetCommParam);
    }
}
