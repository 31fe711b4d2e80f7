//! Hot-plug admission and ring recovery.
//!
//! Both run as CP4 excursions of the phase handler, in parallel to live
//! cyclic traffic. Hot-plug control rides in the reserved 8-byte field of
//! MDT0/AT0:
//!
//! ```text
//! ┌────────────┬────────────┬───────────────┐
//! │ ctrl (u16) │ addr (u16) │ data (u32)    │
//! └────────────┴────────────┴───────────────┘
//! ```
//!
//! An absent-but-configured slave announces itself through the AT field;
//! the master walks it through HP1 (addressing) and HP2 (parameters over
//! the service channel), then releases it into CP4. Failures leave the
//! new slave inactive and never disturb the running network.

use log::{info, warn};

use crate::context::{MasterCore, IDN_AT_START, IDN_CYCLE_TIME};
use crate::error::{Error, PhaseError};
use crate::phase::steps::StepOutcome;
use crate::svc::engine::{SvcOp, SvcRequest};
use crate::svc::{Eidn, SvcElement};
use crate::topology::Topology;

// ── Hot-plug field control codes (master → slave) ─────────────

pub const HP_CTRL_IDLE: u16 = 0x0000;
pub const HP_CTRL_GO_HP1: u16 = 0x0001;
pub const HP_CTRL_GO_HP2: u16 = 0x0002;
pub const HP_CTRL_GO_CP4: u16 = 0x0003;

// ── Hot-plug field status codes (slave → master) ──────────────

/// A slave announces itself; `addr` carries its Sercos address.
pub const HP_STAT_ANNOUNCE: u16 = 0x0001;
/// Acknowledge of a master control code; `data` echoes the code.
pub const HP_STAT_ACK: u16 = 0x8000;

/// Polls granted per admission stage before the excursion fails.
const HP_POLL_LIMIT: u32 = 512;

/// Cross-step progress of the running excursion.
#[derive(Debug, Default)]
pub struct HotplugProgress {
    /// Dense index of the slave under admission.
    pub pending: Option<u16>,
    /// Confirmed-bidirectional cycles during ring recovery.
    pub confirm: u32,
}

// ---------------------------------------------------------------------------
// Field codecs
// ---------------------------------------------------------------------------

pub fn encode_hp_field(ctrl: u16, addr: u16, data: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&ctrl.to_le_bytes());
    out[2..4].copy_from_slice(&addr.to_le_bytes());
    out[4..8].copy_from_slice(&data.to_le_bytes());
    out
}

pub fn decode_hp_field(field: &[u8; 8]) -> (u16, u16, u32) {
    (
        u16::from_le_bytes([field[0], field[1]]),
        u16::from_le_bytes([field[2], field[3]]),
        u32::from_le_bytes([field[4], field[5], field[6], field[7]]),
    )
}

// ---------------------------------------------------------------------------
// Admission (step HotPlug): announce → HP1 → HP2
// ---------------------------------------------------------------------------

pub fn admission_enter(core: &mut MasterCore) {
    core.hotplug.pending = None;
    core.hp_tx = encode_hp_field(HP_CTRL_IDLE, 0, 0);
}

pub fn admission_poll(core: &mut MasterCore) -> StepOutcome {
    core.scratch.polls += 1;
    if core.scratch.polls > HP_POLL_LIMIT {
        let addr = core
            .hotplug
            .pending
            .map(|i| core.slaves[i as usize].address)
            .unwrap_or(0);
        warn!("hot-plug admission timed out (slave {addr})");
        core.hp_tx = encode_hp_field(HP_CTRL_IDLE, 0, 0);
        return StepOutcome::Failed(Error::HotPlug(addr));
    }

    let (stat, addr, data) = decode_hp_field(&core.hp_rx);

    match core.scratch.seq {
        // Stage 0: wait for an announcement that matches a configured
        // hot-plug slave.
        0 => {
            if stat & HP_STAT_ANNOUNCE == 0 {
                return StepOutcome::InProgress;
            }
            let Some(idx) = core.slave_by_address(addr) else {
                warn!("hot-plug announcement from unconfigured address {addr}");
                return StepOutcome::Failed(Error::HotPlug(addr));
            };
            let dev = &core.slaves[idx as usize];
            if !dev.hot_plug || dev.active {
                return StepOutcome::Failed(Error::HotPlug(addr));
            }
            info!("hot-plug: slave {addr} announcing, entering HP1");
            core.hotplug.pending = Some(idx);
            core.hp_tx = encode_hp_field(HP_CTRL_GO_HP1, addr, 0);
            core.scratch.seq = 1;
            StepOutcome::InProgress
        }
        // Stage 1: wait for the HP1 acknowledge, then command HP2.
        1 => {
            if stat & HP_STAT_ACK != 0 && data as u16 == HP_CTRL_GO_HP1 {
                let addr = pending_address(core);
                core.hp_tx = encode_hp_field(HP_CTRL_GO_HP2, addr, 0);
                core.scratch.seq = 2;
            }
            StepOutcome::InProgress
        }
        // Stage 2: wait for the HP2 acknowledge.
        _ => {
            if stat & HP_STAT_ACK != 0 && data as u16 == HP_CTRL_GO_HP2 {
                let idx = core.hotplug.pending.expect("pending slave") as usize;
                core.slaves[idx].discovered = true;
                info!("hot-plug: slave {} reached HP2", core.slaves[idx].address);
                return StepOutcome::Done;
            }
            StepOutcome::InProgress
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter transfer (step TransHp2Para): SVC writes, then release to CP4
// ---------------------------------------------------------------------------

pub fn param_transfer_enter(core: &mut MasterCore) {
    core.scratch.seq = 0;
    let idx = core.hotplug.pending.map(usize::from).unwrap_or(0);
    let cycle_time = core.params.cycle_time_cp3_4_ns.to_le_bytes().to_vec();
    submit_write(core, idx, Eidn::s(IDN_CYCLE_TIME), cycle_time);
}

pub fn param_transfer_poll(core: &mut MasterCore) -> StepOutcome {
    core.scratch.polls += 1;
    if core.scratch.polls > HP_POLL_LIMIT {
        return StepOutcome::Failed(Error::HotPlug(pending_address(core)));
    }
    let Some(idx) = core.hotplug.pending.map(usize::from) else {
        return StepOutcome::Failed(Error::HotPlug(0));
    };

    match core.scratch.seq {
        // Stages 0..2: cycle time, AT start, and the connection table.
        0 => {
            match core.svc.take_completion(idx) {
                Some(Ok(_)) => {
                    let at_start = core.timing.map(|t| t.at_start_ns).unwrap_or_default();
                    submit_write(
                        core,
                        idx,
                        Eidn::s(IDN_AT_START),
                        at_start.to_le_bytes().to_vec(),
                    );
                    core.scratch.seq = 1;
                }
                Some(Err(e)) => {
                    warn!("hot-plug parameter transfer failed: {e}");
                    return StepOutcome::Failed(Error::HotPlug(pending_address(core)));
                }
                None => {}
            }
            StepOutcome::InProgress
        }
        1 => {
            match core.svc.take_completion(idx) {
                Some(Ok(_)) => {
                    let blob = core.conn_table_blob(idx);
                    submit_write(core, idx, Eidn::s(crate::context::IDN_CONN_TABLE), blob);
                    core.scratch.seq = 2;
                }
                Some(Err(e)) => {
                    warn!("hot-plug parameter transfer failed: {e}");
                    return StepOutcome::Failed(Error::HotPlug(pending_address(core)));
                }
                None => {}
            }
            StepOutcome::InProgress
        }
        2 => {
            match core.svc.take_completion(idx) {
                Some(Ok(_)) => {
                    let addr = core.slaves[idx].address;
                    core.hp_tx = encode_hp_field(HP_CTRL_GO_CP4, addr, 0);
                    core.scratch.seq = 3;
                }
                Some(Err(e)) => {
                    warn!("hot-plug parameter transfer failed: {e}");
                    return StepOutcome::Failed(Error::HotPlug(pending_address(core)));
                }
                None => {}
            }
            StepOutcome::InProgress
        }
        // Stage 3: wait for the CP4 release acknowledge, then activate.
        _ => {
            let (stat, _, data) = decode_hp_field(&core.hp_rx);
            if stat & HP_STAT_ACK != 0 && data as u16 == HP_CTRL_GO_CP4 {
                activate_hotplug_slave(core, idx);
                core.hp_tx = encode_hp_field(HP_CTRL_IDLE, 0, 0);
                core.hotplug.pending = None;
                return StepOutcome::Done;
            }
            StepOutcome::InProgress
        }
    }
}

fn submit_write(core: &mut MasterCore, idx: usize, eidn: Eidn, data: Vec<u8>) {
    let req = SvcRequest {
        eidn,
        op: SvcOp::Write {
            element: SvcElement::Value,
            data,
        },
        cancel_in_flight: false,
        done: None,
    };
    if let Err(e) = core.svc.submit(idx, req) {
        warn!("hot-plug svc submit failed: {e}");
    }
}

fn pending_address(core: &MasterCore) -> u16 {
    core.hotplug
        .pending
        .map(|i| core.slaves[i as usize].address)
        .unwrap_or(0)
}

/// Release the admitted slave into cyclic operation: mark it active and
/// reset its connections so they start clean.
fn activate_hotplug_slave(core: &mut MasterCore, idx: usize) {
    core.slaves[idx].active = true;
    let conn_indices: Vec<usize> = core
        .conns
        .connections()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.placement.slave_idx as usize == idx)
        .map(|(i, _)| i)
        .collect();
    for conn_idx in conn_indices {
        core.conns.clear_error(conn_idx);
    }
    info!(
        "hot-plug: slave {} active, {} connections live",
        core.slaves[idx].address,
        core.conns
            .connections()
            .iter()
            .filter(|c| c.placement.slave_idx as usize == idx)
            .count()
    );
}

// ---------------------------------------------------------------------------
// Ring recovery (step RingRecovery)
// ---------------------------------------------------------------------------

pub fn ring_recovery_enter(core: &mut MasterCore) {
    core.hotplug.confirm = 0;
}

pub fn ring_recovery_poll(core: &mut MasterCore) -> StepOutcome {
    core.scratch.polls += 1;
    if core.scratch.polls > HP_POLL_LIMIT {
        return StepOutcome::Failed(PhaseError::Timeout.into());
    }

    if core.topology.current() == Topology::Ring {
        core.hotplug.confirm += 1;
        if core.hotplug.confirm >= u32::from(core.params.accepted_tel_losses) {
            info!(
                "ring recovery: {} confirmed cycles, ring restored",
                core.hotplug.confirm
            );
            core.ring_broken = false;
            return StepOutcome::Done;
        }
    } else {
        core.hotplug.confirm = 0;
    }
    StepOutcome::InProgress
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hp_field_round_trips() {
        let field = encode_hp_field(HP_CTRL_GO_HP1, 42, 0xDEAD_BEEF);
        assert_eq!(decode_hp_field(&field), (HP_CTRL_GO_HP1, 42, 0xDEAD_BEEF));
    }

    #[test]
    fn ring_recovery_needs_consecutive_confirmation() {
        use crate::config::CommParams;
        use crate::topology::LinkSample;

        let mut core = MasterCore::new(CommParams::default(), Vec::new()).unwrap();
        ring_recovery_enter(&mut core);

        let ring = LinkSample {
            link_p1: true,
            link_p2: true,
            frames_traversed: true,
        };
        let broken = LinkSample {
            link_p1: true,
            link_p2: false,
            frames_traversed: false,
        };

        // Two ring cycles, a relapse, then a full confirmation run.
        core.topology.observe(ring);
        assert!(matches!(ring_recovery_poll(&mut core), StepOutcome::InProgress));
        assert!(matches!(ring_recovery_poll(&mut core), StepOutcome::InProgress));
        core.topology.observe(broken);
        assert!(matches!(ring_recovery_poll(&mut core), StepOutcome::InProgress));
        assert_eq!(core.hotplug.confirm, 0);

        core.topology.observe(ring);
        core.ring_broken = true;
        let mut done = false;
        for _ in 0..core.params.accepted_tel_losses {
            if matches!(ring_recovery_poll(&mut core), StepOutcome::Done) {
                done = true;
            }
        }
        assert!(done);
        assert!(!core.ring_broken);
    }
}
