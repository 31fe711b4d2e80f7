//! The master core: every engine and buffer of one instance.
//!
//! One [`MasterCore`] per hardware channel. All entry points take an
//! explicit reference — there is no process-wide state. The byte arenas
//! (Tx/Rx RAM images, cyclic application buffers) are allocated once at
//! init from configuration-derived capacities; phase switching rebuilds
//! index tables inside them but the cyclic path never allocates.

use log::{debug, info, warn};

use crate::config::{CommParams, SlaveConfig, TelegramClass, MAX_TEL};
use crate::conn::engine::ConnEngine;
use crate::error::{Error, PhaseError, SvcError};
use crate::phase::timing::{TimingInputs, TimingSchedule};
use crate::phase::{Phase, PhaseState};
use crate::sercos_time::ClockAndCounters;
use crate::slave::SlaveDevice;
use crate::svc::engine::{SvcEngine, SvcOp, SvcReply, SvcRequest};
use crate::svc::handle::SvcMailbox;
use crate::svc::{Eidn, SvcElement};
use crate::telegram::buffer::BufferBank;
use crate::telegram::descriptor::ConnPlacement;
use crate::telegram::{PayloadLayout, HEADER_LEN};
use crate::topology::TopologyMonitor;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// IDNs the startup ladder touches
// ---------------------------------------------------------------------------

/// Communication version (CheckVersion).
pub const IDN_COMM_VERSION: u16 = 1000;
/// Minimum feedback processing time (GetTimingData).
pub const IDN_FEEDBACK_PROCESSING: u16 = 1005;
/// Ring delay contribution (GetTimingData).
pub const IDN_RING_DELAY: u16 = 1015;
/// Slave jitter capability (GetTimingData).
pub const IDN_JITTER: u16 = 1037;
/// Cycle time (TransmitTiming).
pub const IDN_CYCLE_TIME: u16 = 1002;
/// AT transmission starting time (TransmitTiming).
pub const IDN_AT_START: u16 = 1006;
/// UC channel window (TransmitTiming).
pub const IDN_UCC_WINDOW: u16 = 1017;
/// Master jitter declaration (TransmitTiming).
pub const IDN_MASTER_JITTER: u16 = 1023;
/// Reset class-1 diagnostic procedure command (clear-errors sweep).
pub const IDN_RESET_C1D: u16 = 99;
/// Per-slave connection table (placement offsets), written at CP3.
pub const IDN_CONN_TABLE: u16 = 1050;
/// Drive status word carried in the first AT connection.
pub const IDN_DRIVE_STATUS: u16 = 135;

/// Fallback connection geometry when `detect_slave_config` synthesises
/// the table: C-CON word, control/status word, four data bytes.
pub const DEFAULT_CONN_LEN: u16 = 8;

// ---------------------------------------------------------------------------
// Network control state
// ---------------------------------------------------------------------------

/// What the cyclic engine emits this cycle.
#[derive(Debug, Clone)]
pub struct NetCtl {
    /// Emit Sercos telegrams at all (false in NRT).
    pub emit_telegrams: bool,
    /// Phase number announced in every header.
    pub announce: Phase,
    /// Phase-switch announcement bit.
    pub phase_switch_active: bool,
    /// Full cycle counter; the wire carries it modulo 16.
    pub cycle_count: u64,
    /// MDT/AT slots in use this phase.
    pub active_slots: usize,
    pub src_mac: [u8; 6],
}

impl Default for NetCtl {
    fn default() -> Self {
        Self {
            emit_telegrams: false,
            announce: Phase::Nrt,
            phase_switch_active: false,
            cycle_count: 0,
            active_slots: 1,
            src_mac: [0x02, 0x53, 0x33, 0x4D, 0x00, 0x01],
        }
    }
}

// ---------------------------------------------------------------------------
// Batched service channel access for the startup ladder
// ---------------------------------------------------------------------------

/// One outstanding per-slave SVC sweep (reads or writes to every active
/// slave), polled by the phase steps.
#[derive(Debug, Default)]
pub struct SvcBatch {
    pub results: Vec<Option<Result<SvcReply, SvcError>>>,
    running: bool,
}

impl SvcBatch {
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn done(&self) -> bool {
        self.running && self.results.iter().all(Option::is_some)
    }
}

// ---------------------------------------------------------------------------
// Step scratch
// ---------------------------------------------------------------------------

/// Per-step working state of the phase handler; reset on step entry.
#[derive(Debug, Default)]
pub struct StepScratch {
    pub polls: u32,
    /// Sub-sequence inside a step (multi-sweep SVC steps).
    pub seq: u8,
    /// Discovery: last observed address list and its stability run.
    pub discovery_last: Vec<u16>,
    pub discovery_stable: u32,
    pub batch: SvcBatch,
    /// Cycle at which switch-back power-off was commanded.
    pub powered_off_at_cycle: Option<u64>,
}

impl StepScratch {
    pub fn reset(&mut self) {
        self.polls = 0;
        self.seq = 0;
        self.discovery_last.clear();
        self.discovery_stable = 0;
        self.batch = SvcBatch::default();
        self.powered_off_at_cycle = None;
    }
}

// ---------------------------------------------------------------------------
// Overrun accounting
// ---------------------------------------------------------------------------

/// Deadline accounting of the cyclic task. A single miss is contained —
/// counted, flagged, next cycle proceeds; consecutive misses beyond the
/// accepted-loss threshold escalate to a cyclic data error.
#[derive(Debug, Default)]
pub struct OverrunTracker {
    pub total: u32,
    pub consecutive: u16,
    pub cyclic_data_error: bool,
}

impl OverrunTracker {
    /// Record one cycle's outcome. Returns true when this miss crossed
    /// the escalation threshold.
    pub fn record(&mut self, missed: bool, accepted_losses: u16) -> bool {
        if !missed {
            self.consecutive = 0;
            return false;
        }
        self.total += 1;
        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive > accepted_losses && !self.cyclic_data_error {
            self.cyclic_data_error = true;
            return true;
        }
        false
    }

    pub fn clear(&mut self) {
        self.consecutive = 0;
        self.cyclic_data_error = false;
    }
}

// ---------------------------------------------------------------------------
// Communication watchdog
// ---------------------------------------------------------------------------

/// Cycle-counted watchdog for CP3/CP4: trips when the host stops calling
/// the cyclic entry point for longer than the armed number of periods.
#[derive(Debug, Default)]
pub struct Watchdog {
    armed_cycles: Option<u32>,
    last_cycle_ns: Option<u64>,
    pub expired: bool,
}

impl Watchdog {
    pub fn arm(&mut self, cycles: u32) {
        self.armed_cycles = Some(cycles.max(1));
        self.expired = false;
    }

    pub fn disarm(&mut self) {
        self.armed_cycles = None;
        self.expired = false;
    }

    /// Called once per cycle with the current clock. Returns true on the
    /// edge into the expired state.
    pub fn check(&mut self, now_ns: u64, cycle_time_ns: u32) -> bool {
        let Some(armed) = self.armed_cycles else {
            self.last_cycle_ns = Some(now_ns);
            return false;
        };
        let edge = match self.last_cycle_ns {
            Some(last)
                if now_ns.saturating_sub(last)
                    > u64::from(armed) * u64::from(cycle_time_ns) =>
            {
                !self.expired
            }
            _ => false,
        };
        if edge {
            self.expired = true;
        }
        self.last_cycle_ns = Some(now_ns);
        edge
    }
}

// ---------------------------------------------------------------------------
// UC channel queues
// ---------------------------------------------------------------------------

/// Frames queued through the UC channel window.
#[derive(Debug, Default)]
pub struct UccQueues {
    pub tx: std::collections::VecDeque<Vec<u8>>,
    pub rx: std::collections::VecDeque<Vec<u8>>,
}

impl UccQueues {
    pub const DEPTH: usize = 16;
}

// ---------------------------------------------------------------------------
// The core
// ---------------------------------------------------------------------------

/// Everything one master instance owns.
pub struct MasterCore {
    pub params: CommParams,
    /// Explicit slave configuration from the host (empty with
    /// `detect_slave_config`).
    pub slave_configs: Vec<SlaveConfig>,
    /// Effective per-index configuration after CP0 (discovered order).
    pub effective_configs: Vec<SlaveConfig>,
    pub slaves: Vec<SlaveDevice>,

    pub layout: PayloadLayout,
    pub tx: BufferBank,
    pub rx: BufferBank,
    /// Application-side cyclic buffers; stable pointers hand slices of
    /// these to the host.
    pub app_mdt: Vec<u8>,
    pub app_at: Vec<u8>,
    pub placements: Vec<ConnPlacement>,

    pub conns: ConnEngine,
    pub svc: SvcEngine,
    pub svc_mailbox: Arc<SvcMailbox>,
    pub topology: TopologyMonitor,
    pub clock: ClockAndCounters,

    pub phase_state: PhaseState,
    pub net: NetCtl,
    pub scratch: StepScratch,

    pub timing_inputs: Vec<TimingInputs>,
    pub timing: Option<TimingSchedule>,

    pub overruns: OverrunTracker,
    pub watchdog: Watchdog,
    pub ucc: UccQueues,

    /// Latched after a ring break until ring recovery confirms.
    pub ring_broken: bool,
    /// Set once the connection table is installed: the service layer owes
    /// the application its connection-configuration callbacks.
    pub config_cb_due: bool,
    /// Hot-plug admission progress (CP4 excursion).
    pub hotplug: crate::hotplug::HotplugProgress,
    /// Addresses seen in this cycle's CP0 address field.
    pub discovered: Vec<u16>,
    /// Per-slave activity mask consumed by the connection passes;
    /// refreshed at cycle prepare without reallocating.
    pub active_mask: Vec<bool>,
    /// Scratch frame buffer of the cyclic engine (MTU-sized).
    pub frame_buf: Vec<u8>,
    /// Hot-plug field images (MDT outgoing, AT incoming).
    pub hp_tx: [u8; 8],
    pub hp_rx: [u8; 8],
}

impl MasterCore {
    pub fn new(params: CommParams, slave_configs: Vec<SlaveConfig>) -> crate::error::Result<Self> {
        params.validate()?;
        for cfg in &slave_configs {
            cfg.validate()?;
        }

        let region_len = params.mtu as usize - HEADER_LEN;
        let layout = PayloadLayout::new(0, params.mtu);
        // Sized like the original's cyclic buffer: every slot at full MTU.
        let app_len = MAX_TEL * region_len;

        Ok(Self {
            svc: SvcEngine::new(0, params.svc_container_len as usize, 1)?,
            params,
            slave_configs,
            effective_configs: Vec::new(),
            slaves: Vec::new(),
            layout,
            tx: BufferBank::new(region_len),
            rx: BufferBank::new(region_len),
            app_mdt: vec![0; app_len],
            app_at: vec![0; app_len],
            placements: Vec::new(),
            conns: ConnEngine::new(0),
            svc_mailbox: Arc::new(SvcMailbox::new()),
            topology: TopologyMonitor::new(3),
            clock: ClockAndCounters::default(),
            phase_state: PhaseState::default(),
            net: NetCtl::default(),
            scratch: StepScratch::default(),
            timing_inputs: Vec::new(),
            timing: None,
            overruns: OverrunTracker::default(),
            watchdog: Watchdog::default(),
            ucc: UccQueues::default(),
            ring_broken: false,
            config_cb_due: false,
            hotplug: crate::hotplug::HotplugProgress::default(),
            discovered: Vec::new(),
            active_mask: Vec::new(),
            frame_buf: vec![0; region_len + HEADER_LEN],
            hp_tx: [0; 8],
            hp_rx: [0; 8],
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase_state.phase()
    }

    /// Cycle time for the phase currently announced on the wire.
    pub fn current_cycle_time(&self) -> u32 {
        self.params.cycle_time_for(self.net.announce)
    }

    /// Number of projected (discovered) slaves.
    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    // ── Startup table building ────────────────────────────────

    /// Build the slave table from the stabilised CP0 discovery list.
    /// Dense indices follow discovery order. With explicit configuration,
    /// every configured non-hot-plug slave must be present.
    pub fn adopt_discovery(&mut self, addresses: &[u16]) -> Result<(), Error> {
        self.slaves.clear();
        self.effective_configs.clear();

        if self.params.detect_slave_config {
            for (idx, &addr) in addresses.iter().enumerate() {
                let mut dev = SlaveDevice::new(addr, idx as u16);
                dev.discovered = true;
                self.slaves.push(dev);
                self.effective_configs.push(default_slave_config(addr));
            }
        } else {
            // Configuration order decides the dense indices; hot-plug
            // devices keep a slot even while absent.
            for (idx, cfg) in self.slave_configs.iter().enumerate() {
                let discovered = addresses.contains(&cfg.address);
                if !discovered && !cfg.hot_plug {
                    warn!("configured slave {} missing from discovery", cfg.address);
                    return Err(PhaseError::DeviceMissing(cfg.address).into());
                }
                let mut dev = SlaveDevice::new(cfg.address, idx as u16);
                dev.discovered = discovered;
                dev.hot_plug = cfg.hot_plug;
                self.slaves.push(dev);
                self.effective_configs.push(cfg.clone());
            }
        }

        self.layout = PayloadLayout::new(self.slaves.len(), self.params.mtu);
        self.svc = SvcEngine::new(
            self.slaves.len(),
            self.params.svc_container_len as usize,
            self.svc_cycle_budget(),
        )?;
        self.conns = ConnEngine::new(self.slaves.len());
        self.timing_inputs = vec![TimingInputs::default(); self.slaves.len()];
        self.active_mask = vec![false; self.slaves.len()];

        info!(
            "adopted {} slaves: {:?}",
            self.slaves.len(),
            self.slaves.iter().map(|s| s.address).collect::<Vec<_>>()
        );
        Ok(())
    }

    /// Highest telegram slot any configured connection uses, as a count.
    pub fn planned_slots(&self) -> usize {
        self.effective_configs
            .iter()
            .flat_map(|c| c.connections.iter())
            .map(|c| c.slot as usize + 1)
            .max()
            .unwrap_or(1)
    }

    /// SVC busy timeout expressed in cycles of the current cycle time.
    pub fn svc_cycle_budget(&self) -> u32 {
        let cycle_ns = u64::from(self.current_cycle_time().max(1));
        let timeout_ns = u64::from(self.params.svc_busy_timeout_ms) * 1_000_000;
        (timeout_ns / cycle_ns).max(16) as u32
    }

    /// Dense index of a Sercos address.
    pub fn slave_by_address(&self, address: u16) -> Option<u16> {
        self.slaves
            .iter()
            .find(|s| s.address == address)
            .map(|s| s.index)
    }

    /// Indices of slaves participating in the startup ladder (discovered,
    /// not waiting for hot-plug).
    pub fn startup_slaves(&self) -> Vec<usize> {
        self.slaves
            .iter()
            .filter(|s| s.discovered)
            .map(|s| s.index as usize)
            .collect()
    }

    // ── Phase acknowledgement ─────────────────────────────────

    /// All startup slaves echo the announced phase with a valid S-DEV.
    pub fn all_slaves_acked(&self, phase: Phase) -> bool {
        let number = u16::from(phase.number());
        self.startup_slaves().iter().all(|&i| {
            let dev = &self.slaves[i];
            dev.s_dev_valid() && dev.s_dev & crate::slave::S_DEV_PHASE_MASK == number
        })
    }

    /// Address of the first startup slave that has not acknowledged.
    pub fn first_unacked(&self, phase: Phase) -> Option<u16> {
        let number = u16::from(phase.number());
        self.startup_slaves()
            .iter()
            .find(|&&i| {
                let dev = &self.slaves[i];
                !dev.s_dev_valid() || dev.s_dev & crate::slave::S_DEV_PHASE_MASK != number
            })
            .map(|&i| self.slaves[i].address)
    }

    // ── Batched SVC sweeps ────────────────────────────────────

    /// Submit one read to every startup slave.
    pub fn batch_read(&mut self, eidn: Eidn, max_len: usize) {
        let targets = self.startup_slaves();
        self.scratch.batch = SvcBatch {
            results: vec![None; self.slaves.len()],
            running: true,
        };
        for idx in targets {
            let req = SvcRequest {
                eidn,
                op: SvcOp::Read {
                    element: SvcElement::Value,
                    max_len,
                },
                cancel_in_flight: false,
                done: None,
            };
            if let Err(e) = self.svc.submit(idx, req) {
                self.scratch.batch.results[idx] = Some(Err(e));
            }
        }
        self.mark_absent_batch_slots();
    }

    /// Submit one value write to every startup slave.
    pub fn batch_write(&mut self, eidn: Eidn, data: &[u8]) {
        let targets = self.startup_slaves();
        self.scratch.batch = SvcBatch {
            results: vec![None; self.slaves.len()],
            running: true,
        };
        for idx in targets {
            let req = SvcRequest {
                eidn,
                op: SvcOp::Write {
                    element: SvcElement::Value,
                    data: data.to_vec(),
                },
                cancel_in_flight: false,
                done: None,
            };
            if let Err(e) = self.svc.submit(idx, req) {
                self.scratch.batch.results[idx] = Some(Err(e));
            }
        }
        self.mark_absent_batch_slots();
    }

    /// Submit one value write to every startup slave with per-slave data.
    pub fn batch_write_per(&mut self, eidn: Eidn, make: impl Fn(&Self, usize) -> Vec<u8>) {
        let targets = self.startup_slaves();
        self.scratch.batch = SvcBatch {
            results: vec![None; self.slaves.len()],
            running: true,
        };
        for idx in targets {
            let data = make(self, idx);
            let req = SvcRequest {
                eidn,
                op: SvcOp::Write {
                    element: SvcElement::Value,
                    data,
                },
                cancel_in_flight: false,
                done: None,
            };
            if let Err(e) = self.svc.submit(idx, req) {
                self.scratch.batch.results[idx] = Some(Err(e));
            }
        }
        self.mark_absent_batch_slots();
    }

    /// Serialised connection placements of one slave, as transferred in
    /// the per-slave connection table parameter.
    pub fn conn_table_blob(&self, slave: usize) -> Vec<u8> {
        let mut blob = Vec::new();
        for p in self
            .placements
            .iter()
            .filter(|p| p.slave_idx as usize == slave)
        {
            blob.push(match p.class {
                TelegramClass::Mdt => 0,
                TelegramClass::At => 1,
            });
            blob.push(p.slot);
            blob.extend_from_slice(&p.telegram_offset.to_le_bytes());
            blob.extend_from_slice(&p.length.to_le_bytes());
        }
        blob
    }

    /// Submit one procedure command to every startup slave.
    pub fn batch_command(&mut self, eidn: Eidn) {
        let targets = self.startup_slaves();
        self.scratch.batch = SvcBatch {
            results: vec![None; self.slaves.len()],
            running: true,
        };
        for idx in targets {
            let req = SvcRequest {
                eidn,
                op: SvcOp::Command,
                cancel_in_flight: false,
                done: None,
            };
            if let Err(e) = self.svc.submit(idx, req) {
                self.scratch.batch.results[idx] = Some(Err(e));
            }
        }
        self.mark_absent_batch_slots();
    }

    /// Slots that are not part of the sweep complete immediately.
    fn mark_absent_batch_slots(&mut self) {
        let startup: Vec<usize> = self.startup_slaves();
        for idx in 0..self.slaves.len() {
            if !startup.contains(&idx) && self.scratch.batch.results[idx].is_none() {
                self.scratch.batch.results[idx] = Some(Ok(SvcReply::Written));
            }
        }
    }

    /// Collect finished transactions into the batch. Call once per poll.
    pub fn batch_poll(&mut self) {
        if !self.scratch.batch.is_running() {
            return;
        }
        for idx in 0..self.slaves.len() {
            if self.scratch.batch.results[idx].is_none() {
                if let Some(result) = self.svc.take_completion(idx) {
                    self.scratch.batch.results[idx] = Some(result);
                }
            }
        }
    }

    // ── Device power ──────────────────────────────────────────

    /// Write the enable/disable control word for one slave — into the
    /// application buffer and straight into the Tx image, so switch-back
    /// sees the disable word on the wire regardless of validity gating.
    pub fn write_control_word(&mut self, slave: usize, word: u16) -> bool {
        let Some(placement) = self
            .placements
            .iter()
            .find(|p| p.slave_idx as usize == slave && p.class == TelegramClass::Mdt)
            .copied()
        else {
            return false;
        };
        let app_off = placement.buffer_offset as usize + 2;
        if app_off + 2 > self.app_mdt.len() {
            return false;
        }
        self.app_mdt[app_off..app_off + 2].copy_from_slice(&word.to_le_bytes());

        let region = self
            .tx
            .region_mut(crate::telegram::buffer::tx_region(TelegramClass::Mdt, placement.slot));
        let tel_off = placement.telegram_offset as usize;
        if tel_off + 4 <= region.len() {
            // Assert producer-ready alongside: the word is deliberate
            // master data and must be honoured even while the producer
            // pass is frozen (switch-back).
            let c_con =
                u16::from_le_bytes([region[tel_off], region[tel_off + 1]]) | crate::conn::C_CON_PROD_RDY;
            region[tel_off..tel_off + 2].copy_from_slice(&c_con.to_le_bytes());
            region[tel_off + 2..tel_off + 4].copy_from_slice(&word.to_le_bytes());
        }
        true
    }

    /// Disable every active slave (switch-back safety and close-down).
    pub fn power_down_all(&mut self) {
        debug!("powering down all slaves");
        for idx in 0..self.slaves.len() {
            self.write_control_word(idx, crate::slave::SLAVE_DISABLE);
        }
    }
}

/// The connection set synthesised for a discovered slave: one MDT and one
/// AT connection in slot 0, control/status word at offset 2.
fn default_slave_config(address: u16) -> SlaveConfig {
    SlaveConfig {
        address,
        fsp: None,
        hot_plug: false,
        connections: vec![
            crate::config::ConnConfig {
                class: TelegramClass::Mdt,
                slot: 0,
                length: DEFAULT_CONN_LEN,
                cycle_multiple: 1,
                accepted_losses: 3,
                idns: vec![u32::from(IDN_DRIVE_STATUS)],
            },
            crate::config::ConnConfig {
                class: TelegramClass::At,
                slot: 0,
                length: DEFAULT_CONN_LEN,
                cycle_multiple: 1,
                accepted_losses: 3,
                idns: vec![u32::from(IDN_DRIVE_STATUS)],
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommParams;

    fn core() -> MasterCore {
        MasterCore::new(CommParams::default(), Vec::new()).unwrap()
    }

    #[test]
    fn discovery_assigns_dense_indices_in_order() {
        let mut c = core();
        c.adopt_discovery(&[2, 5, 7]).unwrap();
        assert_eq!(c.slave_count(), 3);
        assert_eq!(c.slave_by_address(2), Some(0));
        assert_eq!(c.slave_by_address(5), Some(1));
        assert_eq!(c.slave_by_address(7), Some(2));
        assert_eq!(c.slave_by_address(9), None);
    }

    #[test]
    fn explicit_config_requires_presence() {
        let cfg = crate::config::SlaveConfig {
            address: 4,
            fsp: None,
            hot_plug: false,
            connections: Vec::new(),
        };
        let mut c = MasterCore::new(
            CommParams {
                detect_slave_config: false,
                ..CommParams::default()
            },
            vec![cfg],
        )
        .unwrap();
        assert!(matches!(
            c.adopt_discovery(&[2, 5]),
            Err(Error::Phase(PhaseError::DeviceMissing(4)))
        ));
        assert!(c.adopt_discovery(&[2, 4]).is_ok());
    }

    #[test]
    fn hot_plug_slaves_may_be_absent() {
        let cfg = crate::config::SlaveConfig {
            address: 9,
            fsp: None,
            hot_plug: true,
            connections: Vec::new(),
        };
        let mut c = MasterCore::new(
            CommParams {
                detect_slave_config: false,
                ..CommParams::default()
            },
            vec![cfg],
        )
        .unwrap();
        c.adopt_discovery(&[]).unwrap();
        assert_eq!(c.slave_count(), 1);
        assert!(!c.slaves[0].discovered);
        assert!(c.startup_slaves().is_empty());
    }

    #[test]
    fn overrun_escalates_after_accepted_losses() {
        let mut tracker = OverrunTracker::default();
        assert!(!tracker.record(true, 2));
        assert!(!tracker.record(true, 2));
        assert!(tracker.record(true, 2));
        assert!(tracker.cyclic_data_error);
        // Already escalated: no second edge.
        assert!(!tracker.record(true, 2));

        tracker.clear();
        assert!(!tracker.cyclic_data_error);
    }

    #[test]
    fn overrun_streak_resets_on_clean_cycle() {
        let mut tracker = OverrunTracker::default();
        tracker.record(true, 2);
        tracker.record(false, 2);
        tracker.record(true, 2);
        tracker.record(true, 2);
        assert!(!tracker.cyclic_data_error);
    }

    #[test]
    fn watchdog_trips_once_per_expiry() {
        let mut wd = Watchdog::default();
        wd.arm(3);
        assert!(!wd.check(0, 1_000));
        assert!(!wd.check(1_000, 1_000));
        // A 10-cycle gap against a 3-cycle budget.
        assert!(wd.check(11_000, 1_000));
        assert!(wd.expired);
        assert!(!wd.check(12_000, 1_000));
    }

    #[test]
    fn disarmed_watchdog_never_trips() {
        let mut wd = Watchdog::default();
        assert!(!wd.check(0, 1_000));
        assert!(!wd.check(1_000_000, 1_000));
    }
}
