//! The master instance and its blocking API.
//!
//! [`Master`] owns the core, the phase handler, the injected ports, and
//! the registered application callbacks. Blocking calls (phase switch,
//! hot-plug, ring recovery, the single-threaded SVC accessors) pump the
//! cyclic engine themselves, paced by the clock port; in steady state the
//! host's real-time task calls [`Master::cycle`] once per tick and other
//! threads reach the service channel through [`Master::svc_handle`].
//!
//! ```text
//!  PacketPort ──▶ ┌─────────────────────────────┐ ──▶ EventSink
//!                 │           Master            │
//!  ClockPort  ──▶ │ phase · cyclic · svc · conn │ ◀── SvcHandle (threads)
//!                 └─────────────────────────────┘
//! ```

use std::time::Duration;

use log::{info, warn};

use crate::config::{CommParams, SlaveConfig, TelegramClass, ALL_DEVICES};
use crate::context::MasterCore;
use crate::cyclic::{self, Callbacks, CyclicCtx};
use crate::error::{Error, PhaseError, Result, SvcError};
use crate::phase::steps::PhaseHandler;
use crate::phase::{Phase, PhaseTarget, Step};
use crate::slave::{SLAVE_DISABLE, SLAVE_ENABLE};
use crate::svc::engine::{SvcOp, SvcReply, SvcRequest};
use crate::svc::handle::SvcHandle;
use crate::svc::{CommandOutcome, Eidn, SvcElement};
use crate::telegram::descriptor::ConnPlacement;
use crate::app::events::MasterEvent;
use crate::app::ports::{ClockPort, EventSink, NullSink, PacketPort};
use crate::topology::Topology;

/// Non-blocking status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SercosStatus {
    pub phase: Phase,
    pub topology: Topology,
    pub ring_broken: bool,
    pub cyclic_data_error: bool,
}

/// One Sercos III master instance.
pub struct Master<P: PacketPort, C: ClockPort> {
    core: MasterCore,
    handler: PhaseHandler,
    port: P,
    clock: C,
    callbacks: Callbacks,
    sink: Box<dyn EventSink + Send>,
    /// Monotonic deadline of the next cycle tick; zero until first use.
    next_tick_ns: u64,
}

impl<P: PacketPort, C: ClockPort> std::fmt::Debug for Master<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("next_tick_ns", &self.next_tick_ns)
            .finish_non_exhaustive()
    }
}

impl<P: PacketPort, C: ClockPort> Master<P, C> {
    /// Allocate all buffers and arm the instance. The network stays in
    /// NRT until the first phase switch.
    pub fn init(params: CommParams, mut port: P, clock: C) -> Result<Self> {
        let core = MasterCore::new(params, Vec::new())?;
        // Standard inter-frame gap; adapters with shaping honour it when
        // squeezing the UC window between real-time telegrams.
        port.set_inter_frame_gap(12);
        info!("master instance initialised");
        Ok(Self {
            core,
            handler: PhaseHandler::new(),
            port,
            clock,
            callbacks: Callbacks::default(),
            sink: Box::new(NullSink),
            next_tick_ns: 0,
        })
    }

    /// Replace the event sink (default: drop everything).
    pub fn set_event_sink(&mut self, sink: Box<dyn EventSink + Send>) {
        self.sink = sink;
    }

    /// Tear the instance down. Only legal from NRT or CP0.
    pub fn close(self) -> Result<()> {
        if self.core.phase() > Phase::Cp0 {
            return Err(Error::WrongPhase);
        }
        info!("master instance closed");
        Ok(())
    }

    // ── Configuration ─────────────────────────────────────────

    /// Install the explicit slave configuration. Only before CP1.
    pub fn set_slave_config(&mut self, list: Vec<SlaveConfig>) -> Result<()> {
        if self.core.phase() > Phase::Cp0 {
            return Err(Error::WrongPhase);
        }
        for cfg in &list {
            cfg.validate()?;
        }
        self.core.slave_configs = list;
        Ok(())
    }

    /// Register per-device callbacks by Sercos address. The config hook
    /// fires once the connection offsets exist; the cyclic hook fires
    /// every CP4 cycle.
    pub fn set_device_callback(
        &mut self,
        address: u16,
        config_fn: Option<Box<dyn FnMut(u16, &[ConnPlacement]) + Send>>,
        cyclic_fn: Option<Box<dyn FnMut(&mut CyclicCtx, u16) + Send>>,
    ) {
        self.callbacks.config_device.retain(|(a, _)| *a != address);
        self.callbacks.cyclic_device.retain(|(a, _)| *a != address);
        if let Some(f) = config_fn {
            self.callbacks.config_device.push((address, f));
        }
        if let Some(f) = cyclic_fn {
            self.callbacks.cyclic_device.push((address, f));
        }
    }

    /// Register the global callbacks (fired before the per-device ones).
    pub fn set_global_callbacks(
        &mut self,
        config_fn: Option<Box<dyn FnMut(&[ConnPlacement]) + Send>>,
        cyclic_fn: Option<Box<dyn FnMut(&mut CyclicCtx) + Send>>,
    ) {
        self.callbacks.config_global = config_fn;
        self.callbacks.cyclic_global = cyclic_fn;
    }

    // ── Status ────────────────────────────────────────────────

    pub fn get_sercos_status(&self) -> SercosStatus {
        SercosStatus {
            phase: self.core.phase(),
            topology: self.core.topology.current(),
            ring_broken: self.core.ring_broken,
            cyclic_data_error: self.core.overruns.cyclic_data_error
                || self.core.conns.any_error(),
        }
    }

    /// Borrow the core read-only (counters, slave table, placements).
    pub fn core(&self) -> &MasterCore {
        &self.core
    }

    // ── Phase switching ───────────────────────────────────────

    /// Blocking phase switch toward `target`, retrying failed steps up
    /// to `retries` times within `timeout`.
    pub fn phase_switch(&mut self, target: Phase, retries: u32, timeout: Duration) -> Result<()> {
        self.switch_to(PhaseTarget::Phase(target), retries, timeout)
    }

    /// Phase switch with the extended targets (`Next`,
    /// `Cp2AfterParamsTransmit`).
    pub fn switch_to(
        &mut self,
        target: PhaseTarget,
        retries: u32,
        timeout: Duration,
    ) -> Result<()> {
        self.handler.request(&mut self.core, target, retries)?;
        self.pump_handler(timeout)
    }

    /// Hot-plug admission of a configured, currently absent slave.
    pub fn hot_plug(&mut self, retries: u32, timeout: Duration) -> Result<()> {
        self.handler
            .request_excursion(&mut self.core, Step::TransHp2Para, retries)?;
        match self.pump_handler(timeout) {
            Ok(()) => {
                if let Some(idx) = self.last_hotplugged() {
                    self.sink.emit(&MasterEvent::HotPlugged { slave: idx });
                }
                Ok(())
            }
            Err(e) => {
                let slave = match e {
                    Error::HotPlug(addr) => addr,
                    _ => 0,
                };
                self.sink.emit(&MasterEvent::HotPlugFailed { slave });
                Err(e)
            }
        }
    }

    /// Restore ring operation after the break healed.
    pub fn recover_ring(&mut self, retries: u32, timeout: Duration) -> Result<()> {
        self.handler
            .request_excursion(&mut self.core, Step::RingRecovery, retries)?;
        self.pump_handler(timeout)
    }

    /// Drive cycles and the handler until the request resolves.
    fn pump_handler(&mut self, timeout: Duration) -> Result<()> {
        let deadline = self.clock.now_ns() + timeout.as_nanos() as u64;
        loop {
            self.cycle();
            let before = self.core.phase();
            let done = self.handler.poll(&mut self.core)?;
            self.run_due_config_callbacks();
            let after = self.core.phase();
            if after != before {
                self.sink.emit(&MasterEvent::PhaseChanged {
                    from: before,
                    to: after,
                });
            }
            if done {
                return Ok(());
            }
            if self.clock.now_ns() >= deadline {
                warn!("phase switch timed out");
                self.handler.cancel(&mut self.core);
                return Err(PhaseError::Timeout.into());
            }
        }
    }

    fn run_due_config_callbacks(&mut self) {
        if !self.core.config_cb_due {
            return;
        }
        self.core.config_cb_due = false;
        if let Some(cb) = &mut self.callbacks.config_global {
            cb(&self.core.placements);
        }
        for (addr, cb) in &mut self.callbacks.config_device {
            if let Some(idx) = self.core.slave_by_address(*addr) {
                cb(idx, &self.core.placements);
            }
        }
    }

    fn last_hotplugged(&self) -> Option<u16> {
        self.core
            .slaves
            .iter()
            .filter(|s| s.hot_plug && s.active)
            .map(|s| s.index)
            .last()
    }

    // ── Cyclic operation ──────────────────────────────────────

    /// One Sercos cycle, paced by the clock port: waits for the next
    /// tick, runs prepare and start, and accounts the deadline.
    pub fn cycle(&mut self) {
        let cycle_time = u64::from(self.core.current_cycle_time());
        if self.next_tick_ns == 0 {
            self.next_tick_ns = self.clock.now_ns();
        }
        self.clock.wait_until(self.next_tick_ns);
        let started = self.clock.now_ns();
        self.next_tick_ns = started + cycle_time;

        cyclic::prepare(&mut self.core, started, self.sink.as_mut());
        cyclic::start(
            &mut self.core,
            &mut self.port,
            &mut self.callbacks,
            self.sink.as_mut(),
        );

        let missed = self.clock.now_ns() > started + cycle_time;
        if missed {
            warn!("cycle overrun at count {}", self.core.net.cycle_count);
            self.sink.emit(&MasterEvent::Overrun {
                consecutive: self.core.overruns.consecutive + 1,
            });
        }
        let accepted = self.core.params.accepted_tel_losses;
        if self.core.overruns.record(missed, accepted) {
            self.sink.emit(&MasterEvent::CyclicDataError { connection: u16::MAX });
        }
    }

    /// Run `n` cycles back to back (test and commissioning helper).
    pub fn run_cycles(&mut self, n: u64) {
        for _ in 0..n {
            self.cycle();
        }
    }

    /// Clear a tripped connection back to `Ready`.
    pub fn clear_connection_error(&mut self, connection: u16) -> bool {
        self.core.conns.clear_error(connection as usize)
    }

    // ── Cyclic data access ────────────────────────────────────

    /// Stable (offset, length) of a connection inside the cyclic MDT or
    /// AT buffer. Stable for the lifetime of the connection.
    pub fn device_data_region(
        &self,
        slave: u16,
        class: TelegramClass,
        conn_idx: u16,
    ) -> Result<(usize, usize)> {
        self.core
            .placements
            .iter()
            .find(|p| p.slave_idx == slave && p.conn_idx == conn_idx && p.class == class)
            .map(|p| (p.buffer_offset as usize, p.length as usize))
            .ok_or(Error::Parameter("no such connection"))
    }

    /// Writable MDT bytes of a connection (C-CON prefix included).
    pub fn mdt_data_mut(&mut self, slave: u16, conn_idx: u16) -> Result<&mut [u8]> {
        let (off, len) = self.device_data_region(slave, TelegramClass::Mdt, conn_idx)?;
        Ok(&mut self.core.app_mdt[off..off + len])
    }

    /// AT bytes of a connection, as of the last consumer pass.
    pub fn at_data(&self, slave: u16, conn_idx: u16) -> Result<&[u8]> {
        let (off, len) = self.device_data_region(slave, TelegramClass::At, conn_idx)?;
        Ok(&self.core.app_at[off..off + len])
    }

    /// Switch drive power for one slave (or [`ALL_DEVICES`]). CP4 only.
    pub fn device_power(&mut self, device: u16, on: bool) -> Result<()> {
        if self.core.phase() != Phase::Cp4 {
            return Err(Error::WrongPhase);
        }
        let word = if on { SLAVE_ENABLE } else { SLAVE_DISABLE };
        if device == ALL_DEVICES {
            for idx in 0..self.core.slave_count() {
                self.core.write_control_word(idx, word);
            }
            Ok(())
        } else if (device as usize) < self.core.slave_count() {
            self.core.write_control_word(device as usize, word);
            Ok(())
        } else {
            Err(Error::Parameter("device index out of range"))
        }
    }

    // ── Sercos time ───────────────────────────────────────────

    /// Begin disseminating Sercos time in MDT0. Only in CP3/CP4.
    pub fn activate_sercos_time(&mut self, seconds: u32, nanos: u32) -> Result<()> {
        if self.core.phase() < Phase::Cp3 {
            return Err(Error::WrongPhase);
        }
        self.core.clock.program_sercos_time(seconds, nanos);
        Ok(())
    }

    /// Current Sercos time. Only in CP3/CP4 after activation.
    pub fn read_sercos_time(&self) -> Result<(u32, u32)> {
        if self.core.phase() < Phase::Cp3 {
            return Err(Error::WrongPhase);
        }
        self.core
            .clock
            .sercos_time()
            .map(|t| (t.seconds, t.nanos))
            .ok_or(Error::Parameter("sercos time not activated"))
    }

    // ── Watchdog ──────────────────────────────────────────────

    /// Arm the communication watchdog (CP3/CP4).
    pub fn set_watchdog(&mut self, cycles: u32) -> Result<()> {
        if self.core.phase() < Phase::Cp3 {
            return Err(Error::WrongPhase);
        }
        self.core.watchdog.arm(cycles);
        Ok(())
    }

    pub fn disable_watchdog(&mut self) {
        self.core.watchdog.disarm();
    }

    // ── UC channel ────────────────────────────────────────────

    /// Queue a frame for transmission inside the next UC window.
    pub fn ucc_tx(&mut self, frame: &[u8]) -> Result<()> {
        if self.core.params.ucc_bandwidth_ns == 0 {
            return Err(Error::Parameter("no UC bandwidth configured"));
        }
        if self.core.ucc.tx.len() >= crate::context::UccQueues::DEPTH {
            return Err(Error::Parameter("UC tx queue full"));
        }
        self.core.ucc.tx.push_back(frame.to_vec());
        Ok(())
    }

    /// Oldest frame received through the UC window, if any.
    pub fn ucc_rx(&mut self) -> Option<Vec<u8>> {
        self.core.ucc.rx.pop_front()
    }

    // ── Service channel (single-threaded, pumping) ────────────

    /// Cloneable handle for blocking SVC access from other threads while
    /// this instance keeps cycling.
    pub fn svc_handle(&self) -> SvcHandle {
        SvcHandle::new(
            self.core.svc_mailbox.clone(),
            Duration::from_millis(u64::from(self.core.params.svc_busy_timeout_ms)),
        )
    }

    /// Blocking element read; pumps cycles until the slave answered.
    pub fn svc_read(
        &mut self,
        slave: u16,
        eidn: Eidn,
        element: SvcElement,
        max_len: usize,
    ) -> Result<Vec<u8>> {
        match self.svc_call(
            slave,
            SvcRequest {
                eidn,
                op: SvcOp::Read { element, max_len },
                cancel_in_flight: false,
                done: None,
            },
        )? {
            SvcReply::Data(data) => Ok(data),
            _ => Err(SvcError::Protocol.into()),
        }
    }

    /// Blocking element write.
    pub fn svc_write(
        &mut self,
        slave: u16,
        eidn: Eidn,
        element: SvcElement,
        data: &[u8],
    ) -> Result<()> {
        match self.svc_call(
            slave,
            SvcRequest {
                eidn,
                op: SvcOp::Write {
                    element,
                    data: data.to_vec(),
                },
                cancel_in_flight: false,
                done: None,
            },
        )? {
            SvcReply::Written => Ok(()),
            _ => Err(SvcError::Protocol.into()),
        }
    }

    /// Blocking procedure command.
    pub fn svc_command(&mut self, slave: u16, eidn: Eidn) -> Result<CommandOutcome> {
        match self.svc_call(
            slave,
            SvcRequest {
                eidn,
                op: SvcOp::Command,
                cancel_in_flight: false,
                done: None,
            },
        )? {
            SvcReply::Command(outcome) => Ok(outcome),
            _ => Err(SvcError::Protocol.into()),
        }
    }

    fn svc_call(&mut self, slave: u16, request: SvcRequest) -> Result<SvcReply> {
        if self.core.phase() < Phase::Cp2 {
            return Err(Error::WrongPhase);
        }
        let idx = slave as usize;
        if idx >= self.core.slave_count() {
            return Err(Error::Parameter("slave index out of range"));
        }
        self.core.svc.submit(idx, request).map_err(Error::Svc)?;

        // Generous pumping budget: the engine's own timeout fires first.
        let budget = u64::from(self.core.svc_cycle_budget()) + 16;
        for _ in 0..budget {
            self.cycle();
            if let Some(result) = self.core.svc.take_completion(idx) {
                return result.map_err(Error::Svc);
            }
        }
        Err(SvcError::Timeout.into())
    }

    // ── Connection list import/export ─────────────────────────

    /// Export the effective slave/connection configuration as a
    /// Sercos-list framed buffer.
    pub fn export_connections(&self) -> Vec<u8> {
        let source = if self.core.effective_configs.is_empty() {
            &self.core.slave_configs
        } else {
            &self.core.effective_configs
        };
        crate::bincfg::export(source)
    }

    /// Import a Sercos-list framed configuration. Only before CP1.
    pub fn import_connections(&mut self, bytes: &[u8]) -> Result<()> {
        let list = crate::bincfg::import(bytes)?;
        self.set_slave_config(list)
    }
}
