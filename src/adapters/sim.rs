//! In-memory network simulator.
//!
//! Plays the role the IP-core emulation plays for the real soft master: a
//! two-port Ethernet segment with behavioural slaves chained between the
//! ports. Telegrams transmitted on one port pass through every present
//! slave in chain order; an intact ring delivers them to the opposite
//! port, a line loops them back at the chain end:
//!
//! ```text
//!   P1 ──▶ slave 0 ──▶ slave 1 ──▶ … ──▶ slave n-1 ──▶ P2   (ring)
//!   P1 ──▶ slave 0 ──▶ … ──▶ slave k ─┐                      (line)
//!   P1 ◀───────────────────────────────┘
//! ```
//!
//! Slaves answer CP0 discovery, acknowledge phase switches through their
//! S-DEV words, run a full service channel parameter store, obey the
//! drive control word, produce their AT connections from the connection
//! table the master ships at CP3, and play the hot-plug admission game.
//!
//! Tests keep a [`SimHandle`] to reshape the network (break the ring,
//! plug a slave in) while the master owns the [`SimNetwork`] port.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::app::ports::{ClockPort, LinkDown, PacketPort, Port};
use crate::config::{CommVersion, TelegramClass};
use crate::context::{
    IDN_AT_START, IDN_COMM_VERSION, IDN_CONN_TABLE, IDN_CYCLE_TIME, IDN_DRIVE_STATUS,
    IDN_FEEDBACK_PROCESSING, IDN_JITTER, IDN_MASTER_JITTER, IDN_RESET_C1D, IDN_RING_DELAY,
    IDN_UCC_WINDOW,
};
use crate::hotplug::{
    decode_hp_field, encode_hp_field, HP_CTRL_GO_CP4, HP_CTRL_GO_HP1, HP_CTRL_GO_HP2,
    HP_CTRL_IDLE, HP_STAT_ACK, HP_STAT_ANNOUNCE,
};
use crate::sercos_time::SercosTime;
use crate::slave::{S_DEV_VALID, SLAVE_DISABLE, SLAVE_ENABLE};
use crate::svc::responder::{ParamDef, SvcResponder};
use crate::svc::{Eidn, ATTR_LEN_LIST, ATTR_LEN_LONG, ATTR_LEN_WORD};
use crate::telegram::{frame, PayloadLayout};

/// Queued frames a port holds before the oldest is dropped.
const PORT_QUEUE_DEPTH: usize = 32;

// ---------------------------------------------------------------------------
// Simulated slave
// ---------------------------------------------------------------------------

/// Tunable behaviour of one simulated slave.
#[derive(Debug, Clone)]
pub struct SimSlaveConfig {
    pub address: u16,
    /// Physically connected at startup.
    pub present: bool,
    /// Communication version the slave advertises.
    pub version: CommVersion,
}

impl SimSlaveConfig {
    pub fn present(address: u16) -> Self {
        Self {
            address,
            present: true,
            version: CommVersion::V1_3,
        }
    }

    pub fn absent(address: u16) -> Self {
        Self {
            address,
            present: false,
            version: CommVersion::V1_3,
        }
    }
}

/// One behavioural slave.
pub struct SimSlave {
    pub address: u16,
    /// Dense index = chain position; must match the master's table.
    index: usize,
    pub present: bool,
    phase: u8,
    responder: SvcResponder,
    /// Last service channel status/data produced for the AT read half.
    svc_reply: [u8; 4],
    pub drive_enabled: bool,
    /// Phase during which the last enable→disable transition arrived.
    pub last_disable_phase: Option<u8>,
    /// Feedback bytes the slave produces behind its AT status word.
    pub feedback: [u8; 4],
    /// Announcing itself for hot-plug admission.
    hp_announce: bool,
    /// Last acknowledged hot-plug control code.
    hp_ack: Option<u16>,
    /// Released into cyclic production (CP4, or hot-plug completed).
    cyclic_released: bool,
    /// Sercos time received in the extended MST field.
    pub ext_time: Option<SercosTime>,
}

impl SimSlave {
    fn new(cfg: &SimSlaveConfig, index: usize) -> Self {
        let mut responder = SvcResponder::new();
        install_standard_params(&mut responder, cfg);
        Self {
            address: cfg.address,
            index,
            present: cfg.present,
            phase: 0,
            responder,
            svc_reply: [0; 4],
            drive_enabled: false,
            last_disable_phase: None,
            feedback: [0; 4],
            hp_announce: false,
            hp_ack: None,
            cyclic_released: false,
            ext_time: None,
        }
    }

    /// Parse the connection table the master shipped at CP3.
    fn placements(&self) -> Vec<(TelegramClass, u8, usize, usize)> {
        let Some(def) = self.responder.param(Eidn::s(IDN_CONN_TABLE)) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut i = 0;
        while i + 6 <= def.value.len() {
            let class = if def.value[i] == 0 {
                TelegramClass::Mdt
            } else {
                TelegramClass::At
            };
            let slot = def.value[i + 1];
            let off = u16::from_le_bytes([def.value[i + 2], def.value[i + 3]]) as usize;
            let len = u16::from_le_bytes([def.value[i + 4], def.value[i + 5]]) as usize;
            out.push((class, slot, off, len));
            i += 6;
        }
        out
    }

    /// Consume a passing MDT.
    fn process_mdt(&mut self, slot: u8, phase: u8, payload: &[u8], layout: &PayloadLayout) {
        // The master's announcement is authoritative.
        if phase != self.phase {
            debug!("sim slave {}: adopting CP{phase}", self.address);
            self.phase = phase;
        }
        if self.phase < 4 {
            self.cyclic_released = false;
            self.drive_enabled = false;
        } else if !self.hp_announce && self.hp_ack.is_none() {
            self.cyclic_released = true;
        }

        if slot != 0 {
            return;
        }

        // Extended MST field: Sercos time.
        let ext = layout.ext_time_offset();
        if payload.len() >= ext + 8 {
            let bytes = &payload[ext..ext + 8];
            if bytes.iter().any(|&b| b != 0) {
                self.ext_time = Some(SercosTime::from_wire(bytes));
            }
        }

        // Hot-plug field.
        let hp_off = layout.mdt_hotplug_offset();
        if self.phase == 4 && payload.len() >= hp_off + 8 {
            let mut field = [0u8; 8];
            field.copy_from_slice(&payload[hp_off..hp_off + 8]);
            let (ctrl, addr, _) = decode_hp_field(&field);
            if ctrl == HP_CTRL_IDLE {
                self.hp_ack = None;
            } else if addr == self.address {
                match ctrl {
                    HP_CTRL_GO_HP1 | HP_CTRL_GO_HP2 => {
                        self.hp_ack = Some(ctrl);
                        self.hp_announce = false;
                    }
                    HP_CTRL_GO_CP4 => {
                        self.hp_ack = Some(ctrl);
                        self.cyclic_released = true;
                    }
                    _ => {}
                }
            }
        }

        // Service channel write half.
        if self.phase >= 1 {
            let off = layout.mdt_svc_offset(self.index);
            if payload.len() >= off + 4 {
                let mut reply = self.svc_reply;
                self.responder.exchange(&payload[off..off + 4], &mut reply);
                self.svc_reply = reply;
            }
        }

        // Drive control word out of our MDT connections.
        if self.phase == 4 && self.cyclic_released {
            for (class, c_slot, off, len) in self.placements() {
                if class != TelegramClass::Mdt || c_slot != slot || len < 4 {
                    continue;
                }
                if payload.len() < off + 4 {
                    continue;
                }
                let c_con = u16::from_le_bytes([payload[off], payload[off + 1]]);
                if c_con & crate::conn::C_CON_PROD_RDY == 0 {
                    continue;
                }
                let control = u16::from_le_bytes([payload[off + 2], payload[off + 3]]);
                match control {
                    SLAVE_ENABLE => self.drive_enabled = true,
                    SLAVE_DISABLE => {
                        if self.drive_enabled {
                            self.last_disable_phase = Some(self.phase);
                        }
                        self.drive_enabled = false;
                    }
                    _ => {}
                }
            }
        }
    }

    /// Fill a passing AT.
    fn process_at(&mut self, slot: u8, payload: &mut [u8], layout: &PayloadLayout) {
        // CP0: append our address to the discovery sequence.
        if self.phase == 0 {
            if slot != 0 {
                return;
            }
            let mut off = 0;
            while off + 2 <= payload.len() {
                let val = u16::from_le_bytes([payload[off], payload[off + 1]]);
                if val == 0 {
                    payload[off..off + 2].copy_from_slice(&self.address.to_le_bytes());
                    return;
                }
                off += 2;
            }
            return;
        }

        if slot == 0 {
            // Device status word.
            let sdev_off = layout.sdev_offset(self.index);
            if payload.len() >= sdev_off + 2 {
                let s_dev = S_DEV_VALID | u16::from(self.phase);
                payload[sdev_off..sdev_off + 2].copy_from_slice(&s_dev.to_le_bytes());
            }

            // Service channel read half.
            if self.phase >= 1 {
                let off = layout.at_svc_offset(self.index);
                if payload.len() >= off + 4 {
                    payload[off..off + 4].copy_from_slice(&self.svc_reply);
                }
            }

            // Hot-plug field: announcements and acknowledgements.
            let hp_off = layout.at_hotplug_offset();
            if self.phase == 4 && payload.len() >= hp_off + 8 {
                if let Some(code) = self.hp_ack {
                    let field = encode_hp_field(HP_STAT_ACK, self.address, u32::from(code));
                    payload[hp_off..hp_off + 8].copy_from_slice(&field);
                } else if self.hp_announce {
                    let field = encode_hp_field(HP_STAT_ANNOUNCE, self.address, 0);
                    payload[hp_off..hp_off + 8].copy_from_slice(&field);
                }
            }
        }

        // AT connections: C-CON, drive status, feedback bytes.
        if self.phase == 4 && self.cyclic_released {
            for (class, c_slot, off, len) in self.placements() {
                if class != TelegramClass::At || c_slot != slot || len < 4 {
                    continue;
                }
                if payload.len() < off + len {
                    continue;
                }
                payload[off..off + 2]
                    .copy_from_slice(&crate::conn::C_CON_PROD_RDY.to_le_bytes());
                let status: u16 = if self.drive_enabled { 0xC000 } else { 0x0000 };
                payload[off + 2..off + 4].copy_from_slice(&status.to_le_bytes());
                let data_len = (len - 4).min(self.feedback.len());
                payload[off + 4..off + 4 + data_len]
                    .copy_from_slice(&self.feedback[..data_len]);
            }
        }
    }
}

/// Standard parameter store of a simulated slave.
fn install_standard_params(responder: &mut SvcResponder, cfg: &SimSlaveConfig) {
    let long = |v: u32| ParamDef::value(ATTR_LEN_LONG, v.to_le_bytes().to_vec());
    responder.install(Eidn::s(IDN_COMM_VERSION), long(cfg.version.wire()));
    responder.install(Eidn::s(IDN_RING_DELAY), long(1_200));
    responder.install(Eidn::s(IDN_FEEDBACK_PROCESSING), long(25_000));
    responder.install(Eidn::s(IDN_JITTER), long(1_000));
    responder.install(Eidn::s(IDN_CYCLE_TIME), long(0));
    responder.install(Eidn::s(IDN_AT_START), long(0));
    responder.install(Eidn::s(IDN_MASTER_JITTER), long(0));
    responder.install(
        Eidn::s(IDN_UCC_WINDOW),
        ParamDef::value(ATTR_LEN_LIST, vec![0; 8]),
    );
    responder.install(
        Eidn::s(IDN_CONN_TABLE),
        ParamDef::value(ATTR_LEN_LIST, Vec::new()),
    );
    responder.install(Eidn::s(IDN_RESET_C1D), ParamDef::command(0));
    responder.install(
        Eidn::s(IDN_DRIVE_STATUS),
        ParamDef::value(ATTR_LEN_WORD, vec![0, 0]),
    );
    // S-0-0032: primary operation mode, a plain 4-byte parameter.
    responder.install(Eidn::s(32), long(0x0000_0003));
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

struct SimState {
    slaves: Vec<SimSlave>,
    layout: PayloadLayout,
    link: [bool; 2],
    /// Chain break after this slave index (both master links stay up).
    break_after: Option<usize>,
    rx: [VecDeque<Vec<u8>>; 2],
    /// Cycle counts of the P-channel MDT0s seen on the wire (bounded tap
    /// for sequencing assertions).
    mdt0_counts: VecDeque<u8>,
}

impl SimState {
    fn ring_intact(&self) -> bool {
        self.link[0] && self.link[1] && self.break_after.is_none()
    }

    /// Run one frame through the chain from `port` and deliver it.
    fn transport(&mut self, port: Port, bytes: &[u8]) {
        let mut buf = bytes.to_vec();

        if let Ok(parsed) = frame::parse(bytes) {
            let header = parsed.header;
            let payload_start = bytes.len() - parsed.payload.len();
            let layout = self.layout;

            if header.class == TelegramClass::Mdt
                && header.slot == 0
                && header.channel == Port::P1
            {
                if self.mdt0_counts.len() >= 64 {
                    self.mdt0_counts.pop_front();
                }
                self.mdt0_counts.push_back(header.cycle_count);
            }

            let order: Vec<usize> = self.chain_order(port);
            for idx in order {
                let slave = &mut self.slaves[idx];
                if !slave.present {
                    continue;
                }
                match header.class {
                    TelegramClass::Mdt => slave.process_mdt(
                        header.slot,
                        header.phase,
                        &buf[payload_start..],
                        &layout,
                    ),
                    TelegramClass::At => {
                        slave.process_at(header.slot, &mut buf[payload_start..], &layout);
                    }
                }
            }
        }

        let dest = if self.ring_intact() {
            port.other()
        } else {
            port // line: loopback at the chain end
        };
        if self.link[dest as usize] {
            let queue = &mut self.rx[dest as usize];
            if queue.len() >= PORT_QUEUE_DEPTH {
                queue.pop_front();
            }
            queue.push_back(buf);
        }
    }

    /// Slave indices a frame passes, in traversal order.
    fn chain_order(&self, from: Port) -> Vec<usize> {
        let n = self.slaves.len();
        match (from, self.break_after) {
            (Port::P1, None) => (0..n).collect(),
            (Port::P2, None) => (0..n).rev().collect(),
            (Port::P1, Some(k)) => (0..=k.min(n.saturating_sub(1))).collect(),
            (Port::P2, Some(k)) => ((k + 1).min(n)..n).rev().collect(),
        }
    }
}

/// The simulated network; implements [`PacketPort`] for the master.
pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
}

/// Cloneable test-side handle to reshape the network.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    /// Build a network; chain order is the configuration order and must
    /// match the master's slave indexing.
    pub fn new(slaves: &[SimSlaveConfig], mtu: u16) -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState {
            layout: PayloadLayout::new(slaves.len(), mtu),
            slaves: slaves
                .iter()
                .enumerate()
                .map(|(i, cfg)| SimSlave::new(cfg, i))
                .collect(),
            link: [true, true],
            break_after: None,
            rx: [VecDeque::new(), VecDeque::new()],
            mdt0_counts: VecDeque::new(),
        }));
        (
            Self {
                state: state.clone(),
            },
            SimHandle { state },
        )
    }
}

impl PacketPort for SimNetwork {
    fn tx_packet(&mut self, port: Port, frame_bytes: &[u8]) -> Result<(), LinkDown> {
        let mut state = self.state.lock();
        if !state.link[port as usize] {
            return Err(LinkDown);
        }
        state.transport(port, frame_bytes);
        Ok(())
    }

    fn rx_packet(&mut self, port: Port, buf: &mut [u8]) -> Option<usize> {
        let mut state = self.state.lock();
        let frame_bytes = state.rx[port as usize].pop_front()?;
        let len = frame_bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&frame_bytes[..len]);
        Some(len)
    }

    fn link_up(&self, port: Port) -> bool {
        self.state.lock().link[port as usize]
    }
}

impl SimHandle {
    /// Bring a master port link up or down.
    pub fn set_link(&self, port: Port, up: bool) {
        self.state.lock().link[port as usize] = up;
    }

    /// Break (or heal) the chain between slave `k` and `k + 1`.
    pub fn break_after(&self, k: Option<usize>) {
        self.state.lock().break_after = k;
    }

    /// Physically connect an absent slave and start its hot-plug
    /// announcement.
    pub fn plug_in(&self, address: u16) {
        let mut state = self.state.lock();
        for slave in &mut state.slaves {
            if slave.address == address {
                slave.present = true;
                slave.hp_announce = true;
                slave.phase = 4;
            }
        }
    }

    /// Inspect a slave by address.
    pub fn with_slave<R>(&self, address: u16, f: impl FnOnce(&mut SimSlave) -> R) -> Option<R> {
        let mut state = self.state.lock();
        state
            .slaves
            .iter_mut()
            .find(|s| s.address == address)
            .map(f)
    }

    /// Set the feedback bytes a slave produces in its AT connection.
    pub fn set_feedback(&self, address: u16, feedback: [u8; 4]) {
        self.with_slave(address, |s| s.feedback = feedback);
    }

    /// Cycle counts of the last P-channel MDT0s that crossed the wire.
    pub fn mdt0_cycle_counts(&self) -> Vec<u8> {
        self.state.lock().mdt0_counts.iter().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Virtual clock
// ---------------------------------------------------------------------------

/// Virtual monotonic clock: `wait_until` jumps time forward, so
/// simulated startups run in wall-clock microseconds.
#[derive(Default)]
pub struct SimClock {
    now_ns: std::cell::Cell<u64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClockPort for SimClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.get()
    }

    fn wait_until(&mut self, target_ns: u64) {
        if target_ns > self.now_ns.get() {
            self.now_ns.set(target_ns);
        }
    }
}
