//! Cyclic engine: per-cycle orchestration.
//!
//! Runs once per Sercos cycle from the real-time task, in strict order:
//!
//! ```text
//! prepare:  clear validity flags, forget Rx freshness, sample the
//!           SVC mailbox, feed the watchdog
//! start:    emit MDTs ─▶ UC channel ─▶ drain Rx ─▶ topology ─▶
//!           decode AT0 ─▶ consumer pass ─▶ cyclic callbacks ─▶
//!           producer pass ─▶ SVC word step ─▶ hot-plug field ─▶ advance
//! ```
//!
//! The cyclic path never fails: network conditions surface through
//! counters, flags, and events. Deadline accounting lives with the
//! caller, which knows the tick times; see [`OverrunTracker`]
//! (`crate::context`).

use log::{debug, trace, warn};

use crate::app::events::MasterEvent;
use crate::app::ports::{EventSink, PacketPort, Port};
use crate::config::TelegramClass;
use crate::context::MasterCore;
use crate::phase::Phase;
use crate::telegram::buffer::{rx_region, tx_region};
use crate::telegram::descriptor::ConnPlacement;
use crate::telegram::frame::{self, FrameError};
use crate::telegram::{SercosHeader, MST_LEN};

// ---------------------------------------------------------------------------
// Application callbacks
// ---------------------------------------------------------------------------

/// Registered application callbacks, owned by the service layer and
/// passed in per cycle so the core stays free of self-references.
#[derive(Default)]
pub struct Callbacks {
    /// Connection-configuration hook, fired once after CP2.
    pub config_global: Option<Box<dyn FnMut(&[ConnPlacement]) + Send>>,
    /// Per-device configuration hooks, by Sercos address.
    pub config_device: Vec<(u16, Box<dyn FnMut(u16, &[ConnPlacement]) + Send>)>,
    /// Global cyclic hook, fired first every CP4 cycle.
    pub cyclic_global: Option<Box<dyn FnMut(&mut CyclicCtx) + Send>>,
    /// Per-device cyclic hooks, by Sercos address.
    pub cyclic_device: Vec<(u16, Box<dyn FnMut(&mut CyclicCtx, u16) + Send>)>,
}

/// What a cyclic callback may touch: the application buffers, validity
/// flags, and read-only status of the running cycle.
pub struct CyclicCtx<'a> {
    core: &'a mut MasterCore,
}

impl CyclicCtx<'_> {
    pub fn phase(&self) -> Phase {
        self.core.phase()
    }

    pub fn cycle_count(&self) -> u64 {
        self.core.net.cycle_count
    }

    /// Gate the producer-ready bit for this slave's MDT connections in
    /// the current cycle.
    pub fn mark_valid(&mut self, slave: u16) {
        self.core.conns.mark_valid(slave as usize);
    }

    /// Writable MDT bytes of one connection (C-CON included).
    pub fn mdt_data(&mut self, slave: u16, conn_idx: u16) -> Option<&mut [u8]> {
        let p = find_placement(&self.core.placements, slave, conn_idx, TelegramClass::Mdt)?;
        let (start, len) = (p.buffer_offset as usize, p.length as usize);
        self.core.app_mdt.get_mut(start..start + len)
    }

    /// Read-only AT bytes of one connection, as of the last consumer pass.
    pub fn at_data(&self, slave: u16, conn_idx: u16) -> Option<&[u8]> {
        let p = find_placement(&self.core.placements, slave, conn_idx, TelegramClass::At)?;
        let (start, len) = (p.buffer_offset as usize, p.length as usize);
        self.core.app_at.get(start..start + len)
    }

    /// Last received device status word of a slave.
    pub fn s_dev(&self, slave: u16) -> Option<u16> {
        self.core.slaves.get(slave as usize).map(|s| s.s_dev)
    }

    pub fn sercos_time(&self) -> Option<crate::sercos_time::SercosTime> {
        self.core.clock.sercos_time()
    }
}

fn find_placement(
    placements: &[ConnPlacement],
    slave: u16,
    conn_idx: u16,
    class: TelegramClass,
) -> Option<ConnPlacement> {
    placements
        .iter()
        .find(|p| p.slave_idx == slave && p.conn_idx == conn_idx && p.class == class)
        .copied()
}

// ---------------------------------------------------------------------------
// Prepare
// ---------------------------------------------------------------------------

/// Cycle preparation: the single point where the cyclic task samples
/// state shared with other tasks.
pub fn prepare(core: &mut MasterCore, now_ns: u64, sink: &mut dyn EventSink) {
    core.conns.clear_valid();
    core.rx.clear_fresh();

    for (mask, dev) in core.active_mask.iter_mut().zip(core.slaves.iter()) {
        *mask = dev.active;
    }

    // SVC mailbox sampling point.
    let mailbox = core.svc_mailbox.clone();
    mailbox.drain_into(&mut core.svc);

    if core.watchdog.check(now_ns, core.current_cycle_time()) {
        warn!("communication watchdog expired");
        sink.emit(&MasterEvent::WatchdogExpired);
    }
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

/// The time-critical cycle body.
pub fn start(
    core: &mut MasterCore,
    port: &mut impl PacketPort,
    callbacks: &mut Callbacks,
    sink: &mut dyn EventSink,
) {
    // Connection passes and callbacks freeze during switch-back so the
    // disable control words stay on the wire untouched for the delay.
    let in_cp4 = core.phase() == Phase::Cp4 && !core.phase_state.switching_back;

    // 1. Emit this cycle's MDTs, then the AT seed frames the slaves fill
    // in transit — per port, with the channel bit marking the origin.
    // The scratch frame buffer lives in the core so the cyclic path
    // stays allocation-free.
    let mut frame_buf = std::mem::take(&mut core.frame_buf);
    if core.net.emit_telegrams {
        stamp_mdt0_fields(core);
        for class in [TelegramClass::Mdt, TelegramClass::At] {
            for slot in 0..core.net.active_slots as u8 {
                let len_payload = payload_len(core, class, slot);
                let region_idx = tx_region(class, slot);
                for p in Port::BOTH {
                    let header = SercosHeader {
                        class,
                        slot,
                        channel: p,
                        phase: core.net.announce.number(),
                        phase_switch: core.net.phase_switch_active,
                        cycle_count: (core.net.cycle_count & 0x0F) as u8,
                    };
                    let region = core.tx.region(region_idx);
                    let len = frame::compose(
                        &header,
                        core.net.src_mac,
                        &region[..len_payload],
                        &mut frame_buf,
                    );
                    if port.tx_packet(p, &frame_buf[..len]).is_err() {
                        trace!("tx on {p:?} with link down");
                    }
                }
            }
        }
    }

    // 2. UC channel: forward queued frames inside the window.
    if core.params.ucc_bandwidth_ns > 0 {
        let mut budget = u64::from(core.params.ucc_bandwidth_ns) / 80; // bytes
        while let Some(ucc_frame) = core.ucc.tx.front() {
            if ucc_frame.len() as u64 > budget {
                break;
            }
            budget -= ucc_frame.len() as u64;
            let ucc_frame = core.ucc.tx.pop_front().expect("checked front");
            for p in Port::BOTH {
                let _ = port.tx_packet(p, &ucc_frame);
            }
        }
    }

    // 3. Drain both ports.
    let mut traversed = false;
    for p in Port::BOTH {
        while let Some(len) = port.rx_packet(p, &mut frame_buf) {
            ingest_frame(core, p, &frame_buf[..len], &mut traversed);
        }
    }

    // 4. Topology.
    let sample = crate::topology::LinkSample {
        link_p1: port.link_up(Port::P1),
        link_p2: port.link_up(Port::P2),
        frames_traversed: traversed,
    };
    if let Some(change) = core.topology.observe(sample) {
        sink.emit(&MasterEvent::TopologyChanged(change.to));
        if in_cp4 {
            if change.ring_broken() {
                core.ring_broken = true;
                sink.emit(&MasterEvent::RingBroken);
            } else if change.ring_restored() {
                sink.emit(&MasterEvent::RingRestored);
            }
        }
    }

    // 5. Decode AT0: discovery in CP0, S-DEV and hot-plug beyond.
    decode_at0(core);

    // 6..8. Connection passes around the application callbacks.
    if in_cp4 {
        let cycle = core.net.cycle_count;
        {
            // Split borrow: the mask is read-only during the passes.
            let active = std::mem::take(&mut core.active_mask);
            core.conns
                .consumer_pass(&core.rx, &mut core.app_at, cycle, &active, |idx| {
                    sink.emit(&MasterEvent::CyclicDataError {
                        connection: idx as u16,
                    });
                });

            let mut ctx = CyclicCtx { core: &mut *core };
            if let Some(cb) = &mut callbacks.cyclic_global {
                cb(&mut ctx);
            }
            for (addr, cb) in &mut callbacks.cyclic_device {
                if let Some(idx) = ctx.core.slave_by_address(*addr) {
                    if ctx.core.slaves[idx as usize].active {
                        cb(&mut ctx, idx);
                    }
                }
            }

            core.conns
                .producer_pass(&core.app_mdt, &mut core.tx, cycle, &active);
            core.active_mask = active;
        }
    }

    // 9. Service channel: one word per slave. Live from CP1 up.
    if core.phase() >= Phase::Cp1 {
        step_svc(core);
    }

    // 10. Hot-plug field into the next MDT0.
    if in_cp4 {
        let hp = core.hp_tx;
        let off = core.layout.mdt_hotplug_offset();
        let region = core.tx.region_mut(tx_region(TelegramClass::Mdt, 0));
        region[off..off + 8].copy_from_slice(&hp);
    }

    // 11. Advance.
    core.frame_buf = frame_buf;
    core.net.cycle_count += 1;
    let cycle_time = core.current_cycle_time();
    core.clock.tick(cycle_time);
}

/// MST, Sercos time, and hot-plug fields of the outgoing MDT0.
fn stamp_mdt0_fields(core: &mut MasterCore) {
    let mst = {
        let mut mst = [0u8; MST_LEN];
        mst[0] = core.net.announce.number();
        mst[1] = u8::from(core.net.phase_switch_active);
        mst[2..6].copy_from_slice(&core.current_cycle_time().to_le_bytes());
        mst
    };
    let time_wire = core.clock.sercos_time().map(|t| t.to_wire());
    let ext_off = core.layout.ext_time_offset();

    let region = core.tx.region_mut(tx_region(TelegramClass::Mdt, 0));
    region[..MST_LEN].copy_from_slice(&mst);
    match time_wire {
        Some(bytes) => region[ext_off..ext_off + 8].copy_from_slice(&bytes),
        None => region[ext_off..ext_off + 8].fill(0),
    }
}

/// Bytes reserved in the CP0 AT0 seed for the slave address sequence.
const DISCOVERY_AREA_LEN: usize = 128;

/// Payload length of one outgoing telegram: the fixed areas plus the
/// packed connection extent. The CP0 AT0 seed instead reserves the
/// discovery area the slaves append their addresses to.
fn payload_len(core: &MasterCore, class: TelegramClass, slot: u8) -> usize {
    if class == TelegramClass::At && slot == 0 && core.net.announce == Phase::Cp0 {
        return DISCOVERY_AREA_LEN.min(core.layout.payload_limit);
    }
    let base = core.layout.conn_area_start(class, slot);
    let conn_extent = core
        .placements
        .iter()
        .filter(|p| p.class == class && p.slot == slot)
        .map(|p| p.telegram_offset as usize + p.length as usize)
        .max()
        .unwrap_or(0);
    base.max(conn_extent).min(core.layout.payload_limit)
}

/// Sort one received frame into the Rx image, the UC queues, or the
/// counters.
fn ingest_frame(core: &mut MasterCore, p: Port, bytes: &[u8], traversed: &mut bool) {
    match frame::parse(bytes) {
        Ok(telegram) => {
            core.clock.counters_mut(p).frames_ok += 1;
            let own = telegram.src_mac == core.net.src_mac;
            // A frame emitted on one port and received on the other went
            // around the whole ring; a line end loops it back onto the
            // emitting port.
            if own && telegram.header.channel != p {
                *traversed = true;
            }
            // Rx regions are keyed by the emitting channel: the P-channel
            // image always holds the chain-order (slave 0 first) data no
            // matter which port delivered it.
            let channel = telegram.header.channel;
            match telegram.header.class {
                TelegramClass::Mdt if own => {
                    let region_idx = rx_region(channel, TelegramClass::Mdt, telegram.header.slot);
                    copy_payload(core, region_idx, telegram.payload);
                }
                TelegramClass::Mdt => {}
                TelegramClass::At => {
                    let region_idx = rx_region(channel, TelegramClass::At, telegram.header.slot);
                    copy_payload(core, region_idx, telegram.payload);
                }
            }
        }
        Err(FrameError::NotSercos) => {
            // UC-channel traffic.
            if core.params.ucc_bandwidth_ns > 0 {
                if core.ucc.rx.len() < crate::context::UccQueues::DEPTH {
                    core.ucc.rx.push_back(bytes.to_vec());
                } else {
                    core.clock.counters_mut(p).discarded += 1;
                }
            } else {
                core.clock.counters_mut(p).ucc_violations += 1;
            }
        }
        Err(e) => {
            debug!("dropping malformed frame on {p:?}: {e:?}");
            core.clock.counters_mut(p).alignment_errors += 1;
        }
    }
}

fn copy_payload(core: &mut MasterCore, region_idx: usize, payload: &[u8]) {
    let region = core.rx.region_mut(region_idx);
    let len = payload.len().min(region.len());
    region[..len].copy_from_slice(&payload[..len]);
    core.rx.mark_fresh(region_idx, len);
}

/// Pull discovery, S-DEV words, and the hot-plug field out of the
/// freshest AT0. The slaves format AT0 according to the phase the
/// master announces, so the announcement — not the reported phase —
/// selects the decode.
fn decode_at0(core: &mut MasterCore) {
    // Freshest AT0 region, preferring the P channel (chain order).
    let region_idx = [Port::P1, Port::P2]
        .into_iter()
        .map(|p| rx_region(p, TelegramClass::At, 0))
        .find(|&idx| core.rx.fresh_len(idx).is_some());

    if core.net.announce == Phase::Cp0 {
        core.discovered.clear();
        if let Some(idx) = region_idx {
            let fresh = core.rx.fresh_len(idx).unwrap_or(0);
            let region = core.rx.region(idx);
            let mut off = 0;
            while off + 2 <= fresh {
                let addr = u16::from_le_bytes([region[off], region[off + 1]]);
                if addr == 0 {
                    break;
                }
                core.discovered.push(addr);
                off += 2;
            }
        }
        return;
    }

    match region_idx {
        Some(idx) => {
            let fresh = core.rx.fresh_len(idx).unwrap_or(0);
            for i in 0..core.slaves.len() {
                let off = core.layout.sdev_offset(i);
                if off + 2 <= fresh {
                    let region = core.rx.region(idx);
                    let word = u16::from_le_bytes([region[off], region[off + 1]]);
                    // Zero means the slave left its S-DEV slot untouched.
                    if word != 0 {
                        core.slaves[i].update_s_dev(word);
                        continue;
                    }
                }
                if core.slaves[i].discovered {
                    core.slaves[i].count_miss();
                }
            }

            if core.net.announce == Phase::Cp4 {
                let hp_off = core.layout.at_hotplug_offset();
                if hp_off + 8 <= fresh {
                    let region = core.rx.region(idx);
                    core.hp_rx.copy_from_slice(&region[hp_off..hp_off + 8]);
                }
            }
        }
        None => {
            for dev in &mut core.slaves {
                if dev.discovered {
                    dev.count_miss();
                }
            }
        }
    }
}

/// Advance the service channel engine by one word per slave: present
/// into the MDT0 write halves, consume the AT0 read halves.
fn step_svc(core: &mut MasterCore) {
    let at_region_idx = [Port::P1, Port::P2]
        .into_iter()
        .map(|p| rx_region(p, TelegramClass::At, 0))
        .find(|&idx| core.rx.fresh_len(idx).is_some());

    let slaves = core.svc.slave_count();
    for i in 0..slaves {
        let at_field: [u8; 4] = match at_region_idx {
            Some(idx) => {
                let off = core.layout.at_svc_offset(i);
                let fresh = core.rx.fresh_len(idx).unwrap_or(0);
                if off + 4 <= fresh {
                    let region = core.rx.region(idx);
                    [region[off], region[off + 1], region[off + 2], region[off + 3]]
                } else {
                    [0; 4]
                }
            }
            None => [0; 4],
        };

        let mdt_off = core.layout.mdt_svc_offset(i);
        let region = core.tx.region_mut(tx_region(TelegramClass::Mdt, 0));
        core.svc
            .step_slave(i, &mut region[mdt_off..mdt_off + 4], &at_field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::NullSink;
    use crate::config::CommParams;

    /// Port stub: loops nothing back, both links up.
    struct DeadPort;

    impl PacketPort for DeadPort {
        fn tx_packet(&mut self, _port: Port, _frame: &[u8]) -> Result<(), crate::app::ports::LinkDown> {
            Ok(())
        }
        fn rx_packet(&mut self, _port: Port, _buf: &mut [u8]) -> Option<usize> {
            None
        }
        fn link_up(&self, _port: Port) -> bool {
            true
        }
    }

    #[test]
    fn cycle_count_advances_and_wraps_on_the_wire() {
        let mut core = MasterCore::new(CommParams::default(), Vec::new()).unwrap();
        core.net.emit_telegrams = true;
        core.net.announce = Phase::Cp0;
        let mut cb = Callbacks::default();
        let mut sink = NullSink;
        let mut port = DeadPort;

        for _ in 0..20 {
            prepare(&mut core, 0, &mut sink);
            start(&mut core, &mut port, &mut cb, &mut sink);
        }
        assert_eq!(core.net.cycle_count, 20);
    }

    #[test]
    fn silent_network_counts_misses() {
        let mut core = MasterCore::new(CommParams::default(), Vec::new()).unwrap();
        core.adopt_discovery(&[3]).unwrap();
        core.net.emit_telegrams = true;
        core.net.announce = Phase::Cp1;
        core.phase_state.current = crate::phase::Step::SetCp1;

        let mut cb = Callbacks::default();
        let mut sink = NullSink;
        let mut port = DeadPort;
        for _ in 0..4 {
            prepare(&mut core, 0, &mut sink);
            start(&mut core, &mut port, &mut cb, &mut sink);
        }
        assert_eq!(core.slaves[0].miss_count, 4);
    }

    #[test]
    fn payload_covers_fixed_areas_even_without_connections() {
        let mut core = MasterCore::new(CommParams::default(), Vec::new()).unwrap();
        core.adopt_discovery(&[1, 2]).unwrap();
        // MST + ext time + hot-plug + 2 SVC fields.
        assert_eq!(payload_len(&core, TelegramClass::Mdt, 0), 6 + 8 + 8 + 2 * 4);
        assert_eq!(payload_len(&core, TelegramClass::Mdt, 1), 0);
        // S-DEV words + hot-plug + 2 SVC fields.
        assert_eq!(payload_len(&core, TelegramClass::At, 0), 4 + 8 + 2 * 4);
    }

    #[test]
    fn cp0_at_seed_reserves_the_discovery_area() {
        let mut core = MasterCore::new(CommParams::default(), Vec::new()).unwrap();
        core.net.announce = Phase::Cp0;
        assert_eq!(payload_len(&core, TelegramClass::At, 0), DISCOVERY_AREA_LEN);
    }
}
