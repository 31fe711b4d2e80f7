//! Full-stack startup scenarios over the simulated network.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sercos3::adapters::sim::{SimClock, SimHandle, SimNetwork, SimSlaveConfig};
use sercos3::app::events::MasterEvent;
use sercos3::app::ports::{EventSink, Port};
use sercos3::config::{CommParams, ConnConfig, SlaveConfig, TelegramClass};
use sercos3::conn::ConnState;
use sercos3::error::{ConfigError, Error};
use sercos3::slave::S_DEV_VALID;
use sercos3::topology::Topology;
use sercos3::{Master, Phase};

// ── Harness ───────────────────────────────────────────────────

#[derive(Clone, Default)]
struct RecordingSink {
    events: Arc<Mutex<Vec<MasterEvent>>>,
}

impl RecordingSink {
    fn collected(&self) -> Vec<MasterEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &MasterEvent) {
        self.events.lock().unwrap().push(*event);
    }
}

fn ring_master(
    addresses: &[u16],
    params: CommParams,
) -> (Master<SimNetwork, SimClock>, SimHandle, RecordingSink) {
    let slaves: Vec<SimSlaveConfig> = addresses
        .iter()
        .map(|&a| SimSlaveConfig::present(a))
        .collect();
    let (net, handle) = SimNetwork::new(&slaves, params.mtu);
    let mut master = Master::init(params, net, SimClock::new()).unwrap();
    let sink = RecordingSink::default();
    master.set_event_sink(Box::new(sink.clone()));
    (master, handle, sink)
}

fn to_cp4(master: &mut Master<SimNetwork, SimClock>) {
    master
        .phase_switch(Phase::Cp4, 3, Duration::from_secs(30))
        .expect("startup to CP4");
}

// ── Three-slave ring startup ──────────────────────────────────

#[test]
fn three_slave_ring_reaches_cp4() {
    let (mut master, _handle, sink) = ring_master(&[2, 5, 7], CommParams::default());
    to_cp4(&mut master);

    let status = master.get_sercos_status();
    assert_eq!(status.phase, Phase::Cp4);
    assert_eq!(status.topology, Topology::Ring);
    assert!(!status.cyclic_data_error);

    // Dense indices in discovery order, all active, S-DEV valid.
    let core = master.core();
    assert_eq!(core.slave_count(), 3);
    for (i, &addr) in [2u16, 5, 7].iter().enumerate() {
        let dev = &core.slaves[i];
        assert_eq!(dev.address, addr);
        assert_eq!(dev.index, i as u16);
        assert!(dev.active);
        assert!(dev.s_dev & S_DEV_VALID != 0, "slave {addr} S-DEV not valid");
    }

    // The phase ladder reported every boundary exactly once, upward.
    let phases: Vec<Phase> = sink
        .collected()
        .iter()
        .filter_map(|e| match e {
            MasterEvent::PhaseChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![Phase::Cp0, Phase::Cp1, Phase::Cp2, Phase::Cp3, Phase::Cp4]
    );
}

#[test]
fn reported_phase_is_monotone_during_startup() {
    let (mut master, _handle, sink) = ring_master(&[1, 2], CommParams::default());
    to_cp4(&mut master);

    let mut last = Phase::Nrt;
    for event in sink.collected() {
        if let MasterEvent::PhaseChanged { from, to } = event {
            assert_eq!(from, last);
            assert!(to > last, "phase regressed: {from:?} -> {to:?}");
            last = to;
        }
    }
}

// ── Cycle-time validation ─────────────────────────────────────

#[test]
fn off_grid_cycle_times_are_rejected_at_the_boundary() {
    let mk = |cp0: u32, cp34: u32| CommParams {
        cycle_time_cp0_ns: cp0,
        cycle_time_cp1_2_ns: 1_000_000,
        cycle_time_cp3_4_ns: cp34,
        ..CommParams::default()
    };

    // 500 µs sits on the 250 µs grid.
    let (net, _h) = SimNetwork::new(&[SimSlaveConfig::present(1)], 1500);
    assert!(Master::init(mk(1_000_000, 500_000), net, SimClock::new()).is_ok());

    // 300 µs and 301 µs do not.
    for bad in [300_000u32, 301_000] {
        let (net, _h) = SimNetwork::new(&[SimSlaveConfig::present(1)], 1500);
        let err = Master::init(mk(1_000_000, bad), net, SimClock::new()).unwrap_err();
        assert_eq!(err, Error::Config(ConfigError::CycleTimeInvalid), "{bad}");
    }

    // 31.25 µs is legal for CP3/CP4 but not for CP0.
    let (net, _h) = SimNetwork::new(&[SimSlaveConfig::present(1)], 1500);
    let err = Master::init(mk(31_250, 1_000_000), net, SimClock::new()).unwrap_err();
    assert_eq!(err, Error::Config(ConfigError::CycleTimeInvalid));
}

// ── Drive control-word write-back ─────────────────────────────

#[test]
fn control_word_write_back_sets_drive_status() {
    let (mut master, handle, _sink) = ring_master(&[4], CommParams::default());

    // Per-device cyclic callback: command the drive on and mark valid.
    master.set_device_callback(
        4,
        None,
        Some(Box::new(|ctx, idx| {
            if let Some(data) = ctx.mdt_data(idx, 0) {
                data[2..4].copy_from_slice(&0xE000u16.to_le_bytes());
            }
            ctx.mark_valid(idx);
        })),
    );

    to_cp4(&mut master);
    master.run_cycles(4);

    // The drive switched on and reports it in its AT status word.
    assert_eq!(handle.with_slave(4, |s| s.drive_enabled), Some(true));
    let at = master.at_data(0, 1).unwrap();
    let status = u16::from_le_bytes([at[2], at[3]]);
    assert_eq!(status & 0xC000, 0xC000, "bits 14|15 must be set");

    // And the S-DEV word carries the valid bit.
    assert!(master.core().slaves[0].s_dev & S_DEV_VALID != 0);
}

#[test]
fn producer_ready_follows_mark_valid() {
    let marking = Arc::new(Mutex::new(true));
    let gate = marking.clone();

    let (mut master, _handle, _sink) = ring_master(&[3], CommParams::default());
    master.set_global_callbacks(
        None,
        Some(Box::new(move |ctx| {
            if *gate.lock().unwrap() {
                ctx.mark_valid(0);
            }
        })),
    );
    to_cp4(&mut master);
    master.run_cycles(2);
    assert_eq!(
        master.core().conns.connections()[0].state,
        ConnState::Producing
    );

    // Stop marking: the producer withdraws.
    *marking.lock().unwrap() = false;
    master.run_cycles(2);
    assert_eq!(
        master.core().conns.connections()[0].state,
        ConnState::Stopping
    );
}

// ── Ring break in CP4 ─────────────────────────────────────────

#[test]
fn ring_break_degrades_to_line_without_connection_errors() {
    let (mut master, handle, sink) = ring_master(&[2, 5], CommParams::default());
    master.set_global_callbacks(
        None,
        Some(Box::new(|ctx| {
            ctx.mark_valid(0);
            ctx.mark_valid(1);
        })),
    );
    to_cp4(&mut master);
    master.run_cycles(2);
    assert_eq!(master.get_sercos_status().topology, Topology::Ring);

    handle.set_link(Port::P2, false);
    master.run_cycles(u64::from(master.core().params.accepted_tel_losses) + 2);

    let status = master.get_sercos_status();
    assert_eq!(status.topology, Topology::LineP1);
    assert!(status.ring_broken);

    let events = sink.collected();
    assert!(events.contains(&MasterEvent::TopologyChanged(Topology::LineP1)));
    assert!(events.contains(&MasterEvent::RingBroken));

    // The line still carries every connection.
    assert!(
        !master
            .core()
            .conns
            .connections()
            .iter()
            .any(|c| c.state == ConnState::Error),
        "no connection may trip on a clean ring break"
    );
}

#[test]
fn ring_recovery_clears_the_break_flag() {
    let (mut master, handle, sink) = ring_master(&[2, 5], CommParams::default());
    to_cp4(&mut master);

    handle.set_link(Port::P2, false);
    master.run_cycles(6);
    assert!(master.get_sercos_status().ring_broken);

    handle.set_link(Port::P2, true);
    master.run_cycles(6);
    master
        .recover_ring(1, Duration::from_secs(10))
        .expect("ring recovery");
    assert!(!master.get_sercos_status().ring_broken);
    assert_eq!(master.get_sercos_status().topology, Topology::Ring);
    assert!(sink.collected().contains(&MasterEvent::RingRestored));
}

// ── Switch-back ───────────────────────────────────────────────

#[test]
fn switch_back_disables_drives_before_leaving_cp4() {
    let (mut master, handle, _sink) = ring_master(&[6], CommParams::default());
    master.set_device_callback(
        6,
        None,
        Some(Box::new(|ctx, idx| {
            if let Some(data) = ctx.mdt_data(idx, 0) {
                data[2..4].copy_from_slice(&0xE000u16.to_le_bytes());
            }
            ctx.mark_valid(idx);
        })),
    );
    to_cp4(&mut master);
    master.run_cycles(4);
    assert_eq!(handle.with_slave(6, |s| s.drive_enabled), Some(true));

    master
        .phase_switch(Phase::Cp0, 1, Duration::from_secs(30))
        .expect("switch-back to CP0");
    assert_eq!(master.get_sercos_status().phase, Phase::Cp0);

    // The disable word reached the drive while the network was still in
    // CP4 — before the phase command went out.
    assert_eq!(handle.with_slave(6, |s| s.last_disable_phase), Some(Some(4)));
}

#[test]
fn switch_back_to_nrt_only_from_cp0() {
    let (mut master, _handle, _sink) = ring_master(&[1], CommParams::default());
    to_cp4(&mut master);

    let err = master
        .phase_switch(Phase::Nrt, 0, Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err, Error::Phase(_)));

    master
        .phase_switch(Phase::Cp0, 1, Duration::from_secs(30))
        .unwrap();
    master
        .phase_switch(Phase::Nrt, 1, Duration::from_secs(10))
        .unwrap();
    assert_eq!(master.get_sercos_status().phase, Phase::Nrt);
    master.close().unwrap();
}

// ── Missing device and retry behaviour ────────────────────────

#[test]
fn configured_slave_missing_fails_and_later_succeeds() {
    let params = CommParams {
        detect_slave_config: false,
        ..CommParams::default()
    };
    let explicit = vec![
        SlaveConfig {
            address: 2,
            fsp: None,
            hot_plug: false,
            connections: conn_pair(),
        },
        SlaveConfig {
            address: 9,
            fsp: None,
            hot_plug: false,
            connections: conn_pair(),
        },
    ];

    // Slave 9 absent: the switch must fail, and the phase stays put.
    let sim_cfg = [SimSlaveConfig::present(2), SimSlaveConfig::absent(9)];
    let (net, handle) = SimNetwork::new(&sim_cfg, params.mtu);
    let mut master = Master::init(params, net, SimClock::new()).unwrap();
    master.set_slave_config(explicit.clone()).unwrap();

    let err = master
        .phase_switch(Phase::Cp4, 1, Duration::from_secs(30))
        .unwrap_err();
    assert!(matches!(err, Error::Phase(_)), "{err}");
    assert!(master.get_sercos_status().phase < Phase::Cp1);

    // Plug the slave in; a fresh call reaches CP4 like a first attempt.
    handle.with_slave(9, |s| s.present = true);
    master
        .phase_switch(Phase::Cp4, 3, Duration::from_secs(30))
        .expect("retry after repair");
    assert_eq!(master.get_sercos_status().phase, Phase::Cp4);
    assert_eq!(master.core().slave_count(), 2);
}

fn conn_pair() -> Vec<ConnConfig> {
    vec![
        ConnConfig {
            class: TelegramClass::Mdt,
            slot: 0,
            length: 8,
            cycle_multiple: 1,
            accepted_losses: 3,
            idns: vec![135],
        },
        ConnConfig {
            class: TelegramClass::At,
            slot: 0,
            length: 8,
            cycle_multiple: 1,
            accepted_losses: 3,
            idns: vec![135],
        },
    ]
}

// ── Hot-plug admission ────────────────────────────────────────

#[test]
fn hot_plug_admits_a_late_slave() {
    let params = CommParams {
        detect_slave_config: false,
        ..CommParams::default()
    };
    let explicit = vec![
        SlaveConfig {
            address: 2,
            fsp: None,
            hot_plug: false,
            connections: conn_pair(),
        },
        SlaveConfig {
            address: 9,
            fsp: None,
            hot_plug: true,
            connections: conn_pair(),
        },
    ];
    let sim_cfg = [SimSlaveConfig::present(2), SimSlaveConfig::absent(9)];
    let (net, handle) = SimNetwork::new(&sim_cfg, params.mtu);
    let mut master = Master::init(params, net, SimClock::new()).unwrap();
    master.set_slave_config(explicit).unwrap();
    let sink = RecordingSink::default();
    master.set_event_sink(Box::new(sink.clone()));

    to_cp4(&mut master);
    assert!(!master.core().slaves[1].active);

    handle.plug_in(9);
    master
        .hot_plug(2, Duration::from_secs(10))
        .expect("hot-plug admission");
    assert!(master.core().slaves[1].active);
    assert!(sink.collected().contains(&MasterEvent::HotPlugged { slave: 1 }));

    // Its configured connections start producing within ten cycles.
    master.run_cycles(10);
    let at_conn = master
        .core()
        .conns
        .connections()
        .iter()
        .find(|c| c.placement.slave_idx == 1 && c.class() == TelegramClass::At)
        .expect("AT connection of the hot-plug slave");
    assert_eq!(at_conn.state, ConnState::Consuming);
}

// ── UC channel ────────────────────────────────────────────────

#[test]
fn ucc_frames_travel_the_ring_inside_the_window() {
    let params = CommParams {
        ucc_bandwidth_ns: 100_000,
        ..CommParams::default()
    };
    let (mut master, _handle, _sink) = ring_master(&[2], params);
    to_cp4(&mut master);

    // A plain IPv4-ish frame: goes out in the UC window, circles the
    // ring, and comes back in through the UC receive queue.
    let mut ucc_frame = vec![0u8; 64];
    ucc_frame[12] = 0x08; // EtherType 0x0800
    master.ucc_tx(&ucc_frame).unwrap();
    master.run_cycles(3);

    let received = master.ucc_rx().expect("UC frame must come back around");
    assert_eq!(received[12], 0x08);
}

#[test]
fn ucc_is_refused_without_bandwidth() {
    let (mut master, _handle, _sink) = ring_master(&[2], CommParams::default());
    assert!(master.ucc_tx(&[0u8; 32]).is_err());
}

// ── Sercos time ───────────────────────────────────────────────

#[test]
fn sercos_time_is_disseminated_once_activated() {
    let (mut master, handle, _sink) = ring_master(&[2], CommParams::default());

    assert!(master.activate_sercos_time(100, 0).is_err(), "not in CP3 yet");

    to_cp4(&mut master);
    master.activate_sercos_time(100, 0).unwrap();
    master.run_cycles(5);

    let (secs, _nanos) = master.read_sercos_time().unwrap();
    assert_eq!(secs, 100);
    let seen = handle.with_slave(2, |s| s.ext_time).flatten();
    assert!(seen.is_some(), "slave never saw the extended MST field");
    assert_eq!(seen.unwrap().seconds, 100);
}
