//! AF_PACKET adapter for two physical NICs (Linux, feature `linux-raw`).
//!
//! Binds one raw socket per interface, non-blocking, EtherType
//! unfiltered (the UC channel may carry anything). The monotonic clock
//! comes from `CLOCK_MONOTONIC`; `wait_until` sleeps with
//! `clock_nanosleep` at whatever precision the host grants. If the
//! process cannot obtain real-time scheduling the adapter logs the
//! degradation once and carries on.

use std::io;
use std::mem;
use std::os::fd::AsRawFd;

use log::{info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::app::ports::{ClockPort, LinkDown, PacketPort, Port};

/// One bound interface.
struct RawIf {
    socket: Socket,
    name: String,
}

/// Raw two-port packet adapter.
pub struct RawPorts {
    ports: [RawIf; 2],
}

impl RawPorts {
    /// Open both interfaces. Needs CAP_NET_RAW.
    pub fn open(if_p1: &str, if_p2: &str) -> io::Result<Self> {
        let p1 = open_if(if_p1)?;
        let p2 = open_if(if_p2)?;
        info!("raw ports open: P1={if_p1} P2={if_p2}");
        Ok(Self { ports: [p1, p2] })
    }
}

fn open_if(name: &str) -> io::Result<RawIf> {
    let proto = (libc::ETH_P_ALL as u16).to_be();
    let socket = Socket::new(
        Domain::PACKET,
        Type::RAW,
        Some(Protocol::from(i32::from(proto))),
    )?;
    socket.set_nonblocking(true)?;

    let ifindex = unsafe {
        let c_name = std::ffi::CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name"))?;
        libc::if_nametoindex(c_name.as_ptr()) as i32
    };
    if ifindex == 0 {
        return Err(io::Error::last_os_error());
    }

    // Bind to the interface so each port only sees its own wire.
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = proto;
    addr.sll_ifindex = ifindex;
    let rc = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            std::ptr::addr_of!(addr).cast(),
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(RawIf {
        socket,
        name: name.to_string(),
    })
}

impl RawIf {
    fn carrier(&self) -> bool {
        // IFF_RUNNING via SIOCGIFFLAGS.
        let mut req: libc::ifreq = unsafe { mem::zeroed() };
        for (dst, src) in req.ifr_name.iter_mut().zip(self.name.bytes()) {
            *dst = src as libc::c_char;
        }
        let rc = unsafe {
            libc::ioctl(
                self.socket.as_raw_fd(),
                libc::SIOCGIFFLAGS,
                std::ptr::addr_of_mut!(req),
            )
        };
        if rc != 0 {
            return false;
        }
        let flags = unsafe { req.ifr_ifru.ifru_flags };
        flags & libc::IFF_RUNNING as libc::c_short != 0
    }
}

impl PacketPort for RawPorts {
    fn tx_packet(&mut self, port: Port, frame: &[u8]) -> Result<(), LinkDown> {
        let interface = &self.ports[port as usize];
        if !interface.carrier() {
            return Err(LinkDown);
        }
        match interface.socket.send(frame) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                warn!("tx on {port:?} ({}) failed: {e}", interface.name);
                Err(LinkDown)
            }
        }
    }

    fn rx_packet(&mut self, port: Port, buf: &mut [u8]) -> Option<usize> {
        let interface = &self.ports[port as usize];
        // SAFETY: recv writes at most buf.len() bytes; MaybeUninit view
        // over an initialised buffer is sound.
        let uninit = unsafe {
            std::slice::from_raw_parts_mut(
                buf.as_mut_ptr().cast::<mem::MaybeUninit<u8>>(),
                buf.len(),
            )
        };
        match interface.socket.recv(uninit) {
            Ok(len) => Some(len),
            Err(_) => None,
        }
    }

    fn link_up(&self, port: Port) -> bool {
        self.ports[port as usize].carrier()
    }
}

// ---------------------------------------------------------------------------
// Monotonic clock
// ---------------------------------------------------------------------------

/// `CLOCK_MONOTONIC` based clock port.
pub struct MonotonicClock {
    degraded_logged: bool,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            degraded_logged: false,
        }
    }

    /// Try to raise the calling thread to SCHED_FIFO. The core runs
    /// without it, with a warning.
    pub fn request_rt_priority(&mut self, priority: i32) {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if rc != 0 && !self.degraded_logged {
            self.degraded_logged = true;
            warn!("real-time priority denied; cycle jitter will be degraded");
        }
    }
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

impl ClockPort for MonotonicClock {
    fn now_ns(&self) -> u64 {
        monotonic_ns()
    }

    fn wait_until(&mut self, target_ns: u64) {
        let ts = libc::timespec {
            tv_sec: (target_ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (target_ns % 1_000_000_000) as libc::c_long,
        };
        unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            );
        }
    }
}
