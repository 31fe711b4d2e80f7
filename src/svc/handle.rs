//! Blocking service channel API.
//!
//! Callers run on their own threads and never touch the engine directly:
//! requests go into a mutex-guarded mailbox that the cyclic task drains at
//! its single prepare-point sampling, and each caller blocks on a
//! rendezvous channel until the engine delivers the completion or the busy
//! timeout expires.
//!
//! ```text
//! app thread ──▶ SvcHandle ──▶ mailbox ──(cycle prepare)──▶ SvcEngine
//!      ▲                                                        │
//!      └──────────────── completion channel ◀───────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel;
use log::debug;
use parking_lot::Mutex;

use super::engine::{SvcEngine, SvcOp, SvcReply, SvcRequest};
use super::{CommandOutcome, Eidn, SvcElement};
use crate::error::SvcError;

/// Requests the mailbox holds before `submit` pushes back.
const MAILBOX_DEPTH: usize = 32;

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SvcCallOpts {
    /// Abort an in-flight transaction on the same slave instead of
    /// waiting behind it.
    pub cancel_in_flight: bool,
}

/// The mailbox shared between blocking callers and the cyclic task.
pub struct SvcMailbox {
    inbox: Mutex<heapless::Deque<(u16, SvcRequest), MAILBOX_DEPTH>>,
}

impl Default for SvcMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl SvcMailbox {
    pub fn new() -> Self {
        Self {
            inbox: Mutex::new(heapless::Deque::new()),
        }
    }

    /// Drain every posted request into the engine. Called by the cyclic
    /// task at cycle prepare — the only point where the two sides meet.
    pub fn drain_into(&self, engine: &mut SvcEngine) {
        let mut inbox = self.inbox.lock();
        while let Some((slave, request)) = inbox.pop_front() {
            let done = request.done.clone();
            if let Err(e) = engine.submit(slave as usize, request) {
                debug!("svc: mailbox submit for slave {slave} rejected: {e}");
                if let Some(done) = done {
                    let _ = done.send(Err(e));
                }
            }
        }
    }

    fn post(&self, slave: u16, request: SvcRequest) -> Result<(), SvcError> {
        self.inbox
            .lock()
            .push_back((slave, request))
            .map_err(|_| SvcError::Busy)
    }
}

/// Cloneable blocking facade over the mailbox.
#[derive(Clone)]
pub struct SvcHandle {
    mailbox: Arc<SvcMailbox>,
    busy_timeout: Duration,
}

impl SvcHandle {
    pub fn new(mailbox: Arc<SvcMailbox>, busy_timeout: Duration) -> Self {
        Self {
            mailbox,
            busy_timeout,
        }
    }

    /// Blocking element read. Returns the payload with the list header
    /// stripped.
    pub fn read(
        &self,
        slave: u16,
        eidn: Eidn,
        element: SvcElement,
        max_len: usize,
        opts: SvcCallOpts,
    ) -> Result<Vec<u8>, SvcError> {
        match self.call(slave, eidn, SvcOp::Read { element, max_len }, opts)? {
            SvcReply::Data(data) => Ok(data),
            _ => Err(SvcError::Protocol),
        }
    }

    /// Blocking element write.
    pub fn write(
        &self,
        slave: u16,
        eidn: Eidn,
        element: SvcElement,
        data: &[u8],
        opts: SvcCallOpts,
    ) -> Result<(), SvcError> {
        match self.call(
            slave,
            eidn,
            SvcOp::Write {
                element,
                data: data.to_vec(),
            },
            opts,
        )? {
            SvcReply::Written => Ok(()),
            _ => Err(SvcError::Protocol),
        }
    }

    /// Blocking procedure command: confirms the proc-cmd attribute,
    /// activates, polls the acknowledgement, clears.
    pub fn command(
        &self,
        slave: u16,
        eidn: Eidn,
        opts: SvcCallOpts,
    ) -> Result<CommandOutcome, SvcError> {
        match self.call(slave, eidn, SvcOp::Command, opts)? {
            SvcReply::Command(outcome) => Ok(outcome),
            _ => Err(SvcError::Protocol),
        }
    }

    fn call(
        &self,
        slave: u16,
        eidn: Eidn,
        op: SvcOp,
        opts: SvcCallOpts,
    ) -> Result<SvcReply, SvcError> {
        let (tx, rx) = channel::bounded(1);
        self.mailbox.post(
            slave,
            SvcRequest {
                eidn,
                op,
                cancel_in_flight: opts.cancel_in_flight,
                done: Some(tx),
            },
        )?;
        match rx.recv_timeout(self.busy_timeout) {
            Ok(result) => result,
            Err(_) => Err(SvcError::Timeout),
        }
    }
}
