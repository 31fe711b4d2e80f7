//! Service channel transaction engine.
//!
//! Owns one transaction slot and one bounded request queue per slave.
//! The cyclic engine calls [`SvcEngine::step_slave`] once per slave per
//! cycle, moving at most one data word (2 bytes) across the wire:
//!
//! ```text
//! MDT0 field:  [ control u16 ][ data u16 ]   master → slave
//! AT0  field:  [ status  u16 ][ data u16 ]   slave  → master
//! ```
//!
//! Every transaction opens by writing element 1 (the addressed EIDN),
//! then transfers the requested element. Each element transfer is
//! length-prefixed with a 4-byte Sercos list header (actual length,
//! maximum length). The master presents one word per cycle together with
//! its handshake toggle; the slave echoes the toggle in `STAT_AHS` once
//! the word is consumed (write) or the reply word is in place (read).
//! `STAT_BUSY` holds progression, `STAT_ERROR` aborts with the code from
//! the data word, and a cleared `STAT_VALID` means nobody is answering.
//!
//! Between transfers the master leaves the field quiet (`CTRL_M_BUSY`
//! low) for one cycle so the slave side can frame transaction
//! boundaries — including after a cancelled transfer.

use log::{debug, info, warn};

use super::container::{
    SvcContainer, CTRL_ELEMENT_SHIFT, CTRL_END, CTRL_HS, CTRL_M_BUSY, CTRL_WRITE, STAT_AHS,
    STAT_BUSY, STAT_ERROR, STAT_VALID,
};
use super::{
    CommandOutcome, Eidn, SvcElement, ATTR_PROC_CMD, CMD_ACTIVATE, CMD_CLEAR, CMD_STATUS_BUSY,
    CMD_STATUS_ERROR, CMD_STATUS_FINISHED, CMD_STATUS_STOPPED,
};
use crate::error::SvcError;

/// Pending requests tolerated per slave before `submit` rejects.
const QUEUE_DEPTH: usize = 8;

// ---------------------------------------------------------------------------
// Requests and replies
// ---------------------------------------------------------------------------

/// What the caller asked for.
#[derive(Debug, Clone)]
pub enum SvcOp {
    Read { element: SvcElement, max_len: usize },
    Write { element: SvcElement, data: Vec<u8> },
    Command,
}

/// A queued service channel request.
#[derive(Debug, Clone)]
pub struct SvcRequest {
    pub eidn: Eidn,
    pub op: SvcOp,
    /// Abort an in-flight transaction on this slave instead of queueing.
    pub cancel_in_flight: bool,
    /// Completion hand-off for a blocking caller; `None` for poll-style
    /// callers (the phase handler).
    pub done: Option<crossbeam::channel::Sender<Result<SvcReply, SvcError>>>,
}

/// A completed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SvcReply {
    /// Read data (list header stripped).
    Data(Vec<u8>),
    /// Write acknowledged.
    Written,
    /// Procedure command ran to an outcome.
    Command(CommandOutcome),
}

/// Externally visible transaction state (one slot per slave).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcState {
    Idle,
    StartRequest,
    InProgress,
    DataValid,
    CmdActive,
    CmdStatusValid,
    CmdCleared,
    RequestError,
}

// ---------------------------------------------------------------------------
// Word-level element transfer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XferOp {
    Read,
    Write,
}

/// One element transfer in flight: header + payload words, one per cycle.
#[derive(Debug)]
struct ElementXfer {
    op: XferOp,
    element: SvcElement,
    /// Outgoing bytes (header + payload) for writes.
    out: Vec<u8>,
    /// Collected bytes (header + payload) for reads.
    collected: Vec<u8>,
    /// Next word index to transfer.
    word: usize,
    /// Word currently presented on the wire, awaiting the slave's echo.
    presented: bool,
    /// Total words, once known (immediately for writes, after the header
    /// for reads).
    total_words: Option<usize>,
    max_len: usize,
}

impl ElementXfer {
    fn read(element: SvcElement, max_len: usize) -> Self {
        Self {
            op: XferOp::Read,
            element,
            out: Vec::new(),
            collected: Vec::new(),
            word: 0,
            presented: false,
            total_words: None,
            max_len,
        }
    }

    fn write(element: SvcElement, payload: &[u8]) -> Self {
        let mut out = Vec::with_capacity(4 + payload.len() + 1);
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
        if out.len() % 2 != 0 {
            out.push(0);
        }
        let words = out.len() / 2;
        Self {
            op: XferOp::Write,
            element,
            out,
            collected: Vec::new(),
            word: 0,
            presented: false,
            total_words: Some(words),
            max_len: 0,
        }
    }

    fn is_last_word(&self) -> bool {
        self.total_words.is_some_and(|t| self.word + 1 >= t)
    }

    /// Payload bytes of a finished read (header stripped, trimmed to the
    /// actual length).
    fn take_payload(&mut self) -> Result<Vec<u8>, SvcError> {
        if self.collected.len() < 4 {
            return Err(SvcError::Protocol);
        }
        let actual = u16::from_le_bytes([self.collected[0], self.collected[1]]) as usize;
        if actual > self.max_len {
            return Err(SvcError::BufferTooSmall);
        }
        if self.collected.len() < 4 + actual {
            return Err(SvcError::Protocol);
        }
        Ok(self.collected[4..4 + actual].to_vec())
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Progression of one transaction through its element transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Element-1 write addressing the EIDN.
    SetIdn,
    /// The requested read or write element transfer.
    Transfer,
    /// Command: attribute read confirming the proc-cmd bit.
    CmdReadAttr,
    /// Command: activation-word write.
    CmdActivate,
    /// Command: status polling reads.
    CmdPollStatus,
    /// Command: clear-word write.
    CmdClear,
}

#[derive(Debug)]
struct Transaction {
    request: SvcRequest,
    state: SvcState,
    stage: Stage,
    xfer: ElementXfer,
    cmd_outcome: Option<CommandOutcome>,
    /// One quiet cycle before the first word, framing the transaction for
    /// the slave side.
    gap_pending: bool,
    /// Cycles consumed so far; trips the busy timeout.
    age_cycles: u32,
}

impl Transaction {
    fn new(request: SvcRequest) -> Self {
        let idn_bytes = request.eidn.raw().to_le_bytes();
        Self {
            request,
            state: SvcState::StartRequest,
            stage: Stage::SetIdn,
            xfer: ElementXfer::write(SvcElement::Idn, &idn_bytes),
            cmd_outcome: None,
            gap_pending: true,
            age_cycles: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct SvcSlot {
    container: SvcContainer,
    txn: Option<Transaction>,
    queue: heapless::Deque<SvcRequest, QUEUE_DEPTH>,
    /// Handshake value last presented to this slave; toggles per word and
    /// persists across transactions.
    hs: bool,
    /// Completion for poll-style callers.
    completion: Option<Result<SvcReply, SvcError>>,
}

/// The service channel engine: one slot per slave.
pub struct SvcEngine {
    slots: Vec<SvcSlot>,
    /// Transaction age limit, in cycles.
    max_cycles: u32,
}

impl SvcEngine {
    pub fn new(slaves: usize, container_len: usize, max_cycles: u32) -> crate::error::Result<Self> {
        let mut slots = Vec::with_capacity(slaves);
        for _ in 0..slaves {
            slots.push(SvcSlot {
                container: SvcContainer::new(container_len)?,
                txn: None,
                queue: heapless::Deque::new(),
                hs: false,
                completion: None,
            });
        }
        Ok(Self { slots, max_cycles })
    }

    pub fn slave_count(&self) -> usize {
        self.slots.len()
    }

    /// Current state of a slave's transaction slot.
    pub fn state(&self, slave: usize) -> SvcState {
        self.slots[slave]
            .txn
            .as_ref()
            .map_or(SvcState::Idle, |t| t.state)
    }

    /// True when neither a transaction nor queued work exists anywhere.
    pub fn all_idle(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.txn.is_none() && s.queue.is_empty())
    }

    /// Queue a request. Requests to one slave are served in submission
    /// order; `submit` rejects only when the queue is full. With
    /// `cancel_in_flight`, an active transaction is aborted first and its
    /// caller gets [`SvcError::Cancelled`].
    pub fn submit(&mut self, slave: usize, request: SvcRequest) -> Result<(), SvcError> {
        if slave >= self.slots.len() {
            return Err(SvcError::Protocol);
        }
        if request.cancel_in_flight {
            if let Some(txn) = self.slots[slave].txn.take() {
                info!("svc: cancelling in-flight transaction on slave {slave}");
                deliver(&mut self.slots[slave], txn, Err(SvcError::Cancelled));
            }
        }
        let slot = &mut self.slots[slave];
        slot.queue.push_back(request).map_err(|_| SvcError::Busy)
    }

    /// Take the completion of the most recently finished transaction on
    /// this slave (poll-style callers).
    pub fn take_completion(&mut self, slave: usize) -> Option<Result<SvcReply, SvcError>> {
        self.slots[slave].completion.take()
    }

    /// Abort everything (phase switch-back). In-flight and queued callers
    /// all see [`SvcError::Cancelled`].
    pub fn abort_all(&mut self) {
        for slave in 0..self.slots.len() {
            if let Some(txn) = self.slots[slave].txn.take() {
                deliver(&mut self.slots[slave], txn, Err(SvcError::Cancelled));
            }
            while let Some(req) = self.slots[slave].queue.pop_front() {
                if let Some(done) = req.done {
                    let _ = done.send(Err(SvcError::Cancelled));
                }
            }
        }
    }

    /// Advance one slave by at most one word. `mdt_field` is this slave's
    /// 4-byte SVC write half in the outgoing MDT0; `at_field` the 4-byte
    /// read half from the freshest received AT0.
    pub fn step_slave(&mut self, slave: usize, mdt_field: &mut [u8], at_field: &[u8]) {
        let slot = &mut self.slots[slave];

        // Pop the next queued request when the slot is free.
        if slot.txn.is_none() {
            if let Some(req) = slot.queue.pop_front() {
                debug!("svc: starting {} on slave {slave} ({})", kind(&req.op), req.eidn);
                slot.txn = Some(Transaction::new(req));
            } else {
                mdt_field[..4].fill(0);
                return;
            }
        }

        let mut txn = slot.txn.take().expect("transaction present");
        txn.age_cycles += 1;
        if txn.age_cycles > self.max_cycles {
            warn!("svc: busy timeout on slave {slave} ({})", txn.request.eidn);
            txn.state = SvcState::RequestError;
            mdt_field[..4].fill(0);
            deliver(slot, txn, Err(SvcError::Timeout));
            return;
        }

        // The framing gap: one quiet cycle before the first word.
        if txn.gap_pending {
            txn.gap_pending = false;
            mdt_field[..4].fill(0);
            slot.txn = Some(txn);
            return;
        }

        let status = u16::from_le_bytes([at_field[0], at_field[1]]);
        let data_in = u16::from_le_bytes([at_field[2], at_field[3]]);
        let alive = status & STAT_VALID != 0;

        // Slave error aborts the transaction; data word carries the code.
        if txn.xfer.presented && alive && status & STAT_ERROR != 0 {
            warn!(
                "svc: slave {slave} error 0x{data_in:04X} accessing {}",
                txn.request.eidn
            );
            slot.container.count_error();
            txn.state = SvcState::RequestError;
            mdt_field[..4].fill(0);
            deliver(slot, txn, Err(SvcError::Slave(data_in)));
            return;
        }

        if txn.xfer.presented {
            let acked =
                alive && (status & STAT_AHS != 0) == slot.hs && status & STAT_BUSY == 0;
            if !acked {
                // Keep the word on the wire until the slave answers.
                present(slot, &mut txn, mdt_field);
                slot.txn = Some(txn);
                return;
            }

            // Word crossed the wire.
            if txn.xfer.op == XferOp::Read {
                txn.xfer.collected.extend_from_slice(&data_in.to_le_bytes());
                if txn.xfer.total_words.is_none() && txn.xfer.collected.len() >= 4 {
                    let actual =
                        u16::from_le_bytes([txn.xfer.collected[0], txn.xfer.collected[1]])
                            as usize;
                    txn.xfer.total_words = Some(2 + actual.div_ceil(2));
                }
            }
            txn.xfer.word += 1;
            txn.xfer.presented = false;
            txn.state = progressed_state(&txn);

            if txn.xfer.total_words.is_some_and(|t| txn.xfer.word >= t) {
                self.finish_xfer(slave, txn, mdt_field);
                return;
            }
        } else {
            txn.state = progressed_state(&txn);
        }

        slot.hs = !slot.hs;
        present(slot, &mut txn, mdt_field);
        slot.txn = Some(txn);
    }

    /// An element transfer completed; resolve the transaction or chain the
    /// next stage. The field is left quiet this cycle so the slave side
    /// sees the transfer boundary.
    fn finish_xfer(&mut self, slave: usize, mut txn: Transaction, mdt_field: &mut [u8]) {
        let slot = &mut self.slots[slave];
        mdt_field[..4].fill(0);

        match txn.stage {
            Stage::SetIdn => {
                let next = match &txn.request.op {
                    SvcOp::Read { element, max_len } => {
                        txn.stage = Stage::Transfer;
                        ElementXfer::read(*element, *max_len)
                    }
                    SvcOp::Write { element, data } => {
                        txn.stage = Stage::Transfer;
                        ElementXfer::write(*element, data)
                    }
                    SvcOp::Command => {
                        txn.stage = Stage::CmdReadAttr;
                        ElementXfer::read(SvcElement::Attribute, 4)
                    }
                };
                txn.xfer = next;
                slot.txn = Some(txn);
            }
            Stage::Transfer => match txn.xfer.op {
                XferOp::Read => {
                    let result = txn.xfer.take_payload().map(SvcReply::Data);
                    txn.state = if result.is_ok() {
                        SvcState::DataValid
                    } else {
                        SvcState::RequestError
                    };
                    deliver(slot, txn, result);
                }
                XferOp::Write => {
                    txn.state = SvcState::DataValid;
                    deliver(slot, txn, Ok(SvcReply::Written));
                }
            },
            Stage::CmdReadAttr => {
                let attr = match txn.xfer.take_payload() {
                    Ok(bytes) if bytes.len() >= 4 => {
                        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
                    }
                    _ => {
                        txn.state = SvcState::RequestError;
                        deliver(slot, txn, Err(SvcError::Protocol));
                        return;
                    }
                };
                if attr & ATTR_PROC_CMD == 0 {
                    txn.state = SvcState::RequestError;
                    deliver(slot, txn, Err(SvcError::NotProcedureCommand));
                    return;
                }
                txn.stage = Stage::CmdActivate;
                txn.xfer = ElementXfer::write(SvcElement::Value, &CMD_ACTIVATE.to_le_bytes());
                slot.txn = Some(txn);
            }
            Stage::CmdActivate => {
                txn.state = SvcState::CmdActive;
                txn.stage = Stage::CmdPollStatus;
                txn.xfer = ElementXfer::read(SvcElement::Value, 2);
                slot.txn = Some(txn);
            }
            Stage::CmdPollStatus => {
                let status = match txn.xfer.take_payload() {
                    Ok(bytes) if bytes.len() >= 2 => u16::from_le_bytes([bytes[0], bytes[1]]),
                    _ => {
                        txn.state = SvcState::RequestError;
                        deliver(slot, txn, Err(SvcError::Protocol));
                        return;
                    }
                };
                match status {
                    CMD_STATUS_BUSY => {
                        // Still running — read the status again.
                        txn.xfer = ElementXfer::read(SvcElement::Value, 2);
                        slot.txn = Some(txn);
                    }
                    CMD_STATUS_FINISHED | CMD_STATUS_STOPPED | CMD_STATUS_ERROR => {
                        txn.state = SvcState::CmdStatusValid;
                        txn.cmd_outcome = Some(match status {
                            CMD_STATUS_FINISHED => CommandOutcome::Finished,
                            CMD_STATUS_STOPPED => CommandOutcome::Stopped,
                            _ => CommandOutcome::Error,
                        });
                        txn.stage = Stage::CmdClear;
                        txn.xfer =
                            ElementXfer::write(SvcElement::Value, &CMD_CLEAR.to_le_bytes());
                        slot.txn = Some(txn);
                    }
                    other => {
                        warn!("svc: unexpected command status 0x{other:04X}");
                        txn.state = SvcState::RequestError;
                        deliver(slot, txn, Err(SvcError::Protocol));
                    }
                }
            }
            Stage::CmdClear => {
                txn.state = SvcState::CmdCleared;
                let outcome = txn.cmd_outcome.unwrap_or(CommandOutcome::Error);
                deliver(slot, txn, Ok(SvcReply::Command(outcome)));
            }
        }
    }
}

/// State reported while words are moving.
fn progressed_state(txn: &Transaction) -> SvcState {
    match txn.stage {
        Stage::CmdActivate | Stage::CmdPollStatus => SvcState::CmdActive,
        _ => SvcState::InProgress,
    }
}

/// Present the current word of a transfer on the MDT field.
fn present(slot: &mut SvcSlot, txn: &mut Transaction, mdt_field: &mut [u8]) {
    let xfer = &txn.xfer;
    let mut ctrl = CTRL_M_BUSY | (xfer.element as u16) << CTRL_ELEMENT_SHIFT;
    if slot.hs {
        ctrl |= CTRL_HS;
    }
    if xfer.is_last_word() {
        ctrl |= CTRL_END;
    }
    let data = match xfer.op {
        XferOp::Write => {
            ctrl |= CTRL_WRITE;
            let i = xfer.word * 2;
            u16::from_le_bytes([xfer.out[i], xfer.out[i + 1]])
        }
        XferOp::Read => 0,
    };
    mdt_field[0..2].copy_from_slice(&ctrl.to_le_bytes());
    mdt_field[2..4].copy_from_slice(&data.to_le_bytes());
    txn.xfer.presented = true;

    // Mirror the presented control word into the container block.
    slot.container.ctrl[0] = ctrl;
}

/// Hand a finished transaction's result to its waiter.
fn deliver(slot: &mut SvcSlot, txn: Transaction, result: Result<SvcReply, SvcError>) {
    if let Some(done) = txn.request.done {
        // A dropped receiver means the blocking caller gave up already.
        let _ = done.send(result);
    } else {
        slot.completion = Some(result);
    }
}

fn kind(op: &SvcOp) -> &'static str {
    match op {
        SvcOp::Read { .. } => "read",
        SvcOp::Write { .. } => "write",
        SvcOp::Command => "command",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::responder::{ParamDef, SvcResponder};
    use crate::svc::{ATTR_LEN_LONG, ATTR_LEN_WORD};

    fn engine() -> SvcEngine {
        SvcEngine::new(2, 126, 10_000).unwrap()
    }

    fn responder() -> SvcResponder {
        let mut r = SvcResponder::new();
        r.install(
            Eidn::s(32),
            ParamDef::value(ATTR_LEN_LONG, vec![0x10, 0x20, 0x30, 0x40]),
        );
        r.install(Eidn::s(99), ParamDef::command(0));
        r.install(Eidn::s(100), ParamDef::value(ATTR_LEN_WORD, vec![0xAA, 0xBB]));
        r
    }

    /// Run cycles until the slave's slot completes, capped.
    fn run(
        eng: &mut SvcEngine,
        resp: &mut SvcResponder,
        slave: usize,
        cap: usize,
    ) -> Result<SvcReply, SvcError> {
        let mut mdt = [0u8; 4];
        let mut at = [0u8; 4];
        for _ in 0..cap {
            eng.step_slave(slave, &mut mdt, &at);
            resp.exchange(&mdt, &mut at);
            if let Some(result) = eng.take_completion(slave) {
                return result;
            }
        }
        panic!("transaction did not finish within {cap} cycles");
    }

    fn read_req(eidn: Eidn, max_len: usize) -> SvcRequest {
        SvcRequest {
            eidn,
            op: SvcOp::Read {
                element: SvcElement::Value,
                max_len,
            },
            cancel_in_flight: false,
            done: None,
        }
    }

    fn write_req(eidn: Eidn, data: Vec<u8>) -> SvcRequest {
        SvcRequest {
            eidn,
            op: SvcOp::Write {
                element: SvcElement::Value,
                data,
            },
            cancel_in_flight: false,
            done: None,
        }
    }

    #[test]
    fn read_returns_the_stored_value() {
        let mut eng = engine();
        let mut resp = responder();
        eng.submit(0, read_req(Eidn::s(32), 64)).unwrap();
        let reply = run(&mut eng, &mut resp, 0, 100).unwrap();
        assert_eq!(reply, SvcReply::Data(vec![0x10, 0x20, 0x30, 0x40]));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut eng = engine();
        let mut resp = responder();
        eng.submit(0, write_req(Eidn::s(32), vec![0xDE, 0xAD, 0xBE, 0xEF]))
            .unwrap();
        assert_eq!(run(&mut eng, &mut resp, 0, 100).unwrap(), SvcReply::Written);

        eng.submit(0, read_req(Eidn::s(32), 64)).unwrap();
        let reply = run(&mut eng, &mut resp, 0, 100).unwrap();
        assert_eq!(reply, SvcReply::Data(vec![0xDE, 0xAD, 0xBE, 0xEF]));
    }

    #[test]
    fn segmentation_cost_is_header_plus_word_count() {
        // One word crosses per cycle. A transaction costs:
        //   1 framing gap
        //   + element-1 write: 4 words + 1 boundary cycle
        //   + value write: (2 header + ⌈N/2⌉) words + 1 boundary cycle
        // = 9 + ⌈N/2⌉ cycles.
        let mut eng = engine();
        let mut resp = responder();
        let payload = vec![1, 2, 3, 4, 5, 6]; // N = 6
        eng.submit(0, write_req(Eidn::s(32), payload)).unwrap();

        let mut mdt = [0u8; 4];
        let mut at = [0u8; 4];
        let mut cycles = 0;
        loop {
            eng.step_slave(0, &mut mdt, &at);
            resp.exchange(&mdt, &mut at);
            cycles += 1;
            if eng.take_completion(0).is_some() {
                break;
            }
            assert!(cycles < 50, "runaway transfer");
        }
        assert_eq!(cycles, 9 + 3);
    }

    #[test]
    fn command_happy_path() {
        let mut eng = engine();
        let mut resp = responder();
        eng.submit(
            0,
            SvcRequest {
                eidn: Eidn::s(99),
                op: SvcOp::Command,
                cancel_in_flight: false,
                done: None,
            },
        )
        .unwrap();
        let reply = run(&mut eng, &mut resp, 0, 400).unwrap();
        assert_eq!(reply, SvcReply::Command(CommandOutcome::Finished));
    }

    #[test]
    fn command_with_busy_phase_finishes() {
        let mut eng = engine();
        let mut resp = SvcResponder::new();
        resp.install(Eidn::s(99), ParamDef::command(5));
        eng.submit(
            0,
            SvcRequest {
                eidn: Eidn::s(99),
                op: SvcOp::Command,
                cancel_in_flight: false,
                done: None,
            },
        )
        .unwrap();
        let reply = run(&mut eng, &mut resp, 0, 800).unwrap();
        assert_eq!(reply, SvcReply::Command(CommandOutcome::Finished));
    }

    #[test]
    fn command_on_plain_parameter_is_rejected() {
        let mut eng = engine();
        let mut resp = responder();
        eng.submit(
            0,
            SvcRequest {
                eidn: Eidn::s(100),
                op: SvcOp::Command,
                cancel_in_flight: false,
                done: None,
            },
        )
        .unwrap();
        let err = run(&mut eng, &mut resp, 0, 200).unwrap_err();
        assert_eq!(err, SvcError::NotProcedureCommand);
    }

    #[test]
    fn unknown_idn_reports_slave_error() {
        let mut eng = engine();
        let mut resp = responder();
        eng.submit(0, read_req(Eidn::s(4000), 16)).unwrap();
        let err = run(&mut eng, &mut resp, 0, 100).unwrap_err();
        assert!(matches!(err, SvcError::Slave(_)));
    }

    #[test]
    fn small_buffer_is_rejected() {
        let mut eng = engine();
        let mut resp = responder();
        eng.submit(0, read_req(Eidn::s(32), 2)).unwrap();
        let err = run(&mut eng, &mut resp, 0, 100).unwrap_err();
        assert_eq!(err, SvcError::BufferTooSmall);
    }

    #[test]
    fn requests_to_one_slave_complete_in_order() {
        let mut eng = engine();
        let mut resp = responder();
        eng.submit(0, write_req(Eidn::s(32), vec![0x01, 0x02, 0x03, 0x04]))
            .unwrap();
        eng.submit(0, read_req(Eidn::s(32), 64)).unwrap();

        // First completion must be the write, then the read returns what
        // the write installed.
        assert_eq!(run(&mut eng, &mut resp, 0, 100).unwrap(), SvcReply::Written);
        assert_eq!(
            run(&mut eng, &mut resp, 0, 100).unwrap(),
            SvcReply::Data(vec![0x01, 0x02, 0x03, 0x04])
        );
    }

    #[test]
    fn timeout_fires_when_slave_never_answers() {
        let mut eng = SvcEngine::new(1, 126, 8).unwrap();
        eng.submit(0, read_req(Eidn::s(32), 16)).unwrap();
        let mut mdt = [0u8; 4];
        let at = [0u8; 4]; // silent slave: STAT_VALID never set
        for _ in 0..20 {
            eng.step_slave(0, &mut mdt, &at);
            if let Some(result) = eng.take_completion(0) {
                assert_eq!(result.unwrap_err(), SvcError::Timeout);
                return;
            }
        }
        panic!("timeout never fired");
    }

    #[test]
    fn cancel_in_flight_preempts() {
        let mut eng = engine();
        let mut resp = responder();
        eng.submit(0, read_req(Eidn::s(32), 64)).unwrap();

        // Let it get under way, then preempt.
        let mut mdt = [0u8; 4];
        let mut at = [0u8; 4];
        for _ in 0..4 {
            eng.step_slave(0, &mut mdt, &at);
            resp.exchange(&mdt, &mut at);
        }

        let mut req = read_req(Eidn::s(100), 64);
        req.cancel_in_flight = true;
        eng.submit(0, req).unwrap();
        assert_eq!(eng.take_completion(0), Some(Err(SvcError::Cancelled)));

        let reply = run(&mut eng, &mut resp, 0, 100).unwrap();
        assert_eq!(reply, SvcReply::Data(vec![0xAA, 0xBB]));
    }

    #[test]
    fn state_reporting_follows_the_ladder() {
        let mut eng = engine();
        let mut resp = responder();
        assert_eq!(eng.state(0), SvcState::Idle);
        eng.submit(0, read_req(Eidn::s(32), 64)).unwrap();

        let mut mdt = [0u8; 4];
        let mut at = [0u8; 4];
        eng.step_slave(0, &mut mdt, &at); // gap cycle
        assert_eq!(eng.state(0), SvcState::StartRequest);
        resp.exchange(&mdt, &mut at);
        eng.step_slave(0, &mut mdt, &at);
        assert_eq!(eng.state(0), SvcState::InProgress);
    }
}
