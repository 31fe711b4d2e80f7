//! Slave-side service channel responder.
//!
//! The reference implementation of the slave half of the word protocol,
//! used by the network simulator and the engine tests. It plays the role
//! the IP-core emulation plays for a real master: a parameter store with
//! element access, procedure command execution, and the AHS/BUSY/ERROR
//! handshake, advanced once per cycle through [`SvcResponder::exchange`].

use std::collections::HashMap;

use super::container::{
    CTRL_ELEMENT_MASK, CTRL_ELEMENT_SHIFT, CTRL_END, CTRL_HS, CTRL_M_BUSY, CTRL_WRITE, STAT_AHS,
    STAT_ERROR, STAT_VALID,
};
use super::{
    Eidn, SvcElement, ATTR_PROC_CMD, CMD_ACTIVATE, CMD_CLEAR, CMD_STATUS_BUSY, CMD_STATUS_FINISHED,
};

/// Sercos error code: addressed IDN does not exist.
pub const ERR_IDN_MISSING: u16 = 0x1001;
/// Sercos error code: element is write-protected.
pub const ERR_WRITE_PROTECTED: u16 = 0x7004;
/// Sercos error code: element selector invalid.
pub const ERR_BAD_ELEMENT: u16 = 0x7001;

/// One parameter in the slave's store.
#[derive(Debug, Clone)]
pub struct ParamDef {
    pub attr: u32,
    pub value: Vec<u8>,
    pub name: Vec<u8>,
    pub unit: Vec<u8>,
    pub min: Vec<u8>,
    pub max: Vec<u8>,
    /// Execution time of a procedure command, in cycles.
    pub busy_cycles: u16,
}

impl ParamDef {
    /// A plain data parameter.
    pub fn value(attr: u32, value: Vec<u8>) -> Self {
        Self {
            attr,
            value,
            name: Vec::new(),
            unit: Vec::new(),
            min: Vec::new(),
            max: Vec::new(),
            busy_cycles: 0,
        }
    }

    /// A procedure command that reports busy for `busy_cycles` cycles
    /// after activation, then finishes.
    pub fn command(busy_cycles: u16) -> Self {
        Self {
            attr: ATTR_PROC_CMD,
            value: vec![0, 0],
            name: Vec::new(),
            unit: Vec::new(),
            min: Vec::new(),
            max: Vec::new(),
            busy_cycles,
        }
    }
}

/// In-flight element transfer on the slave side.
#[derive(Debug)]
struct RespXfer {
    element: u8,
    write: bool,
    /// Bytes collected from the master (writes), including the header.
    collected: Vec<u8>,
    /// Bytes to serve to the master (reads), including the header.
    out: Vec<u8>,
    word: usize,
    /// Error latched for this transfer; echoed until the master backs off.
    error: Option<u16>,
}

/// The responder: parameter store plus handshake state.
pub struct SvcResponder {
    params: HashMap<u32, ParamDef>,
    /// EIDN addressed by the last element-1 write.
    addressed: Option<u32>,
    xfer: Option<RespXfer>,
    /// Handshake value of the last processed word.
    last_hs: bool,
    /// Status/data currently answered on the wire.
    status_out: u16,
    data_out: u16,
    /// Remaining busy cycles of an executing command, per EIDN.
    executing: HashMap<u32, u16>,
}

impl Default for SvcResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl SvcResponder {
    pub fn new() -> Self {
        Self {
            params: HashMap::new(),
            addressed: None,
            xfer: None,
            last_hs: false,
            status_out: STAT_VALID,
            data_out: 0,
            executing: HashMap::new(),
        }
    }

    /// Install a parameter.
    pub fn install(&mut self, eidn: Eidn, def: ParamDef) {
        self.params.insert(eidn.raw(), def);
    }

    /// Direct store access for behavioural checks in tests.
    pub fn param(&self, eidn: Eidn) -> Option<&ParamDef> {
        self.params.get(&eidn.raw())
    }

    /// Advance command execution and answer one cycle of the word
    /// protocol: consume the 4-byte MDT write half, produce the 4-byte
    /// AT read half.
    pub fn exchange(&mut self, mdt_field: &[u8], at_field: &mut [u8]) {
        for remaining in self.executing.values_mut() {
            *remaining = remaining.saturating_sub(1);
        }

        let ctrl = u16::from_le_bytes([mdt_field[0], mdt_field[1]]);
        let data = u16::from_le_bytes([mdt_field[2], mdt_field[3]]);

        if ctrl & CTRL_M_BUSY == 0 {
            // Quiet wire: transfer boundary. Keep the last AHS so the
            // master's next toggle reads as a fresh word.
            self.xfer = None;
            self.status_out = STAT_VALID | if self.last_hs { STAT_AHS } else { 0 };
            self.data_out = 0;
            self.write_reply(at_field);
            return;
        }

        let hs = ctrl & CTRL_HS != 0;
        let element = ((ctrl & CTRL_ELEMENT_MASK) >> CTRL_ELEMENT_SHIFT) as u8;
        let write = ctrl & CTRL_WRITE != 0;
        let end = ctrl & CTRL_END != 0;

        let new_word = self.xfer.is_none() || hs != self.last_hs;
        if !new_word {
            // Same word still on the wire — repeat the answer.
            self.write_reply(at_field);
            return;
        }

        if self.xfer.is_none() {
            self.xfer = Some(self.open_xfer(element, write));
        }

        // A latched transfer error is echoed for every further word.
        if let Some(code) = self.xfer.as_ref().and_then(|x| x.error) {
            self.last_hs = hs;
            self.status_out = STAT_VALID | STAT_ERROR | if hs { STAT_AHS } else { 0 };
            self.data_out = code;
            self.write_reply(at_field);
            return;
        }

        let mut xfer = self.xfer.take().expect("transfer open");
        self.data_out = 0;
        if xfer.write {
            xfer.collected.extend_from_slice(&data.to_le_bytes());
            if end {
                self.apply_write(&mut xfer);
            }
        } else {
            let i = xfer.word * 2;
            let lo = xfer.out.get(i).copied().unwrap_or(0);
            let hi = xfer.out.get(i + 1).copied().unwrap_or(0);
            self.data_out = u16::from_le_bytes([lo, hi]);
        }
        xfer.word += 1;

        self.last_hs = hs;
        self.status_out = STAT_VALID | if hs { STAT_AHS } else { 0 };
        if let Some(code) = xfer.error {
            self.status_out |= STAT_ERROR;
            self.data_out = code;
        }
        self.xfer = Some(xfer);
        self.write_reply(at_field);
    }

    // ── Internal ──────────────────────────────────────────────────

    fn write_reply(&self, at_field: &mut [u8]) {
        at_field[0..2].copy_from_slice(&self.status_out.to_le_bytes());
        at_field[2..4].copy_from_slice(&self.data_out.to_le_bytes());
    }

    /// Begin a transfer: resolve the addressed parameter and, for reads,
    /// prepare the framed reply.
    fn open_xfer(&mut self, element: u8, write: bool) -> RespXfer {
        let mut xfer = RespXfer {
            element,
            write,
            collected: Vec::new(),
            out: Vec::new(),
            word: 0,
            error: None,
        };

        if element == SvcElement::Idn as u8 {
            return xfer; // Addressing is always accepted.
        }

        let Some(raw) = self.addressed else {
            xfer.error = Some(ERR_IDN_MISSING);
            return xfer;
        };
        let Some(def) = self.params.get(&raw) else {
            xfer.error = Some(ERR_IDN_MISSING);
            return xfer;
        };

        if write {
            if element != SvcElement::Value as u8 {
                xfer.error = Some(ERR_WRITE_PROTECTED);
            }
            return xfer;
        }

        let body: Vec<u8> = match SvcElement::from_code(element) {
            Some(SvcElement::Name) => def.name.clone(),
            Some(SvcElement::Attribute) => def.attr.to_le_bytes().to_vec(),
            Some(SvcElement::Unit) => def.unit.clone(),
            Some(SvcElement::Minimum) => def.min.clone(),
            Some(SvcElement::Maximum) => def.max.clone(),
            Some(SvcElement::Value) => {
                if def.attr & ATTR_PROC_CMD != 0 {
                    self.command_status(raw).to_le_bytes().to_vec()
                } else {
                    def.value.clone()
                }
            }
            _ => {
                xfer.error = Some(ERR_BAD_ELEMENT);
                return xfer;
            }
        };

        xfer.out.extend_from_slice(&(body.len() as u16).to_le_bytes());
        xfer.out.extend_from_slice(&(body.len() as u16).to_le_bytes());
        xfer.out.extend_from_slice(&body);
        if xfer.out.len() % 2 != 0 {
            xfer.out.push(0);
        }
        xfer
    }

    /// A write transfer ended; apply it.
    fn apply_write(&mut self, xfer: &mut RespXfer) {
        if xfer.collected.len() < 4 {
            xfer.error = Some(ERR_BAD_ELEMENT);
            return;
        }
        let actual = u16::from_le_bytes([xfer.collected[0], xfer.collected[1]]) as usize;
        if xfer.collected.len() < 4 + actual {
            xfer.error = Some(ERR_BAD_ELEMENT);
            return;
        }
        let body = xfer.collected[4..4 + actual].to_vec();

        if xfer.element == SvcElement::Idn as u8 {
            if body.len() >= 4 {
                self.addressed =
                    Some(u32::from_le_bytes([body[0], body[1], body[2], body[3]]));
            } else {
                xfer.error = Some(ERR_BAD_ELEMENT);
            }
            return;
        }

        let Some(raw) = self.addressed else {
            xfer.error = Some(ERR_IDN_MISSING);
            return;
        };
        let Some(def) = self.params.get_mut(&raw) else {
            xfer.error = Some(ERR_IDN_MISSING);
            return;
        };

        if def.attr & ATTR_PROC_CMD != 0 && body.len() >= 2 {
            let word = u16::from_le_bytes([body[0], body[1]]);
            let busy = def.busy_cycles;
            match word {
                CMD_ACTIVATE => {
                    self.executing.insert(raw, busy);
                }
                CMD_CLEAR => {
                    self.executing.remove(&raw);
                }
                _ => {}
            }
        } else {
            def.value = body;
        }
    }

    /// Status word served when the value element of an executing command
    /// is read.
    fn command_status(&self, raw: u32) -> u16 {
        match self.executing.get(&raw) {
            Some(0) => CMD_STATUS_FINISHED,
            Some(_) => CMD_STATUS_BUSY,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_wire_resets_the_transfer() {
        let mut resp = SvcResponder::new();
        let mut at = [0u8; 4];

        // Present a word mid-transfer, then go quiet.
        let ctrl = CTRL_M_BUSY | CTRL_HS | (1 << CTRL_ELEMENT_SHIFT) | CTRL_WRITE;
        let mut mdt = [0u8; 4];
        mdt[0..2].copy_from_slice(&ctrl.to_le_bytes());
        resp.exchange(&mdt, &mut at);
        assert!(resp.xfer.is_some());

        resp.exchange(&[0u8; 4], &mut at);
        assert!(resp.xfer.is_none());
        let status = u16::from_le_bytes([at[0], at[1]]);
        assert_ne!(status & STAT_VALID, 0);
    }

    #[test]
    fn same_handshake_does_not_advance() {
        let mut resp = SvcResponder::new();
        let mut at = [0u8; 4];
        let ctrl = CTRL_M_BUSY | CTRL_HS | (1 << CTRL_ELEMENT_SHIFT) | CTRL_WRITE;
        let mut mdt = [0u8; 4];
        mdt[0..2].copy_from_slice(&ctrl.to_le_bytes());
        mdt[2..4].copy_from_slice(&4u16.to_le_bytes());

        resp.exchange(&mdt, &mut at);
        let word_after_first = resp.xfer.as_ref().unwrap().word;
        resp.exchange(&mdt, &mut at);
        assert_eq!(resp.xfer.as_ref().unwrap().word, word_after_first);
    }
}
