//! Per-slave service channel container.
//!
//! A fixed-size structure replicated per slave:
//!
//! ```text
//! ┌────────────────────┬────────┬────────┬──────────────┬──────────────┐
//! │ control block 10 B │ wr ptr │ rd ptr │ write buffer │ read buffer  │
//! │ (5 words)          │  2 B   │  2 B   │   wr_len B   │   rd_len B   │
//! └────────────────────┴────────┴────────┴──────────────┴──────────────┘
//! ```
//!
//! The 14-byte overhead plus the two buffer lengths sum to exactly the
//! container length; each half holds at least 32 bytes and is 4-byte
//! aligned. The master composes the write half into MDT0 and reads the
//! read half out of AT0, four bytes per slave per cycle.

use crate::error::ConfigError;

/// Words in the control block.
pub const CTRL_WORDS: usize = 5;

/// Fixed overhead: control block plus the two buffer pointers.
pub const CONTAINER_OVERHEAD: usize = CTRL_WORDS * 2 + 4;

/// Minimum length of each buffer half.
pub const MIN_HALF_LEN: usize = 32;

// ── Control word 0 — master → slave ──────────────────────────

/// Master handshake toggle.
pub const CTRL_HS: u16 = 0x0001;
/// Last word of the element transfer.
pub const CTRL_END: u16 = 0x0002;
/// Element selector, bits 3..5.
pub const CTRL_ELEMENT_MASK: u16 = 0x0038;
pub const CTRL_ELEMENT_SHIFT: u16 = 3;
/// Write access (cleared = read).
pub const CTRL_WRITE: u16 = 0x0040;
/// Transfer active — the container is claimed by a transaction.
pub const CTRL_M_BUSY: u16 = 0x8000;

// ── Status word — slave → master ─────────────────────────────

/// Slave handshake echo.
pub const STAT_AHS: u16 = 0x0001;
/// Slave error bit; the data word then carries the error code.
pub const STAT_ERROR: u16 = 0x0004;
/// Slave service channel is alive; a silent (all-zero) field never acks.
pub const STAT_VALID: u16 = 0x4000;
/// Slave still processing the current word.
pub const STAT_BUSY: u16 = 0x8000;

/// Split a container length into write/read halves.
///
/// Both halves are rounded down to 4-byte boundaries; the write half
/// absorbs any remainder so the overhead invariant holds exactly. The
/// configuration grid keeps `container_len - 14` a multiple of 4, so for
/// every valid configuration the remainder is zero and both halves stay
/// aligned.
pub fn split_halves(container_len: usize) -> Result<(usize, usize), ConfigError> {
    let data = container_len
        .checked_sub(CONTAINER_OVERHEAD)
        .ok_or(ConfigError::Validation("svc container shorter than overhead"))?;
    let wr_base = (data / 2) & !3;
    let rd = (data - wr_base) & !3;
    let wr = data - rd;
    if wr < MIN_HALF_LEN || rd < MIN_HALF_LEN {
        return Err(ConfigError::Validation("svc container halves below 32 B"));
    }
    Ok((wr, rd))
}

/// One slave's service channel container.
#[derive(Debug, Clone)]
pub struct SvcContainer {
    /// Control block: word 0 is the master control word; word 1 mirrors
    /// the last slave status; word 2 counts slave errors; words 3..4 are
    /// end-of-buffer markers for the two halves.
    pub ctrl: [u16; CTRL_WORDS],
    wr_off: u16,
    rd_off: u16,
    wr_len: u16,
    rd_len: u16,
    data: Vec<u8>,
}

impl SvcContainer {
    pub fn new(container_len: usize) -> Result<Self, ConfigError> {
        let (wr, rd) = split_halves(container_len)?;
        Ok(Self {
            ctrl: [0; CTRL_WORDS],
            wr_off: CONTAINER_OVERHEAD as u16,
            rd_off: (CONTAINER_OVERHEAD + wr) as u16,
            wr_len: wr as u16,
            rd_len: rd as u16,
            data: vec![0; wr + rd],
        })
    }

    pub fn write_half(&self) -> &[u8] {
        let start = self.wr_off as usize - CONTAINER_OVERHEAD;
        &self.data[start..start + self.wr_len as usize]
    }

    pub fn write_half_mut(&mut self) -> &mut [u8] {
        let start = self.wr_off as usize - CONTAINER_OVERHEAD;
        &mut self.data[start..start + self.wr_len as usize]
    }

    pub fn read_half(&self) -> &[u8] {
        let start = self.rd_off as usize - CONTAINER_OVERHEAD;
        &self.data[start..start + self.rd_len as usize]
    }

    pub fn read_half_mut(&mut self) -> &mut [u8] {
        let start = self.rd_off as usize - CONTAINER_OVERHEAD;
        &mut self.data[start..start + self.rd_len as usize]
    }

    pub fn wr_len(&self) -> usize {
        self.wr_len as usize
    }

    pub fn rd_len(&self) -> usize {
        self.rd_len as usize
    }

    /// Total container length (overhead plus both halves).
    pub fn total_len(&self) -> usize {
        CONTAINER_OVERHEAD + self.data.len()
    }

    /// Count a slave error report in the control block.
    pub fn count_error(&mut self) {
        self.ctrl[2] = self.ctrl[2].saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_preserves_the_overhead_invariant() {
        for len in [78usize, 126, 198, 254] {
            let (wr, rd) = split_halves(len).unwrap();
            assert_eq!(wr + rd + CONTAINER_OVERHEAD, len, "len {len}");
            assert!(wr >= MIN_HALF_LEN && rd >= MIN_HALF_LEN);
            assert_eq!(wr % 4, 0, "len {len}");
            assert_eq!(rd % 4, 0, "len {len}");
        }
    }

    #[test]
    fn split_rejects_tiny_containers() {
        assert!(split_halves(40).is_err());
        assert!(split_halves(CONTAINER_OVERHEAD).is_err());
        assert!(split_halves(0).is_err());
    }

    #[test]
    fn default_container_geometry() {
        let c = SvcContainer::new(126).unwrap();
        assert_eq!(c.total_len(), 126);
        assert_eq!(c.wr_len() + c.rd_len(), 126 - CONTAINER_OVERHEAD);
        assert_eq!(c.wr_len() % 4, 0);
        assert_eq!(c.rd_len() % 4, 0);
        assert!(c.wr_len() >= MIN_HALF_LEN);
    }

    #[test]
    fn halves_do_not_alias() {
        let mut c = SvcContainer::new(126).unwrap();
        c.write_half_mut()[0] = 0x11;
        c.read_half_mut()[0] = 0x22;
        assert_eq!(c.write_half()[0], 0x11);
        assert_eq!(c.read_half()[0], 0x22);
    }

    #[test]
    fn error_counter_saturates() {
        let mut c = SvcContainer::new(126).unwrap();
        c.ctrl[2] = u16::MAX - 1;
        c.count_error();
        c.count_error();
        assert_eq!(c.ctrl[2], u16::MAX);
    }
}
