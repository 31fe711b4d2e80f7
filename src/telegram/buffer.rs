//! Tx/Rx RAM images.
//!
//! The hardware IP core addresses its telegram RAM through a 16-entry
//! base-pointer list. The soft master keeps the same shape: one byte arena
//! per direction, partitioned into 16 equal regions, addressed either
//! through the list (`base_pointers`) or as discrete registers
//! (`base_pointer`). Both views read the same storage; a unit test below
//! proves them equivalent.
//!
//! Region map:
//!
//! ```text
//! Tx:  0..4   MDT0..MDT3 payload images
//!      4..8   AT0..AT3 seed images (filled by the slaves in transit)
//!      8..16  reserved
//! Rx:  0..4   P channel, AT0..AT3
//!      4..8   S channel, AT0..AT3
//!      8..12  P channel, MDT0..MDT3 (own telegrams coming back)
//!     12..16  S channel, MDT0..MDT3
//! ```
//!
//! Rx regions are keyed by the emitting channel (the port the master
//! sent the telegram from), so the P-channel image always carries the
//! chain-order data regardless of which port delivered the frame.

use crate::app::ports::Port;
use crate::config::TelegramClass;

/// Number of base-pointer entries, fixed by the register file shape.
pub const REGIONS: usize = 16;

/// One direction's telegram RAM: a byte arena split into [`REGIONS`]
/// equal regions. Allocated once at init, never resized.
pub struct BufferBank {
    arena: Vec<u8>,
    bases: [u32; REGIONS],
    region_len: usize,
    /// Bytes received into each region this cycle; `None` = nothing fresh.
    fresh: [Option<usize>; REGIONS],
}

impl BufferBank {
    pub fn new(region_len: usize) -> Self {
        let mut bases = [0u32; REGIONS];
        for (i, base) in bases.iter_mut().enumerate() {
            *base = (i * region_len) as u32;
        }
        Self {
            arena: vec![0; region_len * REGIONS],
            bases,
            region_len,
            fresh: [None; REGIONS],
        }
    }

    /// The base-pointer list (the active register form).
    pub fn base_pointers(&self) -> &[u32; REGIONS] {
        &self.bases
    }

    /// A single base pointer (the discrete-register form). Semantically
    /// identical to indexing `base_pointers()`.
    pub fn base_pointer(&self, region: usize) -> u32 {
        self.bases[region]
    }

    pub fn region_len(&self) -> usize {
        self.region_len
    }

    pub fn region(&self, region: usize) -> &[u8] {
        let base = self.bases[region] as usize;
        &self.arena[base..base + self.region_len]
    }

    pub fn region_mut(&mut self, region: usize) -> &mut [u8] {
        let base = self.bases[region] as usize;
        &mut self.arena[base..base + self.region_len]
    }

    /// Record a reception of `len` payload bytes into `region`.
    pub fn mark_fresh(&mut self, region: usize, len: usize) {
        self.fresh[region] = Some(len.min(self.region_len));
    }

    /// Fresh payload length for `region`, if anything arrived this cycle.
    pub fn fresh_len(&self, region: usize) -> Option<usize> {
        self.fresh[region]
    }

    /// Forget freshness at the start of a cycle. Region contents stay —
    /// consumers keep seeing last-valid data through a loss window.
    pub fn clear_fresh(&mut self) {
        self.fresh = [None; REGIONS];
    }
}

// ---------------------------------------------------------------------------
// Region index helpers
// ---------------------------------------------------------------------------

/// Tx region for a telegram class/slot.
pub fn tx_region(class: TelegramClass, slot: u8) -> usize {
    match class {
        TelegramClass::Mdt => slot as usize,
        TelegramClass::At => 4 + slot as usize,
    }
}

/// Rx region for a port/class/slot.
pub fn rx_region(port: Port, class: TelegramClass, slot: u8) -> usize {
    let port_base = match port {
        Port::P1 => 0,
        Port::P2 => 4,
    };
    match class {
        TelegramClass::At => port_base + slot as usize,
        TelegramClass::Mdt => 8 + port_base + slot as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_and_discrete_register_forms_agree() {
        let bank = BufferBank::new(256);
        let list = bank.base_pointers();
        for i in 0..REGIONS {
            assert_eq!(list[i], bank.base_pointer(i));
            assert_eq!(bank.base_pointer(i) as usize, i * 256);
        }
    }

    #[test]
    fn regions_do_not_alias() {
        let mut bank = BufferBank::new(64);
        bank.region_mut(3)[0] = 0xAA;
        bank.region_mut(4)[0] = 0xBB;
        assert_eq!(bank.region(3)[0], 0xAA);
        assert_eq!(bank.region(4)[0], 0xBB);
    }

    #[test]
    fn freshness_is_per_region_and_clearable() {
        let mut bank = BufferBank::new(64);
        bank.mark_fresh(2, 40);
        assert_eq!(bank.fresh_len(2), Some(40));
        assert_eq!(bank.fresh_len(3), None);
        bank.clear_fresh();
        assert_eq!(bank.fresh_len(2), None);
    }

    #[test]
    fn fresh_len_is_capped_at_region_len() {
        let mut bank = BufferBank::new(64);
        bank.mark_fresh(0, 1000);
        assert_eq!(bank.fresh_len(0), Some(64));
    }

    #[test]
    fn region_map_is_disjoint() {
        let mut seen = [false; REGIONS];
        for slot in 0..4u8 {
            for class in [TelegramClass::Mdt, TelegramClass::At] {
                let t = tx_region(class, slot);
                assert!(t < 8);
                for port in [Port::P1, Port::P2] {
                    let r = rx_region(port, class, slot);
                    assert!(!seen[r], "rx region {r} assigned twice");
                    seen[r] = true;
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }
}
