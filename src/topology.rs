//! Topology monitor.
//!
//! Observes per-port link state once per cycle and classifies the network:
//!
//! ```text
//! link P1 │ link P2 │ frames traverse │ classification
//! ────────┼─────────┼─────────────────┼────────────────────────────
//!   no    │   no    │        –        │ NoLink
//!   yes   │   no    │        –        │ LineP1
//!   no    │   yes   │        –        │ LineP2
//!   yes   │   yes   │       yes       │ Ring
//!   yes   │   yes   │       no        │ DoubleLine, then DefectRing
//!         │         │                 │ once the miss counter trips
//! ```
//!
//! "Frames traverse" means a telegram emitted on one port arrived on the
//! other within the cycle. With both links up but nothing traversing, the
//! network reads as two separate lines until the counter reaches the
//! accepted-telegram-loss threshold; a ring with a broken middle then
//! reports `DefectRing`.

use log::info;

/// Network topology as seen from the master's two ports.
/// Discriminants match the status codes reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Topology {
    NoLink = 0,
    LineP1 = 1,
    LineP2 = 2,
    DoubleLine = 3,
    Ring = 4,
    DefectRing = 8,
}

/// One cycle's link observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSample {
    pub link_p1: bool,
    pub link_p2: bool,
    /// A telegram sent on one port came back in on the other this cycle.
    pub frames_traversed: bool,
}

/// Pure classification for one sample. `miss_exceeded` is the tie-break
/// input: both-links-up without traversal degrades to `DefectRing` only
/// after the monitor's counter has tripped.
pub fn classify(sample: LinkSample, miss_exceeded: bool) -> Topology {
    match (sample.link_p1, sample.link_p2) {
        (false, false) => Topology::NoLink,
        (true, false) => Topology::LineP1,
        (false, true) => Topology::LineP2,
        (true, true) => {
            if sample.frames_traversed {
                Topology::Ring
            } else if miss_exceeded {
                Topology::DefectRing
            } else {
                Topology::DoubleLine
            }
        }
    }
}

/// A classification change surfaced to the phase handler and, in CP4,
/// to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyChange {
    pub from: Topology,
    pub to: Topology,
}

impl TopologyChange {
    /// An intact ring degraded.
    pub fn ring_broken(&self) -> bool {
        self.from == Topology::Ring && self.to != Topology::Ring
    }

    /// The ring is whole again.
    pub fn ring_restored(&self) -> bool {
        self.from != Topology::Ring && self.to == Topology::Ring
    }
}

/// Per-cycle topology tracker.
pub struct TopologyMonitor {
    current: Topology,
    /// Cycles without traversal tolerated before `DefectRing`.
    miss_limit: u16,
    traverse_misses: u16,
}

impl TopologyMonitor {
    pub fn new(miss_limit: u16) -> Self {
        Self {
            current: Topology::NoLink,
            miss_limit,
            traverse_misses: 0,
        }
    }

    pub fn current(&self) -> Topology {
        self.current
    }

    /// Feed one cycle's observation. Returns the change, if any.
    pub fn observe(&mut self, sample: LinkSample) -> Option<TopologyChange> {
        if sample.link_p1 && sample.link_p2 && !sample.frames_traversed {
            self.traverse_misses = self.traverse_misses.saturating_add(1);
        } else {
            self.traverse_misses = 0;
        }

        let new = classify(sample, self.traverse_misses >= self.miss_limit);
        if new == self.current {
            return None;
        }

        let change = TopologyChange {
            from: self.current,
            to: new,
        };
        info!("topology change: {:?} -> {:?}", change.from, change.to);
        self.current = new;
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(p1: bool, p2: bool, traversed: bool) -> LinkSample {
        LinkSample {
            link_p1: p1,
            link_p2: p2,
            frames_traversed: traversed,
        }
    }

    #[test]
    fn classification_table() {
        // Every assignment of link-up/down and the traversal bit.
        for traversed in [false, true] {
            assert_eq!(classify(sample(false, false, traversed), false), Topology::NoLink);
            assert_eq!(classify(sample(true, false, traversed), false), Topology::LineP1);
            assert_eq!(classify(sample(false, true, traversed), false), Topology::LineP2);
        }
        assert_eq!(classify(sample(true, true, true), false), Topology::Ring);
        assert_eq!(classify(sample(true, true, false), false), Topology::DoubleLine);
        assert_eq!(classify(sample(true, true, false), true), Topology::DefectRing);
    }

    #[test]
    fn ring_break_degrades_to_line_and_reports_once() {
        let mut mon = TopologyMonitor::new(3);
        let change = mon.observe(sample(true, true, true)).unwrap();
        assert_eq!(change.to, Topology::Ring);

        let change = mon.observe(sample(true, false, false)).unwrap();
        assert_eq!(change.to, Topology::LineP1);
        assert!(change.ring_broken());

        // Stable line — no further event.
        assert!(mon.observe(sample(true, false, false)).is_none());
    }

    #[test]
    fn missing_traversal_trips_defect_ring_after_limit() {
        let mut mon = TopologyMonitor::new(3);
        mon.observe(sample(true, true, true));

        // Two cycles of silence: still reads as a double line.
        let change = mon.observe(sample(true, true, false)).unwrap();
        assert_eq!(change.to, Topology::DoubleLine);
        assert!(mon.observe(sample(true, true, false)).is_none());

        // Third cycle trips the counter.
        let change = mon.observe(sample(true, true, false)).unwrap();
        assert_eq!(change.to, Topology::DefectRing);
    }

    #[test]
    fn traversal_resets_the_miss_counter() {
        let mut mon = TopologyMonitor::new(2);
        mon.observe(sample(true, true, false));
        mon.observe(sample(true, true, true)); // resets
        let change = mon.observe(sample(true, true, false));
        assert_eq!(change.map(|c| c.to), Some(Topology::DoubleLine));
    }

    #[test]
    fn ring_restored_is_detected() {
        let mut mon = TopologyMonitor::new(3);
        mon.observe(sample(true, true, true));
        mon.observe(sample(true, false, false));
        let change = mon.observe(sample(true, true, true)).unwrap();
        assert!(change.ring_restored());
    }
}
