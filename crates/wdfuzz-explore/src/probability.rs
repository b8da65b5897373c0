//! Per-state mutation probabilities shared between the optimizer and the
//! channel workers.
//!
//! The optimizer is the only writer; it publishes a whole new vector at a
//! time. Workers take an `Arc` snapshot per packet and may see the previous
//! vector for one packet after a publish.
//!
//! For a state whose block starts at `offset`:
//! `individual[offset]` gates the packet, `individual[offset + 1]` gates each
//! field and `individual[offset + 2 + n]` arms layer `n`. Lookups never leave
//! the state's own block; a packet with more layers than the state reserved
//! slots for gets the defaults for the extra layers.

use std::sync::Arc;

use parking_lot::RwLock;
use wdfuzz_model::ProbabilityBlock;

/// Slot of the packet-level gate within a state's block.
pub const PACKET_SLOT: usize = 0;
/// Slot of the field-level gate within a state's block.
pub const FIELD_SLOT: usize = 1;
/// First per-layer slot within a state's block.
pub const LAYER_SLOT_BASE: usize = 2;

#[derive(Debug)]
pub struct ProbabilityTable {
    current: RwLock<Arc<Vec<f64>>>,
    optimizing: bool,
}

impl ProbabilityTable {
    /// A table of `len` slots, every one holding `fill`.
    pub fn new(len: usize, fill: f64, optimizing: bool) -> Self {
        Self {
            current: RwLock::new(Arc::new(vec![fill; len])),
            optimizing,
        }
    }

    /// Whether the values come from the optimizer rather than the defaults.
    pub fn is_optimizing(&self) -> bool {
        self.optimizing
    }

    pub fn snapshot(&self) -> Arc<Vec<f64>> {
        Arc::clone(&self.current.read())
    }

    pub fn publish(&self, individual: Vec<f64>) {
        *self.current.write() = Arc::new(individual);
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolved view of one state's block in a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct StateProbabilities<'a> {
    individual: &'a [f64],
    offset: usize,
    len: usize,
}

impl<'a> StateProbabilities<'a> {
    /// `None` when the state has no block in this vector (created after the
    /// optimizer was sized, or no state at all).
    pub fn resolve(individual: &'a [f64], block: Option<ProbabilityBlock>) -> Option<Self> {
        let block = block?;
        let offset = block.offset as usize;
        let len = block.len as usize;
        (len > PACKET_SLOT && offset < individual.len()).then_some(Self {
            individual,
            offset,
            len,
        })
    }

    fn slot(&self, slot: usize) -> Option<f64> {
        if slot >= self.len {
            return None;
        }
        self.individual.get(self.offset + slot).copied()
    }

    pub fn packet(&self) -> f64 {
        self.individual[self.offset + PACKET_SLOT]
    }

    pub fn field(&self) -> Option<f64> {
        self.slot(FIELD_SLOT)
    }

    pub fn layer(&self, layer_index: usize) -> Option<f64> {
        self.slot(LAYER_SLOT_BASE + layer_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_survives_publish() {
        let table = ProbabilityTable::new(3, 0.1, true);
        let before = table.snapshot();
        table.publish(vec![0.5, 0.6, 0.7]);
        assert_eq!(*before, vec![0.1; 3]);
        assert_eq!(*table.snapshot(), vec![0.5, 0.6, 0.7]);
    }

    fn block(offset: u32, len: u32) -> Option<ProbabilityBlock> {
        Some(ProbabilityBlock { offset, len })
    }

    #[test]
    fn test_resolve_slots() {
        let x = [0.0, 0.1, 0.2, 0.3, 0.4, 0.5];
        let s = StateProbabilities::resolve(&x, block(2, 4)).unwrap();
        assert_eq!(s.packet(), 0.2);
        assert_eq!(s.field(), Some(0.3));
        assert_eq!(s.layer(0), Some(0.4));
        assert_eq!(s.layer(1), Some(0.5));
        assert_eq!(s.layer(2), None);
    }

    #[test]
    fn test_layers_stay_inside_own_block() {
        // Two adjacent states of three slots each.
        let x = [0.1, 0.2, 0.3, 0.7, 0.8, 0.9];
        let first = StateProbabilities::resolve(&x, block(0, 3)).unwrap();
        assert_eq!(first.layer(0), Some(0.3));
        assert_eq!(first.layer(1), None);
        assert_eq!(first.layer(3), None);

        let second = StateProbabilities::resolve(&x, block(3, 3)).unwrap();
        assert_eq!(second.packet(), 0.7);
        assert_eq!(second.layer(0), Some(0.9));
        assert_eq!(second.layer(1), None);
    }

    #[test]
    fn test_resolve_out_of_range() {
        let x = [0.0, 0.1];
        assert!(StateProbabilities::resolve(&x, block(2, 3)).is_none());
        assert!(StateProbabilities::resolve(&x, block(0, 0)).is_none());
        assert!(StateProbabilities::resolve(&x, None).is_none());
        // A block running past the vector is cut at its end.
        let s = StateProbabilities::resolve(&x, block(1, 4)).unwrap();
        assert_eq!(s.packet(), 0.1);
        assert_eq!(s.field(), None);
    }
}
