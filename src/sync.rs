//! Latest-value exchange between the policy thread and the control thread.
//!
//! The writer publishes whole values; the reader takes an `Arc` to the most
//! recent complete value. Both sides hold the lock only long enough to swap or
//! clone a pointer, so the control tick never waits on inference.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug)]
struct Slot<T> {
    value: Option<Arc<T>>,
    seq: u64,
}

/// Single-writer / single-reader cell holding the latest published value.
#[derive(Debug)]
pub struct LatestCell<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Default for LatestCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatestCell<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                seq: 0,
            }),
        }
    }

    /// Replace the current value. Returns the new sequence number.
    pub fn publish(&self, value: T) -> u64 {
        let value = Arc::new(value);
        let mut slot = self.slot.lock();
        slot.value = Some(value);
        slot.seq += 1;
        slot.seq
    }

    /// Latest complete value, if anything has been published.
    pub fn latest(&self) -> Option<Arc<T>> {
        self.slot.lock().value.clone()
    }

    pub fn seq(&self) -> u64 {
        self.slot.lock().seq
    }

    /// Drop the stored value; the sequence number keeps counting.
    pub fn clear(&self) {
        self.slot.lock().value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn empty_cell_has_no_value() {
        let cell: LatestCell<Vec<f32>> = LatestCell::new();
        assert!(cell.latest().is_none());
        assert_eq!(cell.seq(), 0);
    }

    #[test]
    fn latest_value_wins() {
        let cell = LatestCell::new();
        cell.publish(vec![1.0_f32]);
        let seq = cell.publish(vec![2.0_f32, 3.0]);
        assert_eq!(seq, 2);
        assert_eq!(cell.latest().unwrap().as_slice(), &[2.0, 3.0]);
        cell.clear();
        assert!(cell.latest().is_none());
        assert_eq!(cell.seq(), 2);
    }

    #[test]
    fn reader_never_sees_torn_vectors() {
        const WIDTH: usize = 12;
        const ITERS: u32 = 20_000;

        let cell = Arc::new(LatestCell::new());
        let writer = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                for i in 0..ITERS {
                    cell.publish(vec![i as f32; WIDTH]);
                }
            })
        };

        let mut last_seen = 0.0_f32;
        let mut reads = 0u32;
        while !writer.is_finished() || reads == 0 {
            if let Some(v) = cell.latest() {
                assert_eq!(v.len(), WIDTH);
                let first = v[0];
                assert!(v.iter().all(|x| *x == first), "mixed-iteration values");
                assert!(first >= last_seen, "values went backwards");
                last_seen = first;
            }
            reads += 1;
        }
        writer.join().unwrap();
        assert_eq!(cell.latest().unwrap()[0], (ITERS - 1) as f32);
    }
}
