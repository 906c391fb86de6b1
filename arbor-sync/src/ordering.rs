//! Monotone priority queue: turns out-of-order arrivals into a gap-free,
//! strictly ascending stream.
//!
//! ```text
//! admit(3) ─▸ buffer [3]          next = 1
//! admit(1) ─▸ process 1           next = 2
//! admit(2) ─▸ process 2, 3        next = 4
//! admit(2) ─▸ OrderingViolation   (already processed)
//! ```
//!
//! The buffer is kept sorted by priority. Insertion uses binary search and
//! places an item after every buffered item of equal priority, so ties keep
//! their arrival order.

use std::collections::VecDeque;

/// A priority below the next expected one was admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Priority {priority} was already processed (next expected: {next_expected})")]
pub struct OrderingViolation {
    pub priority: u64,
    pub next_expected: u64,
}

/// Reordering buffer keyed by a numeric priority extracted from each item.
pub struct OrderingBuffer<T, F> {
    priority: F,
    next_expected: u64,
    pending: VecDeque<T>,
}

impl<T, F> OrderingBuffer<T, F>
where
    F: Fn(&T) -> u64,
{
    /// Create a buffer expecting `first_priority` as the first item.
    pub fn new(priority: F, first_priority: u64) -> Self {
        Self {
            priority,
            next_expected: first_priority,
            pending: VecDeque::new(),
        }
    }

    /// Admit one item and return every item that became ready, in order.
    ///
    /// A stale priority is rejected without touching the buffer.
    pub fn admit(&mut self, item: T) -> Result<Vec<T>, OrderingViolation> {
        let p = (self.priority)(&item);
        if p < self.next_expected {
            return Err(OrderingViolation {
                priority: p,
                next_expected: self.next_expected,
            });
        }

        if p > self.next_expected {
            let at = self.pending.partition_point(|buffered| (self.priority)(buffered) <= p);
            self.pending.insert(at, item);
            log::trace!("Buffered priority {p} (next expected {}, {} pending)", self.next_expected, self.pending.len());
            return Ok(Vec::new());
        }

        let mut ready = vec![item];
        self.next_expected += 1;
        while let Some(front) = self.pending.front() {
            let front_priority = (self.priority)(front);
            if front_priority < self.next_expected {
                // A duplicate that was buffered before its twin got processed.
                log::warn!("Discarding duplicate of already processed priority {front_priority}");
                self.pending.pop_front();
            } else if front_priority == self.next_expected {
                if let Some(next) = self.pending.pop_front() {
                    ready.push(next);
                }
                self.next_expected += 1;
            } else {
                break;
            }
        }
        Ok(ready)
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Number of items waiting for a gap to close.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Priorities currently buffered, in processing order.
    pub fn pending_priorities(&self) -> Vec<u64> {
        self.pending.iter().map(|item| (self.priority)(item)).collect()
    }
}

/// Callback form of [`OrderingBuffer`]: returns an `admit` function that
/// hands each item to `process` exactly once, in ascending priority order.
pub fn accept<T, F, P>(
    priority: F,
    first_priority: u64,
    mut process: P,
) -> impl FnMut(T) -> Result<(), OrderingViolation>
where
    F: Fn(&T) -> u64,
    P: FnMut(T),
{
    let mut buffer = OrderingBuffer::new(priority, first_priority);
    move |item| {
        for ready in buffer.admit(item)? {
            process(ready);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn identity(p: &u64) -> u64 {
        *p
    }

    /// Heap's algorithm; small n only.
    fn permutations(items: Vec<u64>) -> Vec<Vec<u64>> {
        fn generate(k: usize, items: &mut Vec<u64>, out: &mut Vec<Vec<u64>>) {
            if k <= 1 {
                out.push(items.clone());
                return;
            }
            generate(k - 1, items, out);
            for i in 0..k - 1 {
                if k % 2 == 0 {
                    items.swap(i, k - 1);
                } else {
                    items.swap(0, k - 1);
                }
                generate(k - 1, items, out);
            }
        }
        let mut items = items;
        let mut out = Vec::new();
        let n = items.len();
        generate(n, &mut items, &mut out);
        out
    }

    #[test]
    fn test_every_permutation_processed_in_order() {
        for first in [0u64, 1] {
            let expected: Vec<u64> = (first..first + 5).collect();
            let all = permutations(expected.clone());
            assert_eq!(all.len(), 120);

            for arrival in all {
                let processed = Rc::new(RefCell::new(Vec::new()));
                let sink = processed.clone();
                let mut admit = accept(identity, first, move |p| sink.borrow_mut().push(p));
                for p in &arrival {
                    admit(*p).unwrap();
                }
                assert_eq!(*processed.borrow(), expected, "arrival order {arrival:?}");
            }
        }
    }

    #[test]
    fn test_in_order_processed_immediately() {
        let mut buffer = OrderingBuffer::new(identity, 0);
        assert_eq!(buffer.admit(0).unwrap(), vec![0]);
        assert_eq!(buffer.admit(1).unwrap(), vec![1]);
        assert_eq!(buffer.next_expected(), 2);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_gap_holds_back_later_items() {
        let mut buffer = OrderingBuffer::new(identity, 1);
        assert!(buffer.admit(3).unwrap().is_empty());
        assert!(buffer.admit(4).unwrap().is_empty());
        assert_eq!(buffer.pending_priorities(), vec![3, 4]);

        assert_eq!(buffer.admit(1).unwrap(), vec![1]);
        assert_eq!(buffer.admit(2).unwrap(), vec![2, 3, 4]);
        assert_eq!(buffer.next_expected(), 5);
    }

    #[test]
    fn test_replay_rejected_without_processing() {
        let processed = Rc::new(RefCell::new(Vec::new()));
        let sink = processed.clone();
        let mut admit = accept(identity, 0, move |p| sink.borrow_mut().push(p));

        admit(0).unwrap();
        admit(1).unwrap();
        let err = admit(0).unwrap_err();
        assert_eq!(
            err,
            OrderingViolation {
                priority: 0,
                next_expected: 2
            }
        );
        assert_eq!(*processed.borrow(), vec![0, 1]);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut buffer = OrderingBuffer::new(|item: &(u64, &str)| item.0, 0);
        buffer.admit((2, "first")).unwrap();
        buffer.admit((3, "x")).unwrap();
        buffer.admit((2, "second")).unwrap();

        let ready = buffer.admit((0, "zero")).unwrap();
        assert_eq!(ready, vec![(0, "zero")]);
        let ready = buffer.admit((1, "one")).unwrap();
        // The earlier of the two equal priorities wins; its twin is dropped.
        assert_eq!(ready, vec![(1, "one"), (2, "first"), (3, "x")]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_keyed_by_extracted_priority() {
        #[derive(Debug, PartialEq)]
        struct Numbered {
            seq: u64,
            body: &'static str,
        }
        let mut buffer = OrderingBuffer::new(|n: &Numbered| n.seq, 10);
        assert!(buffer.admit(Numbered { seq: 11, body: "b" }).unwrap().is_empty());
        let ready = buffer.admit(Numbered { seq: 10, body: "a" }).unwrap();
        let bodies: Vec<&str> = ready.iter().map(|n| n.body).collect();
        assert_eq!(bodies, vec!["a", "b"]);
    }
}
