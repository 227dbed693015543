use std::collections::VecDeque;

use super::{Discipline, QueueEntry};
use crate::IfaceId;

/// Ordering of a [`SharedQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    /// The head of an interface is its oldest entry.
    Fifo,
    /// The head of an interface is its newest entry.
    Lifo,
    /// Entries are kept sorted by remaining TTL, lowest first, FIFO among equals.
    Edf,
}

/// One storage shared by all interfaces, bounded by the total entry count.
///
/// Entries are kept in arrival order (FIFO, LIFO) or TTL order (EDF); the head of an interface
/// is found by scanning for the first (or, for LIFO, last) entry queued on it.
#[derive(Debug)]
pub struct SharedQueue<P> {
    ordering: Ordering,
    capacity: usize,
    entries: VecDeque<QueueEntry<P>>,
}

impl<P> SharedQueue<P> {
    pub fn new(ordering: Ordering, capacity: usize) -> Self {
        Self { ordering, capacity, entries: VecDeque::with_capacity(capacity.min(1024)) }
    }

    /// Position of the entry that is served first on `iface`.
    fn head_of(&self, iface: IfaceId) -> Option<usize> {
        match self.ordering {
            Ordering::Fifo | Ordering::Edf => self.entries.iter().position(|e| e.iface == iface),
            Ordering::Lifo => self.entries.iter().rposition(|e| e.iface == iface),
        }
    }

    /// Position of the entry that is served last on `iface`, or of the overall tail if nothing
    /// is queued on `iface`.
    fn tail_of(&self, iface: IfaceId) -> Option<usize> {
        let own = match self.ordering {
            Ordering::Fifo | Ordering::Edf => self.entries.iter().rposition(|e| e.iface == iface),
            Ordering::Lifo => self.entries.iter().position(|e| e.iface == iface),
        };

        own.or_else(|| match self.ordering {
            Ordering::Fifo | Ordering::Edf => self.entries.len().checked_sub(1),
            Ordering::Lifo => (!self.entries.is_empty()).then_some(0),
        })
    }
}

impl<P: Send> Discipline<P> for SharedQueue<P> {
    fn push(&mut self, entry: QueueEntry<P>) -> Result<(), QueueEntry<P>> {
        if self.entries.len() >= self.capacity {
            return Err(entry);
        }

        match self.ordering {
            Ordering::Fifo | Ordering::Lifo => self.entries.push_back(entry),
            Ordering::Edf => {
                // Insert after every entry with a lower or equal TTL.
                let idx = self.entries.partition_point(|e| e.meta.ttl <= entry.meta.ttl);
                self.entries.insert(idx, entry);
            }
        }

        Ok(())
    }

    fn push_front(&mut self, entry: QueueEntry<P>) -> Option<QueueEntry<P>> {
        let evicted = if self.entries.len() >= self.capacity {
            self.tail_of(entry.iface).and_then(|idx| self.entries.remove(idx))
        } else {
            None
        };

        match self.ordering {
            Ordering::Fifo | Ordering::Edf => self.entries.push_front(entry),
            Ordering::Lifo => self.entries.push_back(entry),
        }

        evicted
    }

    fn pop(&mut self, iface: IfaceId) -> Option<QueueEntry<P>> {
        let idx = self.head_of(iface)?;
        self.entries.remove(idx)
    }

    fn peek(&self, iface: IfaceId) -> Option<&QueueEntry<P>> {
        self.head_of(iface).and_then(|idx| self.entries.get(idx))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn extract_if(&mut self, f: &mut dyn FnMut(&QueueEntry<P>) -> bool) -> Vec<QueueEntry<P>> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());

        for entry in self.entries.drain(..) {
            if f(&entry) {
                kept.push_back(entry);
            } else {
                removed.push(entry);
            }
        }

        self.entries = kept;
        removed
    }
}
