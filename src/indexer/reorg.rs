//! Chain reorganization detection over a bounded window of recent headers.
//!
//! The guard keeps the last `capacity` accepted headers in a fixed ring. Each new
//! header must link to the newest one by parent hash; when it does not, the guard
//! searches backwards for the fork point and drops everything above it.

use alloy_primitives::B256;
use tracing::warn;

use crate::models::datasets::blocks::BlockHeader;

/// What observing a header did to the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardTransition {
    /// Linked to the previous tail and was pushed.
    Appended,
    /// Same hash as the current tail; nothing changed.
    Duplicate,
    /// Did not link to the tail. `depth` buffered blocks were evicted (oldest
    /// first in `dropped`) before the new header was pushed.
    ForkDetected {
        depth: usize,
        dropped: Vec<BlockHeader>,
    },
}

#[derive(Debug, Clone)]
pub struct ReorgGuard {
    slots: Vec<Option<BlockHeader>>,
    // Index of the oldest buffered header
    head: usize,
    len: usize,
}

impl ReorgGuard {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot(&self, offset: usize) -> usize {
        (self.head + offset) % self.capacity()
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &BlockHeader> {
        (0..self.len).filter_map(move |i| self.slots[self.slot(i)].as_ref())
    }

    pub fn tail(&self) -> Option<&BlockHeader> {
        self.len
            .checked_sub(1)
            .and_then(|last| self.slots[self.slot(last)].as_ref())
    }

    pub fn oldest(&self) -> Option<&BlockHeader> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    /// The oldest header, but only once the window is full.
    pub fn confirmed(&self) -> Option<&BlockHeader> {
        if self.len == self.capacity() {
            self.oldest()
        } else {
            None
        }
    }

    pub fn observe(&mut self, header: BlockHeader) -> GuardTransition {
        let Some(tail) = self.tail() else {
            self.push(header);
            return GuardTransition::Appended;
        };

        if tail.hash == header.hash {
            return GuardTransition::Duplicate;
        }
        if tail.hash == header.parent_hash {
            self.push(header);
            return GuardTransition::Appended;
        }

        // Number of buffered blocks newer than the fork point
        let depth = self
            .iter()
            .collect::<Vec<_>>()
            .iter()
            .rev()
            .position(|h| h.hash == header.parent_hash)
            .unwrap_or(self.len);

        let mut dropped = Vec::with_capacity(depth);
        for _ in 0..depth {
            if let Some(evicted) = self.pop_newest() {
                dropped.push(evicted);
            }
        }
        dropped.reverse();

        warn!(
            "Reorg detected at block {}: parent {} not at tail, dropping {} buffered blocks",
            header.number, header.parent_hash, depth
        );

        self.push(header);
        GuardTransition::ForkDetected { depth, dropped }
    }

    /// Drop every header above `number`, newest first in the returned list.
    pub fn rewind_to(&mut self, number: u64) -> Vec<BlockHeader> {
        let mut dropped = Vec::new();
        while self.tail().is_some_and(|h| h.number > number) {
            if let Some(header) = self.pop_newest() {
                dropped.push(header);
            }
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.len = 0;
    }

    fn push(&mut self, header: BlockHeader) {
        if self.len == self.capacity() {
            // Overwrite the oldest
            self.slots[self.head] = Some(header);
            self.head = (self.head + 1) % self.capacity();
        } else {
            let idx = self.slot(self.len);
            self.slots[idx] = Some(header);
            self.len += 1;
        }
    }

    fn pop_newest(&mut self) -> Option<BlockHeader> {
        let last = self.len.checked_sub(1)?;
        let idx = self.slot(last);
        self.len = last;
        self.slots[idx].take()
    }
}
