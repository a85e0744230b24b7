//! Reassembly of out-of-order results by sequence number.

use std::collections::BTreeMap;

/// Holds results until every earlier sequence number has been released.
#[derive(Debug)]
pub(crate) struct SequenceBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> SequenceBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Accepts `item` and returns everything that is now in order.
    pub(crate) fn push(&mut self, seq: u64, item: T) -> Vec<T> {
        if seq < self.next {
            return Vec::new();
        }
        self.pending.insert(seq, item);

        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }

    /// Number of results waiting for an earlier one.
    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Releases results in sequence order or as they arrive.
#[derive(Debug)]
pub(crate) enum Merge<T> {
    Ordered(SequenceBuffer<T>),
    Unordered,
}

impl<T> Merge<T> {
    pub(crate) fn new(ordered: bool) -> Self {
        if ordered {
            Self::Ordered(SequenceBuffer::new())
        } else {
            Self::Unordered
        }
    }

    pub(crate) fn push(&mut self, seq: u64, item: T) -> Vec<T> {
        match self {
            Self::Ordered(buffer) => buffer.push(seq, item),
            Self::Unordered => vec![item],
        }
    }

    pub(crate) fn pending(&self) -> usize {
        match self {
            Self::Ordered(buffer) => buffer.pending(),
            Self::Unordered => 0,
        }
    }
}
