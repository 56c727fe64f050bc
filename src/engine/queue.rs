//! Fixed-capacity circular queue of buffer handles, one per port.

use super::core::{OmxError, OmxResult};

/// Ring of `capacity + 1` slots; one slot stays empty so that
/// `write == read` means empty and `write + 1 == read` means full.
#[derive(Debug)]
pub struct HandleQueue<T> {
    slots: Vec<Option<T>>,
    read: usize,
    write: usize,
}

impl<T> HandleQueue<T> {
    pub fn new(capacity: usize) -> OmxResult<Self> {
        let size = capacity
            .checked_add(1)
            .ok_or_else(|| OmxError::BadParameter(format!("queue capacity {}", capacity)))?;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(size)
            .map_err(|_| OmxError::InsufficientResources(format!("queue of {} slots", size)))?;
        slots.resize_with(size, || None);
        Ok(Self {
            slots,
            read: 0,
            write: 0,
        })
    }

    /// Append `item`. A full queue is left untouched and the item is handed back.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        let size = self.slots.len();
        let next = (self.write + 1) % size;
        if next == self.read {
            return Err(item);
        }
        self.slots[self.write] = Some(item);
        self.write = next;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.read == self.write {
            return None;
        }
        let item = self.slots[self.read].take();
        self.read = (self.read + 1) % self.slots.len();
        item
    }

    /// Number of handles currently queued.
    pub fn available(&self) -> usize {
        let size = self.slots.len();
        (self.write + size - self.read) % size
    }

    /// Usable slots.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    pub fn is_full(&self) -> bool {
        (self.write + 1) % self.slots.len() == self.read
    }

    /// Drop every queued handle.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.read = 0;
        self.write = 0;
    }

    /// Remove every queued handle in FIFO order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.available());
        while let Some(item) = self.pop() {
            out.push(item);
        }
        out
    }
}
