/// IKC Queue - single-producer/single-consumer ring of packet slots
///
/// The header (head, tail and the cpu tags) occupies the first cache line of
/// the queue's pages; the rest is slots. `head == tail` means empty and one
/// slot always stays free so a full ring is distinguishable.

use super::packet::{IkcPacket, PACKET_SIZE, PACKET_WORDS};
use crate::hal::{PageAllocator, TransportError};
use crate::types::{CpuId, PhysAddr, PAGE_SIZE};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Bytes reserved at the start of a queue for its header
pub const QUEUE_HEADER_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue full")]
    Full,
    #[error("queue empty")]
    Empty,
}

/// Slot count for a queue backed by `pages` pages
pub fn queue_capacity(pages: usize) -> usize {
    (pages * PAGE_SIZE).saturating_sub(QUEUE_HEADER_SIZE) / PACKET_SIZE
}

pub struct Queue {
    phys: PhysAddr,
    pages: usize,
    capacity: u64,
    /// Next slot to write
    head: AtomicU64,
    /// Next slot to read
    tail: AtomicU64,
    read_cpu: AtomicU32,
    slots: Box<[AtomicU64]>,
}

impl Queue {
    pub fn new(phys: PhysAddr, pages: usize, read_cpu: CpuId) -> Self {
        let capacity = queue_capacity(pages).max(2);
        let slots = (0..capacity * PACKET_WORDS)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            phys,
            pages,
            capacity: capacity as u64,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            read_cpu: AtomicU32::new(read_cpu.0),
            slots,
        }
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Total slots, including the one kept empty
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Packets that can be in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.capacity as usize - 1
    }

    pub fn read_cpu(&self) -> CpuId {
        CpuId(self.read_cpu.load(Ordering::Relaxed))
    }

    pub fn set_read_cpu(&self, cpu: CpuId) {
        self.read_cpu.store(cpu.0, Ordering::Relaxed);
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        ((head + self.capacity - tail) % self.capacity) as usize
    }

    /// Producer side. Never overwrites an unread slot.
    pub fn write(&self, packet: &IkcPacket) -> Result<(), QueueError> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let next = (head + 1) % self.capacity;
        if next == tail {
            return Err(QueueError::Full);
        }

        let base = head as usize * PACKET_WORDS;
        for (slot, word) in self.slots[base..base + PACKET_WORDS]
            .iter()
            .zip(packet.to_words())
        {
            slot.store(word, Ordering::Relaxed);
        }
        self.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Consumer side
    pub fn read(&self) -> Result<IkcPacket, QueueError> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return Err(QueueError::Empty);
        }

        let base = tail as usize * PACKET_WORDS;
        let mut words = [0u64; PACKET_WORDS];
        for (word, slot) in words.iter_mut().zip(&self.slots[base..base + PACKET_WORDS]) {
            *word = slot.load(Ordering::Relaxed);
        }
        self.tail.store((tail + 1) % self.capacity, Ordering::Release);
        Ok(IkcPacket::from_words(words))
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("phys", &self.phys)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("read_cpu", &self.read_cpu())
            .finish()
    }
}

/// Queues reachable by physical address from either kernel
pub struct SharedQueues {
    pages: Arc<dyn PageAllocator>,
    queues: RwLock<HashMap<PhysAddr, Arc<Queue>>>,
}

impl SharedQueues {
    pub fn new(pages: Arc<dyn PageAllocator>) -> Self {
        Self {
            pages,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate and publish a queue of `pages` pages drained on `read_cpu`
    pub fn create(&self, pages: usize, read_cpu: CpuId) -> Result<Arc<Queue>, TransportError> {
        let phys = self.pages.alloc_pages(pages)?;
        let queue = Arc::new(Queue::new(phys, pages, read_cpu));
        self.queues.write().insert(phys, queue.clone());
        log::trace!("Queue at {} ({} slots)", phys, queue.capacity());
        Ok(queue)
    }

    pub fn lookup(&self, phys: PhysAddr) -> Option<Arc<Queue>> {
        self.queues.read().get(&phys).cloned()
    }

    pub fn release(&self, queue: &Queue) {
        if self.queues.write().remove(&queue.phys()).is_some() {
            self.pages.free_pages(queue.phys(), queue.pages());
        }
    }

    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.read().is_empty()
    }
}
