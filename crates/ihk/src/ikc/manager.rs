/// Channel Manager - channel creation, destruction and dispatch lists
///
/// Every channel is linked into exactly one per-CPU dispatch list (its
/// destination CPU) and one per-instance list. Each list carries its own
/// lock.

use super::channel::{Channel, ChannelKind, ChannelParams};
use super::dispatch;
use super::queue::SharedQueues;
use crate::error::{IhkError, Result};
use crate::hal::InterruptTransport;
use crate::types::{ChannelId, CpuId, OsId};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Process-wide channel id source; ids are never reused
static NEXT_CHANNEL_ID: AtomicU32 = AtomicU32::new(1);

fn next_channel_id() -> ChannelId {
    ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
}

/// A list whose only access path is through its lock
pub struct LockedList<T> {
    items: Mutex<Vec<Arc<T>>>,
}

impl<T> Default for LockedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockedList<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<Arc<T>>> {
        self.items.lock()
    }

    pub fn push(&self, item: Arc<T>) {
        self.items.lock().push(item);
    }

    /// Unlink by identity
    pub fn remove(&self, item: &Arc<T>) -> bool {
        let mut items = self.items.lock();
        match items.iter().position(|i| Arc::ptr_eq(i, item)) {
            Some(pos) => {
                items.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.items.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

pub struct ChannelManager {
    /// Indexed by host CPU
    cpu_lists: Vec<LockedList<Channel>>,
    instance_lists: RwLock<HashMap<OsId, Arc<LockedList<Channel>>>>,
    queues: Arc<SharedQueues>,
    irq: Arc<dyn InterruptTransport>,
    queue_pages: usize,
    vector: u32,
}

impl ChannelManager {
    pub fn new(
        num_cpus: usize,
        queues: Arc<SharedQueues>,
        irq: Arc<dyn InterruptTransport>,
        queue_pages: usize,
        vector: u32,
    ) -> Self {
        log::info!(
            "IKC: {} dispatch lists, {} pages per queue, vector {:#x}",
            num_cpus,
            queue_pages,
            vector
        );
        Self {
            cpu_lists: (0..num_cpus).map(|_| LockedList::new()).collect(),
            instance_lists: RwLock::new(HashMap::new()),
            queues,
            irq,
            queue_pages: queue_pages.max(1),
            vector,
        }
    }

    pub fn vector(&self) -> u32 {
        self.vector
    }

    pub fn queues(&self) -> &Arc<SharedQueues> {
        &self.queues
    }

    fn instance_list(&self, os: OsId) -> Arc<LockedList<Channel>> {
        if let Some(list) = self.instance_lists.read().get(&os) {
            return list.clone();
        }
        self.instance_lists.write().entry(os).or_default().clone()
    }

    /// New channel for `os`, dispatched on host `dest_cpu` and notifying
    /// `remote_cpu`. Returned disabled.
    pub fn create_channel(
        &self,
        os: OsId,
        kind: ChannelKind,
        dest_cpu: CpuId,
        remote_cpu: CpuId,
    ) -> Result<Arc<Channel>> {
        let cpu_list = self
            .cpu_lists
            .get(dest_cpu.0 as usize)
            .ok_or_else(|| IhkError::invalid(format!("no dispatch list for {}", dest_cpu)))?;

        let send_queue = self.queues.create(self.queue_pages, remote_cpu)?;
        let recv_queue = match self.queues.create(self.queue_pages, dest_cpu) {
            Ok(q) => q,
            Err(e) => {
                self.queues.release(&send_queue);
                return Err(e.into());
            }
        };

        let channel = Arc::new(Channel::new(ChannelParams {
            id: next_channel_id(),
            os,
            kind,
            dest_cpu,
            remote_cpu,
            send_queue,
            recv_queue,
            irq: self.irq.clone(),
            vector: self.vector,
        }));

        self.instance_list(os).push(channel.clone());
        cpu_list.push(channel.clone());

        log::debug!(
            "{}: created {} for {} ({} -> {})",
            os,
            channel.id(),
            match kind {
                ChannelKind::Master => "master",
                ChannelKind::Regular => "channel",
            },
            dest_cpu,
            remote_cpu
        );
        Ok(channel)
    }

    /// Unlink and free a disabled channel
    pub fn destroy_channel(&self, channel: &Arc<Channel>) -> Result<()> {
        if channel.is_destroyed() {
            return Err(IhkError::invalid(format!("{} already destroyed", channel.id())));
        }
        if channel.is_enabled() {
            return Err(IhkError::busy(format!("{} is still enabled", channel.id())));
        }
        if !channel.mark_destroyed() {
            return Err(IhkError::invalid(format!("{} already destroyed", channel.id())));
        }

        if let Some(list) = self.cpu_lists.get(channel.dest_cpu().0 as usize) {
            list.remove(channel);
        }
        if let Some(list) = self.instance_lists.read().get(&channel.os()) {
            list.remove(channel);
        }
        channel.clear_handler();

        self.queues.release(channel.send_queue());
        self.queues.release(channel.recv_queue());
        log::debug!("{}: destroyed {}", channel.os(), channel.id());
        Ok(())
    }

    /// Disable and destroy every channel of `os`
    pub fn destroy_all(&self, os: OsId) -> usize {
        let channels = self.channels_of(os);
        let mut destroyed = 0;
        for channel in &channels {
            channel.disable();
            if self.destroy_channel(channel).is_ok() {
                destroyed += 1;
            }
        }
        self.instance_lists.write().remove(&os);
        destroyed
    }

    pub fn channels_of(&self, os: OsId) -> Vec<Arc<Channel>> {
        self.instance_lists
            .read()
            .get(&os)
            .map(|l| l.snapshot())
            .unwrap_or_default()
    }

    pub fn find(&self, os: OsId, id: ChannelId) -> Option<Arc<Channel>> {
        self.instance_lists
            .read()
            .get(&os)?
            .lock()
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// Channels dispatched on `cpu`
    pub fn dispatch_list_len(&self, cpu: CpuId) -> usize {
        self.cpu_lists
            .get(cpu.0 as usize)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// IKC interrupt entry for `cpu`; returns the number of deliveries
    pub fn handle_interrupt(&self, cpu: CpuId) -> usize {
        match self.cpu_lists.get(cpu.0 as usize) {
            Some(list) => dispatch::drain(list, cpu),
            None => {
                log::warn!("IKC interrupt on unknown {}", cpu);
                0
            }
        }
    }
}
