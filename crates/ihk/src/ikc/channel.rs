/// IKC Channel - a send/receive queue pair with a registered handler
///
/// The host writes `send_queue` and drains `recv_queue` on `dest_cpu`.
/// The LWK side sees the same two queues through a [`RemoteEndpoint`].

use super::packet::IkcPacket;
use super::queue::{Queue, QueueError, SharedQueues};
use crate::error::{IhkError, Result};
use crate::hal::{InterruptTransport, IrqGuard, TransportError};
use crate::types::{ChannelId, CpuId, OsId, PhysAddr};
use crossbeam::utils::Backoff;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Invoked once per received packet, on the channel's dispatch CPU
pub type PacketHandler = Arc<dyn Fn(&Channel, &IkcPacket) + Send + Sync>;

/// Box a closure as a [`PacketHandler`]
pub fn handler<F>(f: F) -> PacketHandler
where
    F: Fn(&Channel, &IkcPacket) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Bootstrap channel created by `boot()`
    Master,
    Regular,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Enqueue without raising an interrupt on the destination
    pub no_notify: bool,
}

impl SendOptions {
    pub const NOTIFY: SendOptions = SendOptions { no_notify: false };
    pub const NO_NOTIFY: SendOptions = SendOptions { no_notify: true };
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    full_retries: AtomicU64,
}

/// Snapshot of a channel's traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub sent: u64,
    pub received: u64,
    /// Write attempts that found the send queue full
    pub full_retries: u64,
}

pub(crate) struct ChannelParams {
    pub id: ChannelId,
    pub os: OsId,
    pub kind: ChannelKind,
    pub dest_cpu: CpuId,
    pub remote_cpu: CpuId,
    pub send_queue: Arc<Queue>,
    pub recv_queue: Arc<Queue>,
    pub irq: Arc<dyn InterruptTransport>,
    pub vector: u32,
}

pub struct Channel {
    id: ChannelId,
    os: OsId,
    kind: ChannelKind,
    dest_cpu: CpuId,
    remote_cpu: CpuId,
    send_queue: Arc<Queue>,
    recv_queue: Arc<Queue>,
    enabled: AtomicBool,
    destroyed: AtomicBool,
    handler: RwLock<Option<PacketHandler>>,
    /// Serializes producers so the send ring keeps a single writer
    send_lock: Mutex<()>,
    /// Held across one read + handler call
    delivery: Mutex<()>,
    irq: Arc<dyn InterruptTransport>,
    vector: u32,
    counters: Counters,
}

impl Channel {
    pub(crate) fn new(params: ChannelParams) -> Self {
        Self {
            id: params.id,
            os: params.os,
            kind: params.kind,
            dest_cpu: params.dest_cpu,
            remote_cpu: params.remote_cpu,
            send_queue: params.send_queue,
            recv_queue: params.recv_queue,
            enabled: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            handler: RwLock::new(None),
            send_lock: Mutex::new(()),
            delivery: Mutex::new(()),
            irq: params.irq,
            vector: params.vector,
            counters: Counters::default(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn os(&self) -> OsId {
        self.os
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Host CPU whose dispatcher drains this channel
    pub fn dest_cpu(&self) -> CpuId {
        self.dest_cpu
    }

    /// LWK CPU that is notified on send
    pub fn remote_cpu(&self) -> CpuId {
        self.remote_cpu
    }

    pub fn send_queue(&self) -> &Arc<Queue> {
        &self.send_queue
    }

    pub fn recv_queue(&self) -> &Arc<Queue> {
        &self.recv_queue
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    pub fn set_handler(&self, handler: PacketHandler) {
        *self.handler.write() = Some(handler);
    }

    pub fn clear_handler(&self) {
        *self.handler.write() = None;
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        log::debug!("{} enabled (dispatch on {})", self.id, self.dest_cpu);
    }

    /// Returns once no delivery is in progress. Must not be called from this
    /// channel's own handler.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        drop(self.delivery.lock());
        log::debug!("{} disabled", self.id);
    }

    /// Enqueue `packet` and notify the remote CPU.
    ///
    /// A full queue is retried until the consumer makes room; there is no
    /// upper bound on the wait.
    pub fn send(&self, packet: &IkcPacket, opts: SendOptions) -> Result<()> {
        self.send_with(packet, opts, true)
    }

    /// Like [`Channel::send`] but a full queue fails with `ResourceBusy`
    /// instead of waiting for the consumer.
    pub fn try_send(&self, packet: &IkcPacket, opts: SendOptions) -> Result<()> {
        self.send_with(packet, opts, false)
    }

    fn send_with(&self, packet: &IkcPacket, opts: SendOptions, wait_for_room: bool) -> Result<()> {
        let _irq = IrqGuard::new(self.irq.as_ref());

        let mut pkt = *packet;
        pkt.channel_id = self.id.0;

        let backoff = Backoff::new();
        let mut retries = 0u64;
        loop {
            if !self.is_enabled() || self.is_destroyed() {
                return Err(IhkError::invalid(format!("{} is not enabled", self.id)));
            }

            let res = {
                let _producer = self.send_lock.lock();
                self.send_queue.write(&pkt)
            };
            match res {
                Ok(()) => break,
                Err(QueueError::Full) | Err(QueueError::Empty) => {
                    if !wait_for_room {
                        self.counters.full_retries.fetch_add(1, Ordering::Relaxed);
                        return Err(IhkError::busy(format!("{}: send queue full", self.id)));
                    }
                    if retries == 0 {
                        log::debug!("{}: couldn't append packet, retrying", self.id);
                    }
                    retries += 1;
                    backoff.snooze();
                }
            }
        }

        if retries > 0 {
            self.counters.full_retries.fetch_add(retries, Ordering::Relaxed);
        }
        self.counters.sent.fetch_add(1, Ordering::Relaxed);

        // Slot contents must be visible before the remote side is woken
        fence(Ordering::SeqCst);
        if !opts.no_notify {
            self.irq.send_ipi(self.remote_cpu, self.vector)?;
        }
        log::trace!("{} sent msg {:#x} seq {}", self.id, pkt.msg, pkt.seq);
        Ok(())
    }

    /// Pull one packet from the receive queue and run the handler on it
    pub(crate) fn deliver_one(&self) -> bool {
        let _delivery = self.delivery.lock();
        if !self.is_enabled() {
            return false;
        }
        let pkt = match self.recv_queue.read() {
            Ok(pkt) => pkt,
            Err(_) => return false,
        };
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(self, &pkt),
            None => log::warn!("{}: no handler, dropping msg {:#x}", self.id, pkt.msg),
        }
        true
    }

    /// Ready for the dispatcher running on `cpu`
    pub(crate) fn has_work_for(&self, cpu: CpuId) -> bool {
        self.is_enabled() && self.recv_queue.read_cpu() == cpu && !self.recv_queue.is_empty()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            full_retries: self.counters.full_retries.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("os", &self.os)
            .field("kind", &self.kind)
            .field("dest_cpu", &self.dest_cpu)
            .field("remote_cpu", &self.remote_cpu)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Send entry point with the null checks of the management boundary
pub fn ikc_send(
    channel: Option<&Channel>,
    packet: Option<&IkcPacket>,
    opts: SendOptions,
) -> Result<()> {
    let channel = channel.ok_or_else(|| IhkError::invalid("null channel"))?;
    let packet = packet.ok_or_else(|| IhkError::invalid("null packet"))?;
    channel.send(packet, opts)
}

/// The LWK's view of a host channel
pub struct RemoteEndpoint {
    id: ChannelId,
    lwk_cpu: CpuId,
    host_cpu: CpuId,
    /// Host writes, LWK reads
    inbound: Arc<Queue>,
    /// LWK writes, host reads
    outbound: Arc<Queue>,
    queues: Arc<SharedQueues>,
    irq: Arc<dyn InterruptTransport>,
    vector: u32,
}

impl RemoteEndpoint {
    /// Map a channel's queues by physical address. `None` if either queue
    /// is not published.
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        queues: &Arc<SharedQueues>,
        id: ChannelId,
        host_send_pa: PhysAddr,
        host_recv_pa: PhysAddr,
        lwk_cpu: CpuId,
        host_cpu: CpuId,
        irq: Arc<dyn InterruptTransport>,
        vector: u32,
    ) -> Option<Self> {
        let inbound = queues.lookup(host_send_pa)?;
        let outbound = queues.lookup(host_recv_pa)?;
        Some(Self {
            id,
            lwk_cpu,
            host_cpu,
            inbound,
            outbound,
            queues: queues.clone(),
            irq,
            vector,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn lwk_cpu(&self) -> CpuId {
        self.lwk_cpu
    }

    pub fn try_recv(&self) -> Option<IkcPacket> {
        self.inbound.read().ok()
    }

    /// Enqueue towards the host and raise its IKC interrupt. Retries while
    /// full; gives up only if the host has released the queue.
    pub fn send(&self, packet: &IkcPacket) -> std::result::Result<(), TransportError> {
        let mut pkt = *packet;
        pkt.channel_id = self.id.0;

        let backoff = Backoff::new();
        while let Err(QueueError::Full) = self.outbound.write(&pkt) {
            if self.queues.lookup(self.outbound.phys()).is_none() {
                return Err(TransportError::Failed(format!("{} queue unmapped", self.id)));
            }
            backoff.snooze();
        }
        fence(Ordering::SeqCst);
        self.irq.send_ipi(self.host_cpu, self.vector)
    }
}
