/// Simulated chip - both transports on host threads
///
/// Every host CPU gets a dispatcher thread fed by a crossbeam channel, so a
/// CPU handles one interrupt at a time. Handlers run with interrupts masked
/// on that thread; an IPI raised meanwhile waits on the line until the
/// handler returns. Masking on a thread that is not a dispatcher has no CPU
/// to act on, so producers there rely on the channel's send lock alone. Every booted instance gets one
/// `SimLwk` thread standing in for the whole lightweight kernel: it
/// acknowledges boot through the boot-parameter block, maps the master
/// queues, echoes packets on opened channels and acknowledges shutdown.

use super::allocator::PhysPageAllocator;
use super::{BootTransport, InterruptTransport, IrqFlags, IrqHandler, Platform, TransportError};
use crate::ikc::channel::RemoteEndpoint;
use crate::ikc::packet::MasterMessage;
use crate::ikc::queue::SharedQueues;
use crate::os::boot_param::{BootParamBlock, LwkStatus, NmiMode};
use crate::types::{ChannelId, ChipTopology, CpuId, CpuInfo, OsId, PhysAddr};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

thread_local! {
    static IRQ_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the calling thread currently has interrupts masked
pub fn irqs_disabled() -> bool {
    IRQ_DEPTH.with(|d| d.get() > 0)
}

/// Per-thread mask depth; dispatcher threads stand in for CPUs
fn irq_save() -> IrqFlags {
    IRQ_DEPTH.with(|d| {
        let prev = d.get();
        d.set(prev + 1);
        IrqFlags(prev)
    })
}

fn irq_restore(flags: IrqFlags) {
    IRQ_DEPTH.with(|d| d.set(flags.0));
}

/// How far the simulated LWK gets through boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootAck {
    /// Booted, then ready
    #[default]
    Ready,
    /// Booted, never ready
    BootedOnly,
    /// Never writes the status word
    Never,
}

/// Fault injection knobs for one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LwkBehavior {
    pub boot_ack: BootAck,
    pub ack_shutdown: bool,
    /// Cores confirm a forced kill
    pub killable: bool,
}

impl Default for LwkBehavior {
    fn default() -> Self {
        Self {
            boot_ack: BootAck::Ready,
            ack_shutdown: true,
            killable: true,
        }
    }
}

impl LwkBehavior {
    pub fn hang_on_boot() -> Self {
        Self {
            boot_ack: BootAck::Never,
            ..Self::default()
        }
    }

    pub fn ignore_shutdown() -> Self {
        Self {
            ack_shutdown: false,
            ..Self::default()
        }
    }

    pub fn unkillable() -> Self {
        Self {
            ack_shutdown: false,
            killable: false,
            ..Self::default()
        }
    }
}

struct LwkSlot {
    os: OsId,
    cpus: HashSet<CpuId>,
    killable: bool,
    stop: Arc<AtomicBool>,
    _thread: JoinHandle<()>,
}

struct SimInner {
    topology: ChipTopology,
    pages: Arc<PhysPageAllocator>,
    queues: Arc<SharedQueues>,
    handlers: Arc<RwLock<HashMap<u32, IrqHandler>>>,
    host_lines: Vec<Sender<u32>>,
    lwk_lines: RwLock<HashMap<CpuId, Sender<(CpuId, u32)>>>,
    lwks: Mutex<Vec<LwkSlot>>,
    behaviors: Mutex<HashMap<OsId, LwkBehavior>>,
    ipis: AtomicU64,
}

impl Drop for SimInner {
    fn drop(&mut self) {
        for slot in self.lwks.get_mut().iter() {
            slot.stop.store(true, Ordering::Release);
        }
    }
}

impl SimInner {
    fn deliver(&self, dest: CpuId, vector: u32) -> Result<(), TransportError> {
        self.ipis.fetch_add(1, Ordering::Relaxed);
        if let Some(line) = self.lwk_lines.read().get(&dest) {
            return line
                .send((dest, vector))
                .map_err(|_| TransportError::Unresponsive(dest.0));
        }
        let line = self
            .host_lines
            .get(dest.0 as usize)
            .ok_or(TransportError::NoSuchCpu(dest.0))?;
        line.send(vector)
            .map_err(|_| TransportError::Unresponsive(dest.0))
    }
}

/// Simulated chip; clones share the same hardware
#[derive(Clone)]
pub struct SimChip {
    inner: Arc<SimInner>,
}

impl SimChip {
    pub fn new(topology: ChipTopology) -> Self {
        let pages = Arc::new(PhysPageAllocator::default());
        let queues = Arc::new(SharedQueues::new(pages.clone()));
        let handlers: Arc<RwLock<HashMap<u32, IrqHandler>>> = Arc::new(RwLock::new(HashMap::new()));

        let host_lines = topology
            .cpus
            .iter()
            .map(|cpu| spawn_dispatcher(cpu.id, handlers.clone()))
            .collect();

        log::info!("Simulated chip with {} cpus", topology.num_cpus());
        Self {
            inner: Arc::new(SimInner {
                topology,
                pages,
                queues,
                handlers,
                host_lines,
                lwk_lines: RwLock::new(HashMap::new()),
                lwks: Mutex::new(Vec::new()),
                behaviors: Mutex::new(HashMap::new()),
                ipis: AtomicU64::new(0),
            }),
        }
    }

    /// Transports and shared memory for an [`crate::IhkDevice`]
    pub fn platform(&self) -> Platform {
        Platform {
            boot: Arc::new(self.clone()),
            irq: Arc::new(self.clone()),
            pages: self.inner.pages.clone(),
            queues: self.inner.queues.clone(),
        }
    }

    pub fn topology(&self) -> &ChipTopology {
        &self.inner.topology
    }

    pub fn pages(&self) -> &Arc<PhysPageAllocator> {
        &self.inner.pages
    }

    pub fn queues(&self) -> &Arc<SharedQueues> {
        &self.inner.queues
    }

    /// Behavior of the LWK booted next for `os`
    pub fn set_behavior(&self, os: OsId, behavior: LwkBehavior) {
        self.inner.behaviors.lock().insert(os, behavior);
    }

    pub fn ipi_count(&self) -> u64 {
        self.inner.ipis.load(Ordering::Relaxed)
    }

    /// An LWK thread currently owns cores for `os`
    pub fn lwk_running(&self, os: OsId) -> bool {
        self.inner
            .lwks
            .lock()
            .iter()
            .any(|s| s.os == os && !s.stop.load(Ordering::Acquire))
    }

    fn port(&self) -> Arc<dyn InterruptTransport> {
        Arc::new(SimPort {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Drop `cpu` from its LWK; the LWK stops once it has no cores left
    fn detach_core(&self, cpu: CpuId) {
        self.inner.lwk_lines.write().remove(&cpu);
        let mut lwks = self.inner.lwks.lock();
        for slot in lwks.iter_mut() {
            if slot.cpus.remove(&cpu) && slot.cpus.is_empty() {
                slot.stop.store(true, Ordering::Release);
            }
        }
        lwks.retain(|s| !s.cpus.is_empty());
    }
}

fn spawn_dispatcher(cpu: CpuId, handlers: Arc<RwLock<HashMap<u32, IrqHandler>>>) -> Sender<u32> {
    let (tx, rx) = unbounded::<u32>();
    let spawned = std::thread::Builder::new()
        .name(format!("sim-{}", cpu))
        .spawn(move || {
            for vector in rx.iter() {
                let handler = handlers.read().get(&vector).cloned();
                match handler {
                    Some(handler) => {
                        let flags = irq_save();
                        handler(cpu);
                        irq_restore(flags);
                    }
                    None => log::trace!("{}: spurious vector {:#x}", cpu, vector),
                }
            }
        });
    if let Err(e) = spawned {
        log::error!("{}: failed to spawn dispatcher: {}", cpu, e);
    }
    tx
}

impl BootTransport for SimChip {
    fn start_cores(
        &self,
        os: OsId,
        cpus: &[CpuInfo],
        entry: PhysAddr,
        params: &Arc<BootParamBlock>,
    ) -> Result<(), TransportError> {
        for cpu in cpus {
            if self.inner.topology.cpu(cpu.id).is_none() {
                return Err(TransportError::NoSuchCpu(cpu.id.0));
            }
            if self.inner.lwk_lines.read().contains_key(&cpu.id) {
                return Err(TransportError::Failed(format!("{} already running", cpu.id)));
            }
        }

        let behavior = self
            .inner
            .behaviors
            .lock()
            .get(&os)
            .copied()
            .unwrap_or_default();
        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let lwk = SimLwk {
            params: params.clone(),
            behavior,
            queues: self.inner.queues.clone(),
            port: self.port(),
            rx,
            stop: stop.clone(),
            master: None,
            endpoints: HashMap::new(),
            frozen: false,
        };

        let thread = std::thread::Builder::new()
            .name(format!("sim-lwk-{}", os))
            .spawn(move || lwk.run())
            .map_err(|e| TransportError::Failed(e.to_string()))?;

        {
            let mut lines = self.inner.lwk_lines.write();
            for cpu in cpus {
                lines.insert(cpu.id, tx.clone());
            }
        }
        self.inner.lwks.lock().push(LwkSlot {
            os,
            cpus: cpus.iter().map(|c| c.id).collect(),
            killable: behavior.killable,
            stop,
            _thread: thread,
        });
        log::debug!("{}: started {} cores at {}", os, cpus.len(), entry);
        Ok(())
    }

    fn reset_core(&self, cpu: CpuId) -> Result<(), TransportError> {
        if self.inner.topology.cpu(cpu).is_none() {
            return Err(TransportError::NoSuchCpu(cpu.0));
        }
        self.detach_core(cpu);
        Ok(())
    }

    fn kill_core(&self, cpu: CpuId) -> Result<(), TransportError> {
        if self.inner.topology.cpu(cpu).is_none() {
            return Err(TransportError::NoSuchCpu(cpu.0));
        }
        let killable = self
            .inner
            .lwks
            .lock()
            .iter()
            .find(|s| s.cpus.contains(&cpu))
            .map(|s| s.killable)
            .unwrap_or(true);
        if !killable {
            return Err(TransportError::Unresponsive(cpu.0));
        }
        self.detach_core(cpu);
        Ok(())
    }

    fn page_sizes(&self) -> Vec<u64> {
        vec![4 << 10, 2 << 20, 1 << 30]
    }
}

impl InterruptTransport for SimChip {
    fn send_ipi(&self, dest: CpuId, vector: u32) -> Result<(), TransportError> {
        self.inner.deliver(dest, vector)
    }

    fn register_handler(&self, vector: u32, handler: IrqHandler) -> Result<(), TransportError> {
        let mut handlers = self.inner.handlers.write();
        if handlers.contains_key(&vector) {
            return Err(TransportError::Failed(format!("vector {:#x} in use", vector)));
        }
        handlers.insert(vector, handler);
        Ok(())
    }

    fn unregister_handler(&self, vector: u32) {
        self.inner.handlers.write().remove(&vector);
    }

    fn local_irq_save(&self) -> IrqFlags {
        irq_save()
    }

    fn local_irq_restore(&self, flags: IrqFlags) {
        irq_restore(flags)
    }
}

/// The LWK's handle on the interrupt lines; does not keep the chip alive
struct SimPort {
    inner: Weak<SimInner>,
}

impl InterruptTransport for SimPort {
    fn send_ipi(&self, dest: CpuId, vector: u32) -> Result<(), TransportError> {
        match self.inner.upgrade() {
            Some(inner) => inner.deliver(dest, vector),
            None => Err(TransportError::Unresponsive(dest.0)),
        }
    }

    fn register_handler(&self, vector: u32, _handler: IrqHandler) -> Result<(), TransportError> {
        Err(TransportError::NoHandler(vector))
    }

    fn unregister_handler(&self, _vector: u32) {}

    fn local_irq_save(&self) -> IrqFlags {
        irq_save()
    }

    fn local_irq_restore(&self, flags: IrqFlags) {
        irq_restore(flags)
    }
}

/// Stand-in for a lightweight kernel
struct SimLwk {
    params: Arc<BootParamBlock>,
    behavior: LwkBehavior,
    queues: Arc<SharedQueues>,
    port: Arc<dyn InterruptTransport>,
    rx: Receiver<(CpuId, u32)>,
    stop: Arc<AtomicBool>,
    master: Option<RemoteEndpoint>,
    endpoints: HashMap<ChannelId, RemoteEndpoint>,
    frozen: bool,
}

impl SimLwk {
    const IDLE: Duration = Duration::from_millis(5);

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run(mut self) {
        let os = self.params.os();
        if self.behavior.boot_ack == BootAck::Never {
            log::debug!("{}: simulated LWK hangs in early boot", os);
            while !self.stopped() {
                if let Err(RecvTimeoutError::Disconnected) = self.rx.recv_timeout(Self::IDLE) {
                    break;
                }
            }
            return;
        }

        self.params.advance_status(LwkStatus::Booted);
        self.params.kmsg_write(&format!(
            "IHK/LWK: {} cpus, {} memory chunks, entry {}",
            self.params.cpus().len(),
            self.params.memory().len(),
            self.params.entry()
        ));
        if !self.params.kargs().is_empty() {
            self.params
                .kmsg_write(&format!("IHK/LWK: kargs: {}", self.params.kargs()));
        }

        let (Some(bsp), send, recv) = (
            self.params.bsp(),
            self.params.master_send(),
            self.params.master_recv(),
        ) else {
            self.params.kmsg_write("IHK/LWK: no cpus, halting");
            return;
        };
        self.master = RemoteEndpoint::map(
            &self.queues,
            self.params.master_id(),
            send.phys,
            recv.phys,
            bsp,
            self.params.host_ikc_cpu(),
            self.port.clone(),
            self.params.ikc_vector(),
        );
        if self.master.is_none() {
            self.params.kmsg_write("IHK/LWK: master queues not mapped");
        }

        if self.behavior.boot_ack == BootAck::Ready {
            self.params.advance_status(LwkStatus::Ready);
            self.params.kmsg_write("IHK/LWK: ready");
        }

        while !self.stopped() {
            match self.rx.recv_timeout(Self::IDLE) {
                Ok((cpu, vector)) => {
                    if vector == self.params.nmi_vector() {
                        self.on_nmi(cpu);
                    } else if vector != self.params.ikc_vector() {
                        self.params
                            .kmsg_write(&format!("IHK/LWK: vector {:#x} on {}", vector, cpu));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.stopped() || !self.poll() {
                break;
            }
        }
        log::debug!("{}: simulated LWK halted", os);
    }

    fn on_nmi(&mut self, cpu: CpuId) {
        match self.params.nmi_mode() {
            Some(NmiMode::Dump) => self
                .params
                .kmsg_write(&format!("IHK/LWK: NMI on {}: {} channels open", cpu, self.endpoints.len())),
            Some(NmiMode::Freeze) => {
                if !self.frozen {
                    self.params.kmsg_write(&format!("IHK/LWK: frozen by NMI on {}", cpu));
                }
                self.frozen = true;
            }
            Some(NmiMode::Unfreeze) => self.frozen = false,
            None => {}
        }
    }

    /// Drain master and channel queues; `false` once the LWK should halt.
    /// A frozen LWK drains nothing.
    fn poll(&mut self) -> bool {
        if self.frozen {
            return true;
        }
        while let Some(pkt) = self.master.as_ref().and_then(|m| m.try_recv()) {
            match MasterMessage::decode(&pkt) {
                Some(MasterMessage::ChannelOpen {
                    id,
                    send_pa,
                    recv_pa,
                    lwk_cpu,
                    host_cpu,
                }) => {
                    match RemoteEndpoint::map(
                        &self.queues,
                        id,
                        send_pa,
                        recv_pa,
                        lwk_cpu,
                        host_cpu,
                        self.port.clone(),
                        self.params.ikc_vector(),
                    ) {
                        Some(ep) => {
                            self.endpoints.insert(id, ep);
                        }
                        None => log::warn!("{}: cannot map {}", self.params.os(), id),
                    }
                }
                Some(MasterMessage::ChannelClose { id }) => {
                    self.endpoints.remove(&id);
                }
                Some(MasterMessage::Shutdown) => {
                    if !self.behavior.ack_shutdown {
                        self.params.kmsg_write("IHK/LWK: ignoring shutdown request");
                        continue;
                    }
                    self.params.kmsg_write("IHK/LWK: shutting down");
                    if let Some(master) = &self.master {
                        if let Err(e) = master.send(&MasterMessage::ShutdownAck.encode()) {
                            log::warn!("{}: shutdown ack lost: {}", self.params.os(), e);
                        }
                    }
                    return false;
                }
                Some(MasterMessage::ShutdownAck) | None => {
                    log::warn!("{}: unexpected master msg {:#x}", self.params.os(), pkt.msg)
                }
            }
        }

        for ep in self.endpoints.values() {
            while let Some(pkt) = ep.try_recv() {
                self.params.advance_status(LwkStatus::Running);
                if let Err(e) = ep.send(&pkt) {
                    log::debug!("{}: echo on {} dropped: {}", self.params.os(), ep.id(), e);
                    break;
                }
            }
        }
        true
    }
}

/// Interrupt transport that records IPIs and never delivers them
#[derive(Default)]
pub struct NullIrq {
    sent: Mutex<Vec<(CpuId, u32)>>,
    handlers: Mutex<HashMap<u32, IrqHandler>>,
}

impl NullIrq {
    pub fn sent(&self) -> Vec<(CpuId, u32)> {
        self.sent.lock().clone()
    }

    /// Run the handler registered on `vector` as if `cpu` took the interrupt
    pub fn fire(&self, cpu: CpuId, vector: u32) -> bool {
        let handler = self.handlers.lock().get(&vector).cloned();
        match handler {
            Some(handler) => {
                handler(cpu);
                true
            }
            None => false,
        }
    }
}

impl InterruptTransport for NullIrq {
    fn send_ipi(&self, dest: CpuId, vector: u32) -> Result<(), TransportError> {
        self.sent.lock().push((dest, vector));
        Ok(())
    }

    fn register_handler(&self, vector: u32, handler: IrqHandler) -> Result<(), TransportError> {
        self.handlers.lock().insert(vector, handler);
        Ok(())
    }

    fn unregister_handler(&self, vector: u32) {
        self.handlers.lock().remove(&vector);
    }

    fn local_irq_save(&self) -> IrqFlags {
        irq_save()
    }

    fn local_irq_restore(&self, flags: IrqFlags) {
        irq_restore(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikc::channel::{ChannelKind, SendOptions};
    use crate::ikc::manager::ChannelManager;
    use crate::ikc::packet::IkcPacket;

    #[test]
    fn irq_guard_nests() {
        assert!(!irqs_disabled());
        let outer = irq_save();
        let inner = irq_save();
        assert!(irqs_disabled());
        irq_restore(inner);
        assert!(irqs_disabled());
        irq_restore(outer);
        assert!(!irqs_disabled());
    }

    #[test]
    fn send_records_ipi_to_remote_cpu() {
        let irq = Arc::new(NullIrq::default());
        let queues = Arc::new(SharedQueues::new(Arc::new(PhysPageAllocator::default())));
        let mgr = ChannelManager::new(2, queues, irq.clone(), 1, 0xd1);
        let ch = mgr.create_channel(OsId(0), ChannelKind::Regular, CpuId(0), CpuId(7)).unwrap();
        ch.enable();

        ch.send(&IkcPacket::new(5, [0; 6]), SendOptions::NOTIFY).unwrap();
        ch.send(&IkcPacket::new(6, [0; 6]), SendOptions::NO_NOTIFY).unwrap();
        assert_eq!(irq.sent(), vec![(CpuId(7), 0xd1)]);
        assert_eq!(ch.send_queue().len(), 2);
    }

    #[test]
    fn try_send_fails_fast_on_full_queue() {
        let irq = Arc::new(NullIrq::default());
        let queues = Arc::new(SharedQueues::new(Arc::new(PhysPageAllocator::default())));
        let mgr = ChannelManager::new(2, queues, irq, 1, 0xd1);
        let ch = mgr.create_channel(OsId(0), ChannelKind::Regular, CpuId(0), CpuId(1)).unwrap();
        ch.enable();

        let room = ch.send_queue().max_in_flight();
        for seq in 0..room as u64 {
            ch.try_send(&IkcPacket::new(1, [0; 6]).with_seq(seq), SendOptions::NO_NOTIFY)
                .unwrap();
        }
        let err = ch
            .try_send(&IkcPacket::new(1, [0; 6]), SendOptions::NO_NOTIFY)
            .unwrap_err();
        assert!(matches!(err, crate::IhkError::ResourceBusy(_)));
        assert_eq!(ch.stats().sent, room as u64);
        assert_eq!(ch.stats().full_retries, 1);
        assert!(!irqs_disabled());
    }

    #[test]
    fn masked_handler_defers_ipis_to_its_own_cpu() {
        let chip = SimChip::new(ChipTopology::uniform(2, 1, 1 << 30));
        let (tx, rx) = unbounded();
        let line = Arc::downgrade(&chip.inner);
        let first = Arc::new(AtomicBool::new(true));
        chip.register_handler(0x41, Arc::new(move |cpu: CpuId| {
            let _ = tx.send(("enter", irqs_disabled()));
            if first.swap(false, Ordering::AcqRel) {
                if let Some(inner) = line.upgrade() {
                    let _ = inner.deliver(cpu, 0x41);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            let _ = tx.send(("exit", irqs_disabled()));
        }))
        .unwrap();

        chip.send_ipi(CpuId(1), 0x41).unwrap();
        let events: Vec<_> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(
            events,
            vec![("enter", true), ("exit", true), ("enter", true), ("exit", true)]
        );
        assert!(!irqs_disabled());
    }

    #[test]
    fn host_ipis_reach_registered_handler() {
        let chip = SimChip::new(ChipTopology::uniform(4, 1, 1 << 30));
        let (tx, rx) = unbounded();
        chip.register_handler(0x40, Arc::new(move |cpu: CpuId| {
            let _ = tx.send(cpu);
        }))
        .unwrap();
        chip.send_ipi(CpuId(2), 0x40).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), CpuId(2));
        assert_eq!(chip.send_ipi(CpuId(9), 0x40), Err(TransportError::NoSuchCpu(9)));
        assert!(chip.register_handler(0x40, Arc::new(|_: CpuId| {})).is_err());
    }

    #[test]
    fn unkillable_cores_refuse_kill_but_reset() {
        let chip = SimChip::new(ChipTopology::uniform(4, 1, 1 << 30));
        chip.set_behavior(OsId(0), LwkBehavior::unkillable());
        let params = Arc::new(
            BootParamBlock::builder(OsId(0), PhysAddr(0x1000))
                .cpus(vec![chip.topology().cpus[3]])
                .build(),
        );
        chip.start_cores(OsId(0), &[chip.topology().cpus[3]], PhysAddr(0x100000), &params)
            .unwrap();
        assert!(chip.lwk_running(OsId(0)));
        assert_eq!(chip.kill_core(CpuId(3)), Err(TransportError::Unresponsive(3)));
        chip.reset_core(CpuId(3)).unwrap();
        assert!(!chip.lwk_running(OsId(0)));
    }
}
