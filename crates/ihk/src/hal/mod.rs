/// Hardware Abstraction Layer - boot and interrupt transports
///
/// The core never touches an interrupt controller or a trampoline directly.
/// Each target supplies one implementation of these traits; `sim` provides
/// one that runs the whole chip on host threads.

pub mod allocator;
pub mod sim;

use crate::ikc::queue::SharedQueues;
use crate::os::boot_param::BootParamBlock;
use crate::types::{CpuId, CpuInfo, OsId, PhysAddr};
use std::sync::Arc;
use thiserror::Error;

/// Failures reported by the external collaborators
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no such cpu {0}")]
    NoSuchCpu(u32),
    #[error("cpu {0} did not respond")]
    Unresponsive(u32),
    #[error("no handler registered on vector {0:#x}")]
    NoHandler(u32),
    #[error("out of physical memory allocating {0} pages")]
    OutOfMemory(usize),
    #[error("{0}")]
    Failed(String),
}

/// Starts, resets and kills LWK cores
pub trait BootTransport: Send + Sync {
    /// Wake `cpus` at `entry` with `params` published as the boot-parameter block
    fn start_cores(
        &self,
        os: OsId,
        cpus: &[CpuInfo],
        entry: PhysAddr,
        params: &Arc<BootParamBlock>,
    ) -> Result<(), TransportError>;

    fn reset_core(&self, cpu: CpuId) -> Result<(), TransportError>;

    /// Forced stop; `Unresponsive` until the core confirms
    fn kill_core(&self, cpu: CpuId) -> Result<(), TransportError>;

    /// Page sizes the LWK may map, smallest first
    fn page_sizes(&self) -> Vec<u64>;
}

/// Per-CPU interrupt entry point
pub type IrqHandler = Arc<dyn Fn(CpuId) + Send + Sync>;

/// Saved local interrupt state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqFlags(pub u32);

/// Delivers IPIs and routes vectors to handlers
pub trait InterruptTransport: Send + Sync {
    fn send_ipi(&self, dest: CpuId, vector: u32) -> Result<(), TransportError>;

    fn register_handler(&self, vector: u32, handler: IrqHandler) -> Result<(), TransportError>;

    fn unregister_handler(&self, vector: u32);

    /// Mask interrupt delivery on the calling CPU
    fn local_irq_save(&self) -> IrqFlags;

    fn local_irq_restore(&self, flags: IrqFlags);
}

/// Local interrupts stay masked while this is alive
pub struct IrqGuard<'a> {
    irq: &'a dyn InterruptTransport,
    flags: IrqFlags,
}

impl<'a> IrqGuard<'a> {
    pub fn new(irq: &'a dyn InterruptTransport) -> Self {
        let flags = irq.local_irq_save();
        Self { irq, flags }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.irq.local_irq_restore(self.flags);
    }
}

/// Physically contiguous page allocation
pub trait PageAllocator: Send + Sync {
    fn alloc_pages(&self, count: usize) -> Result<PhysAddr, TransportError>;

    fn free_pages(&self, addr: PhysAddr, count: usize);
}

/// Everything the host side needs from the platform
#[derive(Clone)]
pub struct Platform {
    pub boot: Arc<dyn BootTransport>,
    pub irq: Arc<dyn InterruptTransport>,
    pub pages: Arc<dyn PageAllocator>,
    /// Queue memory visible to both kernels by physical address
    pub queues: Arc<SharedQueues>,
}
