/// Boot-parameter block - the memory both kernels read before IKC is live
///
/// The host fills in the descriptors before the cores are started and never
/// changes them afterwards. The LWK advances `status` and appends to the
/// kernel message buffer.

use crate::types::{ChannelId, CpuId, CpuInfo, MemChunk, OsId, PhysAddr};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

/// Bytes of kernel messages kept before the oldest lines are dropped
pub const KMSG_CAPACITY: usize = 16 * 1024;

/// Progress reported by the LWK, in the order it is written
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LwkStatus {
    NotBooted = 0,
    Booted = 1,
    Ready = 2,
    Running = 3,
}

impl LwkStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => LwkStatus::NotBooted,
            1 => LwkStatus::Booted,
            2 => LwkStatus::Ready,
            _ => LwkStatus::Running,
        }
    }
}

/// What the LWK should do on the next NMI
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmiMode {
    /// Dump state to the kernel message buffer
    Dump = 0,
    Freeze = 1,
    Unfreeze = 2,
}

impl NmiMode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(NmiMode::Dump),
            1 => Some(NmiMode::Freeze),
            2 => Some(NmiMode::Unfreeze),
            _ => None,
        }
    }
}

/// Location of one shared queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDesc {
    pub phys: PhysAddr,
    pub pages: usize,
}

/// LWK CPU to host interrupt target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkcMapEntry {
    pub lwk_cpu: CpuId,
    pub target: CpuId,
}

#[derive(Default)]
struct Kmsg {
    lines: VecDeque<String>,
    bytes: usize,
}

impl Kmsg {
    fn push(&mut self, line: &str) {
        let line = truncate_bytes(line, KMSG_CAPACITY - 1).to_string();
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > KMSG_CAPACITY {
            match self.lines.pop_front() {
                Some(old) => self.bytes -= old.len() + 1,
                None => break,
            }
        }
    }
}

/// Longest prefix of `text` within `max` bytes that ends on a char boundary
fn truncate_bytes(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub struct BootParamBlock {
    phys: PhysAddr,
    os: OsId,
    cpus: Vec<CpuInfo>,
    memory: Vec<MemChunk>,
    master_id: ChannelId,
    /// Host to LWK
    master_send: QueueDesc,
    /// LWK to host
    master_recv: QueueDesc,
    host_ikc_cpu: CpuId,
    ikc_map: Vec<IkcMapEntry>,
    kargs: String,
    entry: PhysAddr,
    ikc_vector: u32,
    nmi_vector: u32,
    status: AtomicU32,
    nmi_mode: AtomicU32,
    kmsg: Mutex<Kmsg>,
}

impl BootParamBlock {
    pub fn builder(os: OsId, phys: PhysAddr) -> BootParamBuilder {
        BootParamBuilder::new(os, phys)
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn os(&self) -> OsId {
        self.os
    }

    pub fn cpus(&self) -> &[CpuInfo] {
        &self.cpus
    }

    /// Bootstrap processor of the instance
    pub fn bsp(&self) -> Option<CpuId> {
        self.cpus.first().map(|c| c.id)
    }

    pub fn memory(&self) -> &[MemChunk] {
        &self.memory
    }

    pub fn master_id(&self) -> ChannelId {
        self.master_id
    }

    pub fn master_send(&self) -> QueueDesc {
        self.master_send
    }

    pub fn master_recv(&self) -> QueueDesc {
        self.master_recv
    }

    pub fn host_ikc_cpu(&self) -> CpuId {
        self.host_ikc_cpu
    }

    pub fn ikc_map(&self) -> &[IkcMapEntry] {
        &self.ikc_map
    }

    /// Host CPU that an LWK CPU interrupts for IKC
    pub fn ikc_target(&self, lwk_cpu: CpuId) -> CpuId {
        self.ikc_map
            .iter()
            .find(|e| e.lwk_cpu == lwk_cpu)
            .map(|e| e.target)
            .unwrap_or(self.host_ikc_cpu)
    }

    pub fn kargs(&self) -> &str {
        &self.kargs
    }

    pub fn entry(&self) -> PhysAddr {
        self.entry
    }

    pub fn ikc_vector(&self) -> u32 {
        self.ikc_vector
    }

    pub fn nmi_vector(&self) -> u32 {
        self.nmi_vector
    }

    pub fn status(&self) -> LwkStatus {
        LwkStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    /// LWK side. The status never moves backwards.
    pub fn advance_status(&self, status: LwkStatus) {
        self.status.fetch_max(status as u32, Ordering::AcqRel);
    }

    pub fn nmi_mode(&self) -> Option<NmiMode> {
        NmiMode::from_raw(self.nmi_mode.load(Ordering::Acquire))
    }

    pub fn set_nmi_mode(&self, mode: NmiMode) {
        self.nmi_mode.store(mode as u32, Ordering::Release);
    }

    pub fn kmsg_write(&self, line: &str) {
        self.kmsg.lock().push(line);
    }

    pub fn kmsg_read(&self) -> String {
        let kmsg = self.kmsg.lock();
        let mut out = String::with_capacity(kmsg.bytes);
        for line in &kmsg.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn kmsg_clear(&self) {
        *self.kmsg.lock() = Kmsg::default();
    }
}

impl std::fmt::Debug for BootParamBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootParamBlock")
            .field("phys", &self.phys)
            .field("os", &self.os)
            .field("cpus", &self.cpus.len())
            .field("memory", &self.memory.len())
            .field("status", &self.status())
            .finish()
    }
}

/// Builder for [`BootParamBlock`]
pub struct BootParamBuilder {
    block: BootParamBlock,
}

impl BootParamBuilder {
    fn new(os: OsId, phys: PhysAddr) -> Self {
        Self {
            block: BootParamBlock {
                phys,
                os,
                cpus: Vec::new(),
                memory: Vec::new(),
                master_id: ChannelId(0),
                master_send: QueueDesc::default(),
                master_recv: QueueDesc::default(),
                host_ikc_cpu: CpuId(0),
                ikc_map: Vec::new(),
                kargs: String::new(),
                entry: PhysAddr::default(),
                ikc_vector: 0,
                nmi_vector: 0,
                status: AtomicU32::new(LwkStatus::NotBooted as u32),
                nmi_mode: AtomicU32::new(NmiMode::Dump as u32),
                kmsg: Mutex::new(Kmsg::default()),
            },
        }
    }

    pub fn cpus(mut self, cpus: Vec<CpuInfo>) -> Self {
        self.block.cpus = cpus;
        self
    }

    pub fn memory(mut self, memory: Vec<MemChunk>) -> Self {
        self.block.memory = memory;
        self
    }

    pub fn master(mut self, id: ChannelId, send: QueueDesc, recv: QueueDesc) -> Self {
        self.block.master_id = id;
        self.block.master_send = send;
        self.block.master_recv = recv;
        self
    }

    pub fn ikc_map(mut self, host_ikc_cpu: CpuId, map: Vec<IkcMapEntry>) -> Self {
        self.block.host_ikc_cpu = host_ikc_cpu;
        self.block.ikc_map = map;
        self
    }

    pub fn kargs(mut self, kargs: impl Into<String>) -> Self {
        self.block.kargs = kargs.into();
        self
    }

    pub fn entry(mut self, entry: PhysAddr) -> Self {
        self.block.entry = entry;
        self
    }

    pub fn vectors(mut self, ikc: u32, nmi: u32) -> Self {
        self.block.ikc_vector = ikc;
        self.block.nmi_vector = nmi;
        self
    }

    pub fn build(self) -> BootParamBlock {
        self.block
    }
}
