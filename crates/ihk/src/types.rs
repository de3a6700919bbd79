/// Core types shared by the registry, the IKC layer and the OS lifecycle
///
/// These are the small handles that flow between the host-side components.
/// Resources are always named by their chip-wide logical index, never by
/// pointer.

use serde::Deserialize;
use std::fmt;

/// Size of a page in the shared physical memory model
pub const PAGE_SIZE: usize = 4096;

/// Chip-wide logical CPU index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Index of an OS instance slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsId(pub usize);

impl fmt::Display for OsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "os{}", self.0)
    }
}

/// Globally unique IKC channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Physical address in the shared memory model
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(pub u64);

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Static description of one CPU on the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    /// Chip-wide logical index
    pub id: CpuId,
    /// Hardware id (APIC id / MPIDR)
    pub hw_id: u32,
    /// NUMA node the core belongs to
    pub numa_node: u32,
}

/// A described range of physical memory with a NUMA node tag
///
/// When used as a reservation request only `size` and `numa_node` are
/// meaningful; the registry fills in `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct MemChunk {
    #[serde(default)]
    pub addr: u64,
    pub size: u64,
    pub numa_node: u32,
}

impl MemChunk {
    pub fn new(addr: u64, size: u64, numa_node: u32) -> Self {
        Self {
            addr,
            size,
            numa_node,
        }
    }

    /// A reservation request for `size` bytes on `numa_node`
    pub fn request(size: u64, numa_node: u32) -> Self {
        Self::new(0, size, numa_node)
    }

    pub fn end(&self) -> u64 {
        self.addr + self.size
    }
}

/// Physical memory owned by one NUMA node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryNode {
    pub numa_node: u32,
    pub base: u64,
    pub size: u64,
}

/// What the host knows about the chip. Discovery itself is external.
#[derive(Debug, Clone, Default)]
pub struct ChipTopology {
    pub cpus: Vec<CpuInfo>,
    pub memory: Vec<MemoryNode>,
}

impl ChipTopology {
    /// Uniform topology: `num_cpus` cores split into contiguous blocks across
    /// `numa_nodes` nodes, each node owning `mem_per_node` bytes.
    pub fn uniform(num_cpus: u32, numa_nodes: u32, mem_per_node: u64) -> Self {
        let numa_nodes = numa_nodes.max(1);
        let per_node = num_cpus.div_ceil(numa_nodes).max(1);
        let cpus = (0..num_cpus)
            .map(|i| CpuInfo {
                id: CpuId(i),
                hw_id: i,
                numa_node: i / per_node,
            })
            .collect();
        // Leave the first 1 GiB to the host kernel image and firmware
        let memory = (0..numa_nodes)
            .map(|n| MemoryNode {
                numa_node: n,
                base: (1u64 << 30) + n as u64 * mem_per_node,
                size: mem_per_node,
            })
            .collect();
        Self { cpus, memory }
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, id: CpuId) -> Option<&CpuInfo> {
        self.cpus.get(id.0 as usize)
    }

    pub fn num_nodes(&self) -> usize {
        self.memory.len()
    }
}

/// Identity of the caller of a management operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }

    pub fn user(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// Externally visible state of an OS instance
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OsStatus {
    /// No instance in this slot
    Absent = 0,
    /// Created, resources may still change
    NotBooted = 1,
    /// Cores started, LWK has not acknowledged yet
    Booting = 2,
    /// First acknowledgement seen
    Booted = 3,
    /// Second acknowledgement seen, channels usable
    Ready = 4,
    /// LWK observed doing real work
    Running = 5,
    ShuttingDown = 6,
    Inactive = 7,
    /// A required acknowledgement or kill confirmation never arrived
    HungUp = 8,
}

impl OsStatus {
    /// States in which the instance's resources are in use by the LWK
    pub fn is_live(self) -> bool {
        matches!(
            self,
            OsStatus::Booting | OsStatus::Booted | OsStatus::Ready | OsStatus::Running
        )
    }
}

/// Kernel image handed to the boot transport
#[derive(Debug, Clone)]
pub struct KernelImage {
    /// Physical entry point the cores jump to
    pub entry: PhysAddr,
    pub bytes: Vec<u8>,
}

impl KernelImage {
    pub fn new(entry: PhysAddr, bytes: Vec<u8>) -> Self {
        Self { entry, bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_topology_spreads_nodes() {
        let topo = ChipTopology::uniform(8, 2, 1 << 30);
        assert_eq!(topo.num_cpus(), 8);
        assert_eq!(topo.cpu(CpuId(3)).unwrap().numa_node, 0);
        assert_eq!(topo.cpu(CpuId(4)).unwrap().numa_node, 1);
        assert_eq!(topo.memory[1].base, topo.memory[0].base + (1 << 30));
    }

    #[test]
    fn live_states() {
        assert!(OsStatus::Ready.is_live());
        assert!(!OsStatus::NotBooted.is_live());
        assert!(!OsStatus::Inactive.is_live());
    }
}
