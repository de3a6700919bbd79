/// Resource Registry - ownership of every CPU and memory chunk on the chip
///
/// A resource is FREE, RESERVED, or ASSIGNED to one instance, and only moves
/// FREE -> RESERVED -> ASSIGNED and back the same way. Every call validates
/// the whole set before touching anything, so a failed call leaves the
/// tables unchanged.

use crate::error::{IhkError, Result};
use crate::types::{ChipTopology, CpuId, MemChunk, OsId};
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Free,
    Reserved,
    Assigned(OsId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    base: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy)]
struct ChunkSlot {
    chunk: MemChunk,
    owner: Ownership,
}

struct Tables {
    cpus: Vec<Ownership>,
    /// Reserved or assigned chunks; free memory lives in `free`
    chunks: Vec<ChunkSlot>,
    /// Free extents per topology memory node, sorted by base
    free: Vec<Vec<Extent>>,
}

pub struct ResourceRegistry {
    topology: ChipTopology,
    granule: u64,
    max_chunks: usize,
    tables: Mutex<Tables>,
}

impl ResourceRegistry {
    pub fn new(topology: ChipTopology, granule: u64, max_chunks: usize) -> Self {
        let tables = Tables {
            cpus: vec![Ownership::Free; topology.num_cpus()],
            chunks: Vec::new(),
            free: topology
                .memory
                .iter()
                .map(|n| {
                    vec![Extent {
                        base: n.base,
                        size: n.size,
                    }]
                })
                .collect(),
        };
        log::info!(
            "Registry: {} cpus, {} memory nodes, granule {} KiB",
            topology.num_cpus(),
            topology.num_nodes(),
            granule >> 10
        );
        Self {
            topology,
            granule: granule.max(1),
            max_chunks,
            tables: Mutex::new(tables),
        }
    }

    pub fn topology(&self) -> &ChipTopology {
        &self.topology
    }

    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    fn check_cpu_set(&self, cpus: &[CpuId]) -> Result<()> {
        if cpus.len() > self.topology.num_cpus() {
            return Err(IhkError::invalid(format!(
                "{} cpus requested, chip has {}",
                cpus.len(),
                self.topology.num_cpus()
            )));
        }
        let mut seen = HashSet::with_capacity(cpus.len());
        for &cpu in cpus {
            if cpu.0 as usize >= self.topology.num_cpus() {
                return Err(IhkError::invalid(format!("{} out of range", cpu)));
            }
            if !seen.insert(cpu) {
                return Err(IhkError::invalid(format!("{} listed twice", cpu)));
            }
        }
        Ok(())
    }

    pub fn reserve_cpus(&self, cpus: &[CpuId]) -> Result<()> {
        self.check_cpu_set(cpus)?;
        let mut tables = self.tables.lock();
        if let Some(&cpu) = cpus
            .iter()
            .find(|c| tables.cpus[c.0 as usize] != Ownership::Free)
        {
            return Err(IhkError::busy(format!("{} is not free", cpu)));
        }
        for cpu in cpus {
            tables.cpus[cpu.0 as usize] = Ownership::Reserved;
        }
        log::debug!("Reserved {} cpus", cpus.len());
        Ok(())
    }

    pub fn release_cpus(&self, cpus: &[CpuId]) -> Result<()> {
        self.check_cpu_set(cpus)?;
        let mut tables = self.tables.lock();
        if let Some(&cpu) = cpus
            .iter()
            .find(|c| tables.cpus[c.0 as usize] != Ownership::Reserved)
        {
            return Err(IhkError::invalid(format!("{} is not reserved", cpu)));
        }
        for cpu in cpus {
            tables.cpus[cpu.0 as usize] = Ownership::Free;
        }
        log::debug!("Released {} cpus", cpus.len());
        Ok(())
    }

    pub fn assign_cpus(&self, os: OsId, cpus: &[CpuId]) -> Result<()> {
        self.check_cpu_set(cpus)?;
        let mut tables = self.tables.lock();
        for &cpu in cpus {
            match tables.cpus[cpu.0 as usize] {
                Ownership::Reserved => {}
                Ownership::Free => {
                    return Err(IhkError::invalid(format!("{} is not reserved", cpu)))
                }
                Ownership::Assigned(owner) => {
                    return Err(IhkError::busy(format!("{} already assigned to {}", cpu, owner)))
                }
            }
        }
        for cpu in cpus {
            tables.cpus[cpu.0 as usize] = Ownership::Assigned(os);
        }
        log::debug!("{}: assigned {} cpus", os, cpus.len());
        Ok(())
    }

    pub fn unassign_cpus(&self, os: OsId, cpus: &[CpuId]) -> Result<()> {
        self.check_cpu_set(cpus)?;
        let mut tables = self.tables.lock();
        if let Some(&cpu) = cpus
            .iter()
            .find(|c| tables.cpus[c.0 as usize] != Ownership::Assigned(os))
        {
            return Err(IhkError::invalid(format!("{} is not assigned to {}", cpu, os)));
        }
        for cpu in cpus {
            tables.cpus[cpu.0 as usize] = Ownership::Reserved;
        }
        log::debug!("{}: unassigned {} cpus", os, cpus.len());
        Ok(())
    }

    fn cpus_with(&self, owner: Ownership) -> Vec<CpuId> {
        self.tables
            .lock()
            .cpus
            .iter()
            .enumerate()
            .filter(|(_, o)| **o == owner)
            .map(|(i, _)| CpuId(i as u32))
            .collect()
    }

    /// Reserved but unassigned CPUs, ascending
    pub fn reserved_cpus(&self) -> Vec<CpuId> {
        self.cpus_with(Ownership::Reserved)
    }

    pub fn num_reserved_cpus(&self) -> usize {
        self.reserved_cpus().len()
    }

    pub fn assigned_cpus(&self, os: OsId) -> Vec<CpuId> {
        self.cpus_with(Ownership::Assigned(os))
    }

    pub fn cpu_state(&self, cpu: CpuId) -> Option<Ownership> {
        self.tables.lock().cpus.get(cpu.0 as usize).copied()
    }

    fn node_index(&self, numa_node: u32) -> Result<usize> {
        self.topology
            .memory
            .iter()
            .position(|n| n.numa_node == numa_node)
            .ok_or_else(|| IhkError::invalid(format!("no memory on node {}", numa_node)))
    }

    fn check_chunk_count(&self, count: usize) -> Result<()> {
        if count > self.max_chunks {
            return Err(IhkError::invalid(format!(
                "{} chunks requested, limit is {}",
                count, self.max_chunks
            )));
        }
        Ok(())
    }

    /// Carve each request out of its node's free memory. Sizes are rounded
    /// up to the granule; the granted chunks are returned in request order.
    pub fn reserve_mem(&self, requests: &[MemChunk]) -> Result<Vec<MemChunk>> {
        self.check_chunk_count(requests.len())?;
        let mut tables = self.tables.lock();
        let mut free = tables.free.clone();
        let mut granted = Vec::with_capacity(requests.len());

        for req in requests {
            if req.size == 0 {
                return Err(IhkError::invalid("zero-sized memory request"));
            }
            let node = self.node_index(req.numa_node)?;
            let size = req
                .size
                .checked_next_multiple_of(self.granule)
                .ok_or_else(|| IhkError::invalid(format!("size {:#x} too large", req.size)))?;

            let extents = &mut free[node];
            let pos = extents.iter().position(|e| e.size >= size).ok_or_else(|| {
                IhkError::ResourceExhausted(format!(
                    "no {} MiB extent on node {}",
                    size >> 20,
                    req.numa_node
                ))
            })?;
            let base = extents[pos].base;
            extents[pos].base += size;
            extents[pos].size -= size;
            if extents[pos].size == 0 {
                extents.remove(pos);
            }
            granted.push(MemChunk::new(base, size, req.numa_node));
        }

        tables.free = free;
        tables.chunks.extend(granted.iter().map(|&chunk| ChunkSlot {
            chunk,
            owner: Ownership::Reserved,
        }));
        log::debug!("Reserved {} memory chunks", granted.len());
        Ok(granted)
    }

    /// Indices of the slots matching `chunks` exactly, all owned by `owner`
    fn match_chunks(tables: &Tables, chunks: &[MemChunk], owner: Ownership) -> Result<Vec<usize>> {
        let mut indices = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let idx = tables
                .chunks
                .iter()
                .position(|s| s.chunk == *chunk && s.owner == owner)
                .ok_or_else(|| {
                    IhkError::invalid(format!(
                        "chunk {:#x}+{:#x} on node {} is not {:?}",
                        chunk.addr, chunk.size, chunk.numa_node, owner
                    ))
                })?;
            if indices.contains(&idx) {
                return Err(IhkError::invalid(format!("chunk {:#x} listed twice", chunk.addr)));
            }
            indices.push(idx);
        }
        Ok(indices)
    }

    pub fn release_mem(&self, chunks: &[MemChunk]) -> Result<()> {
        self.check_chunk_count(chunks.len())?;
        let mut tables = self.tables.lock();
        let mut indices = Self::match_chunks(&tables, chunks, Ownership::Reserved)?;

        indices.sort_unstable_by(|a, b| b.cmp(a));
        for idx in indices {
            let slot = tables.chunks.remove(idx);
            let node = self.node_index(slot.chunk.numa_node)?;
            insert_extent(
                &mut tables.free[node],
                Extent {
                    base: slot.chunk.addr,
                    size: slot.chunk.size,
                },
            );
        }
        log::debug!("Released {} memory chunks", chunks.len());
        Ok(())
    }

    pub fn assign_mem(&self, os: OsId, chunks: &[MemChunk]) -> Result<()> {
        self.check_chunk_count(chunks.len())?;
        let mut tables = self.tables.lock();
        for chunk in chunks {
            let held = tables
                .chunks
                .iter()
                .any(|s| s.chunk == *chunk && matches!(s.owner, Ownership::Assigned(_)));
            if held {
                return Err(IhkError::busy(format!("chunk {:#x} already assigned", chunk.addr)));
            }
        }
        let indices = Self::match_chunks(&tables, chunks, Ownership::Reserved)?;
        for idx in indices {
            tables.chunks[idx].owner = Ownership::Assigned(os);
        }
        log::debug!("{}: assigned {} memory chunks", os, chunks.len());
        Ok(())
    }

    pub fn unassign_mem(&self, os: OsId, chunks: &[MemChunk]) -> Result<()> {
        self.check_chunk_count(chunks.len())?;
        let mut tables = self.tables.lock();
        let indices = Self::match_chunks(&tables, chunks, Ownership::Assigned(os))?;
        for idx in indices {
            tables.chunks[idx].owner = Ownership::Reserved;
        }
        log::debug!("{}: unassigned {} memory chunks", os, chunks.len());
        Ok(())
    }

    fn chunks_with(&self, owner: Ownership) -> Vec<MemChunk> {
        let mut chunks: Vec<MemChunk> = self
            .tables
            .lock()
            .chunks
            .iter()
            .filter(|s| s.owner == owner)
            .map(|s| s.chunk)
            .collect();
        chunks.sort_by_key(|c| c.addr);
        chunks
    }

    pub fn reserved_mem(&self) -> Vec<MemChunk> {
        self.chunks_with(Ownership::Reserved)
    }

    pub fn num_reserved_mem(&self) -> usize {
        self.reserved_mem().len()
    }

    pub fn assigned_mem(&self, os: OsId) -> Vec<MemChunk> {
        self.chunks_with(Ownership::Assigned(os))
    }

    /// Free extents as chunks, one entry per contiguous range
    pub fn available_mem(&self) -> Vec<MemChunk> {
        let tables = self.tables.lock();
        self.topology
            .memory
            .iter()
            .zip(&tables.free)
            .flat_map(|(node, extents)| {
                extents
                    .iter()
                    .map(move |e| MemChunk::new(e.base, e.size, node.numa_node))
            })
            .collect()
    }
}

/// Insert keeping `extents` sorted and merging with touching neighbours
fn insert_extent(extents: &mut Vec<Extent>, extent: Extent) {
    let pos = extents.partition_point(|e| e.base < extent.base);
    extents.insert(pos, extent);

    if pos + 1 < extents.len() && extents[pos].base + extents[pos].size == extents[pos + 1].base {
        extents[pos].size += extents[pos + 1].size;
        extents.remove(pos + 1);
    }
    if pos > 0 && extents[pos - 1].base + extents[pos - 1].size == extents[pos].base {
        extents[pos - 1].size += extents[pos].size;
        extents.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new(ChipTopology::uniform(16, 2, 256 * MIB), 4 * MIB, 64)
    }

    #[test]
    fn reserve_is_all_or_nothing() {
        let reg = registry();
        reg.reserve_cpus(&[CpuId(3)]).unwrap();
        let err = reg.reserve_cpus(&[CpuId(2), CpuId(3), CpuId(4)]).unwrap_err();
        assert!(matches!(err, IhkError::ResourceBusy(_)));
        assert_eq!(reg.reserved_cpus(), vec![CpuId(3)]);

        let err = reg.reserve_cpus(&[CpuId(5), CpuId(16)]).unwrap_err();
        assert!(matches!(err, IhkError::InvalidArgument(_)));
        assert_eq!(reg.cpu_state(CpuId(5)), Some(Ownership::Free));

        let err = reg.reserve_cpus(&[CpuId(6), CpuId(6)]).unwrap_err();
        assert!(matches!(err, IhkError::InvalidArgument(_)));
    }

    #[test]
    fn no_direct_assigned_to_free() {
        let reg = registry();
        reg.reserve_cpus(&[CpuId(1), CpuId(2)]).unwrap();
        reg.assign_cpus(OsId(0), &[CpuId(1)]).unwrap();
        assert!(matches!(
            reg.release_cpus(&[CpuId(1)]),
            Err(IhkError::InvalidArgument(_))
        ));
        assert!(matches!(
            reg.assign_cpus(OsId(1), &[CpuId(1)]),
            Err(IhkError::ResourceBusy(_))
        ));
        reg.unassign_cpus(OsId(0), &[CpuId(1)]).unwrap();
        reg.release_cpus(&[CpuId(1), CpuId(2)]).unwrap();
        assert_eq!(reg.num_reserved_cpus(), 0);
    }

    #[test]
    fn assign_requires_reservation() {
        let reg = registry();
        assert!(matches!(
            reg.assign_cpus(OsId(0), &[CpuId(4)]),
            Err(IhkError::InvalidArgument(_))
        ));
    }

    #[test]
    fn memory_rounds_to_granule_and_coalesces() {
        let reg = registry();
        let got = reg
            .reserve_mem(&[MemChunk::request(MIB, 0), MemChunk::request(10 * MIB, 0)])
            .unwrap();
        assert_eq!(got[0].size, 4 * MIB);
        assert_eq!(got[1].size, 12 * MIB);
        assert_eq!(got[1].addr, got[0].end());

        reg.release_mem(&got[..1]).unwrap();
        reg.release_mem(&got[1..]).unwrap();
        let avail = reg.available_mem();
        assert_eq!(avail.len(), 2);
        assert_eq!(avail[0].size, 256 * MIB);
    }

    #[test]
    fn memory_failures_leave_state_alone() {
        let reg = registry();
        let err = reg
            .reserve_mem(&[MemChunk::request(8 * MIB, 0), MemChunk::request(8 * MIB, 7)])
            .unwrap_err();
        assert!(matches!(err, IhkError::InvalidArgument(_)));

        let err = reg
            .reserve_mem(&[MemChunk::request(8 * MIB, 1), MemChunk::request(512 * MIB, 1)])
            .unwrap_err();
        assert!(matches!(err, IhkError::ResourceExhausted(_)));
        assert_eq!(reg.num_reserved_mem(), 0);
        assert_eq!(reg.available_mem()[1].size, 256 * MIB);
    }

    #[test]
    fn memory_assignment_round_trip() {
        let reg = registry();
        let got = reg.reserve_mem(&[MemChunk::request(64 * MIB, 1)]).unwrap();
        reg.assign_mem(OsId(2), &got).unwrap();
        assert!(reg.reserved_mem().is_empty());
        assert_eq!(reg.assigned_mem(OsId(2)), got);
        assert!(matches!(
            reg.release_mem(&got),
            Err(IhkError::InvalidArgument(_))
        ));
        assert!(matches!(
            reg.unassign_mem(OsId(1), &got),
            Err(IhkError::InvalidArgument(_))
        ));
        reg.unassign_mem(OsId(2), &got).unwrap();
        reg.release_mem(&got).unwrap();
    }

    #[test]
    fn chunk_count_bound() {
        let reg = registry();
        let requests = vec![MemChunk::request(MIB, 0); 65];
        assert!(matches!(
            reg.reserve_mem(&requests),
            Err(IhkError::InvalidArgument(_))
        ));
    }
}
