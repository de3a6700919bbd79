//! Management handle - the caller-facing boundary
//!
//! Mirrors the control interface of the host driver: resource sets arrive
//! as an optional buffer plus a signed element count, and every mutating
//! call is checked against the caller's credentials. Argument checks run in
//! a fixed order: count sign, empty no-op, missing buffer, upper bound,
//! short buffer.

use crate::device::IhkDevice;
use crate::error::{IhkError, Result};
use crate::os::boot_param::{IkcMapEntry, NmiMode};
use crate::types::{CpuId, Credentials, KernelImage, MemChunk, OsId, OsStatus};
use std::sync::Arc;

/// Validate a caller-supplied set and narrow it to `count` elements
fn take<'a, T>(items: Option<&'a [T]>, count: i32, bound: usize, what: &str) -> Result<&'a [T]> {
    if count < 0 {
        return Err(IhkError::invalid(format!("negative {} count {}", what, count)));
    }
    if count == 0 {
        return Ok(&[]);
    }
    let items = items.ok_or_else(|| IhkError::fault(format!("null {} set with count {}", what, count)))?;
    let count = count as usize;
    if count > bound {
        return Err(IhkError::invalid(format!(
            "{} count {} exceeds {}",
            what, count, bound
        )));
    }
    items
        .get(..count)
        .ok_or_else(|| IhkError::fault(format!("{} buffer holds {} of {}", what, items.len(), count)))
}

/// Copy `src` into a caller buffer whose declared size must match exactly
fn fill<T: Copy>(out: Option<&mut [T]>, count: i32, src: &[T], what: &str) -> Result<()> {
    if count < 0 || count as usize != src.len() {
        return Err(IhkError::invalid(format!(
            "{} count {} but {} present",
            what,
            count,
            src.len()
        )));
    }
    if src.is_empty() {
        return Ok(());
    }
    let out = out.ok_or_else(|| IhkError::fault(format!("null {} buffer", what)))?;
    let dst = out
        .get_mut(..src.len())
        .ok_or_else(|| IhkError::fault(format!("{} buffer too small", what)))?;
    dst.copy_from_slice(src);
    Ok(())
}

/// An open session on an [`IhkDevice`]
pub struct Handle {
    device: Arc<IhkDevice>,
    creds: Credentials,
}

impl Handle {
    pub fn open(device: Arc<IhkDevice>, creds: Credentials) -> Self {
        log::debug!("Handle opened by uid {} gid {}", creds.uid, creds.gid);
        Self { device, creds }
    }

    pub fn device(&self) -> &Arc<IhkDevice> {
        &self.device
    }

    pub fn credentials(&self) -> Credentials {
        self.creds
    }

    fn privileged(&self) -> Result<()> {
        let cfg = self.device.config();
        if self.creds.uid == 0 || self.creds.uid == cfg.owner_uid || self.creds.gid == cfg.owner_gid {
            Ok(())
        } else {
            Err(IhkError::PermissionDenied(format!(
                "uid {} gid {} may not manage the device",
                self.creds.uid, self.creds.gid
            )))
        }
    }

    fn cpu_bound(&self) -> usize {
        self.device.topology().num_cpus()
    }

    fn mem_bound(&self) -> usize {
        self.device.config().max_mem_chunks
    }

    pub fn reserve_cpus(&self, cpus: Option<&[CpuId]>, count: i32) -> Result<()> {
        self.privileged()?;
        let cpus = take(cpus, count, self.cpu_bound(), "cpu")?;
        if cpus.is_empty() {
            return Ok(());
        }
        self.device.reserve_cpus(cpus)
    }

    pub fn release_cpus(&self, cpus: Option<&[CpuId]>, count: i32) -> Result<()> {
        self.privileged()?;
        let cpus = take(cpus, count, self.cpu_bound(), "cpu")?;
        if cpus.is_empty() {
            return Ok(());
        }
        self.device.release_cpus(cpus)
    }

    pub fn get_num_reserved_cpus(&self) -> i32 {
        self.device.num_reserved_cpus() as i32
    }

    /// `count` must equal the number of reserved CPUs
    pub fn query_cpus(&self, out: Option<&mut [CpuId]>, count: i32) -> Result<()> {
        fill(out, count, &self.device.query_cpus(), "cpu")
    }

    /// Returns the chunks actually granted (addresses filled in, sizes rounded)
    pub fn reserve_mem(&self, chunks: Option<&[MemChunk]>, count: i32) -> Result<Vec<MemChunk>> {
        self.privileged()?;
        let chunks = take(chunks, count, self.mem_bound(), "memory chunk")?;
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        self.device.reserve_mem(chunks)
    }

    pub fn release_mem(&self, chunks: Option<&[MemChunk]>, count: i32) -> Result<()> {
        self.privileged()?;
        let chunks = take(chunks, count, self.mem_bound(), "memory chunk")?;
        if chunks.is_empty() {
            return Ok(());
        }
        self.device.release_mem(chunks)
    }

    pub fn get_num_reserved_mem(&self) -> i32 {
        self.device.num_reserved_mem() as i32
    }

    pub fn query_mem(&self, out: Option<&mut [MemChunk]>, count: i32) -> Result<()> {
        fill(out, count, &self.device.query_mem(), "memory chunk")
    }

    pub fn create_os(&self) -> Result<OsId> {
        self.privileged()?;
        self.device.create_os()
    }

    pub fn destroy_os(&self, os: OsId) -> Result<()> {
        self.privileged()?;
        self.device.destroy_os(os)
    }

    pub fn get_num_os_instances(&self) -> i32 {
        self.device.num_os_instances() as i32
    }

    pub fn os_assign_cpus(&self, os: OsId, cpus: Option<&[CpuId]>, count: i32) -> Result<()> {
        self.privileged()?;
        let cpus = take(cpus, count, self.cpu_bound(), "cpu")?;
        self.device.instance(os)?;
        if cpus.is_empty() {
            return Ok(());
        }
        self.device.os_assign_cpus(os, cpus)
    }

    /// Missing buffer beats lifecycle state, which beats membership
    pub fn os_release_cpus(&self, os: OsId, cpus: Option<&[CpuId]>, count: i32) -> Result<()> {
        self.privileged()?;
        let cpus = take(cpus, count, self.cpu_bound(), "cpu")?;
        self.device.instance(os)?;
        if cpus.is_empty() {
            return Ok(());
        }
        self.device.os_release_cpus(os, cpus)
    }

    pub fn os_get_num_assigned_cpus(&self, os: OsId) -> Result<i32> {
        Ok(self.device.os_num_assigned_cpus(os)? as i32)
    }

    pub fn os_query_cpus(&self, os: OsId, out: Option<&mut [CpuId]>, count: i32) -> Result<()> {
        fill(out, count, &self.device.os_query_cpus(os)?, "cpu")
    }

    pub fn os_assign_mem(&self, os: OsId, chunks: Option<&[MemChunk]>, count: i32) -> Result<()> {
        self.privileged()?;
        let chunks = take(chunks, count, self.mem_bound(), "memory chunk")?;
        self.device.instance(os)?;
        if chunks.is_empty() {
            return Ok(());
        }
        self.device.os_assign_mem(os, chunks)
    }

    pub fn os_release_mem(&self, os: OsId, chunks: Option<&[MemChunk]>, count: i32) -> Result<()> {
        self.privileged()?;
        let chunks = take(chunks, count, self.mem_bound(), "memory chunk")?;
        self.device.instance(os)?;
        if chunks.is_empty() {
            return Ok(());
        }
        self.device.os_release_mem(os, chunks)
    }

    pub fn os_get_num_assigned_mem(&self, os: OsId) -> Result<i32> {
        Ok(self.device.os_num_assigned_mem(os)? as i32)
    }

    pub fn os_query_mem(&self, os: OsId, out: Option<&mut [MemChunk]>, count: i32) -> Result<()> {
        fill(out, count, &self.device.os_query_mem(os)?, "memory chunk")
    }

    pub fn os_load(&self, os: OsId, image: KernelImage) -> Result<()> {
        self.privileged()?;
        self.device.os_load(os, image)
    }

    pub fn os_kargs(&self, os: OsId, kargs: &str) -> Result<()> {
        self.privileged()?;
        self.device.os_kargs(os, kargs)
    }

    pub fn os_set_ikc_map(&self, os: OsId, text: &str) -> Result<()> {
        self.privileged()?;
        self.device.os_set_ikc_map(os, text)
    }

    pub fn os_get_ikc_map(&self, os: OsId) -> Result<Vec<IkcMapEntry>> {
        self.device.os_get_ikc_map(os)
    }

    pub fn os_boot(&self, os: OsId) -> Result<()> {
        self.privileged()?;
        self.device.os_boot(os)
    }

    pub fn os_shutdown(&self, os: OsId) -> Result<()> {
        self.privileged()?;
        self.device.os_shutdown(os)
    }

    pub fn os_get_status(&self, os: OsId) -> OsStatus {
        self.device.os_status(os)
    }

    pub fn os_get_pagesizes(&self, os: OsId) -> Result<Vec<u64>> {
        self.device.os_get_pagesizes(os)
    }

    pub fn os_issue_interrupt(&self, os: OsId, cpu_index: i32, vector: u32) -> Result<()> {
        self.privileged()?;
        let index = usize::try_from(cpu_index)
            .map_err(|_| IhkError::invalid(format!("cpu index {}", cpu_index)))?;
        self.device.os_issue_interrupt(os, index, vector)
    }

    pub fn os_send_nmi(&self, os: OsId, mode: NmiMode) -> Result<()> {
        self.privileged()?;
        self.device.os_send_nmi(os, mode)
    }

    pub fn os_kmsg(&self, os: OsId) -> Result<String> {
        self.device.os_kmsg(os)
    }

    pub fn os_clear_kmsg(&self, os: OsId) -> Result<()> {
        self.privileged()?;
        self.device.os_clear_kmsg(os)
    }
}
