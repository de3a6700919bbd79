/// IHK Device - the host-side manager for one chip
///
/// Owns the resource registry, the channel manager and the OS instance
/// slots, and registers the IKC dispatcher on the interrupt transport.

use crate::config::IhkConfig;
use crate::error::{IhkError, Result};
use crate::hal::Platform;
use crate::ikc::channel::{Channel, PacketHandler};
use crate::ikc::manager::ChannelManager;
use crate::os::boot_param::{IkcMapEntry, NmiMode};
use crate::os::ikc_map::parse_ikc_map;
use crate::os::OsInstance;
use crate::registry::{Ownership, ResourceRegistry};
use crate::types::{ChipTopology, CpuId, KernelImage, MemChunk, OsId, OsStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State shared by every instance on the chip
pub(crate) struct HostContext {
    pub config: IhkConfig,
    pub registry: ResourceRegistry,
    pub channels: Arc<ChannelManager>,
    pub platform: Platform,
}

pub struct IhkDevice {
    ctx: HostContext,
    instances: Mutex<Vec<Option<Arc<OsInstance>>>>,
}

impl IhkDevice {
    pub fn new(config: IhkConfig, topology: ChipTopology, platform: Platform) -> Result<Self> {
        let num_cpus = topology.num_cpus();
        if config.host_ikc_cpu as usize >= num_cpus {
            return Err(IhkError::invalid(format!(
                "host_ikc_cpu {} outside {} cpus",
                config.host_ikc_cpu, num_cpus
            )));
        }
        log::info!(
            "Initializing IHK device: {} cpus, {} memory nodes, {} instance slots",
            num_cpus,
            topology.num_nodes(),
            config.max_os_instances
        );

        let registry = ResourceRegistry::new(topology, config.mem_granule, config.max_mem_chunks);
        let channels = Arc::new(ChannelManager::new(
            num_cpus,
            platform.queues.clone(),
            platform.irq.clone(),
            config.ikc_queue_pages,
            config.ikc_vector,
        ));

        let dispatcher = Arc::downgrade(&channels);
        platform.irq.register_handler(
            config.ikc_vector,
            Arc::new(move |cpu: CpuId| {
                if let Some(channels) = dispatcher.upgrade() {
                    channels.handle_interrupt(cpu);
                }
            }),
        )?;

        Ok(Self {
            instances: Mutex::new(vec![None; config.max_os_instances]),
            ctx: HostContext {
                config,
                registry,
                channels,
                platform,
            },
        })
    }

    pub fn config(&self) -> &IhkConfig {
        &self.ctx.config
    }

    pub fn topology(&self) -> &ChipTopology {
        self.ctx.registry.topology()
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.ctx.registry
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.ctx.channels
    }

    // ---- reservation -------------------------------------------------

    pub fn reserve_cpus(&self, cpus: &[CpuId]) -> Result<()> {
        self.ctx.registry.reserve_cpus(cpus)
    }

    pub fn release_cpus(&self, cpus: &[CpuId]) -> Result<()> {
        self.ctx.registry.release_cpus(cpus)
    }

    pub fn query_cpus(&self) -> Vec<CpuId> {
        self.ctx.registry.reserved_cpus()
    }

    pub fn num_reserved_cpus(&self) -> usize {
        self.ctx.registry.num_reserved_cpus()
    }

    pub fn reserve_mem(&self, requests: &[MemChunk]) -> Result<Vec<MemChunk>> {
        self.ctx.registry.reserve_mem(requests)
    }

    pub fn release_mem(&self, chunks: &[MemChunk]) -> Result<()> {
        self.ctx.registry.release_mem(chunks)
    }

    pub fn query_mem(&self) -> Vec<MemChunk> {
        self.ctx.registry.reserved_mem()
    }

    pub fn num_reserved_mem(&self) -> usize {
        self.ctx.registry.num_reserved_mem()
    }

    /// Unreserved memory, one chunk per contiguous free range
    pub fn available_mem(&self) -> Vec<MemChunk> {
        self.ctx.registry.available_mem()
    }

    // ---- instances ---------------------------------------------------

    pub fn instance(&self, os: OsId) -> Result<Arc<OsInstance>> {
        self.instances
            .lock()
            .get(os.0)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| IhkError::not_found(format!("no instance {}", os)))
    }

    pub fn create_os(&self) -> Result<OsId> {
        let mut slots = self.instances.lock();
        let idx = slots.iter().position(|s| s.is_none()).ok_or_else(|| {
            IhkError::ResourceExhausted(format!("all {} instance slots in use", slots.len()))
        })?;
        let os = OsId(idx);
        slots[idx] = Some(Arc::new(OsInstance::new(os)));
        Ok(os)
    }

    pub fn destroy_os(&self, os: OsId) -> Result<()> {
        let instance = self.instance(os)?;
        instance.destroy(&self.ctx)?;
        if let Some(slot) = self.instances.lock().get_mut(os.0) {
            if slot.as_ref().is_some_and(|i| Arc::ptr_eq(i, &instance)) {
                *slot = None;
            }
        }
        Ok(())
    }

    pub fn num_os_instances(&self) -> usize {
        self.instances.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Ids of existing instances, ascending
    pub fn os_ids(&self) -> Vec<OsId> {
        self.instances
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| OsId(i))
            .collect()
    }

    pub fn os_assign_cpus(&self, os: OsId, cpus: &[CpuId]) -> Result<()> {
        self.instance(os)?
            .while_assignable(|| self.ctx.registry.assign_cpus(os, cpus))
    }

    pub fn os_release_cpus(&self, os: OsId, cpus: &[CpuId]) -> Result<()> {
        self.instance(os)?
            .while_releasable(|| self.ctx.registry.unassign_cpus(os, cpus))
    }

    pub fn os_query_cpus(&self, os: OsId) -> Result<Vec<CpuId>> {
        self.instance(os)?;
        Ok(self.ctx.registry.assigned_cpus(os))
    }

    pub fn os_num_assigned_cpus(&self, os: OsId) -> Result<usize> {
        Ok(self.os_query_cpus(os)?.len())
    }

    pub fn os_assign_mem(&self, os: OsId, chunks: &[MemChunk]) -> Result<()> {
        self.instance(os)?
            .while_assignable(|| self.ctx.registry.assign_mem(os, chunks))
    }

    pub fn os_release_mem(&self, os: OsId, chunks: &[MemChunk]) -> Result<()> {
        self.instance(os)?
            .while_releasable(|| self.ctx.registry.unassign_mem(os, chunks))
    }

    pub fn os_query_mem(&self, os: OsId) -> Result<Vec<MemChunk>> {
        self.instance(os)?;
        Ok(self.ctx.registry.assigned_mem(os))
    }

    pub fn os_num_assigned_mem(&self, os: OsId) -> Result<usize> {
        Ok(self.os_query_mem(os)?.len())
    }

    pub fn os_load(&self, os: OsId, image: KernelImage) -> Result<()> {
        self.instance(os)?.load(image)
    }

    pub fn os_kargs(&self, os: OsId, kargs: &str) -> Result<()> {
        self.instance(os)?.set_kargs(kargs)
    }

    /// Set the IKC map from its text form. Every index must be on the chip
    /// and targets must be host CPUs that are neither reserved nor assigned.
    pub fn os_set_ikc_map(&self, os: OsId, text: &str) -> Result<()> {
        let instance = self.instance(os)?;
        instance.while_assignable(|| Ok(()))?;
        let entries = parse_ikc_map(text, self.topology().num_cpus())?;
        for entry in &entries {
            match self.ctx.registry.cpu_state(entry.target) {
                Some(Ownership::Free) => {}
                Some(_) => {
                    return Err(IhkError::invalid(format!(
                        "ikc target {} is not a host cpu",
                        entry.target
                    )))
                }
                None => {
                    return Err(IhkError::invalid(format!(
                        "ikc target {} out of range",
                        entry.target
                    )))
                }
            }
        }
        instance.set_ikc_map(entries)
    }

    pub fn os_get_ikc_map(&self, os: OsId) -> Result<Vec<IkcMapEntry>> {
        Ok(self.instance(os)?.ikc_map(&self.ctx))
    }

    pub fn os_boot(&self, os: OsId) -> Result<()> {
        self.instance(os)?.boot(&self.ctx)
    }

    pub fn os_shutdown(&self, os: OsId) -> Result<()> {
        self.instance(os)?.shutdown(&self.ctx)
    }

    /// `Absent` when there is no such instance
    pub fn os_status(&self, os: OsId) -> OsStatus {
        self.instance(os)
            .map(|i| i.status())
            .unwrap_or(OsStatus::Absent)
    }

    /// Poll until the instance reports `status`
    pub fn os_wait_for_status(&self, os: OsId, status: OsStatus, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.os_status(os);
            if current == status {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(IhkError::TimedOut(format!(
                    "{} is {:?}, wanted {:?}",
                    os, current, status
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn os_get_pagesizes(&self, os: OsId) -> Result<Vec<u64>> {
        self.instance(os)?;
        Ok(self.ctx.platform.boot.page_sizes())
    }

    pub fn os_issue_interrupt(&self, os: OsId, cpu_index: usize, vector: u32) -> Result<()> {
        self.instance(os)?.issue_interrupt(&self.ctx, cpu_index, vector)
    }

    pub fn os_send_nmi(&self, os: OsId, mode: NmiMode) -> Result<()> {
        self.instance(os)?.send_nmi(&self.ctx, mode)
    }

    pub fn os_kmsg(&self, os: OsId) -> Result<String> {
        Ok(self.instance(os)?.kmsg())
    }

    pub fn os_clear_kmsg(&self, os: OsId) -> Result<()> {
        self.instance(os)?.clear_kmsg();
        Ok(())
    }

    pub fn os_open_channel(
        &self,
        os: OsId,
        lwk_cpu: CpuId,
        handler: PacketHandler,
    ) -> Result<Arc<Channel>> {
        self.instance(os)?.open_channel(&self.ctx, lwk_cpu, handler)
    }

    pub fn os_close_channel(&self, os: OsId, channel: &Arc<Channel>) -> Result<()> {
        self.instance(os)?.close_channel(&self.ctx, channel)
    }
}

impl Drop for IhkDevice {
    fn drop(&mut self) {
        self.ctx.platform.irq.unregister_handler(self.ctx.config.ikc_vector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimChip;
    use crate::types::PhysAddr;
    use crossbeam::channel::bounded;

    fn prepared(cpus: &[CpuId]) -> (SimChip, Arc<IhkDevice>, OsId) {
        let chip = SimChip::new(ChipTopology::uniform(8, 1, 256 << 20));
        let config = IhkConfig {
            ikc_queue_pages: 1,
            boot_poll_limit: 5_000_000,
            shutdown_timeout_ms: 200,
            ..IhkConfig::default()
        };
        let device =
            Arc::new(IhkDevice::new(config, chip.topology().clone(), chip.platform()).unwrap());
        device.reserve_cpus(cpus).unwrap();
        let mem = device.reserve_mem(&[MemChunk::request(32 << 20, 0)]).unwrap();
        let os = device.create_os().unwrap();
        device.os_assign_cpus(os, cpus).unwrap();
        device.os_assign_mem(os, &mem).unwrap();
        device
            .os_load(os, KernelImage::new(PhysAddr(0x20_0000), vec![0u8; 4096]))
            .unwrap();
        (chip, device, os)
    }

    #[test]
    fn boot_waits_for_an_in_flight_release() {
        let (_chip, device, os) = prepared(&[CpuId(4), CpuId(5)]);
        let instance = device.instance(os).unwrap();

        let (tx, rx) = bounded(1);
        let booter = device.clone();
        let boot_thread = instance
            .while_releasable(|| {
                let boot_thread = std::thread::spawn(move || {
                    let _ = tx.send(booter.os_boot(os));
                });
                // Boot is parked on the instance lock until the release lands
                assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
                device.registry().unassign_cpus(os, &[CpuId(5)])?;
                Ok(boot_thread)
            })
            .unwrap();
        boot_thread.join().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        // The LWK only ever saw the cpu that stayed assigned
        let booted: Vec<CpuId> = instance.params().unwrap().cpus().iter().map(|c| c.id).collect();
        assert_eq!(booted, vec![CpuId(4)]);
        assert_eq!(device.os_query_cpus(os).unwrap(), vec![CpuId(4)]);
        assert!(matches!(
            device.os_release_cpus(os, &[CpuId(4)]),
            Err(IhkError::ResourceBusy(_))
        ));
        device.os_shutdown(os).unwrap();
    }

    #[test]
    fn destroyed_instance_refuses_assignment() {
        let (_chip, device, os) = prepared(&[CpuId(4)]);
        let instance = device.instance(os).unwrap();
        let mem = device.os_query_mem(os).unwrap();
        device.os_release_cpus(os, &[CpuId(4)]).unwrap();
        device.os_release_mem(os, &mem).unwrap();
        device.destroy_os(os).unwrap();

        assert_eq!(instance.status(), OsStatus::Absent);
        assert!(matches!(
            instance.while_assignable(|| device.registry().assign_cpus(os, &[CpuId(4)])),
            Err(IhkError::ResourceBusy(_))
        ));
        assert!(device.registry().assigned_cpus(os).is_empty());
        assert!(matches!(device.destroy_os(os), Err(IhkError::NotFound(_))));
    }
}

