/// OS Instance - lifecycle of one LWK partition
///
/// Initial -> Booting -> Booted -> Ready -> Running -> ShuttingDown ->
/// Inactive, with HungUp when an acknowledgement or a forced kill never
/// confirms. Booted/Ready/Running are read from the boot-parameter status
/// the LWK writes; everything else is host-side state.

pub mod boot_param;
pub mod ikc_map;

use crate::device::HostContext;
use crate::error::{IhkError, Result};
use crate::ikc::channel::{Channel, ChannelKind, PacketHandler, SendOptions};
use crate::ikc::master::{master_handler, wait_master, AckWaiter};
use crate::ikc::packet::MasterMessage;
use crate::types::{CpuId, CpuInfo, KernelImage, OsId, OsStatus};
use boot_param::{BootParamBlock, IkcMapEntry, LwkStatus, NmiMode, QueueDesc};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Pages backing one boot-parameter block
const BOOT_PARAM_PAGES: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    /// Cores started; finer state comes from the LWK
    Started,
    ShuttingDown,
    Inactive,
    HungUp,
    /// Slot freed; every further operation is refused
    Destroyed,
}

struct OsState {
    phase: Phase,
    image: Option<KernelImage>,
    kargs: String,
    ikc_map: Vec<IkcMapEntry>,
    master: Option<Arc<Channel>>,
    params: Option<Arc<BootParamBlock>>,
}

pub struct OsInstance {
    id: OsId,
    state: Mutex<OsState>,
    shutdown_ack: Arc<AckWaiter>,
}

impl OsInstance {
    pub(crate) fn new(id: OsId) -> Self {
        log::info!("{}: created", id);
        Self {
            id,
            state: Mutex::new(OsState {
                phase: Phase::Initial,
                image: None,
                kargs: String::new(),
                ikc_map: Vec::new(),
                master: None,
                params: None,
            }),
            shutdown_ack: Arc::new(AckWaiter::new()),
        }
    }

    pub fn id(&self) -> OsId {
        self.id
    }

    pub fn status(&self) -> OsStatus {
        Self::status_of(&self.state.lock())
    }

    fn status_of(st: &OsState) -> OsStatus {
        match st.phase {
            Phase::Initial => OsStatus::NotBooted,
            Phase::Started => match st.params.as_ref().map(|p| p.status()) {
                Some(LwkStatus::Booted) => OsStatus::Booted,
                Some(LwkStatus::Ready) => OsStatus::Ready,
                Some(LwkStatus::Running) => OsStatus::Running,
                Some(LwkStatus::NotBooted) | None => OsStatus::Booting,
            },
            Phase::ShuttingDown => OsStatus::ShuttingDown,
            Phase::Inactive => OsStatus::Inactive,
            Phase::HungUp => OsStatus::HungUp,
            Phase::Destroyed => OsStatus::Absent,
        }
    }

    pub fn params(&self) -> Option<Arc<BootParamBlock>> {
        self.state.lock().params.clone()
    }

    pub fn master(&self) -> Option<Arc<Channel>> {
        self.state.lock().master.clone()
    }

    /// Run `f` while the instance is held before boot. The state lock is
    /// kept across `f`, so `boot()` cannot start in between.
    pub(crate) fn while_assignable<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let st = self.state.lock();
        if st.phase != Phase::Initial {
            return Err(IhkError::busy(format!(
                "{}: cannot assign resources in {:?}",
                self.id,
                Self::status_of(&st)
            )));
        }
        f()
    }

    /// Run `f` while the LWK is not using the instance's resources, with the
    /// state lock held across `f`
    pub(crate) fn while_releasable<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let st = self.state.lock();
        match st.phase {
            Phase::Initial | Phase::Inactive | Phase::HungUp => f(),
            Phase::Started | Phase::ShuttingDown | Phase::Destroyed => Err(IhkError::busy(
                format!("{}: resources in use ({:?})", self.id, Self::status_of(&st)),
            )),
        }
    }

    pub(crate) fn load(&self, image: KernelImage) -> Result<()> {
        let mut st = self.state.lock();
        if st.phase != Phase::Initial {
            return Err(IhkError::busy(format!("{}: image is fixed after boot", self.id)));
        }
        log::info!(
            "{}: loaded {} byte image, entry {}",
            self.id,
            image.bytes.len(),
            image.entry
        );
        st.image = Some(image);
        Ok(())
    }

    pub(crate) fn set_kargs(&self, kargs: &str) -> Result<()> {
        let mut st = self.state.lock();
        if st.phase != Phase::Initial {
            return Err(IhkError::busy(format!("{}: kargs are fixed after boot", self.id)));
        }
        st.kargs = kargs.to_string();
        Ok(())
    }

    pub fn kargs(&self) -> String {
        self.state.lock().kargs.clone()
    }

    pub(crate) fn set_ikc_map(&self, entries: Vec<IkcMapEntry>) -> Result<()> {
        let mut st = self.state.lock();
        if st.phase != Phase::Initial {
            return Err(IhkError::busy(format!("{}: ikc map is fixed after boot", self.id)));
        }
        st.ikc_map = entries;
        Ok(())
    }

    /// Target for every CPU in `cpus`: the configured one, else `host_cpu`
    fn effective_map(map: &[IkcMapEntry], cpus: &[CpuId], host_cpu: CpuId) -> Vec<IkcMapEntry> {
        cpus.iter()
            .map(|&lwk_cpu| IkcMapEntry {
                lwk_cpu,
                target: map
                    .iter()
                    .find(|e| e.lwk_cpu == lwk_cpu)
                    .map(|e| e.target)
                    .unwrap_or(host_cpu),
            })
            .collect()
    }

    pub(crate) fn ikc_map(&self, ctx: &HostContext) -> Vec<IkcMapEntry> {
        let st = self.state.lock();
        if let Some(params) = &st.params {
            return params.ikc_map().to_vec();
        }
        let cpus = ctx.registry.assigned_cpus(self.id);
        Self::effective_map(&st.ikc_map, &cpus, CpuId(ctx.config.host_ikc_cpu))
    }

    pub(crate) fn boot(&self, ctx: &HostContext) -> Result<()> {
        let mut st = self.state.lock();
        if st.phase != Phase::Initial {
            return Err(IhkError::busy(format!("{}: boot from {:?}", self.id, st.phase)));
        }

        let cpus = ctx.registry.assigned_cpus(self.id);
        let memory = ctx.registry.assigned_mem(self.id);
        if cpus.is_empty() {
            return Err(IhkError::invalid(format!("{}: no cpus assigned", self.id)));
        }
        if memory.is_empty() {
            return Err(IhkError::invalid(format!("{}: no memory assigned", self.id)));
        }
        let image = st
            .image
            .clone()
            .ok_or_else(|| IhkError::invalid(format!("{}: no kernel image loaded", self.id)))?;
        let cpu_infos: Vec<CpuInfo> = cpus
            .iter()
            .filter_map(|&c| ctx.registry.topology().cpu(c).copied())
            .collect();

        let host_cpu = CpuId(ctx.config.host_ikc_cpu);
        if cpus.contains(&host_cpu) {
            return Err(IhkError::invalid(format!(
                "{}: {} is the host IKC cpu",
                self.id, host_cpu
            )));
        }
        if let Some(stray) = st.ikc_map.iter().find(|e| !cpus.contains(&e.lwk_cpu)) {
            return Err(IhkError::invalid(format!(
                "{}: ikc map names {}, which is not assigned",
                self.id, stray.lwk_cpu
            )));
        }
        let bsp = cpus[0];
        let master = ctx
            .channels
            .create_channel(self.id, ChannelKind::Master, host_cpu, bsp)?;
        master.set_handler(master_handler(self.shutdown_ack.clone()));

        let params_phys = match ctx.platform.pages.alloc_pages(BOOT_PARAM_PAGES) {
            Ok(phys) => phys,
            Err(e) => {
                let _ = ctx.channels.destroy_channel(&master);
                return Err(e.into());
            }
        };

        let queue_desc = |q: &crate::ikc::Queue| QueueDesc {
            phys: q.phys(),
            pages: q.pages(),
        };
        let params = Arc::new(
            BootParamBlock::builder(self.id, params_phys)
                .cpus(cpu_infos.clone())
                .memory(memory.clone())
                .master(
                    master.id(),
                    queue_desc(master.send_queue()),
                    queue_desc(master.recv_queue()),
                )
                .ikc_map(host_cpu, Self::effective_map(&st.ikc_map, &cpus, host_cpu))
                .kargs(st.kargs.clone())
                .entry(image.entry)
                .vectors(ctx.config.ikc_vector, ctx.config.nmi_vector)
                .build(),
        );

        master.enable();
        self.shutdown_ack.reset();
        st.master = Some(master.clone());
        st.params = Some(params.clone());
        st.phase = Phase::Started;
        drop(st);

        log::info!(
            "{}: booting on {} cpus with {} memory chunks (bsp {}, master {})",
            self.id,
            cpu_infos.len(),
            memory.len(),
            bsp,
            master.id()
        );

        if let Err(e) = ctx
            .platform
            .boot
            .start_cores(self.id, &cpu_infos, image.entry, &params)
        {
            log::error!("{}: failed to start cores: {}", self.id, e);
            let mut st = self.state.lock();
            st.phase = Phase::Initial;
            st.master = None;
            st.params = None;
            drop(st);
            ctx.channels.destroy_all(self.id);
            ctx.platform.pages.free_pages(params_phys, BOOT_PARAM_PAGES);
            return Err(e.into());
        }

        if !wait_master(&params, LwkStatus::Booted, ctx.config.boot_poll_limit) {
            log::error!(
                "{}: no boot acknowledgement after {} polls",
                self.id,
                ctx.config.boot_poll_limit
            );
            self.state.lock().phase = Phase::HungUp;
            return Err(IhkError::TimedOut(format!(
                "{}: LWK did not acknowledge boot",
                self.id
            )));
        }

        log::info!("{}: booted", self.id);
        Ok(())
    }

    pub(crate) fn shutdown(&self, ctx: &HostContext) -> Result<()> {
        let (params, master) = {
            let mut st = self.state.lock();
            match st.phase {
                Phase::Started => {}
                Phase::ShuttingDown => {
                    return Err(IhkError::busy(format!("{}: shutdown in progress", self.id)))
                }
                other => {
                    return Err(IhkError::busy(format!("{}: not running ({:?})", self.id, other)))
                }
            }
            let params = st
                .params
                .clone()
                .ok_or_else(|| IhkError::busy(format!("{}: no boot parameters", self.id)))?;
            st.phase = Phase::ShuttingDown;
            (params, st.master.clone())
        };
        let cpus: Vec<CpuId> = params.cpus().iter().map(|c| c.id).collect();
        log::info!("{}: shutting down", self.id);

        let mut acked = false;
        if params.status() >= LwkStatus::Ready {
            if let Some(master) = &master {
                self.shutdown_ack.reset();
                match master.try_send(&MasterMessage::Shutdown.encode(), SendOptions::NOTIFY) {
                    Ok(()) => {
                        acked = self
                            .shutdown_ack
                            .wait(Duration::from_millis(ctx.config.shutdown_timeout_ms));
                    }
                    Err(e) => log::warn!("{}: shutdown request failed: {}", self.id, e),
                }
                if !acked {
                    log::warn!(
                        "{}: no shutdown acknowledgement within {} ms, forcing",
                        self.id,
                        ctx.config.shutdown_timeout_ms
                    );
                }
            }
        }

        if !acked {
            if let Err(e) = self.force_stop(ctx, &cpus) {
                self.state.lock().phase = Phase::HungUp;
                return Err(e);
            }
        }

        for &cpu in &cpus {
            if let Err(e) = ctx.platform.boot.reset_core(cpu) {
                log::warn!("{}: reset of {} failed: {}", self.id, cpu, e);
            }
        }
        ctx.channels.destroy_all(self.id);

        let mut st = self.state.lock();
        st.master = None;
        st.phase = Phase::Inactive;
        log::info!("{}: inactive", self.id);
        Ok(())
    }

    /// Kill every core, each within the retry budget
    fn force_stop(&self, ctx: &HostContext, cpus: &[CpuId]) -> Result<()> {
        let budget = ctx.config.kill_retry_budget.max(1);
        for &cpu in cpus {
            let backoff = Backoff::new();
            let mut confirmed = false;
            for attempt in 1..=budget {
                match ctx.platform.boot.kill_core(cpu) {
                    Ok(()) => {
                        confirmed = true;
                        break;
                    }
                    Err(e) => {
                        log::debug!("{}: kill {} attempt {}: {}", self.id, cpu, attempt, e);
                        backoff.snooze();
                    }
                }
            }
            if !confirmed {
                log::error!(
                    "{}: {} did not stop after {} attempts",
                    self.id,
                    cpu,
                    budget
                );
                return Err(IhkError::TimedOut(format!("{}: {} did not stop", self.id, cpu)));
            }
        }
        Ok(())
    }

    /// Check that nothing is assigned and free whatever the instance still
    /// holds. Afterwards every operation on it is refused.
    pub(crate) fn destroy(&self, ctx: &HostContext) -> Result<()> {
        let mut st = self.state.lock();
        if !matches!(st.phase, Phase::Initial | Phase::Inactive | Phase::HungUp) {
            return Err(IhkError::busy(format!(
                "{} is {:?}",
                self.id,
                Self::status_of(&st)
            )));
        }
        let cpus = ctx.registry.assigned_cpus(self.id).len();
        let mem = ctx.registry.assigned_mem(self.id).len();
        if cpus > 0 || mem > 0 {
            return Err(IhkError::busy(format!(
                "{} still holds {} cpus and {} memory chunks",
                self.id, cpus, mem
            )));
        }

        if st.phase == Phase::HungUp {
            if let Some(params) = &st.params {
                for cpu in params.cpus() {
                    if let Err(e) = ctx.platform.boot.reset_core(cpu.id) {
                        log::warn!("{}: reset of {} failed: {}", self.id, cpu.id, e);
                    }
                }
            }
        }
        st.master = None;
        if let Some(params) = st.params.take() {
            ctx.platform.pages.free_pages(params.phys(), BOOT_PARAM_PAGES);
        }
        st.phase = Phase::Destroyed;
        drop(st);
        ctx.channels.destroy_all(self.id);
        log::info!("{}: destroyed", self.id);
        Ok(())
    }

    /// Params of a started instance the LWK has made ready
    fn ready_params(&self) -> Result<(Arc<BootParamBlock>, Arc<Channel>)> {
        let st = self.state.lock();
        match (&st.params, &st.master) {
            (Some(params), Some(master))
                if st.phase == Phase::Started && params.status() >= LwkStatus::Ready =>
            {
                Ok((params.clone(), master.clone()))
            }
            _ => Err(IhkError::busy(format!("{}: not ready for channels", self.id))),
        }
    }

    /// Create, enable and announce a channel to `lwk_cpu`
    pub(crate) fn open_channel(
        &self,
        ctx: &HostContext,
        lwk_cpu: CpuId,
        handler: PacketHandler,
    ) -> Result<Arc<Channel>> {
        let (params, master) = self.ready_params()?;
        if !params.cpus().iter().any(|c| c.id == lwk_cpu) {
            return Err(IhkError::invalid(format!(
                "{}: {} is not part of the instance",
                self.id, lwk_cpu
            )));
        }

        let dest = params.ikc_target(lwk_cpu);
        let channel = ctx
            .channels
            .create_channel(self.id, ChannelKind::Regular, dest, lwk_cpu)?;
        channel.set_handler(handler);
        channel.enable();

        let open = MasterMessage::ChannelOpen {
            id: channel.id(),
            send_pa: channel.send_queue().phys(),
            recv_pa: channel.recv_queue().phys(),
            lwk_cpu,
            host_cpu: dest,
        };
        if let Err(e) = master.send(&open.encode(), SendOptions::NOTIFY) {
            channel.disable();
            let _ = ctx.channels.destroy_channel(&channel);
            return Err(e);
        }
        log::debug!("{}: opened {} to {}", self.id, channel.id(), lwk_cpu);
        Ok(channel)
    }

    pub(crate) fn close_channel(&self, ctx: &HostContext, channel: &Arc<Channel>) -> Result<()> {
        if channel.os() != self.id || channel.kind() == ChannelKind::Master {
            return Err(IhkError::invalid(format!(
                "{} is not a regular channel of {}",
                channel.id(),
                self.id
            )));
        }
        channel.disable();
        if let Some(master) = self.master() {
            let close = MasterMessage::ChannelClose { id: channel.id() };
            if let Err(e) = master.send(&close.encode(), SendOptions::NOTIFY) {
                log::warn!("{}: close of {} not announced: {}", self.id, channel.id(), e);
            }
        }
        ctx.channels.destroy_channel(channel)
    }

    pub(crate) fn send_nmi(&self, ctx: &HostContext, mode: NmiMode) -> Result<()> {
        let params = {
            let st = self.state.lock();
            match (&st.params, st.phase) {
                (Some(params), Phase::Started) => params.clone(),
                _ => return Err(IhkError::busy(format!("{}: not booted", self.id))),
            }
        };
        params.set_nmi_mode(mode);
        for cpu in params.cpus() {
            ctx.platform.irq.send_ipi(cpu.id, ctx.config.nmi_vector)?;
        }
        log::info!("{}: NMI ({:?}) sent to {} cpus", self.id, mode, params.cpus().len());
        Ok(())
    }

    /// Raise `vector` on the instance's `index`-th CPU
    pub(crate) fn issue_interrupt(&self, ctx: &HostContext, index: usize, vector: u32) -> Result<()> {
        let params = {
            let st = self.state.lock();
            match (&st.params, st.phase) {
                (Some(params), Phase::Started) => params.clone(),
                _ => return Err(IhkError::busy(format!("{}: not booted", self.id))),
            }
        };
        let cpu = params.cpus().get(index).ok_or_else(|| {
            IhkError::invalid(format!(
                "{}: cpu index {} out of {}",
                self.id,
                index,
                params.cpus().len()
            ))
        })?;
        ctx.platform.irq.send_ipi(cpu.id, vector)?;
        Ok(())
    }

    pub fn kmsg(&self) -> String {
        self.params().map(|p| p.kmsg_read()).unwrap_or_default()
    }

    pub fn clear_kmsg(&self) {
        if let Some(params) = self.params() {
            params.kmsg_clear();
        }
    }
}

impl std::fmt::Debug for OsInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsInstance")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}
