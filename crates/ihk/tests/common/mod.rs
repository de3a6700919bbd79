#![allow(dead_code)]

use ihk::{
    ChipTopology, CpuId, Credentials, Handle, IhkConfig, IhkDevice, KernelImage, MemChunk, OsId,
    OsStatus, PhysAddr, SimChip,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const NUM_CPUS: u32 = 16;
pub const NUMA_NODES: u32 = 2;
pub const MEM_PER_NODE: u64 = 256 << 20;

pub struct Host {
    pub chip: SimChip,
    pub device: Arc<IhkDevice>,
    pub root: Handle,
}

impl Host {
    pub fn user(&self, uid: u32, gid: u32) -> Handle {
        Handle::open(self.device.clone(), Credentials::user(uid, gid))
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config() -> IhkConfig {
    IhkConfig {
        ikc_queue_pages: 1,
        boot_poll_limit: 5_000_000,
        shutdown_timeout_ms: 200,
        kill_retry_budget: 3,
        ..IhkConfig::default()
    }
}

pub fn host() -> Host {
    host_with(test_config())
}

pub fn host_with(config: IhkConfig) -> Host {
    init_logging();
    let chip = SimChip::new(ChipTopology::uniform(NUM_CPUS, NUMA_NODES, MEM_PER_NODE));
    let device = Arc::new(
        IhkDevice::new(config, chip.topology().clone(), chip.platform()).expect("device init"),
    );
    let root = Handle::open(device.clone(), Credentials::root());
    Host { chip, device, root }
}

pub fn cpus(range: std::ops::Range<u32>) -> Vec<CpuId> {
    range.map(CpuId).collect()
}

pub fn image() -> KernelImage {
    KernelImage::new(PhysAddr(0x20_0000), vec![0u8; 4096])
}

/// A created instance with reserved and assigned resources, not yet booted
pub struct Prepared {
    pub os: OsId,
    pub cpus: Vec<CpuId>,
    pub mem: Vec<MemChunk>,
}

pub fn prepare(host: &Host, lwk_cpus: &[CpuId], mem_bytes: u64) -> Prepared {
    let h = &host.root;
    let n = lwk_cpus.len() as i32;
    h.reserve_cpus(Some(lwk_cpus), n).expect("reserve cpus");
    let mem = h
        .reserve_mem(Some(&[MemChunk::request(mem_bytes, 0)][..]), 1)
        .expect("reserve mem");
    let os = h.create_os().expect("create os");
    h.os_assign_cpus(os, Some(lwk_cpus), n).expect("assign cpus");
    h.os_assign_mem(os, Some(&mem[..]), mem.len() as i32).expect("assign mem");
    h.os_load(os, image()).expect("load");
    Prepared {
        os,
        cpus: lwk_cpus.to_vec(),
        mem,
    }
}

/// Prepare, boot and wait until the LWK reports ready
pub fn boot_instance(host: &Host, lwk_cpus: &[CpuId]) -> Prepared {
    let p = prepare(host, lwk_cpus, 32 << 20);
    host.root.os_boot(p.os).expect("boot");
    wait_status(host, p.os, OsStatus::Ready);
    p
}

pub fn wait_status(host: &Host, os: OsId, status: OsStatus) {
    host.device
        .os_wait_for_status(os, status, Duration::from_secs(5))
        .unwrap_or_else(|e| panic!("{} never reached {:?}: {}", os, status, e));
}

/// Shut down (if running), unassign, destroy and release everything
pub fn dismantle(host: &Host, p: &Prepared) {
    let h = &host.root;
    if h.os_get_status(p.os).is_live() {
        h.os_shutdown(p.os).expect("shutdown");
    }
    h.os_release_cpus(p.os, Some(&p.cpus[..]), p.cpus.len() as i32)
        .expect("unassign cpus");
    h.os_release_mem(p.os, Some(&p.mem[..]), p.mem.len() as i32)
        .expect("unassign mem");
    h.destroy_os(p.os).expect("destroy");
    h.release_cpus(Some(&p.cpus[..]), p.cpus.len() as i32)
        .expect("release cpus");
    h.release_mem(Some(&p.mem[..]), p.mem.len() as i32)
        .expect("release mem");
}

/// Poll `f` for up to five seconds
pub fn eventually(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    f()
}
