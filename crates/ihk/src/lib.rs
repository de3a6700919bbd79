/// IHK - Interface for Heterogeneous Kernels
///
/// Partitions a chip so a lightweight kernel runs on a subset of cores and
/// memory next to the host kernel, and provides the inter-kernel channels
/// the two use to talk.

pub mod config;
pub mod device;
pub mod error;
pub mod handle;
pub mod hal;
pub mod ikc;
pub mod os;
pub mod registry;
pub mod types;

pub use config::{ConfigError, IhkConfig, SimConfig, TopologyConfig};
pub use device::IhkDevice;
pub use error::{IhkError, Result};
pub use handle::Handle;
pub use hal::sim::{BootAck, LwkBehavior, SimChip};
pub use hal::Platform;
pub use ikc::{Channel, IkcPacket, SendOptions};
pub use os::boot_param::{IkcMapEntry, NmiMode};
pub use os::OsInstance;
pub use registry::ResourceRegistry;
pub use types::{
    ChannelId, ChipTopology, CpuId, CpuInfo, Credentials, KernelImage, MemChunk, OsId, OsStatus,
    PhysAddr, PAGE_SIZE,
};
