/// Inter-Kernel Communication - channels of paired ring-buffer queues
///
/// Packets are written into a queue in shared memory, the destination CPU
/// is interrupted, and that CPU's dispatcher runs the channel handler.

pub mod channel;
pub mod dispatch;
pub mod manager;
pub mod master;
pub mod packet;
pub mod queue;

pub use channel::{handler, ikc_send, Channel, ChannelKind, ChannelStats, PacketHandler, RemoteEndpoint, SendOptions};
pub use manager::{ChannelManager, LockedList};
pub use packet::{IkcPacket, MasterMessage};
pub use queue::{Queue, QueueError, SharedQueues};
