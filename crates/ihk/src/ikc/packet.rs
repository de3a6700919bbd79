/// IKC packet wire format and the master-channel messages carried in it

use crate::types::{ChannelId, CpuId, PhysAddr};
use bytemuck::{Pod, Zeroable};

/// Size of one queue slot
pub const PACKET_SIZE: usize = 64;

/// Number of 64-bit words in a packet
pub const PACKET_WORDS: usize = PACKET_SIZE / 8;

/// One fixed-size message as it sits in a queue slot
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct IkcPacket {
    pub channel_id: u32,
    pub msg: u32,
    pub seq: u64,
    pub args: [u64; 6],
}

const _: () = assert!(std::mem::size_of::<IkcPacket>() == PACKET_SIZE);

impl IkcPacket {
    pub fn new(msg: u32, args: [u64; 6]) -> Self {
        Self {
            channel_id: 0,
            msg,
            seq: 0,
            args,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn to_words(&self) -> [u64; PACKET_WORDS] {
        bytemuck::cast(*self)
    }

    pub fn from_words(words: [u64; PACKET_WORDS]) -> Self {
        bytemuck::cast(words)
    }
}

const MSG_CHANNEL_OPEN: u32 = 0x1001;
const MSG_CHANNEL_CLOSE: u32 = 0x1002;
const MSG_SHUTDOWN: u32 = 0x1003;
const MSG_SHUTDOWN_ACK: u32 = 0x1004;

/// Control messages exchanged on an instance's master channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterMessage {
    /// A host channel is live; the LWK maps the queues by physical address
    ChannelOpen {
        id: ChannelId,
        /// Queue the host writes
        send_pa: PhysAddr,
        /// Queue the host reads
        recv_pa: PhysAddr,
        lwk_cpu: CpuId,
        host_cpu: CpuId,
    },
    ChannelClose {
        id: ChannelId,
    },
    Shutdown,
    ShutdownAck,
}

impl MasterMessage {
    pub fn encode(&self) -> IkcPacket {
        match *self {
            MasterMessage::ChannelOpen {
                id,
                send_pa,
                recv_pa,
                lwk_cpu,
                host_cpu,
            } => IkcPacket::new(
                MSG_CHANNEL_OPEN,
                [
                    id.0 as u64,
                    send_pa.0,
                    recv_pa.0,
                    lwk_cpu.0 as u64,
                    host_cpu.0 as u64,
                    0,
                ],
            ),
            MasterMessage::ChannelClose { id } => {
                IkcPacket::new(MSG_CHANNEL_CLOSE, [id.0 as u64, 0, 0, 0, 0, 0])
            }
            MasterMessage::Shutdown => IkcPacket::new(MSG_SHUTDOWN, [0; 6]),
            MasterMessage::ShutdownAck => IkcPacket::new(MSG_SHUTDOWN_ACK, [0; 6]),
        }
    }

    /// `None` for anything that is not a master message
    pub fn decode(packet: &IkcPacket) -> Option<Self> {
        let a = &packet.args;
        match packet.msg {
            MSG_CHANNEL_OPEN => Some(MasterMessage::ChannelOpen {
                id: ChannelId(a[0] as u32),
                send_pa: PhysAddr(a[1]),
                recv_pa: PhysAddr(a[2]),
                lwk_cpu: CpuId(a[3] as u32),
                host_cpu: CpuId(a[4] as u32),
            }),
            MSG_CHANNEL_CLOSE => Some(MasterMessage::ChannelClose {
                id: ChannelId(a[0] as u32),
            }),
            MSG_SHUTDOWN => Some(MasterMessage::Shutdown),
            MSG_SHUTDOWN_ACK => Some(MasterMessage::ShutdownAck),
            _ => None,
        }
    }
}
