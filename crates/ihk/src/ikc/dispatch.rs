/// Per-CPU interrupt dispatch
///
/// Scans the CPU's dispatch list under its lock. The lock is dropped around
/// every handler call and re-taken afterwards; scanning resumes at the
/// channel just served, so packets that arrive mid-scan are picked up.

use super::channel::Channel;
use super::manager::LockedList;
use crate::types::CpuId;
use std::sync::Arc;

/// Deliver everything ready for `cpu`; returns the number of packets handled
pub fn drain(list: &LockedList<Channel>, cpu: CpuId) -> usize {
    let mut delivered = 0;
    let mut guard = list.lock();
    let mut idx = 0;

    while idx < guard.len() {
        let channel = guard[idx].clone();

        while channel.has_work_for(cpu) {
            drop(guard);
            if channel.deliver_one() {
                delivered += 1;
            }
            guard = list.lock();
        }

        // The list may have changed while unlocked
        idx = match guard.iter().position(|c| Arc::ptr_eq(c, &channel)) {
            Some(pos) => pos + 1,
            None => idx,
        };
    }

    if delivered > 0 {
        log::trace!("{}: dispatched {} packets", cpu, delivered);
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::allocator::PhysPageAllocator;
    use crate::hal::sim::NullIrq;
    use crate::ikc::channel::{handler, ChannelKind};
    use crate::ikc::manager::ChannelManager;
    use crate::ikc::packet::IkcPacket;
    use crate::ikc::queue::SharedQueues;
    use crate::types::OsId;
    use parking_lot::Mutex;

    fn manager() -> ChannelManager {
        let queues = Arc::new(SharedQueues::new(Arc::new(PhysPageAllocator::default())));
        ChannelManager::new(2, queues, Arc::new(NullIrq::default()), 1, 0xd1)
    }

    fn inject(channel: &Channel, value: u64) {
        channel
            .recv_queue()
            .write(&IkcPacket::new(9, [value, 0, 0, 0, 0, 0]))
            .unwrap();
    }

    #[test]
    fn delivers_in_order_on_matching_cpu() {
        let mgr = manager();
        let ch = mgr.create_channel(OsId(0), ChannelKind::Regular, CpuId(1), CpuId(5)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ch.set_handler(handler(move |_, pkt| sink.lock().push(pkt.args[0])));
        ch.enable();

        for i in 0..10 {
            inject(&ch, i);
        }
        assert_eq!(mgr.handle_interrupt(CpuId(0)), 0);
        assert_eq!(mgr.handle_interrupt(CpuId(1)), 10);
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn disabled_channels_are_skipped() {
        let mgr = manager();
        let ch = mgr.create_channel(OsId(0), ChannelKind::Regular, CpuId(0), CpuId(5)).unwrap();
        ch.set_handler(handler(|_, _| {}));
        inject(&ch, 1);
        assert_eq!(mgr.handle_interrupt(CpuId(0)), 0);
        ch.enable();
        assert_eq!(mgr.handle_interrupt(CpuId(0)), 1);
    }

    #[test]
    fn read_affinity_is_respected() {
        let mgr = manager();
        let ch = mgr.create_channel(OsId(0), ChannelKind::Regular, CpuId(0), CpuId(5)).unwrap();
        ch.set_handler(handler(|_, _| {}));
        ch.enable();
        ch.recv_queue().set_read_cpu(CpuId(1));
        inject(&ch, 1);
        assert_eq!(mgr.handle_interrupt(CpuId(0)), 0);
    }

    #[test]
    fn handler_may_create_channels_mid_scan() {
        let mgr = Arc::new(manager());
        let first = mgr.create_channel(OsId(0), ChannelKind::Regular, CpuId(0), CpuId(5)).unwrap();
        let weak = Arc::downgrade(&mgr);
        let created = Arc::new(Mutex::new(Vec::new()));
        let created_in_handler = created.clone();
        first.set_handler(handler(move |_, _| {
            if let Some(mgr) = weak.upgrade() {
                let ch = mgr
                    .create_channel(OsId(0), ChannelKind::Regular, CpuId(0), CpuId(6))
                    .unwrap();
                created_in_handler.lock().push(ch);
            }
        }));
        first.enable();
        inject(&first, 1);
        inject(&first, 2);

        assert_eq!(mgr.handle_interrupt(CpuId(0)), 2);
        assert_eq!(created.lock().len(), 2);
        assert_eq!(mgr.dispatch_list_len(CpuId(0)), 3);
    }
}
