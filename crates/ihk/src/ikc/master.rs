/// Master channel rendezvous
///
/// Before interrupts are live the only shared signal is the status word in
/// the boot-parameter block, so the boot handshake busy-polls it. Later
/// waits (the shutdown acknowledgement) block on a condvar with a timeout.

use super::channel::{handler, PacketHandler};
use super::packet::MasterMessage;
use crate::os::boot_param::{BootParamBlock, LwkStatus};
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll the boot-parameter status until it reaches `target`.
///
/// Gives up after `poll_limit` polls. This is the one wait that cannot sleep.
pub fn wait_master(params: &BootParamBlock, target: LwkStatus, poll_limit: u64) -> bool {
    let backoff = Backoff::new();
    for _ in 0..poll_limit {
        if params.status() >= target {
            return true;
        }
        if backoff.is_completed() {
            std::thread::yield_now();
        } else {
            backoff.snooze();
        }
    }
    params.status() >= target
}

/// One-shot wakeup for the shutdown acknowledgement
#[derive(Default)]
pub struct AckWaiter {
    acked: Mutex<bool>,
    cond: Condvar,
}

impl AckWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        *self.acked.lock() = false;
    }

    pub fn signal(&self) {
        *self.acked.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_signalled(&self) -> bool {
        *self.acked.lock()
    }

    /// `false` on timeout
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut acked = self.acked.lock();
        while !*acked {
            if self.cond.wait_until(&mut acked, deadline).timed_out() {
                return *acked;
            }
        }
        true
    }
}

/// Host-side handler for an instance's master channel
pub fn master_handler(shutdown_ack: Arc<AckWaiter>) -> PacketHandler {
    handler(move |channel, packet| match MasterMessage::decode(packet) {
        Some(MasterMessage::ShutdownAck) => {
            log::debug!("{}: shutdown acknowledged", channel.os());
            shutdown_ack.signal();
        }
        Some(other) => log::warn!("{}: unexpected master message {:?}", channel.os(), other),
        None => log::warn!(
            "{}: unknown master message {:#x}",
            channel.os(),
            packet.msg
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OsId, PhysAddr};

    #[test]
    fn wait_master_sees_status() {
        let params = Arc::new(BootParamBlock::builder(OsId(0), PhysAddr(0x2000)).build());
        assert!(!wait_master(&params, LwkStatus::Booted, 100));

        let lwk = params.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            lwk.advance_status(LwkStatus::Booted);
        });
        assert!(wait_master(&params, LwkStatus::Booted, u64::MAX));
        t.join().unwrap();
    }

    #[test]
    fn ack_waiter_times_out_then_wakes() {
        let waiter = Arc::new(AckWaiter::new());
        assert!(!waiter.wait(Duration::from_millis(10)));

        let signaller = waiter.clone();
        let t = std::thread::spawn(move || signaller.signal());
        assert!(waiter.wait(Duration::from_secs(5)));
        t.join().unwrap();

        waiter.reset();
        assert!(!waiter.is_signalled());
    }
}
