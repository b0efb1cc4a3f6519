//! The bypass state machine: RX/TX burst dispatch and the cap cutover.
//!
//! A switching cycle moves a queue Normal -> Creation -> Bypass ->
//! Destruction -> Normal. The cap packet is an in-band barrier: it travels
//! through the channel about to be drained, behind every packet already
//! committed there, so the receiving side can switch channels without
//! losing or reordering anything. If the cap is lost or the peer is idle,
//! a timeout completes the transition.

use std::sync::Arc;

use shunt_mem::{PktBuf, PktPool};
use tracing::{debug, error};

use crate::port::PortRegistry;
use crate::dataplane::queue::{
    BypassState, CAP_LEN, CAP_TIMEOUT_NS, Mode, RxQueue, RxState, TxQueue, TxState, is_cap,
};

/// Receive up to `n` buffers, appending to `bufs`. Never blocks, never
/// fails; returns the number received.
pub fn rx_burst(reg: &PortRegistry, q: &mut RxQueue, bufs: &mut Vec<PktBuf>, n: u16) -> u16 {
    match q.state {
        RxState::Normal => normal_rx(q, bufs, n),
        RxState::Creation => creation_rx(q, bufs, n),
        RxState::Bypass => bypass_rx(reg, q, bufs, n),
        RxState::Destruction => destruction_rx(reg, q, bufs, n),
    }
}

/// Transmit from the front of `bufs`; accepted buffers are drained out.
pub fn tx_burst(reg: &PortRegistry, q: &mut TxQueue, bufs: &mut Vec<PktBuf>) -> u16 {
    match q.state {
        TxState::Normal => normal_tx(q, bufs),
        TxState::Creation => creation_tx(reg, q, bufs),
        TxState::Bypass => bypass_tx(reg, q, bufs),
        TxState::Destruction => destruction_tx(reg, q, bufs),
    }
}

/// Receive using only the primary (ring) channel.
fn normal_rx(q: &mut RxQueue, bufs: &mut Vec<PktBuf>, n: u16) -> u16 {
    let nb_rx = q.ring.dequeue_burst(bufs, n);
    q.rx_pkts += u64::from(nb_rx);
    nb_rx
}

/// Transmit using only the primary (ring) channel.
fn normal_tx(q: &mut TxQueue, bufs: &mut Vec<PktBuf>) -> u16 {
    let nb_bufs = bufs.len() as u16;
    let nb_tx = q.ring.enqueue_burst(bufs);
    q.tx_pkts += u64::from(nb_tx);
    q.err_pkts += u64::from(nb_bufs - nb_tx);
    nb_tx
}

/// Transmit using only the bypass device, queue 0.
fn bypass_tx(reg: &PortRegistry, q: &mut TxQueue, bufs: &mut Vec<PktBuf>) -> u16 {
    let nb_bufs = bufs.len() as u16;
    let nb_tx = match reg.get(q.bypass_id) {
        Some(port) => port.tx_burst(0, bufs),
        None => 0,
    };

    q.tx_pkts += u64::from(nb_tx);
    q.err_pkts += u64::from(nb_bufs - nb_tx);
    q.tx_pkts_bypass += u64::from(nb_tx);
    q.err_pkts_bypass += u64::from(nb_bufs - nb_tx);
    nb_tx
}

/// Receive while bypassed. Any buffer still queued on the ring trails the
/// cap from the cutover window and is drained first, preserving
/// primary-then-secondary order.
fn bypass_rx(reg: &PortRegistry, q: &mut RxQueue, bufs: &mut Vec<PktBuf>, n: u16) -> u16 {
    if q.ring.count() > 0 {
        return normal_rx(q, bufs, n);
    }

    let nb_rx = match reg.get(q.bypass_id) {
        Some(port) => port.rx_burst(0, bufs, n),
        None => 0,
    };

    q.rx_pkts += u64::from(nb_rx);
    q.rx_pkts_bypass += u64::from(nb_rx);
    nb_rx
}

/// Pull the cap out of a freshly received burst, if present. The cap is
/// freed back to its pool and never reaches the application.
fn strip_cap(bufs: &mut Vec<PktBuf>, start: usize) -> bool {
    if let Some(pos) = bufs[start..].iter().position(is_cap) {
        let cap = bufs.remove(start + pos);
        drop(cap);
        return true;
    }
    false
}

/// Empty-burst bookkeeping shared by the two transitional states.
/// Returns true once the cap has waited long enough to be declared lost.
fn cap_timed_out(q: &mut RxQueue) -> bool {
    if q.nlast != 0 {
        // first empty burst after traffic: start the clock
        q.old_ns = q.clock.now_ns();
        return false;
    }
    q.clock.now_ns().wrapping_sub(q.old_ns) > CAP_TIMEOUT_NS
}

/// Read the ring until the cap (or the timeout) says the primary side is
/// done, then move to the bypass path.
fn creation_rx(q: &mut RxQueue, bufs: &mut Vec<PktBuf>, n: u16) -> u16 {
    let start = bufs.len();
    let mut nb_rx = normal_rx(q, bufs, n);

    if nb_rx > 0 {
        if strip_cap(bufs, start) {
            debug!("rx cutover to bypass (cap observed)");
            q.state = RxState::Bypass;
            nb_rx -= 1;
        }
    } else if cap_timed_out(q) {
        // cap lost or peer idle; switch anyway
        debug!("rx cutover to bypass (timeout)");
        q.state = RxState::Bypass;
    }

    q.nlast = nb_rx;
    nb_rx
}

/// Read the bypass device until the cap (or the timeout) says the wire is
/// drained, then return to the ring path.
fn destruction_rx(reg: &PortRegistry, q: &mut RxQueue, bufs: &mut Vec<PktBuf>, n: u16) -> u16 {
    if q.ctrl.bypass_state() != BypassState::Attached {
        // the bypass is already gone
        q.state = RxState::Normal;
        return normal_rx(q, bufs, n);
    }

    let start = bufs.len();
    let mut nb_rx = match reg.get(q.bypass_id) {
        Some(port) => port.rx_burst(0, bufs, n),
        None => 0,
    };
    q.rx_pkts += u64::from(nb_rx);
    q.rx_pkts_bypass += u64::from(nb_rx);

    if nb_rx > 0 {
        if strip_cap(bufs, start) {
            debug!("rx cutover to ring (cap observed)");
            q.state = RxState::Normal;
            nb_rx -= 1;
        }
    } else if cap_timed_out(q) {
        debug!("rx cutover to ring (timeout)");
        q.state = RxState::Normal;
    }

    q.nlast = nb_rx;
    nb_rx
}

/// Allocate a cap from the pool, retrying until the pool yields one. This
/// is control plane riding a data-path call; the pool keeps enough slack
/// that the loop terminates.
fn make_cap(pool: &Arc<PktPool>) -> PktBuf {
    loop {
        if let Some(mut buf) = pool.alloc() {
            buf.userdata = super::queue::CAP_MAGIC;
            buf.data_len = CAP_LEN;
            buf.pkt_len = CAP_LEN;
            return buf;
        }
        std::hint::spin_loop();
    }
}

/// Emit the cap on the ring, then cut the queue and the device over to
/// the bypass. After this returns, every later burst travels on the
/// bypass while the cap sits behind all data already on the ring.
fn send_cap_ring(q: &mut TxQueue) {
    match q.pool.clone() {
        Some(pool) => {
            let mut cap = vec![make_cap(&pool)];
            loop {
                normal_tx(q, &mut cap);
                if cap.is_empty() {
                    break;
                }
                std::hint::spin_loop();
            }
        }
        None => error!("no pool saved on tx queue, cutting over without a cap"),
    }

    q.state = TxState::Bypass;
    q.ctrl.set_mode(Mode::Bypass);
}

/// Emit the cap on the bypass device, then cut back to the ring.
fn send_cap_bypass(reg: &PortRegistry, q: &mut TxQueue) {
    match q.pool.clone() {
        Some(pool) => {
            let mut cap = vec![make_cap(&pool)];
            loop {
                bypass_tx(reg, q, &mut cap);
                if cap.is_empty() {
                    break;
                }
                std::hint::spin_loop();
            }
        }
        None => error!("no pool saved on tx queue, cutting over without a cap"),
    }

    q.state = TxState::Normal;
    q.ctrl.set_mode(Mode::Normal);
}

/// First TX burst after attach: the cap exchange was delegated here so it
/// never runs inside the attach call itself.
fn creation_tx(reg: &PortRegistry, q: &mut TxQueue, bufs: &mut Vec<PktBuf>) -> u16 {
    debug!("tx cutover to bypass");
    send_cap_ring(q);
    bypass_tx(reg, q, bufs)
}

/// First TX burst after detach.
fn destruction_tx(reg: &PortRegistry, q: &mut TxQueue, bufs: &mut Vec<PktBuf>) -> u16 {
    debug!("tx cutover to ring");
    send_cap_bypass(reg, q);
    normal_tx(q, bufs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::queue::{CAP_MAGIC, CAP_MS, DevCtrl};
    use crate::test_util::ManualClock;
    use shunt_mem::{PktPool, PktRing};
    use std::sync::Arc;

    fn pool() -> Arc<PktPool> {
        Arc::new(PktPool::new("bypass-test", 64, 2048, 0).expect("pool"))
    }

    fn frame(pool: &Arc<PktPool>, tag: u8) -> PktBuf {
        let mut buf = pool.alloc().expect("alloc");
        buf.write_area()[0] = tag;
        buf.data_len = 1;
        buf.pkt_len = 1;
        buf
    }

    fn rx_queue(ring: Arc<PktRing>, clock: Arc<ManualClock>) -> RxQueue {
        RxQueue::new(ring, DevCtrl::new(), clock)
    }

    #[test]
    fn test_normal_rx_counts() {
        let p = pool();
        let ring = PktRing::new("rx", 16);
        let mut q = rx_queue(ring.clone(), ManualClock::new());

        let mut inject: Vec<_> = (0..3).map(|i| frame(&p, i)).collect();
        ring.enqueue_burst(&mut inject);

        let mut out = Vec::new();
        assert_eq!(rx_burst(&PortRegistry::new(), &mut q, &mut out, 8), 3);
        assert_eq!(q.rx_pkts, 3);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_creation_rx_consumes_cap() {
        let p = pool();
        let ring = PktRing::new("rx", 16);
        let mut q = rx_queue(ring.clone(), ManualClock::new());
        q.state = RxState::Creation;
        q.nlast = 1;

        let mut inject = vec![frame(&p, 0), frame(&p, 1)];
        let mut cap = p.alloc().expect("alloc");
        cap.userdata = CAP_MAGIC;
        cap.data_len = CAP_LEN;
        cap.pkt_len = CAP_LEN;
        inject.push(cap);
        ring.enqueue_burst(&mut inject);

        let free_before = p.available();
        let mut out = Vec::new();
        let reg = PortRegistry::new();
        assert_eq!(rx_burst(&reg, &mut q, &mut out, 8), 2);
        assert_eq!(q.state, RxState::Bypass);
        // cap went back to the pool, not to the caller
        assert_eq!(p.available(), free_before + 1);
        assert!(out.iter().all(|b| b.userdata != CAP_MAGIC));
    }

    #[test]
    fn test_creation_rx_timeout() {
        let ring = PktRing::new("rx", 16);
        let clock = ManualClock::new();
        let mut q = rx_queue(ring, clock.clone());
        q.state = RxState::Creation;
        q.nlast = 1;

        let reg = PortRegistry::new();
        let mut out = Vec::new();
        // first empty burst records the timestamp
        assert_eq!(rx_burst(&reg, &mut q, &mut out, 8), 0);
        assert_eq!(q.state, RxState::Creation);

        clock.advance_ms(CAP_MS + 1);
        assert_eq!(rx_burst(&reg, &mut q, &mut out, 8), 0);
        assert_eq!(q.state, RxState::Bypass);
    }

    #[test]
    fn test_creation_rx_traffic_resets_timeout() {
        let p = pool();
        let ring = PktRing::new("rx", 16);
        let clock = ManualClock::new();
        let mut q = rx_queue(ring.clone(), clock.clone());
        q.state = RxState::Creation;
        q.nlast = 1;

        let reg = PortRegistry::new();
        let mut out = Vec::new();
        rx_burst(&reg, &mut q, &mut out, 8);
        clock.advance_ms(CAP_MS + 1);

        // traffic arrives before the next empty burst: timeout restarts
        let mut inject = vec![frame(&p, 0)];
        ring.enqueue_burst(&mut inject);
        assert_eq!(rx_burst(&reg, &mut q, &mut out, 8), 1);
        assert_eq!(q.state, RxState::Creation);

        assert_eq!(rx_burst(&reg, &mut q, &mut out, 8), 0);
        assert_eq!(q.state, RxState::Creation);
        clock.advance_ms(CAP_MS + 1);
        rx_burst(&reg, &mut q, &mut out, 8);
        assert_eq!(q.state, RxState::Bypass);
    }

    #[test]
    fn test_normal_tx_counts_errors() {
        let p = pool();
        let ring = PktRing::new("tx", 2);
        let mut q = TxQueue::new(ring, DevCtrl::new());

        let mut bufs: Vec<_> = (0..4).map(|i| frame(&p, i)).collect();
        let reg = PortRegistry::new();
        assert_eq!(tx_burst(&reg, &mut q, &mut bufs), 2);
        assert_eq!(q.tx_pkts, 2);
        assert_eq!(q.err_pkts, 2);
        assert_eq!(bufs.len(), 2);
    }

    #[test]
    fn test_destruction_rx_detached_falls_back() {
        let p = pool();
        let ring = PktRing::new("rx", 16);
        let mut q = rx_queue(ring.clone(), ManualClock::new());
        q.state = RxState::Destruction;
        // ctrl still says Detached

        let mut inject = vec![frame(&p, 7)];
        ring.enqueue_burst(&mut inject);

        let mut out = Vec::new();
        assert_eq!(rx_burst(&PortRegistry::new(), &mut q, &mut out, 8), 1);
        assert_eq!(q.state, RxState::Normal);
        assert_eq!(out[0].data()[0], 7);
    }
}
