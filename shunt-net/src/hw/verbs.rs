//! Verbs-style device objects backing the hardware RX path.
//!
//! The objects mirror the shapes a kernel-bypass NIC library hands out:
//! memory regions with local keys, a resource domain, completion and work
//! queues, and hash QPs over an indirection table. The device itself is
//! emulated in-process; tests drive the posting and state transitions the
//! same way the real data path would.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum VerbsError {
    #[error("work queue is {actual:?}, expected {expected:?}")]
    WrongState { expected: WqState, actual: WqState },

    #[error("{got} scatter elements exceed the queue limit of {max}")]
    TooManySges { got: usize, max: usize },

    #[error("receive queue is full")]
    QueueFull,

    #[error("hash key must be {expected} bytes, got {got}")]
    BadKeyLen { expected: usize, got: usize },

    #[error("hash QP creation failed")]
    QpCreation,
}

/// Limits reported by the device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAttr {
    pub max_qp_wr: u32,
    pub max_sge: u32,
}

impl Default for DeviceAttr {
    fn default() -> Self {
        Self {
            max_qp_wr: 16_384,
            max_sge: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadModel {
    Single,
    Safe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgModel {
    HighBandwidth,
    LowLatency,
}

/// Groups queue objects that share locking and wiring assumptions.
#[derive(Debug, Clone, Copy)]
pub struct ResDomain {
    pub thread_model: ThreadModel,
    pub msg_model: MsgModel,
}

/// A registered memory range; SGEs must carry its `lkey`.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub lkey: u32,
    pub addr: usize,
    pub len: usize,
}

pub struct CompQueue {
    size: u32,
}

impl CompQueue {
    pub fn size(&self) -> u32 {
        self.size
    }
}

/// One scatter/gather element of a receive work request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqState {
    Reset,
    Ready,
}

pub struct WqInitAttr {
    pub max_recv_wr: u32,
    pub max_recv_sge: u32,
}

/// Receive work queue. Work requests may only be posted in Ready state;
/// moving to Reset flushes everything outstanding.
pub struct WorkQueue {
    max_recv_wr: u32,
    max_recv_sge: u32,
    state: Mutex<WqState>,
    posted: Mutex<VecDeque<Vec<Sge>>>,
}

impl WorkQueue {
    pub fn state(&self) -> WqState {
        *self.state.lock().expect("wq state lock")
    }

    pub fn modify(&self, state: WqState) -> Result<(), VerbsError> {
        let mut cur = self.state.lock().expect("wq state lock");
        if state == WqState::Reset {
            self.posted.lock().expect("wq posted lock").clear();
        }
        *cur = state;
        Ok(())
    }

    pub fn max_recv_wr(&self) -> u32 {
        self.max_recv_wr
    }

    pub fn max_recv_sge(&self) -> u32 {
        self.max_recv_sge
    }

    /// Post one single-SGE work request.
    pub fn recv_burst(&self, sge: &Sge) -> Result<(), VerbsError> {
        self.post(std::slice::from_ref(sge))
    }

    /// Post one scatter/gather list.
    pub fn recv_sg_list(&self, sges: &[Sge]) -> Result<(), VerbsError> {
        self.post(sges)
    }

    fn post(&self, sges: &[Sge]) -> Result<(), VerbsError> {
        let state = self.state();
        if state != WqState::Ready {
            return Err(VerbsError::WrongState {
                expected: WqState::Ready,
                actual: state,
            });
        }
        if sges.len() > self.max_recv_sge as usize {
            return Err(VerbsError::TooManySges {
                got: sges.len(),
                max: self.max_recv_sge as usize,
            });
        }
        let mut posted = self.posted.lock().expect("wq posted lock");
        if posted.len() as u32 == self.max_recv_wr {
            return Err(VerbsError::QueueFull);
        }
        posted.push_back(sges.to_vec());
        Ok(())
    }

    /// Outstanding receive work requests.
    pub fn posted_wrs(&self) -> usize {
        self.posted.lock().expect("wq posted lock").len()
    }
}

/// RSS hash selector of one hash QP.
pub struct HashQpInit {
    pub rx_hash_fields_mask: u32,
    pub key: Vec<u8>,
}

/// A hash QP; steering selects it by `fields_mask`.
pub struct HashQp {
    pub fields_mask: u32,
    live: Arc<AtomicU32>,
}

impl Drop for HashQp {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The emulated NIC: hands out the objects above and tracks live QPs.
pub struct NicContext {
    attr: DeviceAttr,
    next_lkey: AtomicU32,
    live_qps: Arc<AtomicU32>,
    qp_created: AtomicU32,
    /// 1-based creation index that fails, 0 for never (test hook).
    qp_fail_at: AtomicU32,
}

impl NicContext {
    pub fn new(attr: DeviceAttr) -> Self {
        Self {
            attr,
            next_lkey: AtomicU32::new(1),
            live_qps: Arc::new(AtomicU32::new(0)),
            qp_created: AtomicU32::new(0),
            qp_fail_at: AtomicU32::new(0),
        }
    }

    pub fn device_attr(&self) -> DeviceAttr {
        self.attr
    }

    /// Register a virtual range; all buffers posted to this device must
    /// fall inside a registered region.
    pub fn reg_mr(&self, addr: usize, len: usize) -> MemoryRegion {
        MemoryRegion {
            lkey: self.next_lkey.fetch_add(1, Ordering::Relaxed),
            addr,
            len,
        }
    }

    pub fn create_res_domain(&self, thread_model: ThreadModel, msg_model: MsgModel) -> ResDomain {
        ResDomain {
            thread_model,
            msg_model,
        }
    }

    pub fn create_cq(&self, size: u32, _rd: &ResDomain) -> CompQueue {
        CompQueue { size }
    }

    pub fn create_wq(&self, attr: WqInitAttr) -> Result<Arc<WorkQueue>, VerbsError> {
        Ok(Arc::new(WorkQueue {
            max_recv_wr: attr.max_recv_wr,
            max_recv_sge: attr.max_recv_sge,
            state: Mutex::new(WqState::Reset),
            posted: Mutex::new(VecDeque::new()),
        }))
    }

    pub fn create_hash_qp(&self, init: HashQpInit) -> Result<HashQp, VerbsError> {
        if init.key.len() != 40 {
            return Err(VerbsError::BadKeyLen {
                expected: 40,
                got: init.key.len(),
            });
        }
        let seq = self.qp_created.fetch_add(1, Ordering::AcqRel) + 1;
        let fail_at = self.qp_fail_at.load(Ordering::Acquire);
        if fail_at != 0 && seq == fail_at {
            return Err(VerbsError::QpCreation);
        }
        self.live_qps.fetch_add(1, Ordering::AcqRel);
        Ok(HashQp {
            fields_mask: init.rx_hash_fields_mask,
            live: self.live_qps.clone(),
        })
    }

    /// Hash QPs currently alive on this device.
    pub fn live_qps(&self) -> u32 {
        self.live_qps.load(Ordering::Acquire)
    }

    /// Make the `nth` hash-QP creation on this device fail (test hook).
    pub fn fail_qp_creation(&self, nth: u32) {
        self.qp_fail_at.store(nth, Ordering::Release);
    }
}

impl Default for NicContext {
    fn default() -> Self {
        Self::new(DeviceAttr::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wq_requires_ready_for_posting() {
        let ctx = NicContext::default();
        let wq = ctx
            .create_wq(WqInitAttr {
                max_recv_wr: 4,
                max_recv_sge: 2,
            })
            .expect("wq");

        let sge = Sge::default();
        assert!(matches!(
            wq.recv_burst(&sge),
            Err(VerbsError::WrongState { .. })
        ));
        wq.modify(WqState::Ready).expect("ready");
        wq.recv_burst(&sge).expect("post");
        assert_eq!(wq.posted_wrs(), 1);
    }

    #[test]
    fn test_wq_reset_flushes() {
        let ctx = NicContext::default();
        let wq = ctx
            .create_wq(WqInitAttr {
                max_recv_wr: 4,
                max_recv_sge: 2,
            })
            .expect("wq");
        wq.modify(WqState::Ready).expect("ready");
        wq.recv_burst(&Sge::default()).expect("post");
        wq.modify(WqState::Reset).expect("reset");
        assert_eq!(wq.posted_wrs(), 0);
    }

    #[test]
    fn test_wq_limits() {
        let ctx = NicContext::default();
        let wq = ctx
            .create_wq(WqInitAttr {
                max_recv_wr: 1,
                max_recv_sge: 2,
            })
            .expect("wq");
        wq.modify(WqState::Ready).expect("ready");

        let sges = [Sge::default(); 3];
        assert!(matches!(
            wq.recv_sg_list(&sges),
            Err(VerbsError::TooManySges { .. })
        ));

        wq.recv_burst(&Sge::default()).expect("post");
        assert!(matches!(
            wq.recv_burst(&Sge::default()),
            Err(VerbsError::QueueFull)
        ));
    }

    #[test]
    fn test_qp_accounting_and_injection() {
        let ctx = NicContext::default();
        let qp = ctx
            .create_hash_qp(HashQpInit {
                rx_hash_fields_mask: 0,
                key: vec![0; 40],
            })
            .expect("qp");
        assert_eq!(ctx.live_qps(), 1);
        drop(qp);
        assert_eq!(ctx.live_qps(), 0);

        ctx.fail_qp_creation(2);
        assert!(
            ctx.create_hash_qp(HashQpInit {
                rx_hash_fields_mask: 0,
                key: vec![0; 40],
            })
            .is_err()
        );
        assert_eq!(ctx.live_qps(), 0);
    }
}
