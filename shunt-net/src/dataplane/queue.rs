//! Per-queue state for the bypass state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use shunt_mem::{PktBuf, PktPool, PktRing};

use crate::port::{PortId, RxQueueConf, TxQueueConf};

/// Sentinel carried in a cap packet's `userdata` slot. No real packet
/// carries this value there.
pub const CAP_MAGIC: u64 = 0x444E_7834_082C_83A7;

/// How long RX waits for a cap before switching anyway.
pub const CAP_MS: u64 = 10;

pub const CAP_TIMEOUT_NS: u64 = CAP_MS * 1_000_000;

/// On-wire length of a cap packet.
pub const CAP_LEN: usize = 64;

/// A cap is recognised by value, never by address.
#[inline]
pub fn is_cap(buf: &PktBuf) -> bool {
    buf.userdata == CAP_MAGIC
}

/// Monotonic time, injectable so tests can drive the cap timeout.
pub trait TickSource: Send + Sync {
    fn now_ns(&self) -> u64;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
        })
    }
}

impl TickSource for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Normal,
    Creation,
    Bypass,
    Destruction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Normal,
    Creation,
    Bypass,
    Destruction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Normal = 0,
    Bypass = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BypassState {
    Detached = 0,
    Attaching = 1,
    Attached = 2,
    Detaching = 3,
}

/// Device state shared lock-free with every queue. Queues hold this
/// instead of a back-pointer to the device.
pub struct DevCtrl {
    mode: AtomicU8,
    bypass_state: AtomicU8,
}

impl DevCtrl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mode: AtomicU8::new(Mode::Normal as u8),
            bypass_state: AtomicU8::new(BypassState::Detached as u8),
        })
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        match self.mode.load(Ordering::Acquire) {
            1 => Mode::Bypass,
            _ => Mode::Normal,
        }
    }

    #[inline]
    pub fn set_mode(&self, mode: Mode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    #[inline]
    pub fn bypass_state(&self) -> BypassState {
        match self.bypass_state.load(Ordering::Acquire) {
            1 => BypassState::Attaching,
            2 => BypassState::Attached,
            3 => BypassState::Detaching,
            _ => BypassState::Detached,
        }
    }

    #[inline]
    pub fn set_bypass_state(&self, state: BypassState) {
        self.bypass_state.store(state as u8, Ordering::Release);
    }
}

/// Receive side of one ring queue.
pub struct RxQueue {
    pub ring: Arc<PktRing>,
    pub state: RxState,
    /// Physical port to read from while bypassed.
    pub bypass_id: PortId,
    pub ctrl: Arc<DevCtrl>,
    /// Saved at queue setup, replayed onto the bypass device at attach.
    pub pool: Option<Arc<PktPool>>,
    pub nb_rx_desc: u16,
    pub conf: RxQueueConf,
    pub rx_pkts: u64,
    pub rx_pkts_bypass: u64,
    /// Result of the previous burst; drives the cap-timeout bookkeeping.
    pub nlast: u16,
    /// Timestamp of the first empty burst in a run of empty bursts.
    pub old_ns: u64,
    pub clock: Arc<dyn TickSource>,
}

impl RxQueue {
    pub fn new(ring: Arc<PktRing>, ctrl: Arc<DevCtrl>, clock: Arc<dyn TickSource>) -> Self {
        Self {
            ring,
            state: RxState::Normal,
            bypass_id: 0,
            ctrl,
            pool: None,
            nb_rx_desc: 0,
            conf: RxQueueConf::default(),
            rx_pkts: 0,
            rx_pkts_bypass: 0,
            nlast: 0,
            old_ns: 0,
            clock,
        }
    }
}

/// Transmit side of one ring queue.
pub struct TxQueue {
    pub ring: Arc<PktRing>,
    pub state: TxState,
    pub bypass_id: PortId,
    pub ctrl: Arc<DevCtrl>,
    /// Cap packets are allocated from here (the RX queue 0 pool).
    pub pool: Option<Arc<PktPool>>,
    pub nb_tx_desc: u16,
    pub conf: TxQueueConf,
    pub tx_pkts: u64,
    pub err_pkts: u64,
    pub tx_pkts_bypass: u64,
    pub err_pkts_bypass: u64,
}

impl TxQueue {
    pub fn new(ring: Arc<PktRing>, ctrl: Arc<DevCtrl>) -> Self {
        Self {
            ring,
            state: TxState::Normal,
            bypass_id: 0,
            ctrl,
            pool: None,
            nb_tx_desc: 0,
            conf: TxQueueConf::default(),
            tx_pkts: 0,
            err_pkts: 0,
            tx_pkts_bypass: 0,
            err_pkts_bypass: 0,
        }
    }
}
