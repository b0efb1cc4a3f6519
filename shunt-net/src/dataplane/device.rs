//! Ring-backed Ethernet devices.
//!
//! A `RingDevice` owns up to [`RXTX_MAX`] RX/TX queue pairs over shared
//! packet rings and implements [`EthPort`]. At runtime it can attach a
//! physical port as a bypass: the control call only flips the queues into
//! their transitional states; the actual cutover is completed in-band by
//! the state machine on the next bursts. Detaching stops the physical
//! port from a control worker, never from the data path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use shunt_mem::{PktBuf, PktPool, PktRing};
use tracing::{debug, error, info, warn};

use crate::dataplane::bypass;
use crate::dataplane::queue::{
    BypassState, DevCtrl, Mode, MonotonicClock, RxQueue, RxState, TickSource, TxQueue, TxState,
};
use crate::error::{NetError, Result};
use crate::port::{
    DevConfig, EthPort, LinkStatus, MAX_QUEUE_STATS, PortId, PortRegistry, PortStats, RxQueueConf,
    TxQueueConf,
};

/// Compile-time bound on RX/TX queues per device.
pub const RXTX_MAX: usize = 16;

/// Delay before the control worker tears the bypass device down.
pub const CLOSE_BYPASS_DELAY: Duration = Duration::from_millis(100);

/// Ring devices currently alive, for downcast-free lookup by port ID.
static RING_DEVICES: Mutex<Vec<Weak<RingDevice>>> = Mutex::new(Vec::new());

pub struct RingDevice {
    name: String,
    port_id: PortId,
    numa: u32,
    mac: [u8; 6],
    ctrl: Arc<DevCtrl>,
    link_up: AtomicBool,
    dev_conf: Mutex<DevConfig>,
    /// Physical device to auto-attach at start, if configured.
    bypass_dev: Mutex<Option<String>>,
    rx: Vec<Mutex<RxQueue>>,
    tx: Vec<Mutex<TxQueue>>,
}

impl RingDevice {
    /// Create a device over the given rings and register it. The same
    /// ring may appear on both sides (loopback).
    pub fn from_rings(
        name: &str,
        rx_rings: &[Arc<PktRing>],
        tx_rings: &[Arc<PktRing>],
        numa: u32,
    ) -> Result<PortId> {
        if rx_rings.len() > RXTX_MAX {
            return Err(NetError::TooManyQueues(rx_rings.len(), RXTX_MAX));
        }
        if tx_rings.len() > RXTX_MAX {
            return Err(NetError::TooManyQueues(tx_rings.len(), RXTX_MAX));
        }
        let registry = PortRegistry::global();
        if registry.contains_name(name) {
            return Err(NetError::DeviceExists(name.to_string()));
        }

        info!(name, numa, "creating rings-backed ethdev");

        let clock: Arc<dyn TickSource> = MonotonicClock::new();
        let ctrl = DevCtrl::new();
        let rx = rx_rings
            .iter()
            .map(|r| Mutex::new(RxQueue::new(r.clone(), ctrl.clone(), clock.clone())))
            .collect();
        let tx = tx_rings
            .iter()
            .map(|r| Mutex::new(TxQueue::new(r.clone(), ctrl.clone())))
            .collect();

        let name = name.to_string();
        let mut created = None;
        let port_id = registry.register(|port_id| {
            let dev = Arc::new(RingDevice {
                mac: mac_for(&name, port_id),
                name,
                port_id,
                numa,
                ctrl,
                link_up: AtomicBool::new(false),
                dev_conf: Mutex::new(DevConfig::default()),
                bypass_dev: Mutex::new(None),
                rx,
                tx,
            });
            created = Some(dev.clone());
            dev
        })?;

        let mut devices = RING_DEVICES.lock().expect("ring device list poisoned");
        devices.retain(|w| w.upgrade().is_some());
        devices.push(Arc::downgrade(&created.expect("register ran the builder")));

        Ok(port_id)
    }

    /// Single-queue shorthand: the ring serves both directions.
    pub fn from_ring(ring: &Arc<PktRing>) -> Result<PortId> {
        Self::from_rings(ring.name(), &[ring.clone()], &[ring.clone()], 0)
    }

    /// Look a ring device up by port ID.
    pub fn get(port_id: PortId) -> Option<Arc<RingDevice>> {
        RING_DEVICES
            .lock()
            .expect("ring device list poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .find(|d| d.port_id == port_id)
    }

    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    pub fn mode(&self) -> Mode {
        self.ctrl.mode()
    }

    pub fn bypass_state(&self) -> BypassState {
        self.ctrl.bypass_state()
    }

    pub fn rx_state(&self, queue: u16) -> Option<RxState> {
        Some(self.rx.get(queue as usize)?.lock().expect("queue lock").state)
    }

    pub fn tx_state(&self, queue: u16) -> Option<TxState> {
        Some(self.tx.get(queue as usize)?.lock().expect("queue lock").state)
    }

    /// (rx_pkts, rx_pkts_bypass) of one RX queue.
    pub fn rx_counters(&self, queue: u16) -> Option<(u64, u64)> {
        let q = self.rx.get(queue as usize)?.lock().expect("queue lock");
        Some((q.rx_pkts, q.rx_pkts_bypass))
    }

    /// (tx_pkts, err_pkts, tx_pkts_bypass, err_pkts_bypass) of one TX queue.
    pub fn tx_counters(&self, queue: u16) -> Option<(u64, u64, u64, u64)> {
        let q = self.tx.get(queue as usize)?.lock().expect("queue lock");
        Some((q.tx_pkts, q.err_pkts, q.tx_pkts_bypass, q.err_pkts_bypass))
    }

    /// Configure a device name to bypass to automatically at `start()`.
    pub fn set_bypass_dev(&self, name: Option<String>) {
        *self.bypass_dev.lock().expect("bypass dev lock") = name;
    }

    /// Replace the time source on every RX queue (test hook).
    pub fn set_tick_source(&self, clock: Arc<dyn TickSource>) {
        for q in &self.rx {
            q.lock().expect("queue lock").clock = clock.clone();
        }
    }

    /// Attach a physical port as the bypass for this device.
    ///
    /// The physical port is configured like the ring device (saved queue
    /// parameters and pool), started, and recorded on every queue; the
    /// queues enter their Creation states. The cap exchange itself runs
    /// on the next TX burst, off the control path.
    pub fn add_bypass(normal_id: PortId, bypass_id: PortId) -> Result<()> {
        let registry = PortRegistry::global();
        let dev = Self::get(normal_id).ok_or(NetError::NotRingDevice(normal_id))?;
        let bypass = registry
            .get(bypass_id)
            .ok_or(NetError::InvalidPort(bypass_id))?;
        if dev.ctrl.bypass_state() != BypassState::Detached {
            return Err(NetError::BypassAttached);
        }
        if dev.rx.is_empty() || dev.tx.is_empty() {
            return Err(NetError::NoRxQueues);
        }

        dev.ctrl.set_bypass_state(BypassState::Attaching);
        if let Err(e) = dev.setup_bypass(&*bypass, bypass_id) {
            dev.ctrl.set_bypass_state(BypassState::Detached);
            return Err(e);
        }
        dev.ctrl.set_bypass_state(BypassState::Attached);
        info!(normal = normal_id, bypass = bypass_id, "bypass attached");
        Ok(())
    }

    fn setup_bypass(&self, bypass: &dyn EthPort, bypass_id: PortId) -> Result<()> {
        let conf = *self.dev_conf.lock().expect("dev conf lock");
        bypass.configure(1, 1, &conf)?;

        let pool = {
            let rx0 = self.rx[0].lock().expect("queue lock");
            let pool = rx0
                .pool
                .clone()
                .ok_or(NetError::QueueNotSetUp(0))?;
            bypass.rx_queue_setup(0, rx0.nb_rx_desc, self.numa, &rx0.conf, &pool)?;
            pool
        };
        {
            let tx0 = self.tx[0].lock().expect("queue lock");
            bypass.tx_queue_setup(0, tx0.nb_tx_desc, self.numa, &tx0.conf)?;
        }
        bypass.start()?;

        for q in &self.rx {
            let mut q = q.lock().expect("queue lock");
            q.bypass_id = bypass_id;
            q.rx_pkts_bypass = 0;
            // assume packets were received on the last call
            q.nlast = 1;
            q.state = RxState::Creation;
        }
        for q in &self.tx {
            let mut q = q.lock().expect("queue lock");
            q.bypass_id = bypass_id;
            q.pool = Some(pool.clone());
            q.tx_pkts_bypass = 0;
            q.err_pkts_bypass = 0;
            q.state = TxState::Creation;
        }
        Ok(())
    }

    /// Detach the bypass. The queues enter their Destruction states and
    /// finish the cutover in-band; the physical port itself is stopped
    /// and closed by the control worker after a grace delay, because
    /// tearing a driver down from inside a transmit call would be
    /// reentrant.
    pub fn remove_bypass(normal_id: PortId) -> Result<()> {
        let dev = Self::get(normal_id).ok_or(NetError::NotRingDevice(normal_id))?;
        if dev.ctrl.bypass_state() != BypassState::Attached {
            return Err(NetError::NoBypass);
        }

        let bypass_id = {
            let mut first = None;
            for q in &dev.rx {
                let mut q = q.lock().expect("queue lock");
                q.nlast = 1;
                q.state = RxState::Destruction;
                first.get_or_insert(q.bypass_id);
            }
            for q in &dev.tx {
                q.lock().expect("queue lock").state = TxState::Destruction;
            }
            first.ok_or(NetError::NoRxQueues)?
        };

        let ctrl = dev.ctrl.clone();
        ControlWorker::global().run_after(
            CLOSE_BYPASS_DELAY,
            Box::new(move || close_bypass(ctrl, bypass_id)),
        );
        info!(normal = normal_id, bypass = bypass_id, "bypass detach scheduled");
        Ok(())
    }

    /// Stop and release a device: the port ID is freed and the queues
    /// die with the device.
    pub fn destroy(port_id: PortId) -> Result<()> {
        let dev = Self::get(port_id).ok_or(NetError::NotRingDevice(port_id))?;
        dev.stop();
        dev.close();
        PortRegistry::global().unregister(port_id);
        RING_DEVICES
            .lock()
            .expect("ring device list poisoned")
            .retain(|w| w.upgrade().is_some_and(|d| d.port_id != port_id));
        info!(port = port_id, name = dev.name(), "device destroyed");
        Ok(())
    }

    /// Aggregate of all queue counters.
    fn collect_stats(&self) -> PortStats {
        let mut stats = PortStats::default();
        for (i, q) in self.rx.iter().enumerate() {
            let q = q.lock().expect("queue lock");
            if i < MAX_QUEUE_STATS {
                stats.q_ipackets[i] = q.rx_pkts;
            }
            stats.ipackets += q.rx_pkts;
        }
        for (i, q) in self.tx.iter().enumerate() {
            let q = q.lock().expect("queue lock");
            if i < MAX_QUEUE_STATS {
                stats.q_opackets[i] = q.tx_pkts;
                stats.q_errors[i] = q.err_pkts;
            }
            stats.opackets += q.tx_pkts;
            stats.oerrors += q.err_pkts;
        }
        stats
    }
}

fn mac_for(name: &str, port_id: PortId) -> [u8; 6] {
    // locally administered, stable per name
    let mut hash: u32 = 5381;
    for b in name.bytes() {
        hash = hash.wrapping_mul(33) ^ u32::from(b);
    }
    let h = hash.to_be_bytes();
    [0x52, 0x54, h[1], h[2], h[3], port_id as u8]
}

/// Stop, close and unregister the bypass device, then mark it safe to
/// remove. Runs on the control worker.
fn close_bypass(ctrl: Arc<DevCtrl>, bypass_id: PortId) {
    ctrl.set_bypass_state(BypassState::Detaching);

    let registry = PortRegistry::global();
    if let Some(port) = registry.get(bypass_id) {
        port.stop();
        port.close();
    }
    registry.unregister(bypass_id);

    ctrl.set_bypass_state(BypassState::Detached);
    debug!(bypass = bypass_id, "bypass detached");
}

/// Re-point a bypass attachment from one physical port to another. The
/// host side drives this through the serial channel when it migrates the
/// guest onto different hardware.
pub fn change_bypass_device(old_name: &str, new_name: &str) -> Result<()> {
    let registry = PortRegistry::global();
    let (old_id, _) = registry
        .find_by_name(old_name)
        .ok_or_else(|| NetError::PortNotFound(old_name.to_string()))?;
    let (new_id, _) = registry
        .find_by_name(new_name)
        .ok_or_else(|| NetError::PortNotFound(new_name.to_string()))?;

    let dev = RING_DEVICES
        .lock()
        .expect("ring device list poisoned")
        .iter()
        .filter_map(Weak::upgrade)
        .find(|d| {
            d.ctrl.bypass_state() == BypassState::Attached
                && d.rx
                    .first()
                    .is_some_and(|q| q.lock().expect("queue lock").bypass_id == old_id)
        })
        .ok_or_else(|| NetError::PortNotFound(old_name.to_string()))?;

    let normal_id = dev.port_id;
    RingDevice::remove_bypass(normal_id)?;

    // re-attach once the close worker has released the old device
    ControlWorker::global().run_after(
        CLOSE_BYPASS_DELAY * 2,
        Box::new(move || {
            if let Err(e) = RingDevice::add_bypass(normal_id, new_id) {
                error!(normal = normal_id, bypass = new_id, error = %e,
                       "device swap re-attach failed");
            }
        }),
    );
    Ok(())
}

impl EthPort for RingDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mac_addr(&self) -> [u8; 6] {
        self.mac
    }

    fn configure(&self, nb_rx: u16, nb_tx: u16, conf: &DevConfig) -> Result<()> {
        if nb_rx as usize > self.rx.len() || nb_tx as usize > self.tx.len() {
            return Err(NetError::TooManyQueues(
                nb_rx.max(nb_tx) as usize,
                self.rx.len().max(self.tx.len()),
            ));
        }
        *self.dev_conf.lock().expect("dev conf lock") = *conf;
        Ok(())
    }

    fn rx_queue_setup(
        &self,
        queue: u16,
        nb_desc: u16,
        _socket: u32,
        conf: &RxQueueConf,
        pool: &Arc<PktPool>,
    ) -> Result<()> {
        let q = self
            .rx
            .get(queue as usize)
            .ok_or(NetError::InvalidQueue(queue))?;
        let mut q = q.lock().expect("queue lock");
        // saved for replay onto the bypass device when one attaches
        q.nb_rx_desc = nb_desc;
        q.conf = *conf;
        q.pool = Some(pool.clone());
        Ok(())
    }

    fn tx_queue_setup(
        &self,
        queue: u16,
        nb_desc: u16,
        _socket: u32,
        conf: &TxQueueConf,
    ) -> Result<()> {
        let q = self
            .tx
            .get(queue as usize)
            .ok_or(NetError::InvalidQueue(queue))?;
        let mut q = q.lock().expect("queue lock");
        q.nb_tx_desc = nb_desc;
        q.conf = *conf;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let auto = self.bypass_dev.lock().expect("bypass dev lock").clone();
        if let Some(name) = auto {
            let (bypass_id, _) = PortRegistry::global()
                .find_by_name(&name)
                .ok_or_else(|| NetError::PortNotFound(name.clone()))?;
            Self::add_bypass(self.port_id, bypass_id)?;
        }
        self.link_up.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.link_up.store(false, Ordering::Release);
    }

    fn close(&self) {
        // finish any scheduled bypass teardown before the device goes away
        ControlWorker::global().flush();
        self.link_up.store(false, Ordering::Release);
    }

    fn link(&self) -> LinkStatus {
        LinkStatus {
            up: self.link_up.load(Ordering::Acquire),
            ..LinkStatus::default()
        }
    }

    fn set_link(&self, up: bool) {
        self.link_up.store(up, Ordering::Release);
    }

    fn stats(&self) -> PortStats {
        self.collect_stats()
    }

    fn stats_reset(&self) {
        for q in &self.rx {
            let mut q = q.lock().expect("queue lock");
            q.rx_pkts = 0;
            q.rx_pkts_bypass = 0;
        }
        for q in &self.tx {
            let mut q = q.lock().expect("queue lock");
            q.tx_pkts = 0;
            q.err_pkts = 0;
            q.tx_pkts_bypass = 0;
            q.err_pkts_bypass = 0;
        }
    }

    fn rx_burst(&self, queue: u16, bufs: &mut Vec<PktBuf>, n: u16) -> u16 {
        let Some(q) = self.rx.get(queue as usize) else {
            return 0;
        };
        let mut q = q.lock().expect("queue lock");
        bypass::rx_burst(PortRegistry::global(), &mut q, bufs, n)
    }

    fn tx_burst(&self, queue: u16, bufs: &mut Vec<PktBuf>) -> u16 {
        let Some(q) = self.tx.get(queue as usize) else {
            return 0;
        };
        let mut q = q.lock().expect("queue lock");
        bypass::tx_burst(PortRegistry::global(), &mut q, bufs)
    }
}

type Job = Box<dyn FnOnce() + Send>;

enum Msg {
    Delayed { at: Instant, job: Job },
    Flush(Sender<()>),
}

/// Control thread servicing deferred jobs (bypass teardown, device
/// swaps). Device close drains it so no job outlives its device.
pub struct ControlWorker {
    tx: Sender<Msg>,
}

impl ControlWorker {
    pub fn global() -> &'static ControlWorker {
        static GLOBAL: OnceLock<ControlWorker> = OnceLock::new();
        GLOBAL.get_or_init(ControlWorker::spawn)
    }

    fn spawn() -> Self {
        let (tx, rx) = unbounded::<Msg>();
        std::thread::Builder::new()
            .name("shunt-control".to_string())
            .spawn(move || run_control(rx))
            .expect("spawning the control worker");
        Self { tx }
    }

    /// Schedule `job` to run on the worker after `delay`.
    pub fn run_after(&self, delay: Duration, job: Job) {
        let at = Instant::now() + delay;
        if self.tx.send(Msg::Delayed { at, job }).is_err() {
            warn!("control worker gone, dropping job");
        }
    }

    /// Run every pending job now and wait until that is done.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(Msg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}


fn run_control(rx: Receiver<Msg>) {
    let mut pending: Vec<(Instant, Job)> = Vec::new();
    loop {
        let timeout = pending
            .iter()
            .map(|(at, _)| at.saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(Duration::from_millis(100));

        match rx.recv_timeout(timeout) {
            Ok(Msg::Delayed { at, job }) => pending.push((at, job)),
            Ok(Msg::Flush(ack)) => {
                for (_, job) in pending.drain(..) {
                    job();
                }
                let _ = ack.send(());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        let mut i = 0;
        while i < pending.len() {
            if pending[i].0 <= now {
                let (_, job) = pending.swap_remove(i);
                job();
            } else {
                i += 1;
            }
        }
    }
}
