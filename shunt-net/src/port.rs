//! Logical ports and the per-process port registry.
//!
//! Every device, software or physical, sits behind the [`EthPort`] trait
//! and is reached through its logical port ID. The registry's read path is
//! lock-free (the data plane resolves a port on every burst); writers
//! serialise on a mutex and publish a new table atomically.

use std::sync::{Arc, Mutex, OnceLock};

use arc_swap::ArcSwap;
use shunt_mem::{PktBuf, PktPool};
use tracing::debug;

use crate::error::{NetError, Result};

pub type PortId = u16;

pub const MAX_PORTS: usize = 64;

/// Queues covered by per-queue stats in [`PortStats`].
pub const MAX_QUEUE_STATS: usize = 16;

/// Device-level configuration copied onto a bypass device at attach.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevConfig {
    pub jumbo_frame: bool,
    pub max_rx_pkt_len: u32,
}

/// RX queue thresholds, saved at setup and replayed on the bypass device.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxQueueConf {
    pub free_thresh: u16,
}

/// TX queue thresholds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxQueueConf {
    pub free_thresh: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkStatus {
    pub speed_mbps: u32,
    pub full_duplex: bool,
    pub up: bool,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            speed_mbps: 10_000,
            full_duplex: true,
            up: false,
        }
    }
}

/// Aggregated device counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortStats {
    pub ipackets: u64,
    pub opackets: u64,
    pub oerrors: u64,
    pub q_ipackets: [u64; MAX_QUEUE_STATS],
    pub q_opackets: [u64; MAX_QUEUE_STATS],
    pub q_errors: [u64; MAX_QUEUE_STATS],
}

/// The seam between the registry and a device implementation.
///
/// Burst calls never fail and never block; adverse conditions return 0.
/// Control-plane calls return errors and leave no partial state behind.
pub trait EthPort: Send + Sync {
    fn name(&self) -> &str;

    fn mac_addr(&self) -> [u8; 6] {
        [0; 6]
    }

    fn configure(&self, nb_rx: u16, nb_tx: u16, conf: &DevConfig) -> Result<()>;

    fn rx_queue_setup(
        &self,
        queue: u16,
        nb_desc: u16,
        socket: u32,
        conf: &RxQueueConf,
        pool: &Arc<PktPool>,
    ) -> Result<()>;

    fn tx_queue_setup(&self, queue: u16, nb_desc: u16, socket: u32, conf: &TxQueueConf)
    -> Result<()>;

    fn start(&self) -> Result<()>;
    fn stop(&self);
    fn close(&self);

    fn link(&self) -> LinkStatus;
    fn set_link(&self, up: bool);

    fn stats(&self) -> PortStats;
    fn stats_reset(&self);

    /// Receive up to `n` buffers from `queue`, appending them to `bufs`.
    fn rx_burst(&self, queue: u16, bufs: &mut Vec<PktBuf>, n: u16) -> u16;

    /// Transmit from the front of `bufs`; accepted buffers are drained
    /// out, rejected ones stay for the caller.
    fn tx_burst(&self, queue: u16, bufs: &mut Vec<PktBuf>) -> u16;
}

type PortTable = Vec<Option<Arc<dyn EthPort>>>;

/// port_id -> device table with a lock-free read path.
pub struct PortRegistry {
    ports: ArcSwap<PortTable>,
    write_lock: Mutex<()>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self {
            ports: ArcSwap::from_pointee(vec![None; MAX_PORTS]),
            write_lock: Mutex::new(()),
        }
    }

    pub fn global() -> &'static PortRegistry {
        static GLOBAL: OnceLock<PortRegistry> = OnceLock::new();
        GLOBAL.get_or_init(PortRegistry::new)
    }

    /// Reserve a port ID and publish the device built for it.
    pub fn register<F>(&self, build: F) -> Result<PortId>
    where
        F: FnOnce(PortId) -> Arc<dyn EthPort>,
    {
        let _guard = self.write_lock.lock().expect("port registry poisoned");
        let mut table = (**self.ports.load()).clone();
        let id = table
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(NetError::NoFreePorts)? as PortId;
        let port = build(id);
        debug!(port = id, name = port.name(), "port registered");
        table[id as usize] = Some(port);
        self.ports.store(Arc::new(table));
        Ok(id)
    }

    pub fn unregister(&self, id: PortId) {
        let _guard = self.write_lock.lock().expect("port registry poisoned");
        let mut table = (**self.ports.load()).clone();
        if let Some(slot) = table.get_mut(id as usize) {
            *slot = None;
            self.ports.store(Arc::new(table));
        }
    }

    #[inline]
    pub fn get(&self, id: PortId) -> Option<Arc<dyn EthPort>> {
        self.ports.load().get(id as usize)?.clone()
    }

    pub fn is_valid(&self, id: PortId) -> bool {
        self.get(id).is_some()
    }

    pub fn find_by_name(&self, name: &str) -> Option<(PortId, Arc<dyn EthPort>)> {
        let table = self.ports.load();
        table.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|p| p.name() == name)
                .map(|p| (i as PortId, p.clone()))
        })
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.find_by_name(name).is_some()
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}
