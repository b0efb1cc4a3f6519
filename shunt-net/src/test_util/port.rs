//! A queue-backed stand-in for a physical port.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use shunt_mem::{PktBuf, PktPool};

use crate::error::Result;
use crate::port::{
    DevConfig, EthPort, LinkStatus, PortId, PortRegistry, PortStats, RxQueueConf, TxQueueConf,
};

/// Emulated wire: frames injected with [`TestPort::inject_rx`] come out
/// of `rx_burst`; everything transmitted lands in a sink for inspection.
pub struct TestPort {
    name: String,
    started: AtomicBool,
    link_up: AtomicBool,
    rx_src: Mutex<VecDeque<PktBuf>>,
    tx_sink: Mutex<Vec<PktBuf>>,
    /// Transmissions rejected while the port reports no capacity.
    tx_capacity: Mutex<Option<usize>>,
}

impl TestPort {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            started: AtomicBool::new(false),
            link_up: AtomicBool::new(false),
            rx_src: Mutex::new(VecDeque::new()),
            tx_sink: Mutex::new(Vec::new()),
            tx_capacity: Mutex::new(None),
        })
    }

    /// Register with the global port registry.
    pub fn register(self: &Arc<Self>) -> Result<PortId> {
        let this = self.clone();
        PortRegistry::global().register(move |_| this)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Queue a frame for delivery on the next `rx_burst`.
    pub fn inject_rx(&self, buf: PktBuf) {
        self.rx_src.lock().expect("rx src lock").push_back(buf);
    }

    /// Take everything transmitted so far.
    pub fn drain_tx(&self) -> Vec<PktBuf> {
        std::mem::take(&mut *self.tx_sink.lock().expect("tx sink lock"))
    }

    pub fn tx_count(&self) -> usize {
        self.tx_sink.lock().expect("tx sink lock").len()
    }

    /// Cap how many more frames the port accepts (None = unlimited).
    pub fn set_tx_capacity(&self, n: Option<usize>) {
        *self.tx_capacity.lock().expect("tx capacity lock") = n;
    }
}

impl EthPort for TestPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, _nb_rx: u16, _nb_tx: u16, _conf: &DevConfig) -> Result<()> {
        Ok(())
    }

    fn rx_queue_setup(
        &self,
        _queue: u16,
        _nb_desc: u16,
        _socket: u32,
        _conf: &RxQueueConf,
        _pool: &Arc<PktPool>,
    ) -> Result<()> {
        Ok(())
    }

    fn tx_queue_setup(
        &self,
        _queue: u16,
        _nb_desc: u16,
        _socket: u32,
        _conf: &TxQueueConf,
    ) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::Release);
        self.link_up.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.link_up.store(false, Ordering::Release);
    }

    fn close(&self) {}

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
        PortStats::default()
    }

    fn stats_reset(&self) {}

    fn rx_burst(&self, _queue: u16, bufs: &mut Vec<PktBuf>, n: u16) -> u16 {
        let mut src = self.rx_src.lock().expect("rx src lock");
        let mut got = 0;
        while got < n {
            match src.pop_front() {
                Some(buf) => {
                    bufs.push(buf);
                    got += 1;
                }
                None => break,
            }
        }
        got
    }

    fn tx_burst(&self, _queue: u16, bufs: &mut Vec<PktBuf>) -> u16 {
        let mut sink = self.tx_sink.lock().expect("tx sink lock");
        let mut capacity = self.tx_capacity.lock().expect("tx capacity lock");

        let accept = match *capacity {
            Some(cap) => cap.min(bufs.len()),
            None => bufs.len(),
        };
        if let Some(cap) = capacity.as_mut() {
            *cap -= accept;
        }
        sink.extend(bufs.drain(..accept));
        accept as u16
    }
}
