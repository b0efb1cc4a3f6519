//! Shared fixtures for the bypass integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use shunt_mem::{PktBuf, PktPool, PktRing};
use shunt_net::dataplane::device::RingDevice;
use shunt_net::dataplane::queue::BypassState;
use shunt_net::port::{DevConfig, EthPort, PortId, PortRegistry, RxQueueConf, TxQueueConf};

pub const POOL_BUFS: usize = 128;
pub const RING_CAP: usize = 1024;

/// A fully set-up single-queue ring device with distinct RX/TX rings.
pub struct Fixture {
    pub port_id: PortId,
    pub dev: Arc<RingDevice>,
    pub rx_ring: Arc<PktRing>,
    pub tx_ring: Arc<PktRing>,
    pub pool: Arc<PktPool>,
}

impl Fixture {
    /// `tag` keeps names unique across tests sharing the process-global
    /// registries.
    pub fn new(tag: &str) -> Fixture {
        let pool = Arc::new(PktPool::new(&format!("{tag}_pool"), POOL_BUFS, 2048, 0).expect("pool"));
        let rx_ring = PktRing::new(&format!("{tag}_rx"), RING_CAP);
        let tx_ring = PktRing::new(&format!("{tag}_tx"), RING_CAP);

        let port_id = RingDevice::from_rings(
            &format!("{tag}_dev"),
            &[rx_ring.clone()],
            &[tx_ring.clone()],
            0,
        )
        .expect("from_rings");
        let dev = RingDevice::get(port_id).expect("device");

        dev.configure(1, 1, &DevConfig::default()).expect("configure");
        dev.rx_queue_setup(0, 128, 0, &RxQueueConf::default(), &pool)
            .expect("rx queue setup");
        dev.tx_queue_setup(0, 128, 0, &TxQueueConf::default())
            .expect("tx queue setup");
        dev.start().expect("start");

        Fixture {
            port_id,
            dev,
            rx_ring,
            tx_ring,
            pool,
        }
    }

    pub fn port(&self) -> Arc<dyn EthPort> {
        PortRegistry::global().get(self.port_id).expect("port")
    }

    /// Wait until the device reaches the given bypass state.
    pub fn wait_bypass_state(&self, want: BypassState, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.dev.bypass_state() != want {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for bypass state {want:?}, still {:?}",
                self.dev.bypass_state()
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// A one-byte frame tagged for order checking.
pub fn frame(pool: &Arc<PktPool>, tag: u8) -> PktBuf {
    let mut buf = pool.alloc().expect("alloc");
    buf.write_area()[0] = tag;
    buf.data_len = 1;
    buf.pkt_len = 1;
    buf
}

pub fn tags(bufs: &[PktBuf]) -> Vec<u8> {
    bufs.iter().map(|b| b.data()[0]).collect()
}
