//! RSS hash-queue fabric: indirection table plus hash QPs.
//!
//! The indirection table has a power-of-two slot count; when the RX queue
//! count is not a power of two, the tail slots wrap around and reuse
//! queues, so hashes are not spread uniformly. Four hash QPs select on
//! TCPv4/UDPv4 4-tuples, the IPv4 2-tuple, and a catch-all; a single
//! RX queue needs no spreading and gets only the catch-all.

use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, error, warn};

use crate::error::{NetError, Result};
use crate::hw::verbs::{HashQp, HashQpInit, NicContext, WorkQueue};

/// Default Toeplitz hash key.
pub const TOEPLITZ_KEY: [u8; 40] = [
    0x2c, 0xc6, 0x81, 0xd1, 0x5b, 0xdb, 0xf4, 0xf7, 0xfc, 0xa2, 0x83, 0x19, 0xdb, 0x1a, 0x3e,
    0x94, 0x6b, 0x9e, 0x38, 0xd9, 0x2c, 0x9c, 0x03, 0xd1, 0xad, 0x99, 0x44, 0xa7, 0xd9, 0x56,
    0x3d, 0x59, 0x06, 0x3c, 0x25, 0xf3, 0xfc, 0x1f, 0xdc, 0x2a,
];

bitflags! {
    /// Packet fields a hash QP feeds into the Toeplitz function.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HashFields: u32 {
        const SRC_IPV4 = 0x01;
        const DST_IPV4 = 0x02;
        const SRC_PORT_TCP = 0x04;
        const DST_PORT_TCP = 0x08;
        const SRC_PORT_UDP = 0x10;
        const DST_PORT_UDP = 0x20;

        const TCPV4_4TUPLE = 0x01 | 0x02 | 0x04 | 0x08;
        const UDPV4_4TUPLE = 0x01 | 0x02 | 0x10 | 0x20;
        const IPV4_2TUPLE = 0x01 | 0x02;
    }
}

/// Hash kinds in priority order; the last (empty) entry catches
/// everything else.
const RSS_HASH_TABLE: [HashFields; 4] = [
    HashFields::TCPV4_4TUPLE,
    HashFields::UDPV4_4TUPLE,
    HashFields::IPV4_2TUPLE,
    HashFields::empty(),
];

/// Nearest power-of-two exponent at or above `v`.
pub fn log2above(v: u32) -> u32 {
    match v {
        0 | 1 => 0,
        v => u32::BITS - (v - 1).leading_zeros(),
    }
}

/// The RSS indirection table: hash buckets to work queues.
pub struct IndTable {
    wqs: Vec<Arc<WorkQueue>>,
    log_size: u32,
}

impl IndTable {
    pub fn len(&self) -> usize {
        self.wqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wqs.is_empty()
    }

    pub fn log_size(&self) -> u32 {
        self.log_size
    }

    pub fn wq(&self, slot: usize) -> &Arc<WorkQueue> {
        &self.wqs[slot]
    }
}

/// One hash RX queue: a QP selecting on a field mask over the table.
pub struct HashRxQueue {
    pub fields: HashFields,
    qp: HashQp,
}

impl HashRxQueue {
    pub fn fields_mask(&self) -> u32 {
        self.qp.fields_mask
    }
}

/// The full fabric, destroyed as a unit.
pub struct HashFabric {
    pub ind_table: Arc<IndTable>,
    pub hash_rxqs: Vec<HashRxQueue>,
}

impl HashFabric {
    pub fn hash_rxqs_n(&self) -> usize {
        self.hash_rxqs.len()
    }
}

/// Build the indirection table and hash QPs over the given work queues.
///
/// On any hash-QP creation failure, the QPs already created here and the
/// table are destroyed before the error is returned.
pub fn create_hash_rxqs(ctx: &NicContext, wqs: &[Arc<WorkQueue>]) -> Result<HashFabric> {
    let rxqs_n = wqs.len() as u32;
    if rxqs_n == 0 {
        return Err(NetError::NoRxQueues);
    }
    debug!(rxqs = rxqs_n, "allocating hash RX queues");

    let log_size = log2above(rxqs_n);
    let wqs_n = 1u32 << log_size;
    if wqs_n != rxqs_n {
        warn!(
            rxqs = rxqs_n,
            padded = wqs_n,
            "RX queue count is not a power of two, consider rounding up for uniform spreading"
        );
    }

    // pad the tail by wrapping around and reusing queues
    let table: Vec<Arc<WorkQueue>> = (0..wqs_n as usize)
        .map(|i| wqs[i % wqs.len()].clone())
        .collect();
    let ind_table = Arc::new(IndTable {
        wqs: table,
        log_size,
    });

    // a single RX queue only needs the catch-all entry
    let hash_rxqs_n = if rxqs_n == 1 { 1 } else { RSS_HASH_TABLE.len() };
    let mut hash_rxqs = Vec::with_capacity(hash_rxqs_n);

    for fields in &RSS_HASH_TABLE[RSS_HASH_TABLE.len() - hash_rxqs_n..] {
        let qp = match ctx.create_hash_qp(HashQpInit {
            rx_hash_fields_mask: fields.bits(),
            key: TOEPLITZ_KEY.to_vec(),
        }) {
            Ok(qp) => qp,
            Err(e) => {
                error!(error = %e, "hash RX QP creation failure");
                // unwind QPs created in this call, then the table
                drop(hash_rxqs);
                drop(ind_table);
                return Err(e.into());
            }
        };
        hash_rxqs.push(HashRxQueue {
            fields: *fields,
            qp,
        });
    }

    Ok(HashFabric {
        ind_table,
        hash_rxqs,
    })
}
