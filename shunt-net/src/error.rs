//! Error types for the driver layer.

use crate::hw::verbs::VerbsError;
use crate::port::PortId;

/// Control-plane errors. The data path never returns these; it degrades
/// to empty bursts and counts drops instead.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("memory layer error: {0}")]
    Mem(#[from] shunt_mem::MemError),

    #[error("verbs error: {0}")]
    Verbs(#[from] VerbsError),

    #[error("port {0} is not valid")]
    InvalidPort(PortId),

    #[error("port '{0}' not found")]
    PortNotFound(String),

    #[error("device '{0}' already exists")]
    DeviceExists(String),

    #[error("port {0} is not a ring device")]
    NotRingDevice(PortId),

    #[error("port table is full")]
    NoFreePorts,

    #[error("queue {0} out of range")]
    InvalidQueue(u16),

    #[error("{0} queues requested, at most {1} supported")]
    TooManyQueues(usize, usize),

    #[error("{got} descriptors, must be a positive multiple of {multiple}")]
    BadDescCount { got: u16, multiple: u16 },

    #[error("mempool '{0}' is empty")]
    NoBuffers(String),

    #[error("no RX queues configured")]
    NoRxQueues,

    #[error("a bypass device is already attached")]
    BypassAttached,

    #[error("no bypass device attached")]
    NoBypass,

    #[error("queue setup was never completed on queue {0}")]
    QueueNotSetUp(u16),

    #[error("queue unusable after failed rehash")]
    QueueUnusable,

    #[error("cannot parse '{0}'")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
