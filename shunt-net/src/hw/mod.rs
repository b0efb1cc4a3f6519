//! Hardware RX path: the verbs-style device layer, receive queue element
//! lifecycle, and the RSS hash-queue fabric.

pub mod rss;
pub mod rxq;
pub mod verbs;

pub use rxq::{HwRxQueue, SG_WR_N};
pub use verbs::{NicContext, WorkQueue, WqState};
