pub mod config;
pub mod error;
pub mod hotplug;
pub mod layout;
pub mod manager;
pub mod map;
pub mod mempool;
pub mod pci;
pub mod ring;
pub mod segment;

pub use error::{MemError, Result};
pub use mempool::{HEADROOM, PktBuf, PktPool};
pub use ring::{PktRing, RingRegistry};
