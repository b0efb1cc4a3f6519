pub mod dataplane;
pub mod error;
pub mod hw;
pub mod port;
pub mod serial;
pub mod test_util;
pub mod vdev;

pub use error::{NetError, Result};
pub use port::{EthPort, PortId, PortRegistry};
