//! Virtual-device parameters: `nodeaction=<name>:<numa>:<CREATE|ATTACH>`.
//!
//! CREATE allocates the per-queue rings; ATTACH looks them up by name so
//! two processes (or two devices) can share one set of rings. With no
//! parameters the device is created on the local node, falling back to
//! ATTACH when the rings already exist.

use std::sync::Arc;

use shunt_mem::ring::{PktRing, RingRegistry};
use tracing::{info, warn};

use crate::dataplane::device::{RXTX_MAX, RingDevice};
use crate::error::{NetError, Result};
use crate::port::PortId;

/// Ring capacity for CREATE.
pub const RING_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevAction {
    Create,
    Attach,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAction {
    pub name: String,
    pub node: u32,
    pub action: DevAction,
}

/// Name of the i-th shared ring of a device.
pub fn ring_name(i: usize, dev: &str) -> String {
    format!("ETH_RXTX{i}_{dev}")
}

/// Parse one `<name>:<numa>:<CREATE|ATTACH>` value.
pub fn parse_nodeaction(value: &str) -> Result<NodeAction> {
    let mut parts = value.splitn(3, ':');
    let (Some(name), Some(node), Some(action)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(NetError::Parse(value.to_string()));
    };
    if name.is_empty() {
        return Err(NetError::Parse(value.to_string()));
    }
    let node: u32 = node
        .parse()
        .map_err(|_| NetError::Parse(value.to_string()))?;
    let action = match action {
        "CREATE" => DevAction::Create,
        "ATTACH" => DevAction::Attach,
        _ => return Err(NetError::Parse(value.to_string())),
    };
    Ok(NodeAction {
        name: name.to_string(),
        node,
        action,
    })
}

/// Parse a full parameter string: comma-separated `nodeaction=` pairs.
pub fn parse_params(params: &str) -> Result<Vec<NodeAction>> {
    params
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|kv| {
            let value = kv
                .strip_prefix("nodeaction=")
                .ok_or_else(|| NetError::Parse(kv.to_string()))?;
            parse_nodeaction(value)
        })
        .collect()
}

fn rings(base: &str, action: DevAction) -> Result<Vec<Arc<PktRing>>> {
    let registry = RingRegistry::global();
    (0..RXTX_MAX)
        .map(|i| {
            let name = ring_name(i, base);
            match action {
                // rings carry single-producer/single-consumer traffic;
                // the burst API documents that contract
                DevAction::Create => registry.create(&name, RING_SIZE).map_err(NetError::Mem),
                DevAction::Attach => registry
                    .lookup(&name)
                    .ok_or(NetError::Mem(shunt_mem::MemError::RingNotFound(name))),
            }
        })
        .collect()
}

fn create_dev(dev_name: &str, ring_base: &str, node: u32, action: DevAction) -> Result<PortId> {
    let rxtx = rings(ring_base, action)?;
    RingDevice::from_rings(dev_name, &rxtx, &rxtx, node)
}

/// Probe a virtual device from its name and parameter string, creating
/// one port per action pair (one port on the local node when the string
/// is empty). CREATE failures fall back to ATTACH.
pub fn probe(name: &str, params: &str) -> Result<Vec<PortId>> {
    info!(name, params, "initializing ring vdev");

    if params.is_empty() {
        let port = create_with_fallback(name, name, 0)?;
        return Ok(vec![port]);
    }

    let actions = match parse_params(params) {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "ignoring unsupported parameters");
            let port = create_with_fallback(name, name, 0)?;
            return Ok(vec![port]);
        }
    };

    let mut ports = Vec::new();
    for na in actions {
        let port = match na.action {
            DevAction::Create => create_with_fallback(name, &na.name, na.node)?,
            DevAction::Attach => create_dev(name, &na.name, na.node, DevAction::Attach)?,
        };
        ports.push(port);
    }
    Ok(ports)
}

fn create_with_fallback(dev_name: &str, ring_base: &str, node: u32) -> Result<PortId> {
    match create_dev(dev_name, ring_base, node, DevAction::Create) {
        Ok(port) => Ok(port),
        Err(NetError::Mem(shunt_mem::MemError::DuplicateRing(_))) => {
            info!(name = dev_name, "rings exist, attaching instead");
            create_dev(dev_name, ring_base, node, DevAction::Attach)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nodeaction() {
        let na = parse_nodeaction("net0:1:CREATE").expect("parse");
        assert_eq!(na.name, "net0");
        assert_eq!(na.node, 1);
        assert_eq!(na.action, DevAction::Create);

        let na = parse_nodeaction("x:0:ATTACH").expect("parse");
        assert_eq!(na.action, DevAction::Attach);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_nodeaction("net0:1").is_err());
        assert!(parse_nodeaction("net0:one:CREATE").is_err());
        assert!(parse_nodeaction("net0:1:DESTROY").is_err());
        assert!(parse_nodeaction(":1:CREATE").is_err());
    }

    #[test]
    fn test_parse_params_list() {
        let actions =
            parse_params("nodeaction=a:0:CREATE,nodeaction=b:1:ATTACH").expect("parse");
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].name, "a");
        assert_eq!(actions[1].action, DevAction::Attach);

        assert!(parse_params("bogus=a:0:CREATE").is_err());
    }

    #[test]
    fn test_ring_name_format() {
        assert_eq!(ring_name(3, "net0"), "ETH_RXTX3_net0");
    }

    #[test]
    fn test_probe_create_then_attach() {
        // CREATE builds the rings, a second device ATTACHes to them
        let ports = probe("vdev_probe_a", "nodeaction=vdev_probe_a:0:CREATE").expect("probe");
        assert_eq!(ports.len(), 1);
        assert!(
            RingRegistry::global()
                .lookup(&ring_name(0, "vdev_probe_a"))
                .is_some()
        );

        let ports2 = probe("vdev_probe_b", "nodeaction=vdev_probe_a:0:ATTACH").expect("probe");
        assert_eq!(ports2.len(), 1);
        assert_ne!(ports[0], ports2[0]);
    }

    #[test]
    fn test_probe_empty_params_falls_back() {
        let first = probe("vdev_fallback", "").expect("probe");
        assert_eq!(first.len(), 1);
        // same name again: CREATE fails on duplicate rings, device name
        // also exists, so the whole probe errors
        assert!(matches!(
            probe("vdev_fallback", ""),
            Err(NetError::DeviceExists(_))
        ));
    }

    #[test]
    fn test_attach_missing_rings_fails() {
        assert!(matches!(
            probe("vdev_absent", "nodeaction=no_such_rings:0:ATTACH"),
            Err(NetError::Mem(shunt_mem::MemError::RingNotFound(_)))
        ));
    }
}
