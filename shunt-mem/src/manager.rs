//! Ties discovery, the shared config, mapping and object init together.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use crate::config::{SharedConfigFile, config_path};
use crate::error::Result;
use crate::hotplug::HotplugMonitor;
use crate::map::{self, MemRegistry};
use crate::pci::{self, PciScanner};
use crate::ring::RingRegistry;

/// Role of this process with respect to the shared config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcRole {
    /// Owns the config: scans devices, maps segments, publishes objects.
    Primary,
    /// Attaches to a config published by a primary.
    Secondary,
}

/// The shared-memory manager for one process.
pub struct IvshmemManager {
    scanner: PciScanner,
    config_path: PathBuf,
    /// Created lazily when the first device with metadata is found.
    cfg: Option<SharedConfigFile>,
    registry: MemRegistry,
    rings: &'static RingRegistry,
}

impl IvshmemManager {
    pub fn new(prefix: &str) -> Self {
        Self::with_paths(config_path(prefix), PciScanner::default())
    }

    /// Construct with explicit paths (tests present a fake bus and a
    /// config file in a scratch directory).
    pub fn with_paths(config_path: PathBuf, scanner: PciScanner) -> Self {
        Self {
            scanner,
            config_path,
            cfg: None,
            registry: MemRegistry::new(),
            rings: RingRegistry::global(),
        }
    }

    pub fn registry(&self) -> &MemRegistry {
        &self.registry
    }

    pub fn config(&self) -> Option<&SharedConfigFile> {
        self.cfg.as_ref()
    }

    /// Initialise per the process role. For a secondary, attaching to no
    /// config at all is a normal boot.
    pub fn init(&mut self, role: ProcRole) -> Result<()> {
        match role {
            ProcRole::Secondary => {
                self.cfg = SharedConfigFile::open(&self.config_path)?;
                if self.cfg.is_none() {
                    debug!("no ivshmem configuration found");
                }
                Ok(())
            }
            ProcRole::Primary => self.scan_and_map(),
        }
    }

    /// One full pass of the pipeline: discovery, ingest, mapping, object
    /// init. Also the hot-plug re-entry point.
    pub fn scan_and_map(&mut self) -> Result<()> {
        let found = self.scanner.scan()?;
        if found.is_empty() && self.cfg.is_none() {
            debug!("no ivshmem devices found");
            return Ok(());
        }

        // config creation is deferred until the first device is found
        if self.cfg.is_none() {
            self.cfg = Some(SharedConfigFile::create(&self.config_path)?);
        }
        let cfg = self.cfg.as_mut().expect("config just created");

        for dev in &found {
            if pci::already_saved(cfg, &dev.resource_path) {
                debug!(path = %dev.resource_path.display(), "skipping known device");
                continue;
            }
            let added = pci::ingest(cfg, dev)?;
            info!(path = %dev.resource_path.display(), segments = added, "device ingested");
        }

        map::map_all_segments(cfg, &mut self.registry)?;
        map::obj_init(cfg, &mut self.registry, self.rings)?;
        Ok(())
    }

    /// Spawn the hot-plug monitor wired back into this manager.
    pub fn spawn_hotplug(mgr: Arc<Mutex<IvshmemManager>>) -> Result<HotplugMonitor> {
        HotplugMonitor::spawn(Box::new(move || {
            let mut mgr = match mgr.lock() {
                Ok(m) => m,
                Err(_) => return,
            };
            if let Err(e) = mgr.scan_and_map() {
                error!(error = %e, "hot-plug rescan failed");
            }
        }))
    }
}
