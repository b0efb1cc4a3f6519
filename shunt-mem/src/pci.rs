//! Discovery of ivshmem PCI devices through sysfs.
//!
//! An ivshmem device (vendor 0x1af4, device 0x1110) exposes its shared
//! memory on BAR2. The first page of the BAR holds a metadata block
//! describing the zones inside it; a metadata whose name carries the
//! remap prefix additionally asks for each entry's existing mapping to be
//! torn down before re-ingest.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use tracing::{debug, info, warn};

use crate::config::SharedConfigFile;
use crate::error::{MemError, Result};
use crate::layout::{
    self, MAX_MEMSEG, MAX_PCI_DEVS, METADATA_MAGIC, Metadata, REMAP_PREFIX, ZoneDesc, align_ceil,
    align_floor, page_size,
};

pub const PCI_VENDOR_ID_IVSHMEM: u16 = 0x1af4;
pub const PCI_DEVICE_ID_IVSHMEM: u16 = 0x1110;

/// An ivshmem device found on the bus, with its metadata already read.
pub struct FoundDevice {
    /// Path of the BAR2 resource file.
    pub resource_path: PathBuf,
    /// Bus address of BAR2 (the ioremap base for this device).
    pub bar2_base: u64,
    pub metadata: Metadata,
}

/// Sysfs scanner; the root is injectable so tests can present a fake bus.
pub struct PciScanner {
    sysfs_root: PathBuf,
}

impl Default for PciScanner {
    fn default() -> Self {
        Self::new("/sys/bus/pci/devices")
    }
}

impl PciScanner {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
        }
    }

    /// Walk the bus and return every ivshmem device carrying valid
    /// metadata on BAR2.
    pub fn scan(&self) -> Result<Vec<FoundDevice>> {
        let mut found = Vec::new();
        debug!(root = %self.sysfs_root.display(), "searching for ivshmem devices");

        let entries = match std::fs::read_dir(&self.sysfs_root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let dir = entry?.path();
            if !is_ivshmem_device(&dir) {
                continue;
            }

            let resource_path = dir.join("resource2");
            let flen = match std::fs::metadata(&resource_path) {
                Ok(m) => m.len(),
                // no BAR2
                Err(_) => continue,
            };
            if flen == 0 {
                continue;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&resource_path)?;
            let metadata = match read_bar_metadata(&file, flen)? {
                Some(md) => md,
                None => {
                    debug!(dev = %dir.display(), "skipping non-shunt ivshmem device");
                    continue;
                }
            };

            let bar2_base = read_bar2_base(&dir)?;
            info!(dev = %dir.display(), bar2_base = format_args!("{bar2_base:#x}"),
                  "found ivshmem device");
            found.push(FoundDevice {
                resource_path,
                bar2_base,
                metadata,
            });
        }

        Ok(found)
    }
}

fn read_hex_id(path: &Path) -> Option<u16> {
    let text = std::fs::read_to_string(path).ok()?;
    u16::from_str_radix(text.trim().trim_start_matches("0x"), 16).ok()
}

fn is_ivshmem_device(dir: &Path) -> bool {
    read_hex_id(&dir.join("vendor")) == Some(PCI_VENDOR_ID_IVSHMEM)
        && read_hex_id(&dir.join("device")) == Some(PCI_DEVICE_ID_IVSHMEM)
}

/// Parse the BAR2 start address out of the device's `resource` file
/// (one `start end flags` line per BAR).
fn read_bar2_base(dir: &Path) -> Result<u64> {
    let text = std::fs::read_to_string(dir.join("resource"))?;
    let line = text.lines().nth(2).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "resource file has no BAR2")
    })?;
    let start = line.split_whitespace().next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed resource line")
    })?;
    u64::from_str_radix(start.trim_start_matches("0x"), 16)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad BAR2 base").into())
}

/// Map the metadata page of a BAR and copy the block out, if the magic
/// matches. `None` means "not one of ours".
fn read_bar_metadata(file: &File, flen: u64) -> Result<Option<Metadata>> {
    let md_len = std::mem::size_of::<Metadata>();
    let aligned = align_ceil(md_len as u64, page_size());
    if flen < aligned {
        return Ok(None);
    }

    let ptr = unsafe {
        mmap(
            None,
            NonZeroUsize::new(md_len).expect("metadata struct is not zero-sized"),
            ProtFlags::PROT_READ,
            MapFlags::MAP_SHARED,
            file,
            0,
        )?
    };
    // SAFETY: the mapping is at least md_len bytes and page-aligned
    let metadata = unsafe { std::ptr::read(ptr.as_ptr() as *const Metadata) };
    unsafe {
        let _ = munmap(ptr, md_len);
    }

    if metadata.magic != METADATA_MAGIC {
        return Ok(None);
    }
    Ok(Some(metadata))
}

/// True if this device's resource path is already in the shared config.
pub fn already_saved(cfg: &SharedConfigFile, resource_path: &Path) -> bool {
    let config = cfg.get();
    let path = resource_path.to_string_lossy();
    (0..config.pci_devs_idx as usize)
        .any(|i| layout::fixed_to_str(&config.pci_devs[i].path) == path)
}

/// Ingest a device's metadata entries into the shared config and record
/// the device. Returns the number of segments added.
pub fn ingest(cfg: &mut SharedConfigFile, dev: &FoundDevice) -> Result<usize> {
    let remap = dev.metadata.name_str().starts_with(REMAP_PREFIX);
    if remap {
        debug!(name = dev.metadata.name_str(), "metadata requests remapping");
    }

    let path = dev.resource_path.to_string_lossy();
    let config = cfg.get_mut();
    let start = config.segment_idx as usize;
    let mut idx = start;

    for entry in dev.metadata.entries.iter() {
        // stop on the first uninitialized zone
        if entry.zone.len == 0 {
            break;
        }
        if idx == MAX_MEMSEG {
            return Err(MemError::TableFull("memseg"));
        }

        let seg = &mut config.segment[idx];
        seg.entry = *entry;
        seg.align = 0;
        seg.path = layout::to_fixed(&path);
        seg.processed = 0;

        if remap {
            unmap_zone(&entry.zone);
        }
        idx += 1;
    }
    config.segment_idx = idx as u32;

    if config.pci_devs_idx as usize == MAX_PCI_DEVS {
        warn!("ivshmem PCI device limit exceeded, not recording device");
    } else {
        let dev_idx = config.pci_devs_idx as usize;
        config.pci_devs[dev_idx].path = layout::to_fixed(&path);
        config.pci_devs[dev_idx].ioremap_addr = dev.bar2_base;
        config.pci_devs_idx += 1;
    }

    Ok(idx - start)
}

/// Tear down an existing mapping of a zone (hot-replace path).
fn unmap_zone(zone: &ZoneDesc) {
    let page = page_size();
    let align = zone.virt_addr - align_floor(zone.virt_addr, page);
    let len = align_ceil(zone.len + align, page);
    let addr = zone.virt_addr - align;

    debug!(
        addr = format_args!("{addr:#x}"),
        len = format_args!("{len:#x}"),
        "unmapping zone"
    );
    match NonNull::new(addr as *mut std::ffi::c_void) {
        Some(ptr) => {
            // SAFETY: the caller published this zone as mapped at addr
            if let Err(e) = unsafe { munmap(ptr, len as usize) } {
                debug!(error = %e, "munmap failed");
            }
        }
        None => debug!("zone has no mapping to remove"),
    }
}
