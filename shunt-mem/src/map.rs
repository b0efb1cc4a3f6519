//! Materialising shared segments in the local process.
//!
//! Every unprocessed segment in the shared config is page-aligned, merged
//! with its neighbours, then mapped at the exact virtual address its
//! publisher used, so that pointers stored inside the shared memory stay
//! valid. The mapping dance: reserve the range with a private /dev/zero
//! mapping (fails loudly if the address space is taken), drop the
//! reservation, then map the PCI resource file MAP_SHARED at the same
//! address, demanding the kernel lands on it.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use tracing::{debug, info};

use crate::config::SharedConfigFile;
use crate::error::{MemError, Result};
use crate::layout::{
    self, MAX_MEMSEG, MAX_MEMZONE, SegmentRecord, ZoneDesc, align_ceil, align_floor, page_size,
};
use crate::ring::{PktRing, RING_HDR_MAGIC, RING_MZ_PREFIX, RingHeader, RingRegistry};
use crate::segment::cleanup_segments;

/// One OS-level shared mapping materialised in this process.
#[derive(Debug, Clone, Copy)]
pub struct Memseg {
    pub addr: u64,
    pub len: u64,
    pub phys_addr: u64,
    pub ioremap_addr: u64,
    pub hugepage_sz: u64,
    pub socket_id: i32,
}

impl Memseg {
    pub fn contains(&self, zone: &ZoneDesc) -> bool {
        zone.virt_addr >= self.addr && zone.virt_addr < self.addr + self.len
    }
}

/// Process-local tables of materialised segments and published zones.
pub struct MemRegistry {
    memsegs: Vec<Memseg>,
    memzones: Vec<ZoneDesc>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self {
            memsegs: Vec::new(),
            memzones: Vec::new(),
        }
    }

    pub fn memsegs(&self) -> &[Memseg] {
        &self.memsegs
    }

    pub fn memzones(&self) -> &[ZoneDesc] {
        &self.memzones
    }

    pub fn zone_lookup(&self, name: &str) -> Option<&ZoneDesc> {
        self.memzones.iter().find(|z| z.name_str() == name)
    }

    fn add_memseg(&mut self, ms: Memseg) -> Result<()> {
        if self.memsegs.len() == MAX_MEMSEG {
            return Err(MemError::TableFull("memseg"));
        }
        self.memsegs.push(ms);
        Ok(())
    }

    fn publish_zone(&mut self, zone: ZoneDesc) -> Result<()> {
        if self.memzones.len() == MAX_MEMZONE {
            return Err(MemError::TableFull("memzone"));
        }
        self.memzones.push(zone);
        Ok(())
    }
}

impl Default for MemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the working table from unprocessed config segments, coalesce it,
/// and map every resulting segment. Returns the number of segments mapped.
pub fn map_all_segments(cfg: &mut SharedConfigFile, reg: &mut MemRegistry) -> Result<usize> {
    let page = page_size();
    let mut tbl: Vec<SegmentRecord> = Vec::new();

    {
        let config = cfg.get_mut();
        for i in 0..config.segment_idx as usize {
            if config.segment[i].processed != 0 {
                continue;
            }

            // the ioremap base comes from the contributing device
            let path = config.segment[i].path_str().to_string();
            let ioremap_base = (0..config.pci_devs_idx as usize)
                .find(|&j| layout::fixed_to_str(&config.pci_devs[j].path) == path)
                .map(|j| config.pci_devs[j].ioremap_addr)
                .ok_or_else(|| MemError::IoremapNotFound(path.clone().into()))?;

            let seg = &mut config.segment[i];
            let align = seg.entry.zone.virt_addr - align_floor(seg.entry.zone.virt_addr, page);
            let len = align_ceil(seg.entry.zone.len + align, page);

            let mut rec = *seg;
            rec.align = align;
            rec.entry.zone.virt_addr -= align;
            rec.entry.zone.phys_addr -= align;
            rec.entry.zone.len = len;
            rec.entry.zone.ioremap_addr = ioremap_base + seg.entry.offset - align;
            rec.entry.offset -= align;
            tbl.push(rec);

            seg.processed = 1;
        }
    }

    if tbl.is_empty() {
        return Ok(0);
    }

    cleanup_segments(&mut tbl)?;

    let zero = OpenOptions::new().read(true).write(true).open("/dev/zero")?;
    for rec in &tbl {
        let ms = map_one_segment(rec, &zero)?;
        info!(
            addr = format_args!("{:#x}", ms.addr),
            len = format_args!("{:#x}", ms.len),
            "shared segment mapped"
        );
        reg.add_memseg(ms)?;
    }

    Ok(tbl.len())
}

fn map_at(
    addr: u64,
    len: usize,
    flags: MapFlags,
    file: &File,
    offset: i64,
) -> Result<std::ptr::NonNull<std::ffi::c_void>> {
    let base = unsafe {
        mmap(
            NonZeroUsize::new(addr as usize),
            NonZeroUsize::new(len).expect("segment length is never zero"),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            flags,
            file,
            offset,
        )?
    };
    if base.as_ptr() as u64 != addr {
        // the address hint was not honoured; someone owns that range
        unsafe {
            let _ = munmap(base, len);
        }
        return Err(MemError::MapMismatch {
            want: addr,
            got: base.as_ptr() as u64,
        });
    }
    Ok(base)
}

fn map_one_segment(seg: &SegmentRecord, zero: &File) -> Result<Memseg> {
    let zone = &seg.entry.zone;
    let addr = zone.virt_addr;
    let len = zone.len as usize;

    debug!(
        addr = format_args!("{addr:#x}"),
        len = format_args!("{len:#x}"),
        offset = format_args!("{:#x}", seg.entry.offset),
        align = format_args!("{:#x}", seg.align),
        "mapping segment"
    );

    // reserve the range, then hand it over to the real mapping
    let reservation = map_at(addr, len, MapFlags::MAP_PRIVATE, zero, 0)?;
    unsafe {
        let _ = munmap(reservation, len);
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(seg.path_str())?;
    map_at(
        addr,
        len,
        MapFlags::MAP_SHARED,
        &file,
        seg.entry.offset as i64,
    )?;

    // put the addresses back to their unaligned originals
    Ok(Memseg {
        addr: addr + seg.align,
        len: zone.len - seg.align,
        phys_addr: zone.phys_addr + seg.align,
        ioremap_addr: zone.ioremap_addr + seg.align,
        hugepage_sz: zone.hugepage_sz,
        socket_id: zone.socket_id,
    })
}

/// Publish the zones recorded in the config and register any rings living
/// inside them. Runs after `map_all_segments`, once the memory is there.
pub fn obj_init(
    cfg: &SharedConfigFile,
    reg: &mut MemRegistry,
    rings: &RingRegistry,
) -> Result<usize> {
    let config = cfg.get();
    let mut published = 0;

    for i in 0..config.segment_idx as usize {
        let mut zone = config.segment[i].entry.zone;
        if reg.zone_lookup(zone.name_str()).is_some() {
            continue;
        }

        // fix up the ioremap address relative to the containing memseg
        let ms = reg
            .memsegs()
            .iter()
            .find(|ms| ms.contains(&zone))
            .copied();
        if let Some(ms) = ms {
            zone.ioremap_addr = ms.ioremap_addr + (zone.virt_addr - ms.addr);
        }

        debug!(name = zone.name_str(), addr = format_args!("{:#x}", zone.virt_addr),
               "publishing zone");
        reg.publish_zone(zone)?;
        published += 1;
    }

    // rings are zones with the ring name prefix and a live header
    for zone in reg.memzones() {
        if zone.ioremap_addr == 0 || !zone.name_str().starts_with(RING_MZ_PREFIX) {
            continue;
        }
        let name = zone.name_str()[RING_MZ_PREFIX.len()..].to_string();

        // SAFETY: the zone was mapped by map_all_segments at virt_addr
        let header = unsafe { std::ptr::read(zone.virt_addr as *const RingHeader) };
        if header.magic != RING_HDR_MAGIC || header.capacity == 0 {
            debug!(name, "zone has ring prefix but no ring header");
            continue;
        }

        let ring = PktRing::new(&name, header.capacity as usize);
        if rings.insert_if_absent(ring) {
            info!(name, capacity = header.capacity, "found ring");
        }
    }

    Ok(published)
}

/// Convenience for tests and hot-plug: number of zones a path contributed.
pub fn segments_for_path(cfg: &SharedConfigFile, path: &Path) -> usize {
    let config = cfg.get();
    let path = path.to_string_lossy();
    (0..config.segment_idx as usize)
        .filter(|&i| config.segment[i].path_str() == path)
        .count()
}
