//! End-to-end ivshmem pipeline: fake bus -> discovery -> config ->
//! coalescing -> mapping -> object init, plus the hot-plug rescan path.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use shunt_mem::layout::{self, METADATA_MAGIC, Metadata, MetadataEntry};
use shunt_mem::manager::{IvshmemManager, ProcRole};
use shunt_mem::map::segments_for_path;
use shunt_mem::pci::PciScanner;
use shunt_mem::ring::{RING_HDR_MAGIC, RingHeader, RingRegistry};

const BAR_LEN: u64 = 0x20_0000;
/// Zone payloads start well past the metadata pages.
const ZONE_BASE_OFF: u64 = 0x4000;

fn as_bytes<T>(v: &T) -> &[u8] {
    // SAFETY: T is plain repr(C) data in these tests
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, std::mem::size_of::<T>()) }
}

/// Reserve-and-release a range so the pipeline can map at a known-free
/// virtual address.
fn probe_free_range(len: usize) -> u64 {
    let ptr = unsafe {
        mmap_anonymous(
            None,
            NonZeroUsize::new(len).unwrap(),
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        )
        .expect("probe mmap")
    };
    let addr = ptr.as_ptr() as u64;
    unsafe { munmap(ptr, len).expect("probe munmap") };
    addr
}

fn entry(name: &str, virt: u64, phys: u64, len: u64, offset: u64) -> MetadataEntry {
    let mut e = MetadataEntry::zeroed();
    e.zone.set_name(name);
    e.zone.virt_addr = virt;
    e.zone.phys_addr = phys;
    e.zone.len = len;
    e.offset = offset;
    e
}

/// Lay down a fake sysfs PCI device whose BAR2 file carries the metadata.
fn fake_device(bus: &Path, addr: &str, bar2_base: u64, entries: &[MetadataEntry]) -> PathBuf {
    let dev = bus.join(addr);
    std::fs::create_dir_all(&dev).expect("mkdir");
    std::fs::write(dev.join("vendor"), "0x1af4\n").expect("vendor");
    std::fs::write(dev.join("device"), "0x1110\n").expect("device");
    std::fs::write(
        dev.join("resource"),
        format!(
            "0x0 0x0 0x0\n0x0 0x0 0x0\n{bar2_base:#x} {:#x} 0x0\n",
            bar2_base + BAR_LEN - 1
        ),
    )
    .expect("resource");

    let mut md = Metadata::zeroed();
    md.magic = METADATA_MAGIC;
    md.name = layout::to_fixed("e2e");
    for (i, e) in entries.iter().enumerate() {
        md.entries[i] = *e;
    }

    let mut f = File::create(dev.join("resource2")).expect("resource2");
    f.write_all(as_bytes(&md)).expect("metadata");
    f.set_len(BAR_LEN).expect("bar size");
    dev.join("resource2")
}

fn write_ring_header(resource2: &Path, offset: u64, capacity: u32) {
    let hdr = RingHeader {
        magic: RING_HDR_MAGIC,
        capacity,
    };
    let mut f = File::options().write(true).open(resource2).expect("open");
    f.seek(SeekFrom::Start(offset)).expect("seek");
    f.write_all(as_bytes(&hdr)).expect("header");
}

#[test]
fn test_pipeline_and_hotplug_rescan() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bus = dir.path().join("bus");
    std::fs::create_dir_all(&bus).expect("bus dir");

    // device 1: one page-aligned zone holding a ring
    let virt1 = probe_free_range(0x1000);
    let res1 = fake_device(
        &bus,
        "0000:00:05.0",
        0xfe00_0000,
        &[entry("RG_e2e_ring", virt1, 0x4000_0000, 0x1000, ZONE_BASE_OFF)],
    );
    write_ring_header(&res1, ZONE_BASE_OFF, 64);

    let mut mgr = IvshmemManager::with_paths(
        dir.path().join(".e2e_ivshmem_config"),
        PciScanner::new(&bus),
    );
    mgr.init(ProcRole::Primary).expect("init");

    assert_eq!(mgr.registry().memsegs().len(), 1);
    let ms = mgr.registry().memsegs()[0];
    assert_eq!(ms.addr, virt1);
    assert_eq!(ms.len, 0x1000);
    assert_eq!(ms.ioremap_addr, 0xfe00_0000 + ZONE_BASE_OFF);

    assert!(mgr.registry().zone_lookup("RG_e2e_ring").is_some());
    let ring = RingRegistry::global()
        .lookup("e2e_ring")
        .expect("ring registered from zone");
    assert_eq!(ring.capacity(), 64);

    let cfg = mgr.config().expect("config");
    assert_eq!(cfg.get().segment_idx, 1);
    assert_eq!(segments_for_path(cfg, &res1), 1);

    // hot-plug: a second device appears with two fully adjacent zones
    let virt2 = probe_free_range(0x2000);
    let res2 = fake_device(
        &bus,
        "0000:00:06.0",
        0xfd00_0000,
        &[
            entry("mz_c", virt2, 0x5000_0000, 0x1000, ZONE_BASE_OFF),
            entry("mz_d", virt2 + 0x1000, 0x5000_1000, 0x1000, ZONE_BASE_OFF + 0x1000),
        ],
    );

    mgr.scan_and_map().expect("rescan");

    // segment count grew by exactly the device's valid entries
    let cfg = mgr.config().expect("config");
    assert_eq!(cfg.get().segment_idx, 3);
    assert_eq!(segments_for_path(cfg, &res2), 2);

    // the two adjacent zones coalesced into one mapped segment
    assert_eq!(mgr.registry().memsegs().len(), 2);
    let ms2 = mgr.registry().memsegs()[1];
    assert_eq!(ms2.addr, virt2);
    assert_eq!(ms2.len, 0x2000);

    // both zones are published individually
    assert!(mgr.registry().zone_lookup("mz_c").is_some());
    assert!(mgr.registry().zone_lookup("mz_d").is_some());

    // rescans are idempotent: the known device is skipped
    mgr.scan_and_map().expect("rescan again");
    assert_eq!(mgr.config().expect("config").get().segment_idx, 3);
    assert_eq!(mgr.registry().memsegs().len(), 2);
}

#[test]
fn test_secondary_without_config_boots_clean() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut mgr = IvshmemManager::with_paths(
        dir.path().join(".none_ivshmem_config"),
        PciScanner::new(dir.path().join("empty-bus")),
    );
    mgr.init(ProcRole::Secondary).expect("init");
    assert!(mgr.config().is_none());
    assert!(mgr.registry().memsegs().is_empty());
}
