//! Segment reconciliation: overlap/adjacency analysis and coalescing.
//!
//! Segments arrive from device metadata in arbitrary order and may describe
//! the same or touching memory (a zone split across entries, or two
//! processes publishing the same zone). Before mapping, the working table
//! is sorted and reduced to a set of disjoint segments.

use bitflags::bitflags;
use tracing::{debug, error};

use crate::error::{MemError, Result};
use crate::layout::{SegmentRecord, ZoneDesc};

bitflags! {
    /// Address axes on which two zones can touch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Axis: u8 {
        const PHYS = 0x1;
        const VIRT = 0x2;
        const IOREMAP = 0x4;
        const FULL = 0x7;
    }
}

/// Axes on which the two zones overlap (half-open intervals).
pub fn overlap(a: &ZoneDesc, b: &ZoneDesc) -> Axis {
    let mut result = Axis::empty();

    if (a.virt_addr >= b.virt_addr && a.virt_addr < b.virt_end())
        || (b.virt_addr >= a.virt_addr && b.virt_addr < a.virt_end())
    {
        result |= Axis::VIRT;
    }
    if (a.phys_addr >= b.phys_addr && a.phys_addr < b.phys_end())
        || (b.phys_addr >= a.phys_addr && b.phys_addr < a.phys_end())
    {
        result |= Axis::PHYS;
    }
    if (a.ioremap_addr >= b.ioremap_addr && a.ioremap_addr < b.ioremap_end())
        || (b.ioremap_addr >= a.ioremap_addr && b.ioremap_addr < a.ioremap_end())
    {
        result |= Axis::IOREMAP;
    }

    result
}

/// Axes on which the two zones are exactly adjacent (either order).
pub fn adjacent(a: &ZoneDesc, b: &ZoneDesc) -> Axis {
    let mut result = Axis::empty();

    if a.virt_addr == b.virt_end() || b.virt_addr == a.virt_end() {
        result |= Axis::VIRT;
    }
    if a.phys_addr == b.phys_end() || b.phys_addr == a.phys_end() {
        result |= Axis::PHYS;
    }
    if a.ioremap_addr == b.ioremap_end() || b.ioremap_addr == a.ioremap_end() {
        result |= Axis::IOREMAP;
    }

    result
}

fn dump_zone(z: &ZoneDesc) {
    debug!(
        virt = format_args!("{:#x}-{:#x}", z.virt_addr, z.virt_end()),
        phys = format_args!("{:#x}-{:#x}", z.phys_addr, z.phys_end()),
        io = format_args!("{:#x}-{:#x}", z.ioremap_addr, z.ioremap_end()),
        len = z.len,
        "segment"
    );
}

/// Merge `b` into `a`: per-axis minimum start, maximum end, minimum offset.
fn concat(a: &mut SegmentRecord, b: &SegmentRecord) {
    let virt_end = a.entry.zone.virt_end().max(b.entry.zone.virt_end());
    let za = &mut a.entry.zone;
    let zb = &b.entry.zone;

    za.virt_addr = za.virt_addr.min(zb.virt_addr);
    za.phys_addr = za.phys_addr.min(zb.phys_addr);
    za.ioremap_addr = za.ioremap_addr.min(zb.ioremap_addr);
    za.len = virt_end - za.virt_addr;
    a.entry.offset = a.entry.offset.min(b.entry.offset);
}

/// Reduce the working table to disjoint segments.
///
/// Sorts by physical address (unallocated zones last), then repeatedly
/// concatenates pairs that are fully adjacent or fully overlapping on all
/// three axes, until the table is stable. Adjacency that does not include
/// the IOREMAP axis means the segments come from different BARs; such
/// pairs coexist and are never concatenated. Any partial overlap is an
/// error: the metadata describes memory that cannot be mapped coherently.
pub fn cleanup_segments(segs: &mut Vec<SegmentRecord>) -> Result<()> {
    segs.sort_by(|a, b| {
        // unallocated zones go last
        match (a.entry.zone.virt_addr == 0, b.entry.zone.virt_addr == 0) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => a.entry.zone.phys_addr.cmp(&b.entry.zone.phys_addr),
        }
    });

    loop {
        let mut merged = None;
        'scan: for i in 0..segs.len() {
            for j in (i + 1)..segs.len() {
                let ov = overlap(&segs[i].entry.zone, &segs[j].entry.zone);
                let adj = adjacent(&segs[i].entry.zone, &segs[j].entry.zone);

                if adj == Axis::FULL || ov == Axis::FULL {
                    debug!(i, j, "concatenating segments");
                    dump_zone(&segs[i].entry.zone);
                    dump_zone(&segs[j].entry.zone);
                    merged = Some((i, j));
                    break 'scan;
                }
                if !ov.is_empty() {
                    error!(i, j, axes = ?ov, "segments overlap");
                    return Err(MemError::SegmentOverlap(i, j));
                }
            }
        }
        match merged {
            Some((i, j)) => {
                let b = segs.remove(j);
                concat(&mut segs[i], &b);
            }
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MetadataEntry;

    fn seg(virt: u64, phys: u64, io: u64, len: u64, offset: u64) -> SegmentRecord {
        let mut s = SegmentRecord::zeroed();
        s.entry = MetadataEntry::zeroed();
        s.entry.zone.virt_addr = virt;
        s.entry.zone.phys_addr = phys;
        s.entry.zone.ioremap_addr = io;
        s.entry.zone.len = len;
        s.entry.offset = offset;
        s
    }

    #[test]
    fn test_overlap_axes() {
        let a = seg(0x1000, 0x1000, 0x1000, 0x1000, 0).entry.zone;
        let b = seg(0x1800, 0x9000, 0x1800, 0x1000, 0).entry.zone;
        assert_eq!(overlap(&a, &b), Axis::VIRT | Axis::IOREMAP);
        let c = seg(0x9000, 0x9000, 0x9000, 0x1000, 0).entry.zone;
        assert_eq!(overlap(&a, &c), Axis::empty());
    }

    #[test]
    fn test_adjacent_axes() {
        let a = seg(0x1000, 0x1000, 0x1000, 0x1000, 0).entry.zone;
        let b = seg(0x2000, 0x2000, 0x2000, 0x1000, 0).entry.zone;
        assert_eq!(adjacent(&a, &b), Axis::FULL);
        assert_eq!(adjacent(&b, &a), Axis::FULL);
        let c = seg(0x2000, 0x2000, 0x9000, 0x1000, 0).entry.zone;
        assert_eq!(adjacent(&a, &c), Axis::VIRT | Axis::PHYS);
    }

    #[test]
    fn test_fully_adjacent_collapse() {
        // S7: adjacent on all three axes, collapses to one spanning both
        let mut segs = vec![
            seg(0x2000, 0x12000, 0x22000, 0x1000, 0x2000),
            seg(0x1000, 0x11000, 0x21000, 0x1000, 0x1000),
        ];
        cleanup_segments(&mut segs).expect("cleanup");
        assert_eq!(segs.len(), 1);
        let z = &segs[0].entry.zone;
        assert_eq!(z.virt_addr, 0x1000);
        assert_eq!(z.phys_addr, 0x11000);
        assert_eq!(z.ioremap_addr, 0x21000);
        assert_eq!(z.len, 0x2000);
        assert_eq!(segs[0].entry.offset, 0x1000);
    }

    #[test]
    fn test_partial_overlap_rejected() {
        // overlap in VIRT only, disjoint PHYS and IOREMAP
        let mut segs = vec![
            seg(0x1000, 0x11000, 0x21000, 0x1000, 0),
            seg(0x1800, 0x91000, 0x51000, 0x1000, 0),
        ];
        assert!(matches!(
            cleanup_segments(&mut segs),
            Err(MemError::SegmentOverlap(_, _))
        ));
    }

    #[test]
    fn test_adjacent_without_ioremap_coexist() {
        // different BARs: virt/phys adjacent but ioremap not; never merged
        let mut segs = vec![
            seg(0x1000, 0x11000, 0x21000, 0x1000, 0),
            seg(0x2000, 0x12000, 0x91000, 0x1000, 0),
        ];
        cleanup_segments(&mut segs).expect("cleanup");
        assert_eq!(segs.len(), 2);
    }

    #[test]
    fn test_full_overlap_dedup() {
        let mut segs = vec![
            seg(0x1000, 0x11000, 0x21000, 0x1000, 0x40),
            seg(0x1000, 0x11000, 0x21000, 0x1000, 0x40),
        ];
        cleanup_segments(&mut segs).expect("cleanup");
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].entry.zone.len, 0x1000);
    }

    #[test]
    fn test_cleanup_idempotent() {
        let make = || {
            vec![
                seg(0x3000, 0x13000, 0x23000, 0x1000, 0x3000),
                seg(0x1000, 0x11000, 0x21000, 0x1000, 0x1000),
                seg(0x2000, 0x12000, 0x22000, 0x1000, 0x2000),
                seg(0x9000, 0x19000, 0x99000, 0x1000, 0x100),
            ]
        };
        let mut once = make();
        cleanup_segments(&mut once).expect("cleanup");
        let mut twice = once.clone();
        cleanup_segments(&mut twice).expect("cleanup twice");
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.entry.zone.virt_addr, b.entry.zone.virt_addr);
            assert_eq!(a.entry.zone.len, b.entry.zone.len);
        }
    }

    #[test]
    fn test_no_output_overlap() {
        let mut segs = vec![
            seg(0x3000, 0x13000, 0x23000, 0x1000, 0x3000),
            seg(0x1000, 0x11000, 0x21000, 0x1000, 0x1000),
            seg(0x2000, 0x12000, 0x22000, 0x1000, 0x2000),
            seg(0x9000, 0x19000, 0x99000, 0x2000, 0x100),
        ];
        cleanup_segments(&mut segs).expect("cleanup");
        for i in 0..segs.len() {
            for j in (i + 1)..segs.len() {
                assert_eq!(
                    overlap(&segs[i].entry.zone, &segs[j].entry.zone),
                    Axis::empty()
                );
            }
        }
    }

    #[test]
    fn test_unallocated_sorted_last() {
        let mut segs = vec![
            seg(0, 0, 0x31000, 0x1000, 0),
            seg(0x1000, 0x11000, 0x21000, 0x1000, 0),
        ];
        cleanup_segments(&mut segs).expect("cleanup");
        assert_eq!(segs[0].entry.zone.virt_addr, 0x1000);
        assert_eq!(segs[1].entry.zone.virt_addr, 0);
    }
}
