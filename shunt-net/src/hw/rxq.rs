//! Hardware receive queue: element allocation, posting and re-hashing.
//!
//! A queue owns `elts_n` receive work requests. In single-segment mode
//! each WR carries one buffer with its headroom preserved. In scatter
//! mode (jumbo frames larger than one buffer) each WR chains
//! [`SG_WR_N`] buffers: the first keeps the pool's headroom convention,
//! the rest are raw so a frame fills them edge to edge.

use std::sync::Arc;

use shunt_mem::{HEADROOM, PktBuf, PktPool};
use tracing::debug;

use crate::error::{NetError, Result};
use crate::hw::verbs::{
    CompQueue, MemoryRegion, MsgModel, NicContext, ResDomain, Sge, ThreadModel, WorkQueue,
    WqInitAttr, WqState,
};
use crate::port::{DevConfig, RxQueueConf};

/// Maximum scatter/gather elements per work request.
pub const SG_WR_N: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct HwRxStats {
    pub idx: u16,
    pub ipackets: u64,
    pub ibytes: u64,
    pub rx_nombuf: u64,
}

/// Single-segment receive element.
pub struct RxqElt {
    pub sge: Sge,
    pub buf: PktBuf,
}

/// Scatter receive element: `SG_WR_N` chained buffers.
pub struct RxqEltSp {
    pub sges: [Sge; SG_WR_N],
    pub bufs: Vec<PktBuf>,
}

pub enum RxqElts {
    Single(Vec<RxqElt>),
    Scatter(Vec<RxqEltSp>),
}

/// One hardware receive queue.
pub struct HwRxQueue {
    // field order is teardown order: elements release their buffers
    // first, then the queue objects unwind in reverse of acquisition
    // (WQ, CQ, RD, MR)
    elts: Option<RxqElts>,
    wq: Arc<WorkQueue>,
    cq: CompQueue,
    rd: ResDomain,
    mr: MemoryRegion,
    pool: Arc<PktPool>,
    pub sp: bool,
    pub elts_n: u16,
    mb_len: usize,
    socket: u32,
    pub stats: HwRxStats,
}

impl HwRxQueue {
    /// Build and arm a receive queue.
    ///
    /// `desc` must be a positive multiple of [`SG_WR_N`]. The entire
    /// mempool virtual range is registered as one memory region. On any
    /// failure the partially built objects unwind in reverse order and
    /// nothing is armed.
    pub fn setup(
        ctx: &NicContext,
        conf: &DevConfig,
        desc: u16,
        socket: u32,
        _rx_conf: &RxQueueConf,
        pool: &Arc<PktPool>,
    ) -> Result<Self> {
        if desc == 0 || desc as usize % SG_WR_N != 0 {
            return Err(NetError::BadDescCount {
                got: desc,
                multiple: SG_WR_N as u16,
            });
        }

        // probe one buffer to learn the pool geometry
        let mb_len = {
            let probe = pool
                .alloc()
                .ok_or_else(|| NetError::NoBuffers(pool.name().to_string()))?;
            probe.buf_len()
        };

        let (sp, elts_n) = scatter_mode(conf, mb_len, desc);
        debug!(
            sp,
            wrs = elts_n,
            "{} scattered packets support",
            if sp { "enabling" } else { "disabling" }
        );

        let (pool_addr, pool_len) = pool.virt_range();
        let mr = ctx.reg_mr(pool_addr, pool_len);
        let rd = ctx.create_res_domain(ThreadModel::Single, MsgModel::HighBandwidth);
        let cq_size = u32::from(desc);
        let cq = ctx.create_cq(cq_size, &rd);
        let attr = ctx.device_attr();
        let wq = ctx.create_wq(WqInitAttr {
            max_recv_wr: attr.max_qp_wr.min(cq_size),
            max_recv_sge: attr.max_sge.min(SG_WR_N as u32),
        })?;

        let elts = if sp {
            RxqElts::Scatter(alloc_elts_sp(pool, elts_n, &mr, None)?)
        } else {
            RxqElts::Single(alloc_elts(pool, elts_n, &mr, None)?)
        };

        wq.modify(WqState::Ready)?;
        post_elts(&wq, &elts)?;

        Ok(Self {
            elts: Some(elts),
            wq,
            cq,
            rd,
            mr,
            pool: pool.clone(),
            sp,
            elts_n,
            mb_len,
            socket,
            stats: HwRxStats::default(),
        })
    }

    pub fn work_queue(&self) -> &Arc<WorkQueue> {
        &self.wq
    }

    pub fn socket(&self) -> u32 {
        self.socket
    }

    pub fn cq_size(&self) -> u32 {
        self.cq.size()
    }

    pub fn res_domain(&self) -> &ResDomain {
        &self.rd
    }

    /// Reconfigure scatter support in place, recycling every buffer.
    ///
    /// Walks no mempool when the mode is unchanged. Otherwise the WQ is
    /// reset, the buffers are harvested out of the old element array and
    /// fed to the allocation of the new kind, and the queue is re-armed.
    /// Once the old array is torn down, any failure leaves the queue
    /// unusable until the device is restarted; this is the documented
    /// contract, the queue is not restored.
    pub fn rehash(&mut self, conf: &DevConfig) -> Result<()> {
        let buf_n = self.elts_n as usize * if self.sp { SG_WR_N } else { 1 };

        let (sp, elts_n) = scatter_mode(conf, self.mb_len, buf_n as u16);
        if sp == self.sp {
            debug!("scatter mode unchanged, nothing to do");
            return Ok(());
        }
        debug!(
            sp,
            wrs = elts_n,
            "{} scattered packets support",
            if sp { "enabling" } else { "disabling" }
        );

        self.wq.modify(WqState::Reset)?;

        // harvest every buffer out of the old elements
        let mut recycled = Vec::with_capacity(buf_n);
        match self.elts.take() {
            Some(RxqElts::Single(elts)) => {
                for elt in elts {
                    recycled.push(elt.buf);
                }
            }
            Some(RxqElts::Scatter(elts)) => {
                for elt in elts {
                    recycled.extend(elt.bufs);
                }
            }
            None => return Err(NetError::QueueUnusable),
        }
        debug_assert_eq!(recycled.len(), buf_n);

        let elts = if sp {
            RxqElts::Scatter(alloc_elts_sp(&self.pool, elts_n, &self.mr, Some(recycled))?)
        } else {
            RxqElts::Single(alloc_elts(&self.pool, elts_n, &self.mr, Some(recycled))?)
        };

        self.wq.modify(WqState::Ready)?;
        post_elts(&self.wq, &elts)?;

        self.elts = Some(elts);
        self.sp = sp;
        self.elts_n = elts_n;
        Ok(())
    }

    /// Base addresses of every buffer owned by the queue (unordered).
    pub fn buffer_addrs(&self) -> Vec<usize> {
        let mut addrs = Vec::new();
        match &self.elts {
            Some(RxqElts::Single(elts)) => {
                addrs.extend(elts.iter().map(|e| e.buf.buf_addr() as usize));
            }
            Some(RxqElts::Scatter(elts)) => {
                for elt in elts {
                    addrs.extend(elt.bufs.iter().map(|b| b.buf_addr() as usize));
                }
            }
            None => {}
        }
        addrs
    }
}

/// Decide scatter mode and the resulting WR count for `desc` buffers.
fn scatter_mode(conf: &DevConfig, mb_len: usize, desc: u16) -> (bool, u16) {
    if conf.jumbo_frame && conf.max_rx_pkt_len as usize > mb_len - HEADROOM {
        (true, desc / SG_WR_N as u16)
    } else {
        (false, desc)
    }
}

/// Source of buffers for element allocation: a recycled set is consumed
/// exclusively, otherwise the pool is drawn from.
enum BufSource {
    Pool(Arc<PktPool>),
    Recycled(std::vec::IntoIter<PktBuf>),
}

impl BufSource {
    fn take(&mut self) -> Option<PktBuf> {
        match self {
            BufSource::Pool(pool) => pool.alloc(),
            BufSource::Recycled(iter) => iter.next(),
        }
    }
}

fn buf_source(pool: &Arc<PktPool>, recycled: Option<Vec<PktBuf>>) -> BufSource {
    match recycled {
        Some(bufs) => BufSource::Recycled(bufs.into_iter()),
        None => BufSource::Pool(pool.clone()),
    }
}

/// Allocate single-segment elements. On failure everything allocated so
/// far goes back to the pool; a caller-supplied recycled set is never
/// touched beyond what was consumed.
pub fn alloc_elts(
    pool: &Arc<PktPool>,
    elts_n: u16,
    mr: &MemoryRegion,
    recycled: Option<Vec<PktBuf>>,
) -> Result<Vec<RxqElt>> {
    let mut source = buf_source(pool, recycled);
    let mut elts = Vec::with_capacity(elts_n as usize);

    for _ in 0..elts_n {
        let mut buf = source
            .take()
            .ok_or_else(|| NetError::NoBuffers(pool.name().to_string()))?;
        buf.reset();
        debug_assert_eq!(buf.data_len, 0);
        debug_assert_eq!(buf.pkt_len, 0);
        debug_assert_eq!(buf.headroom(), HEADROOM);

        // the SGE keeps its headroom
        let sge = Sge {
            addr: buf.buf_addr() as u64 + HEADROOM as u64,
            length: (buf.buf_len() - HEADROOM) as u32,
            lkey: mr.lkey,
        };
        elts.push(RxqElt { sge, buf });
    }

    debug!(wrs = elts_n, "allocated single-segment WRs");
    Ok(elts)
}

/// Allocate scatter elements: the first SGE of each WR keeps its
/// headroom, subsequent SGEs span their whole buffer.
pub fn alloc_elts_sp(
    pool: &Arc<PktPool>,
    elts_n: u16,
    mr: &MemoryRegion,
    recycled: Option<Vec<PktBuf>>,
) -> Result<Vec<RxqEltSp>> {
    let mut source = buf_source(pool, recycled);
    let mut elts = Vec::with_capacity(elts_n as usize);

    for _ in 0..elts_n {
        let mut sges = [Sge::default(); SG_WR_N];
        let mut bufs = Vec::with_capacity(SG_WR_N);

        for (j, sge) in sges.iter_mut().enumerate() {
            let mut buf = source
                .take()
                .ok_or_else(|| NetError::NoBuffers(pool.name().to_string()))?;
            buf.reset();
            debug_assert_eq!(buf.data_len, 0);
            debug_assert_eq!(buf.pkt_len, 0);

            *sge = if j == 0 {
                // the first segment keeps its headroom
                Sge {
                    addr: buf.buf_addr() as u64 + HEADROOM as u64,
                    length: (buf.buf_len() - HEADROOM) as u32,
                    lkey: mr.lkey,
                }
            } else {
                // subsequent segments lose theirs
                buf.set_data_off(0);
                Sge {
                    addr: buf.buf_addr() as u64,
                    length: buf.buf_len() as u32,
                    lkey: mr.lkey,
                }
            };
            bufs.push(buf);
        }
        elts.push(RxqEltSp { sges, bufs });
    }

    debug!(
        wrs = elts_n,
        segments = elts_n as usize * SG_WR_N,
        "allocated scatter WRs"
    );
    Ok(elts)
}

fn post_elts(wq: &WorkQueue, elts: &RxqElts) -> Result<()> {
    match elts {
        RxqElts::Single(elts) => {
            for elt in elts {
                wq.recv_burst(&elt.sge)?;
            }
        }
        RxqElts::Scatter(elts) => {
            for elt in elts {
                wq.recv_sg_list(&elt.sges)?;
            }
        }
    }
    Ok(())
}
