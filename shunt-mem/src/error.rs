//! Error types for the memory layer.

use std::path::PathBuf;

/// Errors from pools, rings and the shared-memory machinery.
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("{0} is locked by another process")]
    ConfigLocked(PathBuf),

    #[error("segments {0} and {1} overlap")]
    SegmentOverlap(usize, usize),

    #[error("{0} table is full")]
    TableFull(&'static str),

    #[error("mapping landed at {got:#x}, wanted {want:#x}")]
    MapMismatch { want: u64, got: u64 },

    #[error("ring '{0}' already registered")]
    DuplicateRing(String),

    #[error("ring '{0}' not found")]
    RingNotFound(String),

    #[error("no ioremap base recorded for {0}")]
    IoremapNotFound(PathBuf),

    #[error("buffer pool '{0}' exhausted")]
    PoolExhausted(String),
}

pub type Result<T> = std::result::Result<T, MemError>;
