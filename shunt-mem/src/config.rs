//! The process-shared ivshmem configuration file.
//!
//! One filesystem-backed file per hugefile prefix, mapped MAP_SHARED into
//! every participating process. Lock discipline: a primary process proves
//! ownership by taking the flock exclusively, then downgrades to shared
//! for the lifetime of the process. A secondary that manages to take the
//! exclusive lock has found a stray file from a dead primary; it unlinks
//! it and boots as if no config existed.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use nix::fcntl::{Flock, FlockArg};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use tracing::{debug, info};

use crate::error::{MemError, Result};
use crate::layout::SharedConfig;

/// Default location of the config for a given hugefile prefix.
pub fn config_path(prefix: &str) -> PathBuf {
    PathBuf::from(format!("/var/run/.{prefix}_ivshmem_config"))
}

/// The mapped shared configuration, held locked for the process lifetime.
pub struct SharedConfigFile {
    ptr: NonNull<SharedConfig>,
    // holds the advisory shared lock until the process exits
    lock: Flock<File>,
    path: PathBuf,
    writable: bool,
}

// SAFETY: the mapping is MAP_SHARED plain data; access goes through
// get/get_mut which follow Rust borrowing on this handle.
unsafe impl Send for SharedConfigFile {}

impl SharedConfigFile {
    /// Create the config as the primary process.
    ///
    /// Takes the exclusive lock to verify ownership, truncates and zeroes
    /// the file, then moves to a shared lock.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, _)| MemError::ConfigLocked(path.to_path_buf()))?;

        let len = std::mem::size_of::<SharedConfig>();
        lock.set_len(len as u64)?;

        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).expect("config struct is not zero-sized"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &*lock,
                0,
            )?
        };
        // SAFETY: freshly mapped region of `len` bytes
        unsafe { std::ptr::write_bytes(ptr.as_ptr().cast::<u8>(), 0, len) };

        // ownership proven; keep a shared lock for the process lifetime
        let file = match lock.unlock() {
            Ok(file) => file,
            Err((_, e)) => {
                unsafe {
                    let _ = munmap(ptr, len);
                }
                return Err(e.into());
            }
        };
        let lock = match Flock::lock(file, FlockArg::LockSharedNonblock) {
            Ok(lock) => lock,
            Err((_, e)) => {
                unsafe {
                    let _ = munmap(ptr, len);
                }
                return Err(e.into());
            }
        };

        info!(path = %path.display(), "shared config created");
        Ok(Self {
            ptr: ptr.cast(),
            lock,
            path: path.to_path_buf(),
            writable: true,
        })
    }

    /// Open the config as a secondary process.
    ///
    /// A missing file is a normal boot (`Ok(None)`). A file nobody holds
    /// locked is a stray from a dead primary: it is unlinked and treated
    /// as missing.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(_stray_lock) => {
                debug!(path = %path.display(), "removing stray config file");
                std::fs::remove_file(path)?;
                // dropping the lock releases it with the file
                return Ok(None);
            }
            Err((file, _)) => file,
        };

        let lock = Flock::lock(file, FlockArg::LockSharedNonblock)
            .map_err(|(_, e)| MemError::Sys(e))?;

        let len = std::mem::size_of::<SharedConfig>();
        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).expect("config struct is not zero-sized"),
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                &*lock,
                0,
            )?
        };

        info!(path = %path.display(), "shared config opened");
        Ok(Some(Self {
            ptr: ptr.cast(),
            lock,
            path: path.to_path_buf(),
            writable: false,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> &SharedConfig {
        // SAFETY: mapping is valid for the lifetime of self
        unsafe { self.ptr.as_ref() }
    }

    pub fn get_mut(&mut self) -> &mut SharedConfig {
        debug_assert!(self.writable, "secondary config mapping is read-only");
        // SAFETY: mapping is valid for the lifetime of self
        unsafe { self.ptr.as_mut() }
    }
}

impl Drop for SharedConfigFile {
    fn drop(&mut self) {
        // SAFETY: pointer and length come from mmap in create/open
        unsafe {
            let _ = munmap(self.ptr.cast(), std::mem::size_of::<SharedConfig>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".test_ivshmem_config");

        let mut cfg = SharedConfigFile::create(&path).expect("create");
        assert_eq!(cfg.get().segment_idx, 0);
        cfg.get_mut().segment_idx = 3;
        assert_eq!(cfg.get().segment_idx, 3);
    }

    #[test]
    fn test_open_missing_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".missing_ivshmem_config");
        assert!(SharedConfigFile::open(&path).expect("open").is_none());
    }

    #[test]
    fn test_stray_config_unlinked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".stray_ivshmem_config");

        // a dead primary left the file behind, unlocked
        std::fs::write(&path, vec![0u8; std::mem::size_of::<SharedConfig>()])
            .expect("write stray");

        assert!(SharedConfigFile::open(&path).expect("open").is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_secondary_sees_primary_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".shared_ivshmem_config");

        let mut primary = SharedConfigFile::create(&path).expect("create");
        primary.get_mut().segment_idx = 7;

        let secondary = SharedConfigFile::open(&path)
            .expect("open")
            .expect("config present while primary holds the lock");
        assert_eq!(secondary.get().segment_idx, 7);

        primary.get_mut().segment_idx = 9;
        assert_eq!(secondary.get().segment_idx, 9);
    }

    #[test]
    fn test_second_primary_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".locked_ivshmem_config");

        let _primary = SharedConfigFile::create(&path).expect("create");
        // flock locks are per open file description, so a second create in
        // the same process still conflicts
        assert!(matches!(
            SharedConfigFile::create(&path),
            Err(MemError::ConfigLocked(_))
        ));
    }
}
