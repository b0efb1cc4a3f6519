//! Host control side-channel over virtio-serial.
//!
//! The host publishes device-swap requests as single short messages of
//! the form `old=<name>,new=<name>`. A dedicated thread polls the
//! character device and dispatches each message to the registry-level
//! swap hook. Messages are read whole; partial messages are not
//! supported.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error, info};

use crate::dataplane::device::change_bypass_device;
use crate::error::{NetError, Result};

/// Where the host-side agent shows up in the guest.
pub const SERIAL_PATH: &str = "/dev/virtio-ports/dpdk";

const POLL_INTERVAL_MS: u16 = 200;

/// Largest accepted request.
const REQUEST_MAX: usize = 512;

/// Handle to the running channel; stops and joins the thread on drop.
pub struct SerialChannel {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SerialChannel {
    /// Open the channel at the default path, dispatching swap requests to
    /// the device registry.
    pub fn spawn_default() -> Result<Self> {
        Self::spawn(
            Path::new(SERIAL_PATH),
            Box::new(|old, new| {
                if let Err(e) = change_bypass_device(old, new) {
                    error!(old, new, error = %e, "device swap failed");
                }
            }),
        )
    }

    /// Open the channel and poll it from a dedicated thread. `on_swap`
    /// runs once per parsed request.
    pub fn spawn(path: &Path, on_swap: Box<dyn Fn(&str, &str) + Send>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        info!(path = %path.display(), "serial control channel open");

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_worker = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("shunt-serial".to_string())
            .spawn(move || run_channel(file, shutdown_worker, on_swap))
            .map_err(std::io::Error::other)?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn run_channel(mut file: File, shutdown: Arc<AtomicBool>, on_swap: Box<dyn Fn(&str, &str) + Send>) {
    let mut buf = [0u8; REQUEST_MAX];

    while !shutdown.load(Ordering::SeqCst) {
        let revents = {
            let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(_) => fds[0].revents().unwrap_or(PollFlags::empty()),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "serial poll failed");
                    return;
                }
            }
        };
        if !revents.contains(PollFlags::POLLIN) {
            continue;
        }

        let n = match file.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                error!(error = %e, "serial read failed");
                return;
            }
        };

        let msg = String::from_utf8_lossy(&buf[..n]);
        match parse_swap(&msg) {
            Ok((old, new)) => {
                debug!(old, new, "host requested device swap");
                on_swap(&old, &new);
            }
            Err(e) => error!(error = %e, "unparseable host request"),
        }
    }
}

/// Parse `old=<name>,new=<name>`.
pub fn parse_swap(msg: &str) -> Result<(String, String)> {
    let msg = msg.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    let mut old = None;
    let mut new = None;

    for part in msg.split(',') {
        if let Some(v) = part.strip_prefix("old=") {
            old = Some(v.trim().to_string());
        } else if let Some(v) = part.strip_prefix("new=") {
            new = Some(v.trim().to_string());
        }
    }

    match (old, new) {
        (Some(old), Some(new)) if !old.is_empty() && !new.is_empty() => Ok((old, new)),
        _ => Err(NetError::Parse(msg.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[test]
    fn test_parse_swap() {
        let (old, new) = parse_swap("old=eth0,new=eth1").expect("parse");
        assert_eq!(old, "eth0");
        assert_eq!(new, "eth1");

        let (old, new) = parse_swap("old=a,new=b\n\0\0").expect("parse");
        assert_eq!((old.as_str(), new.as_str()), ("a", "b"));
    }

    #[test]
    fn test_parse_swap_rejects_partial() {
        assert!(parse_swap("old=eth0").is_err());
        assert!(parse_swap("new=eth1").is_err());
        assert!(parse_swap("old=,new=eth1").is_err());
        assert!(parse_swap("").is_err());
    }

    #[test]
    fn test_channel_dispatches_from_fifo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("serial");
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600))
            .expect("mkfifo");

        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let chan = SerialChannel::spawn(
            &path,
            Box::new(move |old, new| {
                seen_cb
                    .lock()
                    .expect("seen lock")
                    .push((old.to_string(), new.to_string()));
            }),
        )
        .expect("spawn");

        let mut writer = OpenOptions::new().write(true).open(&path).expect("open");
        use std::io::Write;
        writer.write_all(b"old=p0,new=p1").expect("write");

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if !seen.lock().expect("seen lock").is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "swap request never dispatched");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            seen.lock().expect("seen lock")[0],
            ("p0".to_string(), "p1".to_string())
        );
        chan.stop();
    }
}
