//! PCI hot-plug monitoring for ivshmem devices.
//!
//! A kobject-uevent netlink socket is armed with SIGIO (F_SETOWN +
//! O_ASYNC). The signal handler only sets a flag; a worker thread notices
//! the flag, drains the socket and runs the rescan pipeline for every
//! "add" of an ivshmem device. Masking SIGIO defers delivery: an event
//! that arrives while hot-plug is disabled is handled after re-enable.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow};
use nix::sys::socket::{AddressFamily, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, socket};
use tracing::{debug, info};

use crate::error::Result;

/// PCI_ID property value of an ivshmem device in uevent messages.
const PCI_ID_IVSHMEM: &str = "1AF4:1110";

static HOTPLUG_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn sigio_flag_handler(_: libc::c_int) {
    // async-signal-safe: just raise the flag, the worker does the rest
    HOTPLUG_PENDING.store(true, Ordering::Relaxed);
}

/// Unmask SIGIO; pending hot-plug requests are delivered now.
pub fn enable_hotplug() -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGIO);
    signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None)?;
    Ok(())
}

/// Mask SIGIO; hot-plug requests queue up until re-enabled.
pub fn disable_hotplug() -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGIO);
    signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None)?;
    Ok(())
}

/// Handle to the running monitor; stops and joins the worker on drop.
pub struct HotplugMonitor {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugMonitor {
    /// Open the uevent socket, install the SIGIO plumbing and spawn the
    /// worker. `on_add` runs once per ivshmem "add" event.
    pub fn spawn(on_add: Box<dyn Fn() + Send>) -> Result<Self> {
        let sock = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )?;
        // group 1 carries the kernel uevent broadcast
        bind(sock.as_raw_fd(), &NetlinkAddr::new(std::process::id(), 1))?;

        arm_sigio(&sock)?;

        let handler = SigHandler::Handler(sigio_flag_handler);
        // SAFETY: handler only touches an atomic flag
        unsafe {
            signal::sigaction(
                Signal::SIGIO,
                &SigAction::new(handler, SaFlags::empty(), SigSet::empty()),
            )?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_worker = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("shunt-hotplug".to_string())
            .spawn(move || {
                info!("hot-plug monitor running");
                while !shutdown_worker.load(Ordering::SeqCst) {
                    if HOTPLUG_PENDING.swap(false, Ordering::Relaxed) {
                        drain_events(&sock, on_add.as_ref());
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            })
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

impl Drop for HotplugMonitor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn arm_sigio(sock: &OwnedFd) -> Result<()> {
    // nix has no F_SETOWN wrapper
    // SAFETY: plain fcntl on an owned fd
    unsafe {
        if libc::fcntl(sock.as_raw_fd(), libc::F_SETOWN, libc::getpid()) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    let flags = fcntl(sock, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_ASYNC;
    fcntl(sock, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Read every queued uevent and trigger the pipeline for ivshmem adds.
fn drain_events(sock: &OwnedFd, on_add: &dyn Fn()) {
    let mut buf = [0u8; 4096];
    loop {
        // SAFETY: reading into a stack buffer on a non-blocking socket
        let n = unsafe {
            libc::recv(
                sock.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
            )
        };
        if n <= 0 {
            break;
        }
        if let Some(event) = parse_uevent(&buf[..n as usize]) {
            debug!(action = event.action.as_str(), "ivshmem uevent");
            if event.action == "add" {
                on_add();
            }
        }
    }
}

struct UEvent {
    action: String,
}

/// Parse a kernel uevent (NUL-separated KEY=VALUE fields) and return it
/// only when it concerns an ivshmem PCI device.
fn parse_uevent(raw: &[u8]) -> Option<UEvent> {
    let mut action = None;
    let mut subsystem = None;
    let mut pci_id = None;

    for field in raw.split(|&b| b == 0) {
        let field = std::str::from_utf8(field).ok()?;
        if let Some(v) = field.strip_prefix("ACTION=") {
            action = Some(v.to_string());
        } else if let Some(v) = field.strip_prefix("SUBSYSTEM=") {
            subsystem = Some(v.to_string());
        } else if let Some(v) = field.strip_prefix("PCI_ID=") {
            pci_id = Some(v.to_string());
        }
    }

    if subsystem.as_deref() != Some("pci") || pci_id.as_deref() != Some(PCI_ID_IVSHMEM) {
        return None;
    }
    action.map(|action| UEvent { action })
}
