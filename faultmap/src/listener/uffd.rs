//! `userfaultfd`-backed fault listener.
//!
//! The listener owns an anonymous private mapping and a userfaultfd
//! registered for missing-page and write-protect faults. Page installs go
//! through `UFFDIO_COPY` (optionally write-protected), protection changes
//! through `UFFDIO_WRITEPROTECT`, and reclaim through
//! `madvise(MADV_DONTNEED)`, which drops the page so the next access
//! faults again. A self-pipe lets `stop` interrupt the blocking poll in
//! `get_events`.
//!
//! Write-protect support for anonymous ranges requires Linux 5.7+ and,
//! depending on `vm.unprivileged_userfaultfd`, may need `CAP_SYS_PTRACE`.

use super::{Event, FaultListener};
use crate::Error;
use std::{
    io,
    mem,
    os::unix::io::RawFd,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::debug;

const UFFD_API: u64 = 0xAA;
const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
const UFFD_PAGEFAULT_FLAG_WRITE: u64 = 1 << 0;
const UFFD_FEATURE_PAGEFAULT_FLAG_WP: u64 = 1 << 0;
const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;
const UFFDIO_REGISTER_MODE_WP: u64 = 1 << 1;
const UFFDIO_COPY_MODE_WP: u64 = 1 << 1;
const UFFDIO_WRITEPROTECT_MODE_WP: u64 = 1 << 0;

// ioctl request numbers, computed the way <linux/userfaultfd.h> encodes
// them: dir | size | type (0xAA) | nr.
const fn uffd_ioc(dir: u64, nr: u64, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | (0xAA << 8) | nr
}
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const UFFDIO_API_IOC: u64 = uffd_ioc(IOC_READ | IOC_WRITE, 0x3F, mem::size_of::<UffdioApi>());
const UFFDIO_REGISTER_IOC: u64 =
    uffd_ioc(IOC_READ | IOC_WRITE, 0x00, mem::size_of::<UffdioRegister>());
const UFFDIO_UNREGISTER_IOC: u64 = uffd_ioc(IOC_READ, 0x01, mem::size_of::<UffdioRange>());
const UFFDIO_COPY_IOC: u64 = uffd_ioc(IOC_READ | IOC_WRITE, 0x03, mem::size_of::<UffdioCopy>());
const UFFDIO_WRITEPROTECT_IOC: u64 =
    uffd_ioc(IOC_READ | IOC_WRITE, 0x06, mem::size_of::<UffdioWriteprotect>());

#[repr(C)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioCopy {
    dst: u64,
    src: u64,
    len: u64,
    mode: u64,
    copy: i64,
}

#[repr(C)]
struct UffdioWriteprotect {
    range: UffdioRange,
    mode: u64,
}

/// One fault record as read from the userfaultfd. Only the pagefault arm
/// of the kernel's union is decoded; other event kinds are skipped.
#[repr(C)]
#[derive(Clone, Copy)]
struct UffdMsg {
    event: u8,
    reserved1: u8,
    reserved2: u16,
    reserved3: u32,
    flags: u64,
    address: u64,
    feat: u32,
    _pad: u32,
}

/// A [`FaultListener`] over an anonymous mapping registered with
/// `userfaultfd`.
pub struct UffdListener {
    uffd: RawFd,
    stop_rx: RawFd,
    stop_tx: RawFd,
    base: u64,
    len: usize,
    page_size: usize,
    max_events: usize,
    stopped: AtomicBool,
}

impl UffdListener {
    /// Map an anonymous region of `len` bytes and register it for
    /// missing-page and write-protect fault delivery.
    pub fn new(len: usize, page_size: usize, max_events: usize) -> Result<Self, Error> {
        if len == 0 || page_size == 0 || len % page_size != 0 {
            return Err(Error::InvalidConfig(
                "region length must be a non-zero multiple of the page size",
            ));
        }

        // SAFETY: anonymous mapping with no fixed address; failure is
        // reported as MAP_FAILED.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Map(io::Error::last_os_error()));
        }
        let region = MappedRegion { base, len };

        // SAFETY: plain syscall; the returned fd is owned below.
        let uffd = unsafe {
            libc::syscall(
                libc::SYS_userfaultfd,
                libc::O_CLOEXEC | libc::O_NONBLOCK,
            )
        } as RawFd;
        if uffd < 0 {
            return Err(Error::Listener(io::Error::last_os_error()));
        }
        let uffd_owned = Fd(uffd);

        let mut api = UffdioApi {
            api: UFFD_API,
            features: UFFD_FEATURE_PAGEFAULT_FLAG_WP,
            ioctls: 0,
        };
        // SAFETY: `api` is a valid UffdioApi for the duration of the call.
        if unsafe { libc::ioctl(uffd, UFFDIO_API_IOC as _, &mut api) } < 0 {
            return Err(Error::Listener(io::Error::last_os_error()));
        }
        if api.features & UFFD_FEATURE_PAGEFAULT_FLAG_WP == 0 {
            return Err(Error::Listener(io::Error::new(
                io::ErrorKind::Unsupported,
                "kernel lacks userfaultfd write-protect support",
            )));
        }

        let mut register = UffdioRegister {
            range: UffdioRange {
                start: base as u64,
                len: len as u64,
            },
            mode: UFFDIO_REGISTER_MODE_MISSING | UFFDIO_REGISTER_MODE_WP,
            ioctls: 0,
        };
        // SAFETY: `register` is valid for the duration of the call and the
        // range is the mapping created above.
        if unsafe { libc::ioctl(uffd, UFFDIO_REGISTER_IOC as _, &mut register) } < 0 {
            return Err(Error::Listener(io::Error::last_os_error()));
        }

        let mut pipe = [0 as RawFd; 2];
        // SAFETY: `pipe` is a valid two-element fd array.
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(Error::Listener(io::Error::last_os_error()));
        }

        // All resources created; disarm the cleanup guards.
        mem::forget(region);
        mem::forget(uffd_owned);
        debug!(base = base as u64, len, "registered userfaultfd range");
        Ok(Self {
            uffd,
            stop_rx: pipe[0],
            stop_tx: pipe[1],
            base: base as u64,
            len,
            page_size,
            max_events,
            stopped: AtomicBool::new(false),
        })
    }

    fn range(&self, addr: u64) -> Result<UffdioRange, Error> {
        if addr < self.base
            || addr % self.page_size as u64 != 0
            || addr + self.page_size as u64 > self.base + self.len as u64
        {
            return Err(Error::Listener(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("address {addr:#x} is not an aligned page in the range"),
            )));
        }
        Ok(UffdioRange {
            start: addr,
            len: self.page_size as u64,
        })
    }

    fn writeprotect(&self, addr: u64, protect: bool) -> Result<(), Error> {
        let mut arg = UffdioWriteprotect {
            range: self.range(addr)?,
            mode: if protect { UFFDIO_WRITEPROTECT_MODE_WP } else { 0 },
        };
        // SAFETY: `arg` is valid for the duration of the call.
        if unsafe { libc::ioctl(self.uffd, UFFDIO_WRITEPROTECT_IOC as _, &mut arg) } < 0 {
            return Err(Error::Listener(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl FaultListener for UffdListener {
    fn base(&self) -> u64 {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }

    fn get_events(&self) -> Result<Vec<Event>, Error> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Ok(vec![Event::Shutdown]);
            }

            let mut fds = [
                libc::pollfd {
                    fd: self.uffd,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.stop_rx,
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            // SAFETY: `fds` is a valid pollfd array of length 2.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Listener(err));
            }
            if fds[1].revents & libc::POLLIN != 0 {
                self.stopped.store(true, Ordering::Release);
                return Ok(vec![Event::Shutdown]);
            }
            if fds[0].revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                return Err(Error::Listener(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "userfaultfd poll error",
                )));
            }
            if fds[0].revents & libc::POLLIN == 0 {
                continue;
            }

            let mut raw: Vec<UffdMsg> = Vec::with_capacity(self.max_events);
            // SAFETY: the spare capacity is max_events messages; read
            // returns how many bytes were filled.
            let n = unsafe {
                libc::read(
                    self.uffd,
                    raw.as_mut_ptr() as *mut libc::c_void,
                    self.max_events * mem::size_of::<UffdMsg>(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    // Racing reader drained the queue, or a signal hit.
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => continue,
                    _ => return Err(Error::Listener(err)),
                }
            }
            let count = n as usize / mem::size_of::<UffdMsg>();
            // SAFETY: the kernel wrote `count` complete messages.
            unsafe { raw.set_len(count) };

            let mask = !(self.page_size as u64 - 1);
            let events: Vec<Event> = raw
                .iter()
                .filter(|msg| msg.event == UFFD_EVENT_PAGEFAULT)
                .map(|msg| Event::Fault {
                    addr: msg.address & mask,
                    write: msg.flags & UFFD_PAGEFAULT_FLAG_WRITE != 0,
                })
                .collect();
            if events.is_empty() {
                continue;
            }
            return Ok(events);
        }
    }

    fn install_page(&self, addr: u64, src: &[u8], write_enabled: bool) -> Result<(), Error> {
        assert_eq!(src.len(), self.page_size, "install source must be one page");
        let range = self.range(addr)?;
        loop {
            let mut copy = UffdioCopy {
                dst: range.start,
                src: src.as_ptr() as u64,
                len: range.len,
                mode: if write_enabled { 0 } else { UFFDIO_COPY_MODE_WP },
                copy: 0,
            };
            // SAFETY: `copy` references the caller's page-sized buffer,
            // valid for the duration of the call.
            if unsafe { libc::ioctl(self.uffd, UFFDIO_COPY_IOC as _, &mut copy) } < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    continue;
                }
                return Err(Error::Listener(err));
            }
            return Ok(());
        }
    }

    fn enable_writes(&self, addr: u64) -> Result<(), Error> {
        self.writeprotect(addr, false)
    }

    fn disable_writes(&self, addr: u64) -> Result<(), Error> {
        self.writeprotect(addr, true)
    }

    fn reclaim_page(&self, addr: u64) -> Result<(), Error> {
        let range = self.range(addr)?;
        // SAFETY: the range is an aligned page inside our mapping.
        if unsafe {
            libc::madvise(
                range.start as *mut libc::c_void,
                range.len as usize,
                libc::MADV_DONTNEED,
            )
        } < 0
        {
            return Err(Error::Listener(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn stop(&self) {
        // SAFETY: writing one byte to our own pipe.
        unsafe {
            let byte = 1u8;
            let _ = libc::write(self.stop_tx, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

impl Drop for UffdListener {
    fn drop(&mut self) {
        let mut range = UffdioRange {
            start: self.base,
            len: self.len as u64,
        };
        // SAFETY: unregistering the range we registered; fds and mapping
        // are owned by this listener and closed exactly once.
        unsafe {
            let _ = libc::ioctl(self.uffd, UFFDIO_UNREGISTER_IOC as _, &mut range);
            libc::close(self.uffd);
            libc::close(self.stop_rx);
            libc::close(self.stop_tx);
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Closes the wrapped fd unless disarmed with `mem::forget`.
struct Fd(RawFd);

impl Drop for Fd {
    fn drop(&mut self) {
        // SAFETY: the fd is owned and closed exactly once.
        unsafe { libc::close(self.0) };
    }
}

/// Unmaps the wrapped region unless disarmed with `mem::forget`.
struct MappedRegion {
    base: *mut libc::c_void,
    len: usize,
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned and unmapped exactly once.
        unsafe { libc::munmap(self.base, self.len) };
    }
}
