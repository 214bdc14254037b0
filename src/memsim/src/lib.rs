//! Machine-memory simulator for exercising the mapping cache against
//! real aliased memory.
//!
//! Machine pages live in a memfd. A private direct window maps the whole
//! fd for test setup; each emulated CPU gets a PROT_NONE-reserved
//! kernel-virtual window, and `install_pte` replaces one reserved page
//! with a MAP_SHARED | MAP_FIXED view of the chosen machine page. Stores
//! through a kseg pointer therefore land in the same machine page the
//! direct window sees, the aliasing a real kernel gets from hardware
//! paging.
//!
//! Linux only (memfd); the emulated page size must match the host's.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering::*};

use nix::errno::Errno;
use parking_lot::Mutex;

use kseg::{
    AddressSpace, AspaceError, FrameSource, MachineSpan, TranslateError, TranslateFlags,
};
use memaddr::{GuestPhysAddr, MachineAddr, Mpn, OwnerId, Ppn, VirtAddr, Vpn, PAGE_SIZE};
use percore::CoreId;

#[derive(Debug, Clone, Copy)]
struct Window {
    base: usize,
    pages: usize,
}

#[derive(Debug, Clone, Copy)]
struct GuestPage {
    mpn: Mpn,
    resident: bool,
}

pub struct SimMachine {
    memfd: OwnedFd,
    num_pages: u64,
    direct: *mut u8,
    windows: Mutex<Vec<Option<Window>>>,
    /// Kernel pages come off the top of machine memory, growing down.
    next_kernel_page: AtomicU64,
    translations: Mutex<HashMap<(OwnerId, u64), GuestPage>>,
}

// the raw direct pointer aliases the memfd, which outlives all use
unsafe impl Send for SimMachine {}
unsafe impl Sync for SimMachine {}

impl SimMachine {
    pub fn new(num_pages: u64) -> io::Result<SimMachine> {
        assert!(num_pages > 0);
        let host_page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        assert_eq!(
            host_page, PAGE_SIZE,
            "simulator requires a {PAGE_SIZE}-byte host page"
        );

        let raw = unsafe {
            libc::memfd_create(b"machine-pages\0".as_ptr() as *const libc::c_char, 0)
        };
        let memfd = unsafe { OwnedFd::from_raw_fd(Errno::result(raw).map_err(io::Error::from)?) };
        let total = num_pages * PAGE_SIZE;
        let ret = unsafe { libc::ftruncate(memfd.as_raw_fd(), total as libc::off_t) };
        Errno::result(ret).map_err(io::Error::from)?;

        let direct = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                memfd.as_raw_fd(),
                0,
            )
        };
        if direct == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(SimMachine {
            memfd,
            num_pages,
            direct: direct as *mut u8,
            windows: Mutex::new(Vec::new()),
            next_kernel_page: AtomicU64::new(num_pages),
            translations: Mutex::new(HashMap::new()),
        })
    }

    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    // === Direct machine access (test setup and verification) === //

    pub fn write_machine(&self, maddr: MachineAddr, bytes: &[u8]) {
        assert!(maddr.0 + bytes.len() as u64 <= self.num_pages * PAGE_SIZE);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.direct.add(maddr.0 as usize),
                bytes.len(),
            );
        }
    }

    pub fn read_machine(&self, maddr: MachineAddr, buf: &mut [u8]) {
        assert!(maddr.0 + buf.len() as u64 <= self.num_pages * PAGE_SIZE);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.direct.add(maddr.0 as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    // === Guest translation table === //

    pub fn set_translation(&self, owner: OwnerId, ppn: Ppn, mpn: Mpn, resident: bool) {
        assert!(mpn.0 < self.num_pages);
        self.translations
            .lock()
            .insert((owner, ppn.0), GuestPage { mpn, resident });
    }

    /// Remove the PA→MA translation, as upstream does before a remote
    /// flush.
    pub fn remove_translation(&self, owner: OwnerId, ppn: Ppn) {
        self.translations.lock().remove(&(owner, ppn.0));
    }
}

impl Drop for SimMachine {
    fn drop(&mut self) {
        let windows = self.windows.lock();
        for window in windows.iter().flatten() {
            unsafe {
                libc::munmap(window.base as *mut libc::c_void, window.pages * PAGE_SIZE as usize);
            }
        }
        unsafe {
            libc::munmap(
                self.direct as *mut libc::c_void,
                (self.num_pages * PAGE_SIZE) as usize,
            );
        }
    }
}

impl FrameSource for SimMachine {
    fn alloc_kernel_page(&self) -> Option<Mpn> {
        let mut next = self.next_kernel_page.load(Relaxed);
        loop {
            if next == 0 {
                return None;
            }
            match self
                .next_kernel_page
                .compare_exchange(next, next - 1, SeqCst, Relaxed)
            {
                Ok(_) => return Some(Mpn(next - 1)),
                Err(cur) => next = cur,
            }
        }
    }

    fn phys_to_machine(
        &self,
        owner: OwnerId,
        pa: GuestPhysAddr,
        len: u64,
        _flags: TranslateFlags,
        may_block: bool,
    ) -> Result<MachineSpan, TranslateError> {
        let ppn = pa.ppn();
        let mut table = self.translations.lock();
        let entry = table
            .get_mut(&(owner, ppn.0))
            .ok_or(TranslateError::NoTranslation)?;
        if !entry.resident {
            if !may_block {
                return Err(TranslateError::WouldBlock);
            }
            // a real resolver would suspend here; the simulator just
            // faults the page in
            entry.resident = true;
        }
        let within = pa.page_offset();
        Ok(MachineSpan {
            addr: MachineAddr(entry.mpn.addr().0 + within),
            len: len.min(PAGE_SIZE - within),
        })
    }
}

impl AddressSpace for SimMachine {
    fn attach_cpu(
        &self,
        core: CoreId,
        num_pages: usize,
        pt_pages: &[Mpn],
    ) -> Result<VirtAddr, AspaceError> {
        // the simulator has no real page-table walk; it only checks the
        // bootstrap actually funded the table pages
        assert!(!pt_pages.is_empty());
        for mpn in pt_pages {
            assert!(mpn.0 < self.num_pages);
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                num_pages * PAGE_SIZE as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(AspaceError::NoWindow(core));
        }

        let mut windows = self.windows.lock();
        if windows.len() <= core.0 {
            windows.resize(core.0 + 1, None);
        }
        windows[core.0] = Some(Window {
            base: base as usize,
            pages: num_pages,
        });
        Ok(VirtAddr(base as usize))
    }

    fn install_pte(&self, core: CoreId, vpn: Vpn, mpn: Mpn) {
        assert!(mpn.0 < self.num_pages);
        let window = {
            let windows = self.windows.lock();
            windows[core.0].expect("install_pte before attach_cpu")
        };
        let addr = vpn.addr().0;
        assert!(
            addr >= window.base && addr + PAGE_SIZE as usize <= window.base + window.pages * PAGE_SIZE as usize,
            "pte outside {core}'s window"
        );

        // replace the reserved page with a shared view of the machine
        // page; a host TLB shootdown rides along with mmap
        let mapped = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                PAGE_SIZE as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.memfd.as_raw_fd(),
                (mpn.0 * PAGE_SIZE) as libc::off_t,
            )
        };
        if mapped == libc::MAP_FAILED {
            let err = Errno::last();
            panic!("install_pte mmap failed: {err}");
        }
    }
}
