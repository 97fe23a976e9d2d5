use std::{fs::File, io, mem::size_of, os::fd::AsRawFd};

use log::error;

const PAGE_SHIFT: u64 = 12; // Typical page size shift for 4KB pages
const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
const PFN_MASK: u64 = (1 << 55_i32) - 1;
const PAGE_PRESENT: u64 = 1 << 63_i32;

/// Translates virtual addresses of this process through `/proc/self/pagemap`.
#[derive(Debug)]
pub(crate) struct PhysAddrResolver {
    pagemap: File,
}

impl PhysAddrResolver {
    pub(crate) fn new() -> io::Result<PhysAddrResolver> {
        let pagemap = File::open("/proc/self/pagemap")?;
        Ok(PhysAddrResolver { pagemap })
    }

    /// Physical address of `vaddr`, or `None` if the page is not resident or the
    /// frame number is hidden from this process.
    #[allow(
        unsafe_code,
        clippy::borrow_as_ptr,
        clippy::arithmetic_side_effects,
        clippy::cast_possible_wrap
    )]
    pub(crate) fn query(&self, vaddr: usize) -> Option<u64> {
        let vaddr = vaddr as u64;
        let vpn = vaddr >> PAGE_SHIFT;
        let offset = vaddr % PAGE_SIZE;
        let mut data: u64 = 0;
        // SAFETY: reading 8 bytes into a local u64
        let ret = unsafe {
            libc::pread(
                self.pagemap.as_raw_fd(),
                (&mut data as *mut u64).cast::<libc::c_void>(),
                size_of::<u64>(),
                (vpn * 8) as libc::off_t,
            )
        };
        if ret != 8 {
            error!("read pagemap failed: {:?}", io::Error::last_os_error());
            return None;
        }
        if data & PAGE_PRESENT == 0 {
            return None;
        }
        let pfn = data & PFN_MASK;
        // zero unless the process has CAP_SYS_ADMIN
        if pfn == 0 {
            return None;
        }
        Some((pfn << PAGE_SHIFT) | offset)
    }
}
