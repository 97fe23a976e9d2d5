use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    io,
    ptr::NonNull,
};

use log::error;

use crate::types::PAGE_SIZE;

/// Round `value` up to the next multiple of `align`, which must be a power of two.
#[inline]
pub(crate) fn round_up(value: usize, align: usize) -> usize {
    value.next_multiple_of(align)
}

/// A struct to manage hugepage memory
#[derive(Debug)]
pub(crate) struct HugePage {
    size: usize,
    addr: NonNull<u8>,
}

#[allow(unsafe_code)]
impl HugePage {
    /// size of the huge page
    pub(crate) const HUGE_PAGE_SIZE: usize = 1024 * 1024 * 2;

    /// Bytes actually mapped for a request of `size` bytes.
    ///
    /// hugetlb mappings must be a whole number of huge pages, for `munmap` too.
    pub(crate) fn mapping_len(size: usize) -> usize {
        round_up(size.max(1), Self::HUGE_PAGE_SIZE)
    }

    pub(crate) fn new(size: usize) -> io::Result<Self> {
        let size = Self::mapping_len(size);
        // SAFETY: anonymous private mapping, no file descriptor involved
        let buffer = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if buffer == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let addr = NonNull::new(buffer.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(HugePage { size, addr })
    }
}

#[allow(unsafe_code)]
impl Drop for HugePage {
    fn drop(&mut self) {
        // SAFETY: `addr` and `size` come from a successful mmap
        let result =
            unsafe { libc::munmap(self.addr.as_ptr().cast::<libc::c_void>(), self.size) };
        if result != 0_i32 {
            error!("drop huge page failed: {result}");
        }
    }
}

/// A zeroed, page aligned heap buffer.
#[derive(Debug)]
pub(crate) struct AlignedMemory {
    layout: Layout,
    addr: NonNull<u8>,
}

#[allow(unsafe_code)]
impl AlignedMemory {
    /// # Errors
    /// Return an error if the size is zero or too large.
    pub(crate) fn new(size: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(round_up(size.max(1), PAGE_SIZE), PAGE_SIZE)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: the layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let addr =
            NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(AlignedMemory { layout, addr })
    }
}

#[allow(unsafe_code)]
impl Drop for AlignedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout
        unsafe { dealloc(self.addr.as_ptr(), self.layout) };
    }
}

/// Page aligned host memory backing a hardware buffer object.
#[derive(Debug)]
pub(crate) enum HostBuffer {
    HugePage(HugePage),
    AlignedMemory(AlignedMemory),
}

// SAFETY: the buffer exclusively owns its allocation; all accesses go through raw
// volatile reads and writes of whole words.
#[allow(unsafe_code)]
unsafe impl Send for HostBuffer {}
#[allow(unsafe_code)]
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    pub(crate) fn new(size: usize, is_huge_page: bool) -> io::Result<Self> {
        if is_huge_page {
            HugePage::new(size).map(HostBuffer::HugePage)
        } else {
            AlignedMemory::new(size).map(HostBuffer::AlignedMemory)
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        match self {
            HostBuffer::HugePage(huge_page) => huge_page.addr.as_ptr(),
            HostBuffer::AlignedMemory(aligned_memory) => aligned_memory.addr.as_ptr(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            HostBuffer::HugePage(huge_page) => huge_page.size,
            HostBuffer::AlignedMemory(aligned_memory) => aligned_memory.layout.size(),
        }
    }
}
