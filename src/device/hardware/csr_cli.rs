use std::{
    fs::{File, OpenOptions},
    io,
    mem::size_of,
    os::fd::AsRawFd,
    path::Path,
    ptr::NonNull,
    sync::Arc,
};

use log::{debug, error};
use parking_lot::Mutex;

use crate::device::{constants::CSR_LENGTH, DeviceError};

/// Register window of the compute unit, mapped from a device file.
#[derive(Debug, Clone)]
pub(crate) struct CsrClient(Arc<CsrClientInner>);

#[derive(Debug)]
struct CsrClientInner {
    _device_file: File,
    mapping: Mutex<CsrMapping>,
}

#[derive(Debug)]
struct CsrMapping(NonNull<u32>);

// SAFETY: the mapping is only touched while holding the mutex.
#[allow(unsafe_code)]
unsafe impl Send for CsrMapping {}

impl CsrClient {
    #[allow(unsafe_code)]
    pub(crate) fn new<P: AsRef<Path>>(device_path: P) -> io::Result<Self> {
        let device_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path.as_ref())?;
        let device_file_fd = device_file.as_raw_fd();

        // SAFETY: a fresh shared mapping of the register file; the kernel checks the range
        let mapping = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                CSR_LENGTH,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                device_file_fd,
                0,
            )
        };

        if mapping == libc::MAP_FAILED {
            error!("map failed: {}", device_path.as_ref().display());
            return Err(io::Error::last_os_error());
        }
        let mapping = NonNull::new(mapping.cast::<u32>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        debug!("mapped register window {}", device_path.as_ref().display());

        Ok(Self(Arc::new(CsrClientInner {
            _device_file: device_file,
            mapping: Mutex::new(CsrMapping(mapping)),
        })))
    }

    #[allow(unsafe_code)]
    pub(crate) fn read_csr(&self, addr: usize) -> Result<u32, DeviceError> {
        let offset = Self::word_offset(addr)?;
        let buf = self.0.mapping.lock();
        // SAFETY: `offset` is inside the mapped window
        Ok(unsafe { buf.0.as_ptr().add(offset).read_volatile() })
    }

    #[allow(unsafe_code)]
    pub(crate) fn write_csr(&self, addr: usize, data: u32) -> Result<(), DeviceError> {
        let offset = Self::word_offset(addr)?;
        let buf = self.0.mapping.lock();
        // SAFETY: `offset` is inside the mapped window
        unsafe { buf.0.as_ptr().add(offset).write_volatile(data) };
        Ok(())
    }

    fn word_offset(addr: usize) -> Result<usize, DeviceError> {
        if addr >= CSR_LENGTH || addr % size_of::<u32>() != 0 {
            return Err(DeviceError::Device(format!("csr overflow :{addr}")));
        }
        #[allow(clippy::arithmetic_side_effects)]
        Ok(addr / size_of::<u32>())
    }
}

#[allow(unsafe_code)]
impl Drop for CsrClientInner {
    fn drop(&mut self) {
        let mapping = self.mapping.get_mut();
        // SAFETY: unmapping the window created in `CsrClient::new`
        let result =
            unsafe { libc::munmap(mapping.0.as_ptr().cast::<libc::c_void>(), CSR_LENGTH) };
        if result != 0_i32 {
            error!("unmap register window failed: {result}");
        }
    }
}
