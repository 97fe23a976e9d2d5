use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{fence, AtomicU32, Ordering},
        Arc,
    },
};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::{types::PAGE_SIZE, utils::HostBuffer};

use self::{csr_cli::CsrClient, phys_addr_resolver::PhysAddrResolver};

use super::{
    check_word_access, BoFlags, BoHandle, DeviceAdaptor, DeviceError, DeviceMapping,
    DeviceResult, SyncDirection,
};

mod csr_cli;
mod phys_addr_resolver;

/// A compute unit exposed as a mappable register file, with buffers in pinned host memory.
#[derive(Debug)]
pub(crate) struct HardwareDevice {
    csr_cli: CsrClient,
    phys_addr_resolver: PhysAddrResolver,
    use_hugepage: bool,
    next_handle: AtomicU32,
    buffers: Mutex<HashMap<BoHandle, HardwareBo>>,
}

#[derive(Debug)]
struct HardwareBo {
    memory: Arc<HostBuffer>,
    paddr: u64,
}

impl HardwareDevice {
    pub(crate) fn new<P: AsRef<Path>>(device_path: P, use_hugepage: bool) -> DeviceResult<Self> {
        let csr_cli =
            CsrClient::new(device_path).map_err(|e| DeviceError::Device(e.to_string()))?;
        let phys_addr_resolver =
            PhysAddrResolver::new().map_err(|e| DeviceError::Device(e.to_string()))?;
        Ok(Self {
            csr_cli,
            phys_addr_resolver,
            use_hugepage,
            next_handle: AtomicU32::new(1),
            buffers: Mutex::new(HashMap::new()),
        })
    }
}

impl DeviceAdaptor for HardwareDevice {
    fn alloc_bo(&self, size: usize, bank: u32, flags: BoFlags) -> DeviceResult<BoHandle> {
        if size > PAGE_SIZE && !self.use_hugepage {
            warn!("buffer of {size} bytes may not be physically contiguous without huge pages");
        }
        let memory = HostBuffer::new(size, self.use_hugepage)
            .map_err(|e| DeviceError::Device(e.to_string()))?;
        let memory = Arc::new(memory);
        // fault the first page in so that it has a frame
        HardwareMapping(Arc::clone(&memory)).write_word(0, 0)?;
        let paddr = self
            .phys_addr_resolver
            .query(memory.as_ptr() as usize)
            .ok_or_else(|| DeviceError::Device("physical address unavailable".to_owned()))?;
        let handle = BoHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!(
            "allocated {size} bytes at {paddr:#x} (bank {bank}, flags {:#x})",
            flags.bits()
        );
        let _: Option<HardwareBo> = self
            .buffers
            .lock()
            .insert(handle, HardwareBo { memory, paddr });
        Ok(handle)
    }

    fn map_bo(&self, bo: BoHandle) -> DeviceResult<Arc<dyn DeviceMapping>> {
        let buffers = self.buffers.lock();
        let hw_bo = buffers.get(&bo).ok_or(DeviceError::InvalidHandle(bo.0))?;
        Ok(Arc::new(HardwareMapping(Arc::clone(&hw_bo.memory))))
    }

    fn get_phys_addr(&self, bo: BoHandle) -> DeviceResult<u64> {
        self.buffers
            .lock()
            .get(&bo)
            .map(|hw_bo| hw_bo.paddr)
            .ok_or(DeviceError::InvalidHandle(bo.0))
    }

    fn sync_bo(&self, bo: BoHandle, direction: SyncDirection) -> DeviceResult<()> {
        if !self.buffers.lock().contains_key(&bo) {
            return Err(DeviceError::InvalidHandle(bo.0));
        }
        // pinned host memory is snooped by the device
        let order = match direction {
            SyncDirection::ToDevice => Ordering::Release,
            SyncDirection::FromDevice => Ordering::Acquire,
        };
        fence(order);
        Ok(())
    }

    fn free_bo(&self, bo: BoHandle) {
        let _: Option<HardwareBo> = self.buffers.lock().remove(&bo);
    }

    fn read_reg(&self, offset: usize) -> DeviceResult<u32> {
        self.csr_cli.read_csr(offset)
    }

    fn write_reg(&self, offset: usize, data: u32) -> DeviceResult<()> {
        self.csr_cli.write_csr(offset, data)
    }
}

#[derive(Debug)]
struct HardwareMapping(Arc<HostBuffer>);

impl HardwareMapping {
    fn word_ptr(&self, offset: usize) -> DeviceResult<*mut u32> {
        check_word_access(offset, self.0.len())?;
        Ok(self.0.as_ptr().wrapping_add(offset).cast::<u32>())
    }
}

#[allow(unsafe_code)]
impl DeviceMapping for HardwareMapping {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn read_word(&self, offset: usize) -> DeviceResult<u32> {
        let ptr = self.word_ptr(offset)?;
        // SAFETY: in bounds and word aligned inside a page aligned buffer
        let value = unsafe { ptr.read_volatile() };
        fence(Ordering::Acquire);
        Ok(value)
    }

    fn write_word(&self, offset: usize, value: u32) -> DeviceResult<()> {
        let ptr = self.word_ptr(offset)?;
        fence(Ordering::Release);
        // SAFETY: in bounds and word aligned inside a page aligned buffer
        unsafe { ptr.write_volatile(value) };
        Ok(())
    }
}
