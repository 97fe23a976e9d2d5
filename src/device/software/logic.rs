use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, error};
use parking_lot::Mutex;

use crate::{
    device::{
        constants::{DESC_STATUS_OFFSET, KERNEL_MEM_ARG_OFFSET},
        descriptor::DescriptorLayout,
        DeviceError, DeviceResult,
    },
    types::{DescEntry, DescStatus, FaErrorFlag},
};

use super::memory::{DeviceMemory, MemoryTable};

/// The compute unit of the software accelerator.
///
/// It owns the device memory and the register file; descriptors are executed
/// one at a time by the worker thread.
#[derive(Debug)]
pub(super) struct ComputeUnitLogic {
    pub(super) memory: Mutex<MemoryTable>,
    layout: DescriptorLayout,
    desc_addr_high: AtomicU32,
    desc_addr_low: AtomicU32,
    error: AtomicU32,
    task_count: AtomicU32,
}

impl ComputeUnitLogic {
    pub(super) fn new(memory_budget: usize) -> Self {
        Self {
            memory: Mutex::new(MemoryTable::new(memory_budget)),
            layout: DescriptorLayout::default(),
            desc_addr_high: AtomicU32::new(0),
            desc_addr_low: AtomicU32::new(0),
            error: AtomicU32::new(0),
            task_count: AtomicU32::new(0),
        }
    }

    pub(super) fn set_desc_addr_high(&self, data: u32) {
        self.desc_addr_high.store(data, Ordering::Relaxed);
    }

    pub(super) fn desc_addr_high(&self) -> u32 {
        self.desc_addr_high.load(Ordering::Relaxed)
    }

    /// Latch the low half and return the full descriptor address.
    pub(super) fn latch_desc_addr(&self, low: u32) -> u64 {
        self.desc_addr_low.store(low, Ordering::Relaxed);
        (u64::from(self.desc_addr_high()) << 32_i32) | u64::from(low)
    }

    pub(super) fn desc_addr_low(&self) -> u32 {
        self.desc_addr_low.load(Ordering::Relaxed)
    }

    pub(super) fn raise(&self, flag: FaErrorFlag) {
        let _: u32 = self.error.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub(super) fn error(&self) -> u32 {
        self.error.load(Ordering::Acquire)
    }

    pub(super) fn task_count(&self) -> u32 {
        self.task_count.load(Ordering::Acquire)
    }

    /// Execute the descriptor at `desc_addr` and mark it completed.
    ///
    /// On failure the descriptor keeps its status and the error word records `DESC_DECERR`.
    pub(super) fn run(&self, desc_addr: u64) {
        if let Err(e) = self.execute(desc_addr) {
            error!("failed to execute descriptor at {desc_addr:#x}: {e}");
            self.raise(FaErrorFlag::DESC_DECERR);
        }
    }

    fn execute(&self, desc_addr: u64) -> DeviceResult<()> {
        let (desc_mem, desc_offset) = self
            .memory
            .lock()
            .resolve(desc_addr)
            .ok_or_else(|| {
                DeviceError::Device(format!("unmapped descriptor address {desc_addr:#x}"))
            })?;

        #[allow(clippy::arithmetic_side_effects)] // `resolve` keeps the offset inside the buffer
        let raw = read_region(&desc_mem, desc_offset, desc_mem.len() - desc_offset)?;
        let desc = self.layout.decode(&raw)?;
        debug!("executing descriptor at {desc_addr:#x}");

        for entry in &desc.inputs {
            if let Some(arg_addr) = kernel_mem_arg(entry) {
                self.increment_buffer(arg_addr)?;
            }
        }

        let _: u32 = self.task_count.fetch_add(1, Ordering::AcqRel);
        #[allow(clippy::arithmetic_side_effects)]
        desc_mem.store(desc_offset + DESC_STATUS_OFFSET, DescStatus::Completed.into())
    }

    fn increment_buffer(&self, arg_addr: u64) -> DeviceResult<()> {
        let (mem, offset) = self
            .memory
            .lock()
            .resolve(arg_addr)
            .ok_or_else(|| {
                DeviceError::Device(format!("unmapped argument address {arg_addr:#x}"))
            })?;
        mem.increment_from(offset)
    }
}

/// The argument buffer address carried by the kernel's memory argument, if `entry` is one.
fn kernel_mem_arg(entry: &DescEntry) -> Option<u64> {
    if entry.arg_offset != KERNEL_MEM_ARG_OFFSET {
        return None;
    }
    let bytes: [u8; 8] = entry.payload.as_slice().try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Copy `len` bytes from device memory, rounding down to whole words.
fn read_region(mem: &DeviceMemory, offset: usize, len: usize) -> DeviceResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    let mut cursor = offset;
    #[allow(clippy::arithmetic_side_effects)]
    while cursor + 4 <= offset + len {
        buf.extend_from_slice(&mem.load(cursor)?.to_le_bytes());
        cursor += 4;
    }
    Ok(buf)
}
