use std::{fmt::Debug, sync::Arc};

use bitflags::bitflags;

pub(crate) mod constants;
pub(crate) mod descriptor;
pub(crate) mod dispatch;
mod error;
mod hardware;
pub(crate) mod ringbuf;
mod software;

#[cfg(test)]
pub(crate) mod testing;

pub use self::error::LayoutError;
pub(crate) use self::{
    error::{DeviceError, DeviceResult},
    hardware::HardwareDevice,
    software::SoftwareDevice,
};

use self::constants::WORD_SIZE;

/// Handle of a buffer object allocated by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct BoHandle(pub(crate) u32);

bitflags! {
    /// Placement flags of a buffer object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct BoFlags: u32 {
        /// Device-addressable memory that the host maps directly
        const P2P = 0x1;
    }
}

/// Direction of a cache synchronization between host and device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncDirection {
    ToDevice,
    FromDevice,
}

/// Public interface for a device. Can be a real hardware device or a software emulation.
pub(crate) trait DeviceAdaptor: Send + Sync + Debug {
    /// Allocate `size` bytes of device memory in `bank`.
    fn alloc_bo(&self, size: usize, bank: u32, flags: BoFlags) -> DeviceResult<BoHandle>;

    /// Map a buffer for host access. The mapping stays valid until it is dropped.
    fn map_bo(&self, bo: BoHandle) -> DeviceResult<Arc<dyn DeviceMapping>>;

    /// Device-physical address of the first byte of a buffer.
    fn get_phys_addr(&self, bo: BoHandle) -> DeviceResult<u64>;

    fn sync_bo(&self, bo: BoHandle, direction: SyncDirection) -> DeviceResult<()>;

    /// Release a buffer. Releasing an unknown handle does nothing.
    fn free_bo(&self, bo: BoHandle);

    fn read_reg(&self, offset: usize) -> DeviceResult<u32>;
    fn write_reg(&self, offset: usize, data: u32) -> DeviceResult<()>;
}

/// Word-granular host view of one device buffer.
///
/// Reads acquire and writes release, so a status word written by the device
/// publishes every byte the device wrote before it.
pub(crate) trait DeviceMapping: Send + Sync + Debug {
    /// Length of the mapped region in bytes.
    fn len(&self) -> usize;

    fn read_word(&self, offset: usize) -> DeviceResult<u32>;
    fn write_word(&self, offset: usize, value: u32) -> DeviceResult<()>;

    /// Copy word-packed bytes into the mapping at a word-aligned offset.
    fn write_bytes(&self, offset: usize, bytes: &[u8]) -> DeviceResult<()> {
        check_word_aligned(offset, bytes.len())?;
        for (idx, chunk) in bytes.chunks_exact(WORD_SIZE).enumerate() {
            let word = u32::from_le_bytes(
                chunk
                    .try_into()
                    .map_err(|_err| DeviceError::Device("unaligned word".to_owned()))?,
            );
            #[allow(clippy::arithmetic_side_effects)] // bounded by `bytes.len()`
            self.write_word(offset + idx * WORD_SIZE, word)?;
        }
        Ok(())
    }

    /// Read `len` bytes from a word-aligned offset.
    fn read_bytes(&self, offset: usize, len: usize) -> DeviceResult<Vec<u8>> {
        check_word_aligned(offset, len)?;
        let mut buf = Vec::with_capacity(len);
        #[allow(clippy::arithmetic_side_effects)]
        for idx in 0..len / WORD_SIZE {
            let word = self.read_word(offset + idx * WORD_SIZE)?;
            buf.extend_from_slice(&word.to_le_bytes());
        }
        Ok(buf)
    }
}

/// Check that `[offset, offset + len)` can be accessed word by word.
pub(crate) fn check_word_aligned(offset: usize, len: usize) -> DeviceResult<()> {
    if offset % WORD_SIZE != 0 || len % WORD_SIZE != 0 {
        return Err(DeviceError::Device(format!(
            "unaligned access: offset {offset:#x}, length {len}"
        )));
    }
    Ok(())
}

/// Check that a word access at `offset` stays within a region of `len` bytes.
pub(crate) fn check_word_access(offset: usize, len: usize) -> DeviceResult<()> {
    check_word_aligned(offset, 0)?;
    match offset.checked_add(WORD_SIZE) {
        Some(end) if end <= len => Ok(()),
        _ => Err(DeviceError::Device(format!(
            "access out of bounds: offset {offset:#x}, mapping length {len}"
        ))),
    }
}
