// Register map of the compute unit, byte offsets from the register window base.
pub(crate) const CSR_ADDR_DESC_ADDR_HIGH: usize = 0x00;
pub(crate) const CSR_ADDR_DESC_ADDR_LOW: usize = 0x04;
pub(crate) const CSR_ADDR_ERROR_STATUS: usize = 0x08;
pub(crate) const CSR_ADDR_TASK_COUNT: usize = 0x0C;

/// Size of the register window.
pub(crate) const CSR_LENGTH: usize = 0x1000;

/// Depth of the accelerator's descriptor FIFO.
pub(crate) const DESC_FIFO_DEPTH: usize = 12;

/// Argument aperture offset of the kernel's memory pointer.
pub(crate) const KERNEL_MEM_ARG_OFFSET: u32 = 0x10;

/// Descriptors and entries are packed in 4-byte words.
pub(crate) const WORD_SIZE: usize = 4;

/// Header of a descriptor: status plus four count/size words.
pub(crate) const DESC_HEADER_SIZE: usize = 20;

/// Header of an entry: `argOffset` and `argSize`.
pub(crate) const DESC_ENTRY_HEADER_SIZE: usize = 8;

/// Byte offset of the status word inside a descriptor.
pub(crate) const DESC_STATUS_OFFSET: usize = 0;

/// Device-physical base of the software device's memory arena.
///
/// It sits 64 KiB below a 4 GiB boundary so the high address half changes after sixteen pages.
pub(crate) const SOFTWARE_MEM_BASE: u64 = 0x0000_0004_FFFF_0000;

/// Software device buffers are placed on page boundaries.
pub(crate) const SOFTWARE_MEM_ALIGN: u64 = 4096;
