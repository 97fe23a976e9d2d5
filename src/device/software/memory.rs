use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::device::{
    check_word_access,
    constants::{SOFTWARE_MEM_ALIGN, SOFTWARE_MEM_BASE, WORD_SIZE},
    BoHandle, DeviceError, DeviceMapping, DeviceResult,
};

/// One buffer of device memory, shared between the host mapping and the compute unit.
#[derive(Debug)]
pub(super) struct DeviceMemory {
    words: Box<[AtomicU32]>,
    paddr: u64,
}

impl DeviceMemory {
    fn new(size: usize, paddr: u64) -> Self {
        let words = size.div_ceil(WORD_SIZE);
        Self {
            words: (0..words).map(|_| AtomicU32::new(0)).collect(),
            paddr,
        }
    }

    #[allow(clippy::arithmetic_side_effects)]
    pub(super) fn len(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    pub(super) fn paddr(&self) -> u64 {
        self.paddr
    }

    fn word(&self, offset: usize) -> DeviceResult<&AtomicU32> {
        check_word_access(offset, self.len())?;
        #[allow(clippy::arithmetic_side_effects)]
        self.words
            .get(offset / WORD_SIZE)
            .ok_or(DeviceError::Device(format!("word offset {offset:#x} out of range")))
    }

    pub(super) fn load(&self, offset: usize) -> DeviceResult<u32> {
        Ok(self.word(offset)?.load(Ordering::Acquire))
    }

    pub(super) fn store(&self, offset: usize, value: u32) -> DeviceResult<()> {
        self.word(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Add one to every word from `offset` to the end of the buffer.
    pub(super) fn increment_from(&self, offset: usize) -> DeviceResult<()> {
        check_word_access(offset, self.len())?;
        #[allow(clippy::arithmetic_side_effects)]
        let first = offset / WORD_SIZE;
        for word in self.words.iter().skip(first) {
            let _: u32 = word.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

/// Host view of a [`DeviceMemory`].
#[derive(Debug)]
pub(super) struct SoftwareMapping(pub(super) Arc<DeviceMemory>);

impl DeviceMapping for SoftwareMapping {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn read_word(&self, offset: usize) -> DeviceResult<u32> {
        self.0.load(offset)
    }

    fn write_word(&self, offset: usize, value: u32) -> DeviceResult<()> {
        self.0.store(offset, value)
    }
}

/// Allocation table of the software device's memory.
///
/// Device addresses are handed out upwards from `SOFTWARE_MEM_BASE` and never
/// reused; the byte budget is returned on free.
#[derive(Debug)]
pub(super) struct MemoryTable {
    budget: u64,
    used: u64,
    next_paddr: u64,
    next_handle: u32,
    bos: HashMap<BoHandle, Arc<DeviceMemory>>,
    by_paddr: BTreeMap<u64, Arc<DeviceMemory>>,
}

impl MemoryTable {
    pub(super) fn new(budget: usize) -> Self {
        Self {
            budget: budget as u64,
            used: 0,
            next_paddr: SOFTWARE_MEM_BASE,
            next_handle: 1,
            bos: HashMap::new(),
            by_paddr: BTreeMap::new(),
        }
    }

    fn footprint(size: usize) -> u64 {
        (size as u64).max(1).next_multiple_of(SOFTWARE_MEM_ALIGN)
    }

    pub(super) fn alloc(&mut self, size: usize) -> DeviceResult<BoHandle> {
        let footprint = Self::footprint(size);
        let used = self
            .used
            .checked_add(footprint)
            .filter(|used| *used <= self.budget)
            .ok_or(DeviceError::OutOfMemory)?;
        let next_paddr = self
            .next_paddr
            .checked_add(footprint)
            .ok_or(DeviceError::OutOfMemory)?;
        let handle = BoHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);

        let mem = Arc::new(DeviceMemory::new(size, self.next_paddr));
        let _: Option<Arc<DeviceMemory>> =
            self.by_paddr.insert(self.next_paddr, Arc::clone(&mem));
        let _: Option<Arc<DeviceMemory>> = self.bos.insert(handle, mem);
        self.used = used;
        self.next_paddr = next_paddr;
        Ok(handle)
    }

    pub(super) fn get(&self, bo: BoHandle) -> DeviceResult<&Arc<DeviceMemory>> {
        self.bos.get(&bo).ok_or(DeviceError::InvalidHandle(bo.0))
    }

    pub(super) fn free(&mut self, bo: BoHandle) {
        if let Some(mem) = self.bos.remove(&bo) {
            let _: Option<Arc<DeviceMemory>> = self.by_paddr.remove(&mem.paddr);
            self.used = self.used.saturating_sub(Self::footprint(mem.len()));
        }
    }

    /// Find the buffer containing device address `addr` and the byte offset inside it.
    pub(super) fn resolve(&self, addr: u64) -> Option<(Arc<DeviceMemory>, usize)> {
        let (base, mem) = self.by_paddr.range(..=addr).next_back()?;
        let offset = usize::try_from(addr.checked_sub(*base)?).ok()?;
        (offset < mem.len()).then(|| (Arc::clone(mem), offset))
    }
}
