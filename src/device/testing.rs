//! An in-memory device for unit tests.
//!
//! Completion is lazy: every read of a descriptor status word retires the oldest
//! submitted descriptor, so tasks finish strictly in submission order while the
//! host is polling.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::types::{DescStatus, FaErrorFlag};

use super::{
    check_word_access,
    constants::{
        CSR_ADDR_DESC_ADDR_HIGH, CSR_ADDR_DESC_ADDR_LOW, CSR_ADDR_ERROR_STATUS,
        CSR_ADDR_TASK_COUNT, DESC_STATUS_OFFSET, WORD_SIZE,
    },
    BoFlags, BoHandle, DeviceAdaptor, DeviceError, DeviceMapping, DeviceResult, SyncDirection,
};

const MOCK_MEM_BASE: u64 = 0x0000_0001_0000_0000;
const MOCK_MEM_ALIGN: u64 = 0x1000;

#[derive(Debug)]
struct MockMemory {
    words: Vec<AtomicU32>,
    is_desc: bool,
    shared: Arc<Mutex<MockShared>>,
    live_mappings: Arc<AtomicUsize>,
}

#[derive(Debug, Default)]
struct MockShared {
    /// descriptor memory by device address
    by_paddr: HashMap<u64, Arc<MockMemory>>,
    pending: VecDeque<u64>,
    high: u32,
    error: u32,
    triggers: u64,
    completions: u64,
    reclaims: u64,
    max_outstanding: u64,
    triggered: HashSet<u64>,
    /// stop retiring once this many tasks completed
    stall_after: Option<u64>,
}

impl MockShared {
    fn retire_one(&mut self) {
        if self.stall_after.is_some_and(|n| self.completions >= n) {
            return;
        }
        let Some(addr) = self.pending.pop_front() else {
            return;
        };
        if let Some(mem) = self.by_paddr.get(&addr) {
            if let Some(status) = mem.words.first() {
                status.store(DescStatus::Completed.into(), Ordering::Release);
            }
            self.completions += 1;
        }
    }
}

#[derive(Debug)]
struct MockMapping(Arc<MockMemory>);

impl Drop for MockMapping {
    fn drop(&mut self) {
        self.0.live_mappings.fetch_sub(1, Ordering::Relaxed);
    }
}

impl DeviceMapping for MockMapping {
    fn len(&self) -> usize {
        self.0.words.len() * WORD_SIZE
    }

    fn read_word(&self, offset: usize) -> DeviceResult<u32> {
        check_word_access(offset, self.len())?;
        if self.0.is_desc && offset == DESC_STATUS_OFFSET {
            self.0.shared.lock().retire_one();
        }
        Ok(self.0.words[offset / WORD_SIZE].load(Ordering::Acquire))
    }

    fn write_word(&self, offset: usize, value: u32) -> DeviceResult<()> {
        check_word_access(offset, self.len())?;
        let prev = self.0.words[offset / WORD_SIZE].swap(value, Ordering::Release);
        if self.0.is_desc
            && offset == DESC_STATUS_OFFSET
            && prev == u32::from(DescStatus::Completed)
            && value == u32::from(DescStatus::Issued)
        {
            self.0.shared.lock().reclaims += 1;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MockBo {
    mem: Arc<MockMemory>,
    paddr: u64,
}

#[derive(Debug, Default)]
struct Budgets {
    alloc: Option<usize>,
    map: Option<usize>,
    phys: Option<usize>,
}

fn take_budget(budget: &mut Option<usize>) -> bool {
    match budget {
        None => true,
        Some(0) => false,
        Some(n) => {
            *n -= 1;
            true
        }
    }
}

/// A device whose memory lives in host atomics and whose compute unit retires
/// descriptors on demand.
#[derive(Debug)]
pub(crate) struct MockDevice {
    bos: Mutex<HashMap<BoHandle, MockBo>>,
    next_handle: AtomicU32,
    next_paddr: Mutex<u64>,
    budgets: Mutex<Budgets>,
    shared: Arc<Mutex<MockShared>>,
    live_mappings: Arc<AtomicUsize>,
    syncs: AtomicUsize,
    allocations: Mutex<Vec<(BoFlags, u32)>>,
}

impl MockDevice {
    pub(crate) fn new() -> Self {
        Self {
            bos: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            next_paddr: Mutex::new(MOCK_MEM_BASE),
            budgets: Mutex::new(Budgets::default()),
            shared: Arc::new(Mutex::new(MockShared::default())),
            live_mappings: Arc::new(AtomicUsize::new(0)),
            syncs: AtomicUsize::new(0),
            allocations: Mutex::new(Vec::new()),
        }
    }

    /// Only `n` more allocations succeed.
    pub(crate) fn set_alloc_budget(&self, n: usize) {
        self.budgets.lock().alloc = Some(n);
    }

    /// Only `n` more mappings succeed.
    pub(crate) fn set_map_budget(&self, n: usize) {
        self.budgets.lock().map = Some(n);
    }

    /// Only `n` more address queries succeed.
    pub(crate) fn set_phys_budget(&self, n: usize) {
        self.budgets.lock().phys = Some(n);
    }

    /// Stop retiring tasks after `n` completions in total.
    pub(crate) fn stall_after(&self, n: u64) {
        self.shared.lock().stall_after = Some(n);
    }

    pub(crate) fn live_bos(&self) -> usize {
        self.bos.lock().len()
    }

    pub(crate) fn live_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::Relaxed)
    }

    /// Number of low-half writes seen.
    pub(crate) fn trigger_count(&self) -> u64 {
        self.shared.lock().triggers
    }

    /// Highest number of submissions not yet reclaimed by the host.
    pub(crate) fn max_outstanding(&self) -> u64 {
        self.shared.lock().max_outstanding
    }

    /// Distinct descriptor addresses that were ever submitted.
    pub(crate) fn triggered_addrs(&self) -> HashSet<u64> {
        self.shared.lock().triggered.clone()
    }

    pub(crate) fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::Relaxed)
    }

    /// Flags and bank of every successful allocation, in order.
    pub(crate) fn allocations(&self) -> Vec<(BoFlags, u32)> {
        self.allocations.lock().clone()
    }
}

impl DeviceAdaptor for MockDevice {
    fn alloc_bo(&self, size: usize, bank: u32, flags: BoFlags) -> DeviceResult<BoHandle> {
        if !take_budget(&mut self.budgets.lock().alloc) {
            return Err(DeviceError::OutOfMemory);
        }
        self.allocations.lock().push((flags, bank));
        let words = size.div_ceil(WORD_SIZE);
        let mem = Arc::new(MockMemory {
            words: (0..words).map(|_| AtomicU32::new(0)).collect(),
            is_desc: flags.contains(BoFlags::P2P),
            shared: Arc::clone(&self.shared),
            live_mappings: Arc::clone(&self.live_mappings),
        });
        let paddr = {
            let mut next = self.next_paddr.lock();
            let paddr = *next;
            *next += (size as u64).next_multiple_of(MOCK_MEM_ALIGN).max(MOCK_MEM_ALIGN);
            paddr
        };
        if mem.is_desc {
            self.shared.lock().by_paddr.insert(paddr, Arc::clone(&mem));
        }
        let handle = BoHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.bos.lock().insert(handle, MockBo { mem, paddr });
        Ok(handle)
    }

    fn map_bo(&self, bo: BoHandle) -> DeviceResult<Arc<dyn DeviceMapping>> {
        let bos = self.bos.lock();
        let mock_bo = bos.get(&bo).ok_or(DeviceError::InvalidHandle(bo.0))?;
        if !take_budget(&mut self.budgets.lock().map) {
            return Err(DeviceError::Device("mapping failed".to_owned()));
        }
        self.live_mappings.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MockMapping(Arc::clone(&mock_bo.mem))))
    }

    fn get_phys_addr(&self, bo: BoHandle) -> DeviceResult<u64> {
        let bos = self.bos.lock();
        let mock_bo = bos.get(&bo).ok_or(DeviceError::InvalidHandle(bo.0))?;
        if !take_budget(&mut self.budgets.lock().phys) {
            return Err(DeviceError::Device("address query failed".to_owned()));
        }
        Ok(mock_bo.paddr)
    }

    fn sync_bo(&self, bo: BoHandle, _direction: SyncDirection) -> DeviceResult<()> {
        if !self.bos.lock().contains_key(&bo) {
            return Err(DeviceError::InvalidHandle(bo.0));
        }
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn free_bo(&self, bo: BoHandle) {
        if let Some(mock_bo) = self.bos.lock().remove(&bo) {
            self.shared.lock().by_paddr.remove(&mock_bo.paddr);
        }
    }

    fn read_reg(&self, offset: usize) -> DeviceResult<u32> {
        let shared = self.shared.lock();
        match offset {
            CSR_ADDR_DESC_ADDR_HIGH => Ok(shared.high),
            CSR_ADDR_ERROR_STATUS => Ok(shared.error),
            #[allow(clippy::cast_possible_truncation)]
            CSR_ADDR_TASK_COUNT => Ok(shared.completions as u32),
            _ => Ok(0),
        }
    }

    fn write_reg(&self, offset: usize, data: u32) -> DeviceResult<()> {
        let mut shared = self.shared.lock();
        match offset {
            CSR_ADDR_DESC_ADDR_HIGH => shared.high = data,
            CSR_ADDR_DESC_ADDR_LOW => {
                let addr = (u64::from(shared.high) << 32) | u64::from(data);
                shared.triggers += 1;
                let outstanding = shared.triggers - shared.reclaims;
                shared.max_outstanding = shared.max_outstanding.max(outstanding);
                if shared.by_paddr.contains_key(&addr) {
                    shared.pending.push_back(addr);
                    shared.triggered.insert(addr);
                } else {
                    shared.error |= FaErrorFlag::DESC_DECERR.bits();
                }
            }
            _ => {
                return Err(DeviceError::Device(format!(
                    "write to read-only register {offset:#x}"
                )))
            }
        }
        Ok(())
    }
}
