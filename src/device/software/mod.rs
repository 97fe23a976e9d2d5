use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use flume::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{error, info, warn};

use crate::types::FaErrorFlag;

use self::{logic::ComputeUnitLogic, memory::SoftwareMapping};

use super::{
    constants::{
        CSR_ADDR_DESC_ADDR_HIGH, CSR_ADDR_DESC_ADDR_LOW, CSR_ADDR_ERROR_STATUS,
        CSR_ADDR_TASK_COUNT, CSR_LENGTH, DESC_FIFO_DEPTH,
    },
    BoFlags, BoHandle, DeviceAdaptor, DeviceError, DeviceMapping, DeviceResult, SyncDirection,
};

mod logic;
mod memory;

/// How long the worker waits on an empty FIFO before checking the stop flag.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(10);

/// An software device implementation of the accelerator.
///
/// Device memory lives in the host process; a worker thread plays the compute
/// unit and drains the descriptor FIFO in arrival order.
#[derive(Debug)]
pub(crate) struct SoftwareDevice {
    logic: Arc<ComputeUnitLogic>,
    desc_fifo: Sender<u64>,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SoftwareDevice {
    /// Initializing an software device with `memory_budget` bytes of device memory.
    pub(crate) fn new(memory_budget: usize) -> DeviceResult<Self> {
        let logic = Arc::new(ComputeUnitLogic::new(memory_budget));
        let (desc_fifo, fifo_rx) = bounded(DESC_FIFO_DEPTH);
        let stop_flag = Arc::new(AtomicBool::new(false));

        let thread_logic = Arc::clone(&logic);
        let thread_stop_flag = Arc::clone(&stop_flag);
        let worker = thread::Builder::new()
            .name("fa-compute-unit".to_owned())
            .spawn(move || worker_loop(&thread_logic, &fifo_rx, &thread_stop_flag))
            .map_err(|e| DeviceError::Device(e.to_string()))?;

        Ok(Self {
            logic,
            desc_fifo,
            stop_flag,
            worker: Some(worker),
        })
    }

    fn push_desc_addr(&self, desc_addr: u64) -> DeviceResult<()> {
        match self.desc_fifo.try_send(desc_addr) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("descriptor FIFO overrun, dropping descriptor at {desc_addr:#x}");
                self.logic.raise(FaErrorFlag::DESC_FIFO_OVERRUN);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(DeviceError::Device("compute unit is stopped".to_owned()))
            }
        }
    }
}

fn worker_loop(logic: &ComputeUnitLogic, fifo: &Receiver<u64>, stop_flag: &AtomicBool) {
    while !stop_flag.load(Ordering::Relaxed) {
        match fifo.recv_timeout(WORKER_IDLE_WAIT) {
            Ok(desc_addr) => logic.run(desc_addr),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("compute unit thread is normally stopped");
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.worker.take() {
            if let Err(e) = thread.join() {
                error!("SoftwareDevice thread join failed: {e:?}");
            }
        }
    }
}

impl DeviceAdaptor for SoftwareDevice {
    fn alloc_bo(&self, size: usize, _bank: u32, _flags: BoFlags) -> DeviceResult<BoHandle> {
        self.logic.memory.lock().alloc(size)
    }

    fn map_bo(&self, bo: BoHandle) -> DeviceResult<Arc<dyn DeviceMapping>> {
        let mem = Arc::clone(self.logic.memory.lock().get(bo)?);
        Ok(Arc::new(SoftwareMapping(mem)))
    }

    fn get_phys_addr(&self, bo: BoHandle) -> DeviceResult<u64> {
        Ok(self.logic.memory.lock().get(bo)?.paddr())
    }

    fn sync_bo(&self, bo: BoHandle, _direction: SyncDirection) -> DeviceResult<()> {
        // host and device share the same coherent memory
        self.logic.memory.lock().get(bo).map(|_| ())
    }

    fn free_bo(&self, bo: BoHandle) {
        self.logic.memory.lock().free(bo);
    }

    fn read_reg(&self, offset: usize) -> DeviceResult<u32> {
        match offset {
            CSR_ADDR_DESC_ADDR_HIGH => Ok(self.logic.desc_addr_high()),
            CSR_ADDR_DESC_ADDR_LOW => Ok(self.logic.desc_addr_low()),
            CSR_ADDR_ERROR_STATUS => Ok(self.logic.error()),
            CSR_ADDR_TASK_COUNT => Ok(self.logic.task_count()),
            _ if offset < CSR_LENGTH => Ok(0),
            _ => Err(DeviceError::Device(format!("csr overflow :{offset}"))),
        }
    }

    fn write_reg(&self, offset: usize, data: u32) -> DeviceResult<()> {
        match offset {
            CSR_ADDR_DESC_ADDR_HIGH => {
                self.logic.set_desc_addr_high(data);
                Ok(())
            }
            CSR_ADDR_DESC_ADDR_LOW => {
                let desc_addr = self.logic.latch_desc_addr(data);
                self.push_desc_addr(desc_addr)
            }
            _ => Err(DeviceError::Device(format!(
                "register {offset:#x} is not writable"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        thread::sleep,
        time::{Duration, Instant},
    };

    use crate::{
        device::{
            constants::{
                CSR_ADDR_DESC_ADDR_HIGH, CSR_ADDR_DESC_ADDR_LOW, CSR_ADDR_ERROR_STATUS,
                CSR_ADDR_TASK_COUNT, SOFTWARE_MEM_BASE,
            },
            descriptor::{Descriptor, DescriptorLayout},
            BoFlags, DeviceAdaptor, DeviceError, SyncDirection,
        },
        types::{DescEntry, DescStatus, FaErrorFlag},
    };

    use super::SoftwareDevice;

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_software_device_runs_kernel() {
        let dev = SoftwareDevice::new(1 << 20).unwrap();
        let arg = dev.alloc_bo(16, 0, BoFlags::empty()).unwrap();
        let desc = dev.alloc_bo(36, 0, BoFlags::P2P).unwrap();
        let arg_map = dev.map_bo(arg).unwrap();
        let desc_map = dev.map_bo(desc).unwrap();
        for j in 0..4_u32 {
            arg_map.write_word(j as usize * 4, j).unwrap();
        }
        dev.sync_bo(arg, SyncDirection::ToDevice).unwrap();

        let arg_addr = dev.get_phys_addr(arg).unwrap();
        let desc_addr = dev.get_phys_addr(desc).unwrap();
        assert_eq!(arg_addr, SOFTWARE_MEM_BASE);
        let bytes = DescriptorLayout::default()
            .encode(&Descriptor::new(vec![DescEntry::new_addr(0x10, arg_addr)], vec![]))
            .unwrap();
        desc_map.write_bytes(0, &bytes).unwrap();

        dev.write_reg(CSR_ADDR_DESC_ADDR_HIGH, (desc_addr >> 32) as u32).unwrap();
        dev.write_reg(CSR_ADDR_DESC_ADDR_LOW, desc_addr as u32).unwrap();
        wait_until(|| desc_map.read_word(0).unwrap() == u32::from(DescStatus::Completed));

        assert_eq!(
            arg_map.read_bytes(0, 16).unwrap(),
            vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0]
        );
        assert_eq!(dev.read_reg(CSR_ADDR_TASK_COUNT).unwrap(), 1);
        assert_eq!(dev.read_reg(CSR_ADDR_ERROR_STATUS).unwrap(), 0);
        assert_eq!(dev.read_reg(CSR_ADDR_DESC_ADDR_LOW).unwrap(), desc_addr as u32);
    }

    #[test]
    fn test_software_device_out_of_memory() {
        let dev = SoftwareDevice::new(2 * 4096).unwrap();
        let a = dev.alloc_bo(4096, 0, BoFlags::empty()).unwrap();
        let _b = dev.alloc_bo(1, 0, BoFlags::P2P).unwrap();
        assert!(matches!(
            dev.alloc_bo(4, 0, BoFlags::empty()),
            Err(DeviceError::OutOfMemory)
        ));
        dev.free_bo(a);
        dev.free_bo(a);
        assert!(dev.map_bo(a).is_err());
        assert!(dev.alloc_bo(4096, 0, BoFlags::empty()).is_ok());
    }

    #[test]
    fn test_unknown_address_raises_decode_error() {
        let dev = SoftwareDevice::new(4096).unwrap();
        dev.write_reg(CSR_ADDR_DESC_ADDR_HIGH, 0).unwrap();
        dev.write_reg(CSR_ADDR_DESC_ADDR_LOW, 0x40).unwrap();
        wait_until(|| dev.read_reg(CSR_ADDR_ERROR_STATUS).unwrap() != 0);
        assert_eq!(
            dev.read_reg(CSR_ADDR_ERROR_STATUS).unwrap(),
            FaErrorFlag::DESC_DECERR.bits()
        );
        assert!(dev.write_reg(CSR_ADDR_TASK_COUNT, 1).is_err());
        assert!(dev.read_reg(0x10_0000).is_err());
    }
}
