use std::{sync::Arc, time::Instant};

use log::{error, info};

use crate::{
    device::{
        constants::{CSR_ADDR_ERROR_STATUS, CSR_ADDR_TASK_COUNT, WORD_SIZE},
        descriptor::DescriptorLayout,
        dispatch::{CuTriggerProxy, DispatchEngine},
        DeviceAdaptor, DeviceError, HardwareDevice, SoftwareDevice,
    },
    poller::CompletionPoller,
    slot::{SlotSpec, TaskSlotPool},
    types::{Error, FaErrorFlag, RunReport},
    DeviceType, HarnessConfig,
};

/// Measures sustained task throughput of an accelerator.
///
/// The harness owns the device, a pool of task slots built once at startup and
/// the dispatch state. Every run starts from the cold state and reuses the same
/// slots.
///
/// # Liveness
///
/// Completions are detected by polling the oldest in-flight descriptor only. If
/// the device never completes it, or completes tasks out of submission order, a
/// run without a poll timeout never returns.
#[derive(Debug)]
pub struct ThroughputHarness {
    config: HarnessConfig,
    adaptor: Arc<dyn DeviceAdaptor>,
    pool: TaskSlotPool,
    engine: DispatchEngine<CuTriggerProxy>,
    poller: CompletionPoller,
    timed_out: bool,
}

impl ThroughputHarness {
    /// Open the device selected by `config` and build the slot pool.
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` if the device cannot be opened, `Error::Layout` if a
    /// descriptor cannot be encoded and `Error::NoSlots` if not a single slot fits.
    pub fn new(config: HarnessConfig) -> Result<Self, Error> {
        let adaptor: Arc<dyn DeviceAdaptor> = match config.device_type {
            DeviceType::Software { memory_budget } => {
                Arc::new(SoftwareDevice::new(memory_budget).map_err(setup_error)?)
            }
            DeviceType::Hardware {
                ref path,
                use_hugepage,
            } => Arc::new(
                HardwareDevice::new(path, use_hugepage).map_err(setup_error)?,
            ),
        };
        Self::with_adaptor(adaptor, config)
    }

    pub(crate) fn with_adaptor(
        adaptor: Arc<dyn DeviceAdaptor>,
        config: HarnessConfig,
    ) -> Result<Self, Error> {
        let spec = SlotSpec {
            arg_buffer_size: config.arg_buffer_size,
            bank: config.bank,
        };
        let pool = TaskSlotPool::new(
            Arc::clone(&adaptor),
            DescriptorLayout::new(WORD_SIZE)?,
            config.slot_count,
            spec,
        )?;
        if pool.is_empty() {
            return Err(Error::NoSlots);
        }
        let engine = DispatchEngine::new(
            CuTriggerProxy::new(Arc::clone(&adaptor)),
            config.fifo_depth,
        );
        let poller = CompletionPoller::new(pool.len(), config.poll_timeout);
        info!(
            "harness ready: {} slots, in-flight depth {}",
            pool.len(),
            engine.depth()
        );
        Ok(Self {
            config,
            adaptor,
            pool,
            engine,
            poller,
            timed_out: false,
        })
    }

    /// Number of usable task slots, possibly fewer than requested.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.pool.len()
    }

    /// The configuration this harness was built with.
    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run `target` tasks from the cold state and time them.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` when a configured poll timeout expires; the harness
    /// refuses further runs afterwards. Returns `Error::DeviceFault` when the
    /// accelerator reports an error at the end of the run.
    pub fn run(&mut self, target: u64) -> Result<RunReport, Error> {
        if self.timed_out {
            return Err(Error::Timeout);
        }
        if self.pool.is_empty() {
            return Err(Error::NoSlots);
        }
        self.pool.reset_statuses()?;

        let start = Instant::now();
        let stats = match self.poller.run(&self.pool, &mut self.engine, target) {
            Ok(stats) => stats,
            Err(DeviceError::Timeout) => {
                error!("no completion within {:?}", self.config.poll_timeout);
                self.timed_out = true;
                return Err(Error::Timeout);
            }
            Err(e) => return Err(e.into()),
        };
        let elapsed = start.elapsed();

        let flags = self.error_status()?;
        if !flags.is_empty() {
            error!("device reported fault {flags:?} after {target} tasks");
            return Err(Error::DeviceFault(flags));
        }

        let report = RunReport {
            target,
            completed: stats.completed,
            initial_submissions: stats.initial_submissions,
            resubmissions: stats.resubmissions,
            max_in_flight: stats.max_in_flight,
            elapsed,
        };
        info!("{report}");
        Ok(report)
    }

    /// Run every target count of the configuration in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing run; see [`Self::run`].
    pub fn run_all(&mut self) -> Result<Vec<RunReport>, Error> {
        let runs = self.config.runs.clone();
        runs.into_iter().map(|target| self.run(target)).collect()
    }

    /// Decode a slot's live descriptor and format it for display.
    ///
    /// # Errors
    ///
    /// Returns `Error::SlotIndex` for an unknown slot and `Error::Layout` if the
    /// descriptor no longer decodes.
    pub fn dump_slot(&self, idx: usize) -> Result<String, Error> {
        let slot = self.pool.get(idx).ok_or(Error::SlotIndex(idx))?;
        let bytes = slot.descriptor_bytes()?;
        let desc = self.pool.layout().decode(&bytes)?;
        Ok(desc.to_string())
    }

    /// Words of a slot's argument buffer, read back from the device.
    ///
    /// # Errors
    ///
    /// Returns `Error::SlotIndex` for an unknown slot.
    pub fn read_argument(&self, idx: usize) -> Result<Vec<u32>, Error> {
        if idx >= self.pool.len() {
            return Err(Error::SlotIndex(idx));
        }
        Ok(self.pool.read_argument(idx)?)
    }

    /// The accelerator's error word.
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the register cannot be read.
    pub fn error_status(&self) -> Result<FaErrorFlag, Error> {
        let raw = self.adaptor.read_reg(CSR_ADDR_ERROR_STATUS)?;
        Ok(FaErrorFlag::from_bits_retain(raw))
    }

    /// The accelerator's retired task counter.
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the register cannot be read.
    pub fn task_count(&self) -> Result<u32, Error> {
        Ok(self.adaptor.read_reg(CSR_ADDR_TASK_COUNT)?)
    }

    /// Release every slot. Later runs fail with `Error::NoSlots`; calling it again does nothing.
    pub fn teardown(&mut self) {
        self.pool.teardown();
    }
}

fn setup_error(err: DeviceError) -> Error {
    Error::Setup(err.to_string())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use crate::{
        device::{testing::MockDevice, DeviceAdaptor},
        types::Error,
        HarnessConfigBuilder,
    };

    use super::ThroughputHarness;

    fn harness(dev: &Arc<MockDevice>, slots: usize, depth: usize) -> ThroughputHarness {
        let adaptor: Arc<dyn DeviceAdaptor> = Arc::<MockDevice>::clone(dev);
        let config = HarnessConfigBuilder::default()
            .slot_count(slots)
            .fifo_depth(depth)
            .arg_buffer_size(32_usize)
            .build()
            .unwrap();
        ThroughputHarness::with_adaptor(adaptor, config).unwrap()
    }

    #[test]
    fn test_run_reports_counts() {
        let dev = Arc::new(MockDevice::new());
        let mut h = harness(&dev, 100, 12);
        let report = h.run(1000).unwrap();
        assert_eq!(report.target, 1000);
        assert_eq!(report.completed, 1000);
        assert_eq!(report.initial_submissions, 12);
        assert_eq!(report.resubmissions, 988);
        assert!(report.max_in_flight <= 12);
        assert!(dev.max_outstanding() <= 12);
    }

    #[test]
    fn test_bound_larger_than_pool() {
        let dev = Arc::new(MockDevice::new());
        let mut h = harness(&dev, 3, 12);
        let report = h.run(10).unwrap();
        assert_eq!(report.completed, 10);
        assert_eq!(report.initial_submissions, 3);
        assert_eq!(report.resubmissions, 7);
        assert!(report.max_in_flight <= 3);
        assert!(dev.max_outstanding() <= 3);
    }

    #[test]
    fn test_degraded_pool_still_runs() {
        let dev = Arc::new(MockDevice::new());
        dev.set_alloc_budget(7);
        let mut h = harness(&dev, 100, 12);
        assert_eq!(h.slot_count(), 3);
        assert_eq!(h.run(20).unwrap().completed, 20);
    }

    #[test]
    fn test_no_slots() {
        let dev = Arc::new(MockDevice::new());
        dev.set_alloc_budget(1);
        let adaptor: Arc<dyn DeviceAdaptor> = Arc::<MockDevice>::clone(&dev);
        let config = HarnessConfigBuilder::default().build().unwrap();
        assert!(matches!(
            ThroughputHarness::with_adaptor(adaptor, config),
            Err(Error::NoSlots)
        ));
        assert_eq!(dev.live_bos(), 0);
    }

    #[test]
    fn test_timeout_poisons_harness() {
        let dev = Arc::new(MockDevice::new());
        let adaptor: Arc<dyn DeviceAdaptor> = Arc::<MockDevice>::clone(&dev);
        let config = HarnessConfigBuilder::default()
            .slot_count(4_usize)
            .poll_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let mut h = ThroughputHarness::with_adaptor(adaptor, config).unwrap();
        dev.stall_after(3);
        assert!(matches!(h.run(10), Err(Error::Timeout)));
        assert!(matches!(h.run(1), Err(Error::Timeout)));
    }

    #[test]
    fn test_dump_and_argument_access() {
        let dev = Arc::new(MockDevice::new());
        let mut h = harness(&dev, 2, 2);
        let dump = h.dump_slot(1).unwrap();
        assert!(dump.contains("numInputEntries   0x1"));
        assert!(dump.contains("argOffset  0x10"));
        assert_eq!(h.read_argument(0).unwrap(), (0..8).collect::<Vec<u32>>());
        assert!(matches!(h.dump_slot(2), Err(Error::SlotIndex(2))));
        assert!(matches!(h.read_argument(5), Err(Error::SlotIndex(5))));

        h.teardown();
        h.teardown();
        assert_eq!(dev.live_bos(), 0);
        assert_eq!(h.slot_count(), 0);
    }
}
