use std::{fmt::Debug, sync::Arc};

use log::trace;

use super::{
    constants::{CSR_ADDR_DESC_ADDR_HIGH, CSR_ADDR_DESC_ADDR_LOW},
    DeviceAdaptor, DeviceError, DeviceResult,
};

/// An adaptor to write the descriptor address registers of a compute unit.
///
/// Writing the low half starts execution of the descriptor at the combined address.
pub(crate) trait DescAddrTrigger: Debug {
    fn write_addr_high(&self, data: u32) -> DeviceResult<()>;
    fn write_addr_low(&self, data: u32) -> DeviceResult<()>;
}

#[derive(Debug)]
pub(crate) struct CuTriggerProxy(Arc<dyn DeviceAdaptor>);

impl CuTriggerProxy {
    const HIGH_CSR: usize = CSR_ADDR_DESC_ADDR_HIGH;
    const LOW_CSR: usize = CSR_ADDR_DESC_ADDR_LOW;
    pub(crate) fn new(adaptor: Arc<dyn DeviceAdaptor>) -> Self {
        Self(adaptor)
    }
}

impl DescAddrTrigger for CuTriggerProxy {
    fn write_addr_high(&self, data: u32) -> DeviceResult<()> {
        self.0.write_reg(Self::HIGH_CSR, data)
    }
    fn write_addr_low(&self, data: u32) -> DeviceResult<()> {
        self.0.write_reg(Self::LOW_CSR, data)
    }
}

/// Hands descriptor addresses to the device under an in-flight depth bound.
#[derive(Debug)]
pub(crate) struct DispatchEngine<T> {
    trigger: T,
    depth: usize,
    in_flight: usize,
    submitted: u64,
    max_in_flight: usize,

    /// High half the device currently holds, `None` when unknown.
    last_high: Option<u32>,
}

impl<T: DescAddrTrigger> DispatchEngine<T> {
    pub(crate) fn new(trigger: T, depth: usize) -> Self {
        Self {
            trigger,
            depth,
            in_flight: 0,
            submitted: 0,
            max_in_flight: 0,
            last_high: None,
        }
    }

    /// Reset the per-run counters.
    ///
    /// The cached high half survives: the register keeps its value across runs.
    pub(crate) fn begin_run(&mut self) {
        self.in_flight = 0;
        self.submitted = 0;
        self.max_in_flight = 0;
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.in_flight < self.depth
    }

    /// Start execution of the descriptor at `addr`.
    ///
    /// Fails with `DepthExceeded` when `depth` submissions are already outstanding.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn submit(&mut self, addr: u64) -> DeviceResult<()> {
        if !self.has_capacity() {
            return Err(DeviceError::DepthExceeded(self.depth));
        }
        let high = (addr >> 32_i32) as u32;
        let low = addr as u32;
        if self.last_high != Some(high) {
            // a failed write leaves the register in an unknown state
            self.last_high = None;
            self.trigger.write_addr_high(high)?;
            self.last_high = Some(high);
        }
        self.trigger.write_addr_low(low)?;
        trace!("submitted descriptor at {addr:#x}");

        self.in_flight = self.in_flight.wrapping_add(1);
        self.submitted = self.submitted.wrapping_add(1);
        self.max_in_flight = self.max_in_flight.max(self.in_flight);
        Ok(())
    }

    /// Account for one completion observed by the poller.
    pub(crate) fn retire(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub(crate) fn submitted(&self) -> u64 {
        self.submitted
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}
