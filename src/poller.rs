use std::{
    hint,
    time::{Duration, Instant},
};

use log::trace;

use crate::{
    device::{
        dispatch::{DescAddrTrigger, DispatchEngine},
        ringbuf::SlotRing,
        DeviceError, DeviceResult,
    },
    slot::TaskSlotPool,
    types::DescStatus,
};

/// Counters of one submit/poll run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RunStats {
    pub(crate) completed: u64,
    pub(crate) initial_submissions: u64,
    pub(crate) resubmissions: u64,
    pub(crate) max_in_flight: usize,
}

/// Waits on the oldest in-flight slot and refills the device as slots retire.
///
/// The device is assumed to retire descriptors in submission order, so only the
/// head of the ring is ever inspected. A device that completes out of order makes
/// the poller spin on the head while later slots are already done.
#[derive(Debug)]
pub(crate) struct CompletionPoller {
    ring: SlotRing,
    poll_timeout: Option<Duration>,
}

impl CompletionPoller {
    pub(crate) fn new(slot_count: usize, poll_timeout: Option<Duration>) -> Self {
        Self {
            ring: SlotRing::new(slot_count),
            poll_timeout,
        }
    }

    /// Drive `target` tasks through the device, starting from the cold state.
    ///
    /// Without a poll timeout this never returns if the head task never completes.
    pub(crate) fn run<T: DescAddrTrigger>(
        &mut self,
        pool: &TaskSlotPool,
        engine: &mut DispatchEngine<T>,
        target: u64,
    ) -> DeviceResult<RunStats> {
        self.ring.reset();
        engine.begin_run();
        let mut stats = RunStats::default();

        while engine.submitted() < target && self.submit_next(pool, engine)? {}
        stats.initial_submissions = engine.submitted();
        trace!("primed {} tasks", stats.initial_submissions);

        let mut last_progress = Instant::now();
        while stats.completed < target {
            let head = self
                .ring
                .front()
                .ok_or_else(|| DeviceError::Device("no task in flight".to_owned()))?;
            let slot = pool.slot(head)?;
            if slot.status()? == u32::from(DescStatus::Completed) {
                stats.completed = stats.completed.wrapping_add(1);
                slot.set_status(DescStatus::Issued)?;
                let _: Option<usize> = self.ring.pop_front();
                engine.retire();

                if engine.submitted() < target && self.submit_next(pool, engine)? {
                    stats.resubmissions = stats.resubmissions.wrapping_add(1);
                }
                if self.poll_timeout.is_some() {
                    last_progress = Instant::now();
                }
            } else if let Some(timeout) = self.poll_timeout {
                if last_progress.elapsed() >= timeout {
                    return Err(DeviceError::Timeout);
                }
            } else {
                hint::spin_loop();
            }
        }
        stats.max_in_flight = engine.max_in_flight();
        trace!(
            "run drained, {} submitted, {} still in flight",
            engine.submitted(),
            engine.in_flight()
        );
        Ok(stats)
    }

    /// Submit the slot at the ring's tail. Returns `false` if every slot is in flight.
    fn submit_next<T: DescAddrTrigger>(
        &mut self,
        pool: &TaskSlotPool,
        engine: &mut DispatchEngine<T>,
    ) -> DeviceResult<bool> {
        if !engine.has_capacity() || self.ring.is_full() {
            return Ok(false);
        }
        let idx = self
            .ring
            .push_back()
            .ok_or_else(|| DeviceError::Device("task ring is full".to_owned()))?;
        engine.submit(pool.slot(idx)?.desc_addr())?;
        Ok(true)
    }
}
