use std::sync::Arc;

use log::{debug, info, warn};

use crate::{
    device::{
        constants::{DESC_STATUS_OFFSET, KERNEL_MEM_ARG_OFFSET, WORD_SIZE},
        descriptor::{Descriptor, DescriptorLayout},
        BoFlags, BoHandle, DeviceAdaptor, DeviceError, DeviceMapping, DeviceResult,
        SyncDirection,
    },
    types::{DescEntry, DescStatus, Error},
};

/// Memory bank of every descriptor buffer.
const DESC_BANK: u32 = 0;

/// Shape of the slots a pool builds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotSpec {
    /// bytes per argument buffer
    pub(crate) arg_buffer_size: usize,
    /// memory bank of the argument buffers
    pub(crate) bank: u32,
}

/// A descriptor buffer and the argument buffer it points at.
///
/// Every resource is optional so that a half-built slot can be released the same
/// way as a complete one.
#[derive(Debug, Default)]
pub(crate) struct TaskSlot {
    arg_bo: Option<BoHandle>,
    arg_map: Option<Arc<dyn DeviceMapping>>,
    desc_bo: Option<BoHandle>,
    desc_map: Option<Arc<dyn DeviceMapping>>,
    arg_addr: u64,
    desc_addr: u64,
    desc_len: usize,
}

impl TaskSlot {
    /// Build a slot, releasing whatever was acquired if any step fails.
    ///
    /// `entries` turns the argument buffer's device address into the input entries.
    fn build<F>(
        adaptor: &dyn DeviceAdaptor,
        layout: DescriptorLayout,
        spec: SlotSpec,
        entries: &F,
    ) -> DeviceResult<Self>
    where
        F: Fn(u64) -> Vec<DescEntry>,
    {
        let mut slot = TaskSlot::default();
        match slot.populate(adaptor, layout, spec, entries) {
            Ok(()) => Ok(slot),
            Err(e) => {
                slot.release(adaptor);
                Err(e)
            }
        }
    }

    fn populate<F>(
        &mut self,
        adaptor: &dyn DeviceAdaptor,
        layout: DescriptorLayout,
        spec: SlotSpec,
        entries: &F,
    ) -> DeviceResult<()>
    where
        F: Fn(u64) -> Vec<DescEntry>,
    {
        let arg_bo = adaptor.alloc_bo(spec.arg_buffer_size, spec.bank, BoFlags::empty())?;
        self.arg_bo = Some(arg_bo);
        let arg_map = adaptor.map_bo(arg_bo)?;
        self.arg_map = Some(Arc::clone(&arg_map));
        #[allow(clippy::arithmetic_side_effects)]
        for (idx, value) in (0..spec.arg_buffer_size / WORD_SIZE).zip(0_u32..) {
            arg_map.write_word(idx * WORD_SIZE, value)?;
        }
        adaptor.sync_bo(arg_bo, SyncDirection::ToDevice)?;
        self.arg_addr = adaptor.get_phys_addr(arg_bo)?;

        let desc = Descriptor::new(entries(self.arg_addr), vec![]);
        self.desc_len = layout.size_of(&desc.inputs, &desc.outputs);
        // descriptors always live in bank 0, whatever the argument bank
        let desc_bo = adaptor.alloc_bo(self.desc_len, DESC_BANK, BoFlags::P2P)?;
        self.desc_bo = Some(desc_bo);
        let desc_map = adaptor.map_bo(desc_bo)?;
        self.desc_map = Some(Arc::clone(&desc_map));
        self.desc_addr = adaptor.get_phys_addr(desc_bo)?;

        let bytes = layout.encode(&desc)?;
        desc_map.write_bytes(0, &bytes)?;
        debug!("descriptor at {:#x}\n{desc}", self.desc_addr);
        Ok(())
    }

    /// Drop the mappings and free the buffers. Calling it again does nothing.
    fn release(&mut self, adaptor: &dyn DeviceAdaptor) {
        self.desc_map = None;
        if let Some(bo) = self.desc_bo.take() {
            adaptor.free_bo(bo);
        }
        self.arg_map = None;
        if let Some(bo) = self.arg_bo.take() {
            adaptor.free_bo(bo);
        }
    }

    fn desc_map(&self) -> DeviceResult<&Arc<dyn DeviceMapping>> {
        self.desc_map
            .as_ref()
            .ok_or_else(|| DeviceError::Device("task slot is released".to_owned()))
    }

    /// Device address of the descriptor.
    pub(crate) fn desc_addr(&self) -> u64 {
        self.desc_addr
    }

    /// Raw status word of the descriptor.
    pub(crate) fn status(&self) -> DeviceResult<u32> {
        self.desc_map()?.read_word(DESC_STATUS_OFFSET)
    }

    pub(crate) fn set_status(&self, status: DescStatus) -> DeviceResult<()> {
        self.desc_map()?.write_word(DESC_STATUS_OFFSET, status.into())
    }

    /// The live descriptor bytes, as the device sees them.
    pub(crate) fn descriptor_bytes(&self) -> DeviceResult<Vec<u8>> {
        self.desc_map()?.read_bytes(0, self.desc_len)
    }

    fn argument_words(&self, adaptor: &dyn DeviceAdaptor) -> DeviceResult<Vec<u32>> {
        let (Some(bo), Some(map)) = (self.arg_bo, self.arg_map.as_ref()) else {
            return Err(DeviceError::Device("task slot is released".to_owned()));
        };
        adaptor.sync_bo(bo, SyncDirection::FromDevice)?;
        #[allow(clippy::arithmetic_side_effects)]
        (0..map.len() / WORD_SIZE)
            .map(|idx| map.read_word(idx * WORD_SIZE))
            .collect()
    }
}

/// The fixed set of task slots shared by every run.
#[derive(Debug)]
pub(crate) struct TaskSlotPool {
    adaptor: Arc<dyn DeviceAdaptor>,
    layout: DescriptorLayout,
    slots: Vec<TaskSlot>,
}

impl TaskSlotPool {
    /// Build up to `requested` slots.
    ///
    /// Running out of device resources ends construction early with a smaller
    /// pool. A descriptor layout error is fatal and releases every slot built so far.
    pub(crate) fn new(
        adaptor: Arc<dyn DeviceAdaptor>,
        layout: DescriptorLayout,
        requested: usize,
        spec: SlotSpec,
    ) -> Result<Self, Error> {
        Self::with_entries(adaptor, layout, requested, spec, |arg_addr| {
            vec![DescEntry::new_addr(KERNEL_MEM_ARG_OFFSET, arg_addr)]
        })
    }

    /// Like [`Self::new`], with the input entries of every slot produced by `entries`.
    pub(crate) fn with_entries<F>(
        adaptor: Arc<dyn DeviceAdaptor>,
        layout: DescriptorLayout,
        requested: usize,
        spec: SlotSpec,
        entries: F,
    ) -> Result<Self, Error>
    where
        F: Fn(u64) -> Vec<DescEntry>,
    {
        let mut pool = Self {
            adaptor,
            layout,
            slots: Vec::with_capacity(requested),
        };
        for _ in 0..requested {
            match TaskSlot::build(pool.adaptor.as_ref(), layout, spec, &entries) {
                Ok(slot) => pool.slots.push(slot),
                Err(DeviceError::Layout(e)) => {
                    pool.teardown();
                    return Err(Error::Layout(e));
                }
                Err(e) => {
                    warn!("task slot allocation stopped: {e}");
                    break;
                }
            }
        }
        if pool.slots.len() == requested {
            debug!(
                "allocated task slots, expect {requested}, created {}",
                pool.slots.len()
            );
        } else {
            info!(
                "allocated task slots, expect {requested}, created {}",
                pool.slots.len()
            );
        }
        Ok(pool)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn layout(&self) -> DescriptorLayout {
        self.layout
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&TaskSlot> {
        self.slots.get(idx)
    }

    /// Like [`Self::get`], for indices handed out by the submission ring.
    pub(crate) fn slot(&self, idx: usize) -> DeviceResult<&TaskSlot> {
        self.get(idx)
            .ok_or_else(|| DeviceError::Device(format!("task slot {idx} out of range")))
    }

    /// Return every slot to `Issued`, the cold state of a run.
    pub(crate) fn reset_statuses(&self) -> DeviceResult<()> {
        for slot in &self.slots {
            if slot.status()? != u32::from(DescStatus::Issued) {
                slot.set_status(DescStatus::Issued)?;
            }
        }
        Ok(())
    }

    /// Words of a slot's argument buffer after syncing it from the device.
    pub(crate) fn read_argument(&self, idx: usize) -> DeviceResult<Vec<u32>> {
        self.slot(idx)?.argument_words(self.adaptor.as_ref())
    }

    /// Release every slot. Safe to call more than once.
    pub(crate) fn teardown(&mut self) {
        for slot in &mut self.slots {
            slot.release(self.adaptor.as_ref());
        }
        self.slots.clear();
    }
}

impl Drop for TaskSlotPool {
    fn drop(&mut self) {
        self.teardown();
    }
}
