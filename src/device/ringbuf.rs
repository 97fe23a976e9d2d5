/// Submission-order ring over the indices of a fixed slot pool.
///
/// `tail` is the next slot to hand to the device and `head` the oldest slot
/// still in flight. Both wrap at `capacity`; `in_flight` disambiguates the
/// full and empty states where `head == tail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlotRing {
    capacity: usize,
    head: usize,
    tail: usize,
    in_flight: usize,
}

impl SlotRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            head: 0,
            tail: 0,
            in_flight: 0,
        }
    }

    /// Back to the cold state: nothing in flight, both indices at slot 0.
    pub(crate) fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.in_flight = 0;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.in_flight == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.in_flight >= self.capacity
    }

    /// Claim the slot at the tail for a new submission.
    ///
    /// Returns `None` when every slot is already in flight.
    pub(crate) fn push_back(&mut self) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let idx = self.tail;
        self.tail = self.wrap_next(self.tail);
        self.in_flight = self.in_flight.wrapping_add(1);
        Some(idx)
    }

    /// The oldest slot in flight, the one the device retires next.
    pub(crate) fn front(&self) -> Option<usize> {
        (!self.is_empty()).then_some(self.head)
    }

    /// Release the oldest slot in flight.
    pub(crate) fn pop_front(&mut self) -> Option<usize> {
        let idx = self.front()?;
        self.head = self.wrap_next(self.head);
        self.in_flight = self.in_flight.wrapping_sub(1);
        Some(idx)
    }

    fn wrap_next(&self, idx: usize) -> usize {
        let next = idx.wrapping_add(1);
        if next >= self.capacity {
            0
        } else {
            next
        }
    }
}
