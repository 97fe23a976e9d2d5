use std::fmt;

use crate::types::{DescEntry, DescStatus};

use self::layout::{DescEntryHeader, DescriptorHeader};
use super::{
    constants::{DESC_ENTRY_HEADER_SIZE, DESC_HEADER_SIZE, WORD_SIZE},
    LayoutError,
};

/// layout of a descriptor
mod layout;

/// A descriptor as the host sees it: the header words plus the decoded entry lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Descriptor {
    /// Raw status word
    pub(crate) status: u32,

    /// Header field `inputEntryBytes`
    pub(crate) input_entry_bytes: u32,

    /// Header field `outputEntryBytes`
    pub(crate) output_entry_bytes: u32,

    pub(crate) inputs: Vec<DescEntry>,
    pub(crate) outputs: Vec<DescEntry>,
}

impl Descriptor {
    /// Build a descriptor in the `Issued` state.
    ///
    /// `inputEntryBytes` and `outputEntryBytes` hold the payload bytes of each list.
    pub(crate) fn new(inputs: Vec<DescEntry>, outputs: Vec<DescEntry>) -> Self {
        let input_entry_bytes = inputs.iter().fold(0_u32, |a, e| a.wrapping_add(e.arg_size));
        let output_entry_bytes = outputs
            .iter()
            .fold(0_u32, |a, e| a.wrapping_add(e.arg_size));
        Self {
            status: DescStatus::Issued.into(),
            input_entry_bytes,
            output_entry_bytes,
            inputs,
            outputs,
        }
    }
}

/// The packing rule shared by the host and the accelerator firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DescriptorLayout {
    word_stride: usize,
}

impl Default for DescriptorLayout {
    fn default() -> Self {
        Self {
            word_stride: WORD_SIZE,
        }
    }
}

impl DescriptorLayout {
    /// Create a layout whose entries are rounded up to `word_stride` bytes.
    pub(crate) fn new(word_stride: usize) -> Result<Self, LayoutError> {
        if word_stride < WORD_SIZE || !word_stride.is_power_of_two() {
            return Err(LayoutError::BadStride(word_stride));
        }
        Ok(Self { word_stride })
    }

    /// Bytes an entry occupies: its header plus payload, rounded to the word stride.
    pub(crate) fn entry_footprint(&self, arg_size: u32) -> usize {
        let raw = DESC_ENTRY_HEADER_SIZE.saturating_add(arg_size as usize);
        raw.next_multiple_of(self.word_stride)
    }

    /// Total bytes needed by a descriptor carrying `inputs` and `outputs`.
    pub(crate) fn size_of(&self, inputs: &[DescEntry], outputs: &[DescEntry]) -> usize {
        inputs
            .iter()
            .chain(outputs.iter())
            .fold(DESC_HEADER_SIZE, |acc, e| {
                acc.saturating_add(self.entry_footprint(e.arg_size))
            })
    }

    /// Encode `desc` into a freshly allocated buffer of exactly the required size.
    pub(crate) fn encode(&self, desc: &Descriptor) -> Result<Vec<u8>, LayoutError> {
        let size = self.size_of(&desc.inputs, &desc.outputs);
        let mut buf = vec![0_u8; size];
        let written = self.encode_into(desc, &mut buf)?;
        if written != size {
            return Err(LayoutError::SizeMismatch {
                expected: size,
                encoded: written,
            });
        }
        Ok(buf)
    }

    /// Encode `desc` into `dst` in the order header, input entries, output entries.
    ///
    /// Returns the number of bytes written.
    pub(crate) fn encode_into(
        &self,
        desc: &Descriptor,
        dst: &mut [u8],
    ) -> Result<usize, LayoutError> {
        let header = slice_mut(dst, 0, DESC_HEADER_SIZE)?;
        let mut head = DescriptorHeader(header);
        head.set_status(desc.status);
        head.set_num_input_entries(entry_count(&desc.inputs));
        head.set_input_entry_bytes(desc.input_entry_bytes);
        head.set_num_output_entries(entry_count(&desc.outputs));
        head.set_output_entry_bytes(desc.output_entry_bytes);

        let mut offset = DESC_HEADER_SIZE;
        for entry in desc.inputs.iter().chain(desc.outputs.iter()) {
            offset = self.write_entry(dst, offset, entry)?;
        }
        Ok(offset)
    }

    fn write_entry(
        &self,
        dst: &mut [u8],
        offset: usize,
        entry: &DescEntry,
    ) -> Result<usize, LayoutError> {
        if entry.payload.len() != entry.arg_size as usize {
            return Err(LayoutError::PayloadLength {
                arg_size: entry.arg_size,
                payload: entry.payload.len(),
            });
        }
        let footprint = self.entry_footprint(entry.arg_size);
        let region = slice_mut(dst, offset, footprint)?;
        let (header, rest) = region.split_at_mut(DESC_ENTRY_HEADER_SIZE);
        let mut entry_header = DescEntryHeader(header);
        entry_header.set_arg_offset(entry.arg_offset);
        entry_header.set_arg_size(entry.arg_size);
        let (payload, padding) = rest.split_at_mut(entry.payload.len());
        payload.copy_from_slice(&entry.payload);
        padding.fill(0);
        Ok(offset.saturating_add(footprint))
    }

    /// Decode a descriptor by walking its entries from the start of `data`.
    pub(crate) fn decode(&self, src: &[u8]) -> Result<Descriptor, LayoutError> {
        let view = DescriptorView::new(*self, src)?;
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut consumed = DESC_HEADER_SIZE;
        for item in view.entries() {
            let (is_output, entry, footprint) = item?;
            consumed = consumed.saturating_add(footprint);
            if is_output {
                outputs.push(entry);
            } else {
                inputs.push(entry);
            }
        }
        let expected = self.size_of(&inputs, &outputs);
        if consumed != expected {
            return Err(LayoutError::SizeMismatch {
                expected,
                encoded: consumed,
            });
        }
        Ok(Descriptor {
            status: view.status(),
            input_entry_bytes: view.input_entry_bytes(),
            output_entry_bytes: view.output_entry_bytes(),
            inputs,
            outputs,
        })
    }
}

/// A read-only view over an encoded descriptor.
///
/// Entries are not indexed, so every accessor past the header walks them in order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DescriptorView<'buf> {
    layout: DescriptorLayout,
    buf: &'buf [u8],
}

impl<'buf> DescriptorView<'buf> {
    pub(crate) fn new(layout: DescriptorLayout, buf: &'buf [u8]) -> Result<Self, LayoutError> {
        let _header: &[u8] = slice(buf, 0, DESC_HEADER_SIZE)?;
        Ok(Self { layout, buf })
    }

    fn header(&self) -> DescriptorHeader<&'buf [u8]> {
        #[allow(clippy::indexing_slicing)] // length checked in `new`
        DescriptorHeader(&self.buf[..DESC_HEADER_SIZE])
    }

    pub(crate) fn status(&self) -> u32 {
        self.header().get_status()
    }

    pub(crate) fn num_input_entries(&self) -> u32 {
        self.header().get_num_input_entries()
    }

    pub(crate) fn input_entry_bytes(&self) -> u32 {
        self.header().get_input_entry_bytes()
    }

    pub(crate) fn num_output_entries(&self) -> u32 {
        self.header().get_num_output_entries()
    }

    pub(crate) fn output_entry_bytes(&self) -> u32 {
        self.header().get_output_entry_bytes()
    }

    /// Walk every entry: inputs first, then outputs.
    ///
    /// Yields `(is_output, entry, footprint)`.
    pub(crate) fn entries(&self) -> EntryWalk<'buf> {
        EntryWalk {
            view: *self,
            offset: DESC_HEADER_SIZE,
            index: 0,
            num_inputs: self.num_input_entries(),
            total: self
                .num_input_entries()
                .saturating_add(self.num_output_entries()),
        }
    }
}

/// Iterator produced by [`DescriptorView::entries`].
#[derive(Debug)]
pub(crate) struct EntryWalk<'buf> {
    view: DescriptorView<'buf>,
    offset: usize,
    index: u32,
    num_inputs: u32,
    total: u32,
}

impl Iterator for EntryWalk<'_> {
    type Item = Result<(bool, DescEntry, usize), LayoutError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.total {
            return None;
        }
        let is_output = self.index >= self.num_inputs;
        self.index = self.index.wrapping_add(1);
        let item = read_entry(&self.view, self.offset);
        match item {
            Ok((entry, footprint)) => {
                self.offset = self.offset.saturating_add(footprint);
                Some(Ok((is_output, entry, footprint)))
            }
            Err(e) => {
                // a broken entry makes the rest of the walk meaningless
                self.index = self.total;
                Some(Err(e))
            }
        }
    }
}

fn read_entry(
    view: &DescriptorView<'_>,
    offset: usize,
) -> Result<(DescEntry, usize), LayoutError> {
    let header = DescEntryHeader(slice(view.buf, offset, DESC_ENTRY_HEADER_SIZE)?);
    let arg_offset = header.get_arg_offset();
    let arg_size = header.get_arg_size();
    let footprint = view.layout.entry_footprint(arg_size);
    let _whole: &[u8] = slice(view.buf, offset, footprint)?;
    let payload = slice(
        view.buf,
        offset.saturating_add(DESC_ENTRY_HEADER_SIZE),
        arg_size as usize,
    )?;
    Ok((
        DescEntry {
            arg_offset,
            arg_size,
            payload: payload.to_vec(),
        },
        footprint,
    ))
}

#[allow(clippy::cast_possible_truncation)] // entry counts are bounded by the descriptor size
fn entry_count(entries: &[DescEntry]) -> u32 {
    entries.len() as u32
}

fn slice(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], LayoutError> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or(LayoutError::Truncated { offset, len })
}

fn slice_mut(buf: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], LayoutError> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get_mut(offset..end))
        .ok_or(LayoutError::Truncated { offset, len })
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_entry(
            f: &mut fmt::Formatter<'_>,
            kind: &str,
            idx: usize,
            entry: &DescEntry,
        ) -> fmt::Result {
            writeln!(f, "{kind} descEntry ({idx})")?;
            writeln!(f, "    argOffset  0x{:x}", entry.arg_offset)?;
            writeln!(f, "    argSize    0x{:x}", entry.arg_size)?;
            for word in entry.payload_words() {
                writeln!(f, "    argValue   0x{word:x}")?;
            }
            Ok(())
        }

        writeln!(f, "status            0x{:x}", self.status)?;
        writeln!(f, "numInputEntries   0x{:x}", self.inputs.len())?;
        writeln!(f, "inputEntryBytes   0x{:x}", self.input_entry_bytes)?;
        writeln!(f, "numOutputEntries  0x{:x}", self.outputs.len())?;
        writeln!(f, "outputEntryBytes  0x{:x}", self.output_entry_bytes)?;
        for (idx, entry) in self.inputs.iter().enumerate() {
            write_entry(f, "input", idx, entry)?;
        }
        for (idx, entry) in self.outputs.iter().enumerate() {
            write_entry(f, "output", idx, entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use crate::{
        device::{
            constants::{DESC_ENTRY_HEADER_SIZE, DESC_HEADER_SIZE},
            LayoutError,
        },
        types::{DescEntry, DescStatus},
    };

    use super::{Descriptor, DescriptorLayout, DescriptorView};

    fn random_entries(rng: &mut impl Rng, max: usize) -> Vec<DescEntry> {
        let cnt = rng.gen_range(0..=max);
        (0..cnt)
            .map(|_| {
                let words = rng.gen_range(0..8);
                let payload: Vec<u8> = (0..words * 4).map(|_| rng.gen()).collect();
                DescEntry::new(rng.gen::<u32>() & !0x3, payload)
            })
            .collect()
    }

    #[test]
    fn test_kernel_descriptor_bytes() {
        // the increment kernel's descriptor: one 8-byte pointer at 0x10
        let layout = DescriptorLayout::default();
        let desc = Descriptor::new(
            vec![DescEntry::new_addr(0x10, 0x0000_0004_1000_2000)],
            vec![],
        );
        let buf = layout.encode(&desc).unwrap();
        assert_eq!(buf.len(), DESC_HEADER_SIZE + DESC_ENTRY_HEADER_SIZE + 8);
        assert_eq!(
            buf,
            vec![
                0x00, 0x00, 0x00, 0x00, // status = ISSUED
                0x01, 0x00, 0x00, 0x00, // numInputEntries
                0x08, 0x00, 0x00, 0x00, // inputEntryBytes
                0x00, 0x00, 0x00, 0x00, // numOutputEntries
                0x00, 0x00, 0x00, 0x00, // outputEntryBytes
                0x10, 0x00, 0x00, 0x00, // argOffset
                0x08, 0x00, 0x00, 0x00, // argSize
                0x00, 0x20, 0x00, 0x10, 0x04, 0x00, 0x00, 0x00, // argValue
            ]
        );
    }

    #[test]
    fn test_encode_decode_random_entries() {
        let layout = DescriptorLayout::default();
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let inputs = random_entries(&mut rng, 5);
            let outputs = random_entries(&mut rng, 5);
            let desc = Descriptor::new(inputs.clone(), outputs.clone());
            let buf = layout.encode(&desc).unwrap();
            assert_eq!(buf.len(), layout.size_of(&inputs, &outputs));
            let decoded = layout.decode(&buf).unwrap();
            assert_eq!(decoded.inputs, inputs);
            assert_eq!(decoded.outputs, outputs);
            assert_eq!(decoded, desc);
            assert_eq!(decoded.status, u32::from(DescStatus::Issued));
        }
    }

    #[test]
    fn test_footprint_rounds_to_stride() {
        let layout = DescriptorLayout::new(16).unwrap();
        assert_eq!(layout.entry_footprint(8), 16);
        assert_eq!(layout.entry_footprint(12), 32);
        assert_eq!(DescriptorLayout::default().entry_footprint(6), 16);
        assert!(matches!(
            DescriptorLayout::new(6),
            Err(LayoutError::BadStride(6))
        ));
        assert!(DescriptorLayout::new(2).is_err());

        // padding is zeroed and skipped on decode
        let desc = Descriptor::new(
            vec![
                DescEntry::new(0x10, vec![1, 2, 3, 4]),
                DescEntry::new(0x20, vec![5; 12]),
            ],
            vec![DescEntry::new(0x30, vec![9; 4])],
        );
        let buf = layout.encode(&desc).unwrap();
        assert_eq!(buf.len(), DESC_HEADER_SIZE + 16 + 32 + 16);
        assert_eq!(&buf[DESC_HEADER_SIZE + 12..DESC_HEADER_SIZE + 16], &[0, 0, 0, 0]);
        assert_eq!(layout.decode(&buf).unwrap(), desc);
    }

    #[test]
    fn test_payload_length_mismatch_is_fatal() {
        let layout = DescriptorLayout::default();
        let mut entry = DescEntry::new(0x10, vec![0; 8]);
        entry.arg_size = 4;
        let desc = Descriptor::new(vec![entry], vec![]);
        assert!(matches!(
            layout.encode(&desc),
            Err(LayoutError::PayloadLength {
                arg_size: 4,
                payload: 8
            })
        ));
    }

    #[test]
    fn test_decode_truncated() {
        let layout = DescriptorLayout::default();
        let desc = Descriptor::new(vec![DescEntry::new_addr(0x10, 0xdead_beef)], vec![]);
        let buf = layout.encode(&desc).unwrap();
        assert!(matches!(
            layout.decode(&buf[..buf.len() - 4]),
            Err(LayoutError::Truncated { .. })
        ));
        assert!(matches!(
            layout.decode(&buf[..DESC_HEADER_SIZE - 1]),
            Err(LayoutError::Truncated { offset: 0, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_count_disagreement() {
        // header claims two inputs but only one is present
        let layout = DescriptorLayout::default();
        let desc = Descriptor::new(vec![DescEntry::new_addr(0x10, 1)], vec![]);
        let mut buf = layout.encode(&desc).unwrap();
        buf[4] = 2;
        assert!(layout.decode(&buf).is_err());
    }

    #[test]
    fn test_view_walk_and_display() {
        let layout = DescriptorLayout::default();
        let desc = Descriptor::new(
            vec![DescEntry::new_addr(0x10, 0x1_0000_0004)],
            vec![DescEntry::new(0x18, vec![0xaa, 0, 0, 0])],
        );
        let buf = layout.encode(&desc).unwrap();
        let view = DescriptorView::new(layout, &buf).unwrap();
        assert_eq!(view.num_input_entries(), 1);
        assert_eq!(view.num_output_entries(), 1);
        assert_eq!(view.output_entry_bytes(), 4);
        let walked: Vec<_> = view.entries().map(Result::unwrap).collect();
        assert_eq!(walked.len(), 2);
        assert!(!walked[0].0);
        assert!(walked[1].0);
        assert_eq!(walked[0].2, 16);
        assert_eq!(walked[1].2, 12);

        let dump = desc.to_string();
        assert!(dump.contains("numInputEntries   0x1"));
        assert!(dump.contains("output descEntry (0)"));
        assert!(dump.contains("argValue   0x4"));
        assert!(dump.contains("argValue   0xaa"));
    }
}
