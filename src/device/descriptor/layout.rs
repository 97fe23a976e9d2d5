#![allow(clippy::indexing_slicing, unreachable_pub)]
// Using the `#!` to suppress the warning of `clippy::indexing_slicing` in the generated code.
use bitfield::bitfield;

// typedef struct {
//     uint32_t     status;            // descriptor control synchronization word
//     uint32_t     numInputEntries;   // number of input arg entries
//     uint32_t     inputEntryBytes;   // total number of bytes for input args
//     uint32_t     numOutputEntries;  // number of output arg entries
//     uint32_t     outputEntryBytes;  // total number of bytes for output args
//     uint32_t     data[];
// } descriptor_t;
bitfield! {
    pub struct DescriptorHeader([u8]);
    u32;
    pub get_status, set_status: 31, 0;                          // 32bits
    pub get_num_input_entries, set_num_input_entries: 63, 32;   // 32bits
    pub get_input_entry_bytes, set_input_entry_bytes: 95, 64;   // 32bits
    pub get_num_output_entries, set_num_output_entries: 127, 96; // 32bits
    pub get_output_entry_bytes, set_output_entry_bytes: 159, 128; // 32bits
}

// typedef struct {
//     uint32_t     argOffset;   // offset within the acc aperture
//     uint32_t     argSize;     // size of argument in bytes
//     uint32_t     argValue[];
// } descEntry_t;
bitfield! {
    pub struct DescEntryHeader([u8]);
    u32;
    pub get_arg_offset, set_arg_offset: 31, 0; // 32bits
    pub get_arg_size, set_arg_size: 63, 32;    // 32bits
}
