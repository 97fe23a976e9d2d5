//! fa-dispatch
//!
//! Dispatches fixed-shape tasks to an accelerator through in-memory descriptors
//! and measures the sustained completion rate under a bounded number of tasks
//! in flight.
//!
//! ```no_run
//! use fa_dispatch::{HarnessConfigBuilder, ThroughputHarness};
//!
//! let config = HarnessConfigBuilder::default().build()?;
//! let mut harness = ThroughputHarness::new(config)?;
//! for report in harness.run_all()? {
//!     println!("{report}");
//! }
//! # Ok::<(), fa_dispatch::Error>(())
//! ```
#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    absolute_paths_not_starting_with_crate,
    explicit_outlives_requirements,
    // elided_lifetimes_in_paths,  // allow anonymous lifetime
    keyword_idents,
    macro_use_extern_crate,
    meta_variable_misuse,
    missing_abi,
    missing_copy_implementations,
    missing_debug_implementations,
    // must_not_suspend, unstable
    missing_docs,
    non_ascii_idents,
    // non_exhaustive_omitted_patterns, unstable
    noop_method_call,
    rust_2021_incompatible_closure_captures,
    rust_2021_incompatible_or_patterns,
    rust_2021_prefixes_incompatible_syntax,
    rust_2021_prelude_collisions,
    single_use_lifetimes,
    // trivial_casts, // We allow trivial_casts for casting a pointer
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_code,
    unsafe_op_in_unsafe_fn,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_lifetimes,
    unused_qualifications,
    unused_results,
    // variant_size_differences, device configs differ in size

    clippy::all,
    clippy::pedantic,
    clippy::cargo,

    // The followings are selected restriction lints for rust 1.57
    // clippy::as_conversions, // we allow lossless "as" conversion, it has checked by clippy::cast_possible_truncation
    clippy::clone_on_ref_ptr,
    clippy::create_dir,
    clippy::dbg_macro,
    clippy::decimal_literal_representation,
    clippy::default_numeric_fallback,
    clippy::disallowed_script_idents,
    clippy::else_if_without_else,
    clippy::exit,
    clippy::expect_used,
    clippy::filetype_is_file,
    clippy::float_arithmetic,
    clippy::float_cmp_const,
    clippy::get_unwrap,
    clippy::if_then_some_else_none,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::print_stderr,
    clippy::print_stdout,
    clippy::rc_buffer,
    clippy::rc_mutex,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_name_method,
    clippy::self_named_module_files,
    clippy::shadow_unrelated,
    clippy::str_to_string,
    clippy::string_add,
    clippy::string_to_string,
    clippy::unimplemented,
    clippy::unnecessary_self_imports,
    clippy::unneeded_field_pattern,
    clippy::unwrap_in_result,
    clippy::unwrap_used,
    clippy::verbose_file_reads,
    clippy::wildcard_enum_match_arm,

    // // The followings are selected lints from 1.61.0 to 1.67.1
    clippy::as_ptr_cast_mut,
    clippy::derive_partial_eq_without_eq,
    clippy::empty_drop,
    clippy::empty_structs_with_brackets,
    clippy::format_push_string,
    clippy::iter_on_empty_collections,
    clippy::iter_on_single_items,
    clippy::large_include_file,
    clippy::manual_clamp,
    clippy::suspicious_xor_used_as_pow,
    clippy::unnecessary_safety_doc,
    clippy::unused_peekable,
    clippy::unused_rounding,

    // The followings are selected restriction lints from rust 1.68.0 to 1.71.0
    clippy::impl_trait_in_params,
    clippy::let_underscore_untyped,
    clippy::missing_assert_message,
    clippy::multiple_unsafe_ops_per_block,
    clippy::semicolon_inside_block,
    clippy::tests_outside_test_module,
    // 1.71.0
    clippy::default_constructed_unit_structs,
    clippy::items_after_test_module,
    clippy::manual_next_back,
    clippy::manual_while_let_some,
    clippy::needless_bool_assign,
    clippy::non_minimal_cfg,
)]
#![cfg_attr(
    test,
    allow(
        clippy::indexing_slicing,
        unused_results,
        clippy::unwrap_used,
        clippy::unwrap_in_result,
        clippy::expect_used,
        clippy::as_conversions,
        clippy::shadow_unrelated,
        clippy::arithmetic_side_effects,
        clippy::let_underscore_untyped,
        clippy::pedantic,
        clippy::default_numeric_fallback,
        clippy::missing_assert_message,
        clippy::print_stderr,
        unsafe_code,
    )
)]

use std::{path::PathBuf, time::Duration};

use derive_builder::Builder;

/// adaptor device: hardware, software
mod device;

/// The throughput harness
mod harness;

/// Completion polling
mod poller;

/// Task slots and their pool
mod slot;

/// some useful types
pub mod types;

/// utility functions
mod utils;

pub use crate::{
    device::LayoutError,
    harness::ThroughputHarness,
    types::{DescEntry, DescStatus, Error, FaErrorFlag, RunReport, PAGE_SIZE},
};

/// Memory budget of the software accelerator: 16 MiB.
const DEFAULT_SOFTWARE_MEMORY: usize = 16 * 1024 * 1024;

/// Which device the harness drives.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceType {
    /// The built-in software accelerator
    Software {
        /// Bytes of device memory available for buffers
        memory_budget: usize,
    },

    /// A compute unit behind a mappable register file
    Hardware {
        /// Path of the register file, e.g. a PCI resource file
        path: PathBuf,
        /// Back buffers with huge pages
        use_hugepage: bool,
    },
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Software {
            memory_budget: DEFAULT_SOFTWARE_MEMORY,
        }
    }
}

/// Configuration of a [`ThroughputHarness`]
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
#[builder(derive(Debug), build_fn(validate = "Self::validate", error = "Error"))]
pub struct HarnessConfig {
    /// Device to open
    #[builder(default)]
    device_type: DeviceType,

    /// Slots requested from the pool
    #[builder(default = "100")]
    slot_count: usize,

    /// Maximum number of tasks in flight
    #[builder(default = "12")]
    fifo_depth: usize,

    /// Target task counts of `run_all`
    #[builder(default = "vec![1000, 10000, 50000, 100_000]", setter(into))]
    runs: Vec<u64>,

    /// Bytes per argument buffer
    #[builder(default = "4096")]
    arg_buffer_size: usize,

    /// Memory bank of the argument buffers
    #[builder(default)]
    bank: u32,

    /// Give up a run when the oldest task shows no completion for this long
    #[builder(default, setter(strip_option))]
    poll_timeout: Option<Duration>,
}

impl HarnessConfig {
    /// Device to open
    #[must_use]
    pub fn device_type(&self) -> &DeviceType {
        &self.device_type
    }

    /// Slots requested from the pool
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Maximum number of tasks in flight
    #[must_use]
    pub fn fifo_depth(&self) -> usize {
        self.fifo_depth
    }

    /// Target task counts of `run_all`
    #[must_use]
    pub fn runs(&self) -> &[u64] {
        &self.runs
    }

    /// Bytes per argument buffer
    #[must_use]
    pub fn arg_buffer_size(&self) -> usize {
        self.arg_buffer_size
    }

    /// Memory bank of the argument buffers
    #[must_use]
    pub fn bank(&self) -> u32 {
        self.bank
    }

    /// Poll timeout, `None` to wait forever
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout
    }
}

impl HarnessConfigBuilder {
    fn validate(&self) -> Result<(), Error> {
        if self.fifo_depth == Some(0) {
            return Err(Error::InvalidConfig(
                "in-flight depth must be at least 1".to_owned(),
            ));
        }
        if self.slot_count == Some(0) {
            return Err(Error::InvalidConfig(
                "slot count must be at least 1".to_owned(),
            ));
        }
        if let Some(size) = self.arg_buffer_size {
            if size == 0 || size % device::constants::WORD_SIZE != 0 {
                return Err(Error::InvalidConfig(format!(
                    "argument buffer size {size} is not a positive multiple of 4"
                )));
            }
        }
        let software = matches!(self.device_type, None | Some(DeviceType::Software { .. }));
        if software
            && self
                .fifo_depth
                .is_some_and(|depth| depth > device::constants::DESC_FIFO_DEPTH)
        {
            return Err(Error::InvalidConfig(format!(
                "in-flight depth exceeds the descriptor FIFO depth {}",
                device::constants::DESC_FIFO_DEPTH
            )));
        }
        Ok(())
    }
}

impl From<derive_builder::UninitializedFieldError> for Error {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}
