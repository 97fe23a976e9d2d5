use std::{
    fs, io,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use fa_dispatch::{DeviceType, ThroughputHarness};
use log::{error, info};

use crate::common::{init_logging, print_reports, BenchOpts};

mod common;

/// Where PCI functions expose their BAR resource files.
const PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Throughput of a compute unit behind a mappable register file.
///
/// The device is either given by the path of its register file or picked by index
/// among the PCI functions that expose a `resource0` BAR, sorted by address.
#[derive(Debug, Clone, Parser)]
#[command(name = "hardware_bench")]
struct Opts {
    /// Register file of the compute unit, overrides `--device-index`
    #[arg(long)]
    device: Option<PathBuf>,
    /// Index of the device among the PCI functions with a BAR 0
    #[arg(short = 'd', long, default_value_t = 0)]
    device_index: usize,
    /// Memory bank of the argument buffers
    #[arg(long, default_value_t = 0)]
    bank: u32,
    /// Back buffers with huge pages
    #[arg(long)]
    hugepage: bool,
    /// Print the descriptor of this slot after the runs
    #[arg(long)]
    dump_slot: Option<usize>,
    #[command(flatten)]
    bench: BenchOpts,
}

/// BAR 0 resource files of every PCI function under `root`.
fn pci_register_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    Ok(fs::read_dir(root)?
        .filter_map(Result::ok)
        .map(|entry| entry.path().join("resource0"))
        .filter(|path| path.exists())
        .collect())
}

/// The `index`th register file in PCI address order.
fn pick_device(mut files: Vec<PathBuf>, index: usize) -> io::Result<PathBuf> {
    info!("The system has {} device(s)", files.len());
    files.sort();
    if index >= files.len() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no device with index {index}"),
        ));
    }
    Ok(files.swap_remove(index))
}

fn resolve_device(opts: &Opts) -> io::Result<PathBuf> {
    match &opts.device {
        Some(path) => Ok(path.clone()),
        None => pick_device(pci_register_files(Path::new(PCI_DEVICES))?, opts.device_index),
    }
}

fn main() -> ExitCode {
    let opts = Opts::parse();
    if let Err(e) = init_logging(&opts.bench) {
        eprintln!("failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }
    let device = match resolve_device(&opts) {
        Ok(device) => device,
        Err(e) => {
            error!("Could not open device: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = match opts
        .bench
        .builder()
        .device_type(DeviceType::Hardware {
            path: device.clone(),
            use_hugepage: opts.hugepage,
        })
        .bank(opts.bank)
        .build()
    {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut harness = match ThroughputHarness::new(config) {
        Ok(harness) => harness,
        Err(e) => {
            error!("failed to open {}: {e}", device.display());
            return ExitCode::FAILURE;
        }
    };
    info!("{} ready with {} slots", device.display(), harness.slot_count());

    let reports = match harness.run_all() {
        Ok(reports) => reports,
        Err(e) => {
            error!("run failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    print_reports(&reports);

    if let Some(idx) = opts.dump_slot {
        match harness.dump_slot(idx) {
            Ok(dump) => println!("{dump}"),
            Err(e) => error!("cannot dump slot {idx}: {e}"),
        }
    }
    harness.teardown();
    ExitCode::SUCCESS
}
