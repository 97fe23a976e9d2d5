use std::process::ExitCode;

use clap::Parser;
use fa_dispatch::{DeviceType, ThroughputHarness};
use log::{error, info};

use crate::common::{init_logging, print_reports, BenchOpts};

mod common;

/// Throughput of the built-in software accelerator.
#[derive(Debug, Clone, Parser)]
#[command(name = "software_bench")]
struct Opts {
    /// Bytes of simulated device memory
    #[arg(long, default_value_t = 16 << 20)]
    memory: usize,
    #[command(flatten)]
    bench: BenchOpts,
}

fn main() -> ExitCode {
    let opts = Opts::parse();
    if let Err(e) = init_logging(&opts.bench) {
        eprintln!("failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }

    let config = match opts
        .bench
        .builder()
        .device_type(DeviceType::Software {
            memory_budget: opts.memory,
        })
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
            error!("failed to open the software device: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("software device ready with {} slots", harness.slot_count());

    match harness.run_all() {
        Ok(reports) => {
            print_reports(&reports);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("run failed: {e}");
            ExitCode::FAILURE
        }
    }
}
