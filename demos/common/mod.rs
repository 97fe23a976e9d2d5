use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use clap::Args;
use fa_dispatch::{HarnessConfigBuilder, RunReport};
use log::{Level, LevelFilter, Metadata, Record};
use parking_lot::Mutex;

/// Options shared by every bench binary.
#[derive(Debug, Clone, Args)]
pub struct BenchOpts {
    /// Task slots to build
    #[arg(long, default_value_t = 100)]
    pub slots: usize,
    /// Maximum tasks in flight
    #[arg(long, default_value_t = 12)]
    pub depth: usize,
    /// Target task counts, one run each
    #[arg(long, value_delimiter = ',', default_values_t = [1000_u64, 10000, 50000, 100_000])]
    pub runs: Vec<u64>,
    /// Bytes per argument buffer
    #[arg(long, default_value_t = 4096)]
    pub arg_size: usize,
    /// Give up a run after this many milliseconds without a completion
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Also write the log to this file
    #[arg(long)]
    pub log_file: Option<String>,
    /// Log debug records, including every slot's descriptor
    #[arg(short, long)]
    pub verbose: bool,
}

impl BenchOpts {
    pub fn builder(&self) -> HarnessConfigBuilder {
        let mut builder = HarnessConfigBuilder::default();
        builder
            .slot_count(self.slots)
            .fifo_depth(self.depth)
            .runs(self.runs.clone())
            .arg_buffer_size(self.arg_size);
        if let Some(ms) = self.timeout_ms {
            builder.poll_timeout(std::time::Duration::from_millis(ms));
        }
        builder
    }
}

struct SimpleLogger {
    level: Level,
    file: Option<Mutex<File>>,
    file_failed: AtomicBool,
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{} - {}", record.level(), record.args());
            if let Some(file) = &self.file {
                if let Err(e) = writeln!(file.lock(), "{} - {}", record.level(), record.args()) {
                    // report once, later records still reach stderr
                    if !self.file_failed.swap(true, Ordering::Relaxed) {
                        eprintln!("ERROR - cannot write log file: {e}");
                    }
                }
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Err(e) = file.lock().flush() {
                eprintln!("ERROR - cannot flush log file: {e}");
            }
        }
    }
}

pub fn init_logging(opts: &BenchOpts) -> io::Result<()> {
    let level = if opts.verbose { Level::Debug } else { Level::Info };
    let file = match &opts.log_file {
        Some(path) => Some(Mutex::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(Path::new(path))?,
        )),
        None => None,
    };
    log::set_boxed_logger(Box::new(SimpleLogger {
        level,
        file,
        file_failed: AtomicBool::new(false),
    }))
        .map(|()| log::set_max_level(LevelFilter::Debug))
        .map_err(io::Error::other)
}

pub fn print_reports(reports: &[RunReport]) {
    for report in reports {
        println!("{report}");
    }
}
