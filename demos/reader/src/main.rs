use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Deserialize;
use sluice::{
    HardwareInformation, Priority, ReadOutput, ReportType, RequestStatus, StackConfig,
    StorageDriveOptions, StreamerConfig, StreamerOptions,
};
use structopt::StructOpt;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, StructOpt)]
#[structopt(name = "reader", about = "Streams a file through a sluice stack")]
struct Args {
    /// The file to stream.
    #[structopt(parse(from_os_str))]
    file: PathBuf,

    /// A JSON file describing the stack, hardware and storage drive.
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// The size of every read in bytes.
    #[structopt(long, default_value = "65536")]
    read_size: u64,

    /// How many times the file is read from start to end.
    #[structopt(long, default_value = "2")]
    passes: usize,

    /// Create a dedicated cache for the file before reading it.
    #[structopt(long)]
    dedicated: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    stack: StackConfig,
    hardware: HardwareInformation,
    storage: StorageDriveOptions,
}

fn load_config(path: &Option<PathBuf>) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&text)?)
        }
        None => Ok(ConfigFile::default()),
    }
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::from_args();

    if let Err(e) = run(&args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.config)?;
    let file_size = std::fs::metadata(&args.file)?.len();
    let read_size = args.read_size.max(1);

    let streamer = sluice::open_streamer(&StreamerConfig {
        stack: config.stack,
        hardware: config.hardware,
        storage: config.storage,
        streamer: StreamerOptions::default(),
    })?;

    let report = streamer.report(ReportType::Config);
    streamer.block_until_completed(&report, TIMEOUT);
    for stat in streamer.get_report_result(&report)? {
        log::info!("{}", stat);
    }

    if args.dedicated {
        let create = streamer.create_dedicated_cache(args.file.clone());
        let status = streamer.block_until_completed(&create, TIMEOUT);
        log::info!("Dedicated cache for {:?}: {:?}", args.file, status);
    }

    for pass in 0..args.passes {
        let start = Instant::now();

        // Submit everything up front and let the scheduler order the reads.
        let mut handles = Vec::new();
        let mut offset = 0;
        while offset < file_size {
            let size = read_size.min(file_size - offset);
            let deadline = Some(Instant::now() + Duration::from_millis(100));
            handles.push(streamer.read(
                args.file.clone(),
                ReadOutput::Buffer(Vec::new()),
                size,
                deadline,
                Priority::default(),
                offset,
            ));
            offset += size;
        }

        let mut bytes_read = 0;
        let mut failed = 0;
        for handle in &handles {
            match streamer.block_until_completed(handle, TIMEOUT) {
                RequestStatus::Completed => bytes_read += streamer.get_read_request_result(handle)?,
                status => {
                    log::warn!("Read {} finished as {:?}", handle.id(), status);
                    failed += 1;
                }
            }
        }

        log::info!(
            "Pass {}: read {} of {} bytes in {} requests ({} failed) in {:?}",
            pass,
            bytes_read,
            file_size,
            handles.len(),
            failed,
            start.elapsed()
        );
    }

    if args.dedicated {
        let destroy = streamer.destroy_dedicated_cache(args.file.clone());
        streamer.block_until_completed(&destroy, TIMEOUT);
    }

    let mut statistics = Vec::new();
    streamer.collect_statistics(&mut statistics);
    for stat in &statistics {
        log::info!("{}", stat);
    }

    Ok(())
}
