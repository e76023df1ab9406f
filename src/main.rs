use std::{
    fs::{self, File},
    process,
    sync::Mutex,
};

use chrono::Local;
use clap::Parser;
use rfi_capture::{
    args::{convert_filter, Args},
    capture::{force_cleanup, Pipeline},
    config::Config,
    executor::{install_interrupt_handler, MeasurementExecutor},
    instrument::{self, InstrumentClient},
    Result,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*};

fn init_logging(args: &Args) -> std::io::Result<()> {
    let level = convert_filter(args.verbose.log_level_filter());
    let file_layer = match &args.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let name = format!("{}_rfi_chamber.log", Local::now().format("%Y-%m-%dT%H:%M:%S"));
            let file = File::create(dir.join(name))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(level)
        .init();
    Ok(())
}

fn run(args: &Args, config: Config) -> Result<()> {
    let analyser = &config.spectrum_analyser;
    info!("Connecting to spectrum analyser at {}", analyser.resource);
    let transport = instrument::open(&analyser.resource, analyser.timeout())?;
    if args.dry_run {
        warn!("Dry run, no commands will be sent to the spectrum analyser");
    }
    let client = InstrumentClient::new(transport, args.dry_run);
    let pipeline = Pipeline::new(config.capture.clone());
    let capture_config = config.capture.clone();
    let mut executor = MeasurementExecutor::new(config, client, pipeline);

    install_interrupt_handler(executor.interrupt_flag(), capture_config)?;

    executor.init()?;
    let summary = executor.run_all_measurements();
    info!(
        "Campaign finished: {} measurements completed, {} failed, {} captures recorded",
        summary.completed, summary.failed, summary.captures
    );
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(&args) {
        eprintln!("Could not set up logging: {e}");
        process::exit(1);
    }

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };
    let capture_config = config.capture.clone();
    let result = run(&args, config);
    force_cleanup(&capture_config);
    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
    info!("Done");
}
