//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// YAML file describing the analyser and the measurements to run
    #[clap(short, long)]
    pub config: PathBuf,
    /// Only query the analyser, never send it commands
    #[clap(long)]
    pub dry_run: bool,
    /// Also write the log to a timestamped file in this directory
    #[clap(long)]
    pub log_dir: Option<PathBuf>,
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = Args::parse_from(["rfi_capture", "--config", "chamber.yaml", "--dry-run", "-v"]);
        assert_eq!(args.config, PathBuf::from("chamber.yaml"));
        assert!(args.dry_run);
        assert!(args.log_dir.is_none());
        assert_eq!(
            convert_filter(args.verbose.log_level_filter()),
            tracing_subscriber::filter::LevelFilter::DEBUG
        );
    }

    #[test]
    fn test_default_verbosity() {
        let args = Args::parse_from(["rfi_capture", "-c", "chamber.yaml"]);
        assert_eq!(
            convert_filter(args.verbose.log_level_filter()),
            tracing_subscriber::filter::LevelFilter::INFO
        );
    }

    #[test]
    fn test_config_is_required() {
        assert!(Args::try_parse_from(["rfi_capture"]).is_err());
    }
}
