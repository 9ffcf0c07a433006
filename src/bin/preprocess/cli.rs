use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Aggregates raw experiment events into one row per user.
#[derive(Parser, Debug)]
#[command(
    name = "preprocess",
    version,
    about = "Aggregates raw A/B test events per user and removes contaminated users"
)]
pub struct Cli {
    #[arg(
        value_name = "RAW",
        help = "CSV file with user_id, variant_name and revenue columns"
    )]
    pub raw: PathBuf,

    #[arg(
        long,
        short,
        default_value = "aggregated.csv",
        value_name = "OUT",
        help = "Output file path for the per-user table"
    )]
    pub out: PathBuf,

    #[arg(
        value_enum,
        long,
        default_value = "normal",
        value_name = "VERBOSITY",
        help = "Verbosity level"
    )]
    pub verbosity: LogLevel,
}

#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Verbose,
    Normal,
    Silent,
}

impl LogLevel {
    pub fn default_filter(&self) -> &'static str {
        match self {
            LogLevel::Verbose => "debug",
            LogLevel::Normal => "info",
            LogLevel::Silent => "off",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Verbose => write!(f, "verbose"),
            LogLevel::Normal => write!(f, "normal"),
            LogLevel::Silent => write!(f, "silent"),
        }
    }
}
