use bayesab_utils::sampler::SamplerConfig;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Fits the Bayesian conversion and revenue model to an aggregated A/B table.
#[derive(Parser, Debug)]
#[command(name = "bayesab", version, about = "Bayesian A/B test analysis of conversion and revenue")]
pub struct Cli {
    #[arg(
        value_name = "TABLE",
        help = "Per-user CSV with user_id, variant_name, total_revenue and converted"
    )]
    pub table: PathBuf,

    #[arg(
        long,
        short,
        default_value = "bayesab",
        value_name = "OUT",
        help = "Output directory for trace.json and summary.tsv"
    )]
    pub out: PathBuf,

    #[arg(long, default_value = "4", help = "Number of chains")]
    pub chains: usize,

    #[arg(long, default_value = "2000", help = "Kept draws per chain")]
    pub draws: usize,

    #[arg(long, default_value = "1000", help = "Warmup iterations per chain")]
    pub tune: usize,

    #[arg(long, default_value = "42", help = "Random seed")]
    pub seed: u64,

    #[arg(long, default_value = "0.9", help = "Target acceptance statistic for step size adaptation")]
    pub target_accept: f64,

    #[arg(long, default_value = "10", help = "Maximum tree depth of a NUTS transition")]
    pub max_tree_depth: u32,

    #[arg(
        long,
        default_value = "0.25",
        help = "Largest tolerated fraction of divergent draws"
    )]
    pub max_divergence_fraction: f64,

    #[arg(long, short, help = "Number of threads to use [default: all cores]")]
    pub threads: Option<usize>,

    #[arg(
        value_enum,
        long,
        default_value = "normal",
        value_name = "VERBOSITY",
        help = "Verbosity level"
    )]
    pub verbosity: LogLevel,
}

impl Cli {
    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            chains: self.chains,
            draws: self.draws,
            tune: self.tune,
            seed: self.seed,
            target_accept: self.target_accept,
            max_tree_depth: self.max_tree_depth,
            max_divergence_fraction: self.max_divergence_fraction,
            threads: self.threads,
        }
    }
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
