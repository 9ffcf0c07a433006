use anyhow::Result;
use bayesab_utils::error::AbError;
use bayesab_utils::pipeline;
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};

mod cli;

fn stage_error(e: AbError) -> anyhow::Error {
    let stage = e.stage();
    anyhow::Error::new(e).context(format!("preprocess failed at the {} stage", stage))
}

fn run(args: &cli::Cli) -> Result<()> {
    info!("Aggregating {}", args.raw.display());
    let report = pipeline::preprocess(&args.raw, &args.out).map_err(stage_error)?;

    info!(
        "Kept {} of {} events",
        report.n_events_kept, report.n_events
    );
    if report.n_contaminated() > 0 {
        warn!(
            "Removed {} users seen in both arms",
            report.n_contaminated()
        );
    }
    info!(
        "Users per arm: control {}, variant {}",
        report.n_control_users, report.n_variant_users
    );
    Ok(())
}

fn main() {
    let args = cli::Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(args.verbosity.default_filter()))
        .init();

    if let Err(e) = run(&args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
    info!("Finished preprocessing");
}
