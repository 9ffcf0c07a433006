use anyhow::{bail, Context, Result};
use bayesab_utils::error::AbError;
use bayesab_utils::pipeline;
use clap::Parser;
use env_logger::Env;
use log::{error, info};

mod cli;

fn stage_error(e: AbError) -> anyhow::Error {
    let stage = e.stage();
    anyhow::Error::new(e).context(format!("analysis failed at the {} stage", stage))
}

fn run(args: &cli::Cli) -> Result<()> {
    if args.out.exists() {
        bail!("Output directory {} already exists", args.out.display());
    }

    let config = args.sampler_config();
    let run = pipeline::analyze(&args.table, &config).map_err(stage_error)?;
    for v in &run.diagnostics.variables {
        info!(
            "{:<13} mean {:>10.4}  94% HDI [{:.4}, {:.4}]  ess {:.0}  r_hat {:.3}",
            v.name, v.mean, v.hdi_low, v.hdi_high, v.ess_bulk, v.r_hat
        );
    }

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("Could not create output directory {}", args.out.display()))?;
    info!("Created output directory");
    pipeline::persist(
        &run,
        &args.out.join("trace.json"),
        &args.out.join("summary.tsv"),
    )
    .map_err(stage_error)?;
    Ok(())
}

fn main() {
    let args = cli::Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(args.verbosity.default_filter()))
        .init();

    info!("Running Bayesian A/B analysis on {}", args.table.display());
    if let Err(e) = run(&args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
    info!("Finished analysis");
}
