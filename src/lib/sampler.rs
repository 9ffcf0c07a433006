use crate::density::LogDensity;
use crate::error::{AbError, Result};
use crate::nuts::{ChainDraws, NutsChain, NutsSettings};
use log::{debug, info};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Settings of a sampling run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub chains: usize,
    /// Kept draws per chain.
    pub draws: usize,
    /// Warmup iterations per chain, discarded.
    pub tune: usize,
    pub seed: u64,
    pub target_accept: f64,
    pub max_tree_depth: u32,
    /// Largest tolerated share of divergent kept draws.
    pub max_divergence_fraction: f64,
    /// Size of a dedicated thread pool; the global rayon pool when `None`.
    pub threads: Option<usize>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            chains: 4,
            draws: 2000,
            tune: 1000,
            seed: 42,
            target_accept: 0.9,
            max_tree_depth: 10,
            max_divergence_fraction: 0.25,
            threads: None,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chains == 0 {
            return Err(AbError::InvalidConfig("chains must be at least 1".to_string()));
        }
        if self.draws == 0 {
            return Err(AbError::InvalidConfig("draws must be at least 1".to_string()));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(AbError::InvalidConfig(format!(
                "target_accept must lie in (0, 1), got {}",
                self.target_accept
            )));
        }
        if self.max_tree_depth == 0 {
            return Err(AbError::InvalidConfig("max_tree_depth must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.max_divergence_fraction) {
            return Err(AbError::InvalidConfig(format!(
                "max_divergence_fraction must lie in [0, 1], got {}",
                self.max_divergence_fraction
            )));
        }
        if self.threads == Some(0) {
            return Err(AbError::InvalidConfig("threads must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn total_draws(&self) -> usize {
        self.chains * self.draws
    }

    fn nuts_settings(&self) -> NutsSettings {
        NutsSettings {
            draws: self.draws,
            tune: self.tune,
            target_accept: self.target_accept,
            max_tree_depth: self.max_tree_depth,
        }
    }
}

/// Random stream of chain `chain`: the seeded generator advanced by `chain` jumps,
/// so streams never overlap and do not depend on scheduling.
pub fn chain_rng(seed: u64, chain: usize) -> Xoshiro256PlusPlus {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    for _ in 0..chain {
        rng.jump();
    }
    rng
}

/// Run all chains in parallel, in chain order, and apply the divergence policy.
pub fn sample_chains<D: LogDensity>(density: &D, config: &SamplerConfig) -> Result<Vec<ChainDraws>> {
    config.validate()?;
    info!(
        "Sampling {} chains: {} warmup + {} draws each",
        config.chains, config.tune, config.draws
    );
    let settings = config.nuts_settings();
    let run = || {
        (0..config.chains)
            .into_par_iter()
            .map(|chain| {
                debug!("Starting chain {}", chain);
                NutsChain::new(density, settings.clone(), chain_rng(config.seed, chain)).run()
            })
            .collect::<Result<Vec<ChainDraws>>>()
    };
    let chains = match config.threads {
        Some(threads) => rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| AbError::InvalidConfig(format!("could not build thread pool: {}", e)))?
            .install(run)?,
        None => run()?,
    };

    for (chain, draws) in chains.iter().enumerate() {
        if let Some(draw) = draws
            .positions
            .iter()
            .position(|q| q.iter().any(|u| !u.is_finite()))
        {
            return Err(AbError::SamplingFailure(format!(
                "chain {} produced a non-finite draw at index {}",
                chain, draw
            )));
        }
    }

    let divergent: usize = chains
        .iter()
        .map(|c| c.stats.iter().filter(|s| s.diverging).count())
        .sum();
    let fraction = divergent as f64 / config.total_draws() as f64;
    if fraction > config.max_divergence_fraction {
        return Err(AbError::SamplingFailure(format!(
            "{} of {} draws diverged ({:.1}% > {:.1}% allowed)",
            divergent,
            config.total_draws(),
            100.0 * fraction,
            100.0 * config.max_divergence_fraction
        )));
    }
    Ok(chains)
}
