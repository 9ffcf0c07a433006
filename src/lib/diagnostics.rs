//! Convergence and efficiency diagnostics of a posterior trace.

use crate::error::{AbError, Result};
use crate::trace::PosteriorTrace;
use csv::WriterBuilder;
use itertools::Itertools;
use log::warn;
use ordered_float::OrderedFloat;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub const HDI_PROB: f64 = 0.94;
pub const RHAT_THRESHOLD: f64 = 1.01;
pub const MIN_ESS: f64 = 400.0;

fn mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len() as f64
}

/// Sample variance with `n - 1` in the denominator.
fn variance(x: &[f64]) -> f64 {
    let m = mean(x);
    x.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (x.len() as f64 - 1.0)
}

/// Each chain cut into a first and a second half; the middle draw of an odd
/// chain is dropped.
fn split_chains(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    chains
        .iter()
        .flat_map(|chain| {
            let half = chain.len() / 2;
            [chain[..half].to_vec(), chain[chain.len() - half..].to_vec()]
        })
        .collect()
}

/// Potential scale reduction over split chains; NaN when undefined.
pub fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    let n = split.first().map_or(0, Vec::len);
    if split.len() < 2 || n < 2 {
        return f64::NAN;
    }
    let means: Vec<f64> = split.iter().map(|c| mean(c)).collect();
    let within = mean(&split.iter().map(|c| variance(c)).collect::<Vec<f64>>());
    let between = n as f64 * variance(&means);
    let var_hat = (n as f64 - 1.0) / n as f64 * within + between / n as f64;
    (var_hat / within).sqrt()
}

/// Autocovariances of one chain, computed up to the lags actually requested.
struct Autocovariance<'a> {
    chain: &'a [f64],
    mean: f64,
}

impl<'a> Autocovariance<'a> {
    fn new(chain: &'a [f64]) -> Self {
        Self {
            chain,
            mean: mean(chain),
        }
    }

    fn at(&self, lag: usize) -> f64 {
        let n = self.chain.len();
        let m = self.mean;
        (0..n - lag)
            .map(|i| (self.chain[i] - m) * (self.chain[i + lag] - m))
            .sum::<f64>()
            / n as f64
    }
}

/// Multi-chain effective sample size with Geyer's initial monotone sequence.
pub fn ess(chains: &[Vec<f64>]) -> f64 {
    let m = chains.len();
    let n = chains.first().map_or(0, Vec::len);
    if m == 0 || n < 4 {
        return f64::NAN;
    }
    let acov: Vec<Autocovariance> = chains.iter().map(|c| Autocovariance::new(c)).collect();
    let mean_acov = |lag: usize| acov.iter().map(|a| a.at(lag)).sum::<f64>() / m as f64;

    let chain_means: Vec<f64> = acov.iter().map(|a| a.mean).collect();
    let mean_var = mean_acov(0) * n as f64 / (n as f64 - 1.0);
    let mut var_plus = mean_var * (n as f64 - 1.0) / n as f64;
    if m > 1 {
        var_plus += variance(&chain_means);
    }
    if !(var_plus > 0.0) {
        return f64::NAN;
    }
    let rho = |lag: usize| 1.0 - (mean_var - mean_acov(lag)) / var_plus;

    let mut rho_hat = vec![0.0; n];
    rho_hat[0] = 1.0;
    let mut rho_even = 1.0;
    let mut rho_odd = rho(1);
    rho_hat[1] = rho_odd;

    let mut t = 1;
    while t < n - 4 && rho_even + rho_odd > 0.0 {
        rho_even = rho(t + 1);
        rho_odd = rho(t + 2);
        if rho_even + rho_odd >= 0.0 {
            rho_hat[t + 1] = rho_even;
            rho_hat[t + 2] = rho_odd;
        }
        t += 2;
    }
    let max_t = t;
    if rho_even > 0.0 {
        rho_hat[max_t + 1] = rho_even;
    }

    // Initial monotone sequence
    let mut t = 1;
    while t + 3 <= max_t {
        if rho_hat[t + 1] + rho_hat[t + 2] > rho_hat[t - 1] + rho_hat[t] {
            rho_hat[t + 1] = (rho_hat[t - 1] + rho_hat[t]) / 2.0;
            rho_hat[t + 2] = rho_hat[t + 1];
        }
        t += 2;
    }

    let total = (m * n) as f64;
    let tau = -1.0 + 2.0 * rho_hat[..max_t].iter().sum::<f64>() + rho_hat[max_t + 1];
    let tau = tau.max(1.0 / total.log10());
    total / tau
}

/// Replace pooled draws by normal scores of their (average) ranks, keeping the chain layout.
fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let pooled: Vec<f64> = chains.concat();
    let total = pooled.len();
    let order: Vec<usize> = (0..total)
        .sorted_by_key(|&i| OrderedFloat(pooled[i]))
        .collect();

    let mut ranks = vec![0.0; total];
    let mut start = 0;
    while start < total {
        let mut end = start + 1;
        while end < total && pooled[order[end]] == pooled[order[start]] {
            end += 1;
        }
        // 1-based average rank of a block of ties
        let rank = (start + end + 1) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = rank;
        }
        start = end;
    }

    let normal = Normal::standard();
    let scores: Vec<f64> = ranks
        .iter()
        .map(|r| normal.inverse_cdf((r - 0.375) / (total as f64 + 0.25)))
        .collect();
    let n = chains.first().map_or(0, Vec::len);
    scores.chunks(n.max(1)).map(<[f64]>::to_vec).collect()
}

/// Bulk effective sample size: ESS of the rank-normalized split chains.
pub fn ess_bulk(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    if split.first().map_or(0, Vec::len) < 4 {
        return f64::NAN;
    }
    ess(&rank_normalize(&split))
}

/// Narrowest interval containing `prob` of the draws.
pub fn hdi(samples: &[f64], prob: f64) -> (f64, f64) {
    if samples.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let sorted: Vec<f64> = samples
        .iter()
        .copied()
        .sorted_by_key(|&x| OrderedFloat(x))
        .collect();
    let n = sorted.len();
    let width = ((prob * n as f64).floor() as usize).min(n - 1);
    let start = (0..n - width)
        .min_by_key(|&i| OrderedFloat(sorted[i + width] - sorted[i]))
        .unwrap_or(0);
    (sorted[start], sorted[start + width])
}

/// Summary statistics of one variable.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VariableSummary {
    #[serde(rename = "variable")]
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    #[serde(rename = "hdi_3%")]
    pub hdi_low: f64,
    #[serde(rename = "hdi_97%")]
    pub hdi_high: f64,
    pub mcse_mean: f64,
    pub ess_bulk: f64,
    pub r_hat: f64,
}

impl VariableSummary {
    pub fn from_chains(name: &str, chains: &[Vec<f64>]) -> Self {
        let pooled = chains.concat();
        let sd = variance(&pooled).sqrt();
        let (hdi_low, hdi_high) = hdi(&pooled, HDI_PROB);
        Self {
            name: name.to_string(),
            mean: mean(&pooled),
            sd,
            hdi_low,
            hdi_high,
            mcse_mean: sd / ess(&split_chains(chains)).sqrt(),
            ess_bulk: ess_bulk(chains),
            r_hat: split_rhat(chains),
        }
    }
}

/// Sampler behaviour of one chain.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainStats {
    pub chain: usize,
    pub divergences: usize,
    pub step_size: f64,
    pub mean_accept: f64,
    pub mean_tree_depth: f64,
    pub max_depth_hits: usize,
    pub gradient_evals: u64,
}

/// Diagnostics attached to every inference run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunDiagnostics {
    pub max_tree_depth: u32,
    pub chains: Vec<ChainStats>,
    pub variables: Vec<VariableSummary>,
}

impl RunDiagnostics {
    pub fn from_trace(trace: &PosteriorTrace) -> Self {
        let stats = trace.sample_stats();
        let max_tree_depth = trace.attrs().max_tree_depth;
        let chains = (0..trace.n_chains())
            .map(|c| {
                let depth = &stats.tree_depth[c];
                ChainStats {
                    chain: c,
                    divergences: stats.diverging[c].iter().filter(|d| **d).count(),
                    step_size: stats.step_size[c].first().copied().unwrap_or(f64::NAN),
                    mean_accept: mean(&stats.acceptance_rate[c]),
                    mean_tree_depth: depth.iter().map(|d| *d as f64).sum::<f64>()
                        / depth.len() as f64,
                    max_depth_hits: depth.iter().filter(|d| **d >= max_tree_depth).count(),
                    gradient_evals: stats.n_steps[c].iter().map(|n| *n as u64).sum(),
                }
            })
            .collect();
        let variables = trace
            .posterior()
            .iter()
            .map(|v| VariableSummary::from_chains(&v.name, &v.draws))
            .collect();
        Self {
            max_tree_depth,
            chains,
            variables,
        }
    }

    pub fn variable(&self, name: &str) -> Option<&VariableSummary> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn total_divergences(&self) -> usize {
        self.chains.iter().map(|c| c.divergences).sum()
    }

    /// Human readable problems with the run, empty when everything looks fine.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let divergences = self.total_divergences();
        if divergences > 0 {
            warnings.push(format!(
                "{} divergent transitions after warmup, the posterior may be biased",
                divergences
            ));
        }
        let saturated: usize = self.chains.iter().map(|c| c.max_depth_hits).sum();
        if saturated > 0 {
            warnings.push(format!(
                "{} transitions hit the maximum tree depth of {}",
                saturated, self.max_tree_depth
            ));
        }
        for v in &self.variables {
            if v.r_hat.is_nan() {
                warnings.push(format!("r_hat of {} is undefined", v.name));
            } else if v.r_hat > RHAT_THRESHOLD {
                warnings.push(format!("r_hat of {} is {:.3} (> {})", v.name, v.r_hat, RHAT_THRESHOLD));
            }
            if v.ess_bulk.is_nan() {
                warnings.push(format!("ess_bulk of {} is undefined", v.name));
            } else if v.ess_bulk < MIN_ESS {
                warnings.push(format!("ess_bulk of {} is {:.0} (< {})", v.name, v.ess_bulk, MIN_ESS));
            }
        }
        warnings
    }

    pub fn log_warnings(&self) {
        for w in self.warnings() {
            warn!("{}", w);
        }
    }

    /// Tab separated per-variable summary.
    pub fn write_summary<W: Write>(&self, inner: W) -> csv::Result<()> {
        let mut writer = WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_writer(inner);
        for v in &self.variables {
            writer.serialize(v)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn save_summary(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| AbError::output_write(path, e))?;
        self.write_summary(file)
            .map_err(|e| AbError::output_write(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn iid_chains(chains: usize, draws: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        (0..chains)
            .map(|_| (0..draws).map(|_| rng.sample::<f64, _>(StandardNormal)).collect())
            .collect()
    }

    fn ar1_chains(chains: usize, draws: usize, phi: f64, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let scale = (1.0 - phi * phi).sqrt();
        (0..chains)
            .map(|_| {
                let mut x: f64 = rng.sample(StandardNormal);
                (0..draws)
                    .map(|_| {
                        let z: f64 = rng.sample(StandardNormal);
                        x = phi * x + scale * z;
                        x
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_rhat_independent_chains() {
        let chains = iid_chains(4, 2000, 1);
        let rhat = split_rhat(&chains);
        assert!((rhat - 1.0).abs() < 0.01, "r_hat {}", rhat);
    }

    #[test]
    fn test_rhat_shifted_chains() {
        let mut chains = iid_chains(4, 1000, 2);
        for x in chains[2..].iter_mut().flatten() {
            *x += 3.0;
        }
        assert!(split_rhat(&chains) > 1.5);
    }

    #[test]
    fn test_ess_independent_draws() {
        let chains = iid_chains(4, 1000, 3);
        let bulk = ess_bulk(&chains);
        assert!(bulk > 2800.0 && bulk < 5600.0, "ess_bulk {}", bulk);
        let plain = ess(&chains);
        assert!(plain > 2800.0 && plain < 5600.0, "ess {}", plain);
    }

    #[test]
    fn test_ess_autocorrelated_draws() {
        // AR(1) with phi = 0.9 keeps about (1 - phi) / (1 + phi) of the draws
        let chains = ar1_chains(4, 1000, 0.9, 4);
        let bulk = ess_bulk(&chains);
        assert!(bulk > 100.0 && bulk < 400.0, "ess_bulk {}", bulk);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(ess(&[vec![1.0, 2.0]]).is_nan());
        assert!(ess(&[vec![5.0; 10], vec![5.0; 10]]).is_nan());
        assert!(split_rhat(&[vec![1.0]]).is_nan());
    }

    #[test]
    fn test_hdi() {
        let samples: Vec<f64> = (0..100).rev().map(|i| i as f64).collect();
        assert_eq!(hdi(&samples, 0.94), (0.0, 94.0));

        // a long right tail pulls the interval to the left of the central one
        let mut skewed: Vec<f64> = (0..90).map(|i| i as f64 / 90.0).collect();
        skewed.extend((0..10).map(|i| 10.0 + i as f64 * 10.0));
        let (low, high) = hdi(&skewed, 0.9);
        assert_eq!(low, 0.0);
        assert!(high < 10.0 + 1e-12);
    }

    #[test]
    fn test_rank_normalize_ties() {
        let chains = vec![vec![1.0, 2.0, 2.0, 3.0]];
        let z = rank_normalize(&chains);
        assert_eq!(z[0][1], z[0][2]);
        assert!(z[0][0] < z[0][1] && z[0][1] < z[0][3]);
        assert!((z[0][0] + z[0][3]).abs() < 1e-9);
    }

    #[test]
    fn test_summary_tsv() {
        let chains = iid_chains(2, 100, 5);
        let diagnostics = RunDiagnostics {
            max_tree_depth: 10,
            chains: vec![],
            variables: vec![VariableSummary::from_chains("alpha", &chains)],
        };
        let mut buf = Vec::new();
        diagnostics.write_summary(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "variable\tmean\tsd\thdi_3%\thdi_97%\tmcse_mean\tess_bulk\tr_hat"
        );
        assert!(lines.next().unwrap().starts_with("alpha\t"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_warnings() {
        let mut chains = iid_chains(4, 100, 6);
        for x in chains[0].iter_mut() {
            *x += 5.0;
        }
        let diagnostics = RunDiagnostics {
            max_tree_depth: 10,
            chains: vec![ChainStats {
                chain: 0,
                divergences: 2,
                step_size: 0.5,
                mean_accept: 0.9,
                mean_tree_depth: 3.0,
                max_depth_hits: 1,
                gradient_evals: 700,
            }],
            variables: vec![VariableSummary::from_chains("mu_control", &chains)],
        };
        let warnings = diagnostics.warnings();
        assert!(warnings.iter().any(|w| w.contains("divergent")));
        assert!(warnings.iter().any(|w| w.contains("maximum tree depth")));
        assert!(warnings.iter().any(|w| w.starts_with("r_hat of mu_control")));
        assert!(warnings.iter().any(|w| w.starts_with("ess_bulk of mu_control")));
    }

    #[test]
    fn test_undefined_diagnostics_are_reported() {
        let chains = vec![vec![0.1, 0.4, 0.2], vec![0.3, 0.5, 0.7]];
        let summary = VariableSummary::from_chains("alpha", &chains);
        assert!(summary.r_hat.is_nan());
        assert!(summary.ess_bulk.is_nan());
        let diagnostics = RunDiagnostics {
            max_tree_depth: 10,
            chains: vec![],
            variables: vec![summary],
        };
        let warnings = diagnostics.warnings();
        assert!(warnings.contains(&"r_hat of alpha is undefined".to_string()));
        assert!(warnings.contains(&"ess_bulk of alpha is undefined".to_string()));
    }
}
