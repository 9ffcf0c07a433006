//! Posterior trace: the retained draws of every recorded variable together
//! with sampler statistics, the observed data and run attributes.
//!
//! Arrays are indexed `[chain][draw]`. The trace is written once and read
//! back as JSON; floats survive the round trip exactly.

use crate::error::{AbError, Result};
use crate::nuts::ChainDraws;
use crate::sampler::SamplerConfig;
use crate::table::ArmData;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Draws of one named variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub draws: Vec<Vec<f64>>,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct SampleStats {
    pub lp: Vec<Vec<f64>>,
    pub energy: Vec<Vec<f64>>,
    pub step_size: Vec<Vec<f64>>,
    pub tree_depth: Vec<Vec<u32>>,
    pub n_steps: Vec<Vec<u32>>,
    pub acceptance_rate: Vec<Vec<f64>>,
    pub diverging: Vec<Vec<bool>>,
}

impl SampleStats {
    pub fn from_chains(chains: &[ChainDraws]) -> Self {
        let mut stats = SampleStats::default();
        for chain in chains {
            let s = &chain.stats;
            stats.lp.push(s.iter().map(|d| d.lp).collect());
            stats.energy.push(s.iter().map(|d| d.energy).collect());
            stats.step_size.push(s.iter().map(|d| d.step_size).collect());
            stats.tree_depth.push(s.iter().map(|d| d.tree_depth).collect());
            stats.n_steps.push(s.iter().map(|d| d.n_steps).collect());
            stats.acceptance_rate.push(s.iter().map(|d| d.acceptance_rate).collect());
            stats.diverging.push(s.iter().map(|d| d.diverging).collect());
        }
        stats
    }

    fn shapes(&self) -> Vec<(&'static str, Vec<usize>)> {
        fn lens<T>(v: &[Vec<T>]) -> Vec<usize> {
            v.iter().map(Vec::len).collect()
        }
        vec![
            ("lp", lens(&self.lp)),
            ("energy", lens(&self.energy)),
            ("step_size", lens(&self.step_size)),
            ("tree_depth", lens(&self.tree_depth)),
            ("n_steps", lens(&self.n_steps)),
            ("acceptance_rate", lens(&self.acceptance_rate)),
            ("diverging", lens(&self.diverging)),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservedData {
    pub control: ArmData,
    pub variant: ArmData,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceAttrs {
    pub chains: usize,
    pub draws: usize,
    pub tune: usize,
    pub seed: u64,
    pub target_accept: f64,
    pub max_tree_depth: u32,
    pub sampler: String,
    pub created_by: String,
    pub version: String,
}

impl TraceAttrs {
    pub fn from_config(config: &SamplerConfig) -> Self {
        Self {
            chains: config.chains,
            draws: config.draws,
            tune: config.tune,
            seed: config.seed,
            target_accept: config.target_accept,
            max_tree_depth: config.max_tree_depth,
            sampler: "nuts".to_string(),
            created_by: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PosteriorTrace {
    posterior: Vec<Variable>,
    sample_stats: SampleStats,
    observed_data: ObservedData,
    attrs: TraceAttrs,
}

impl PosteriorTrace {
    pub fn new(
        posterior: Vec<Variable>,
        sample_stats: SampleStats,
        observed_data: ObservedData,
        attrs: TraceAttrs,
    ) -> Result<Self> {
        let trace = Self {
            posterior,
            sample_stats,
            observed_data,
            attrs,
        };
        trace.check_shape().map_err(AbError::SamplingFailure)?;
        Ok(trace)
    }

    /// Every array must be `chains x draws` as declared in the attributes.
    fn check_shape(&self) -> std::result::Result<(), String> {
        let expected = vec![self.attrs.draws; self.attrs.chains];
        for variable in &self.posterior {
            let got: Vec<usize> = variable.draws.iter().map(Vec::len).collect();
            if got != expected {
                return Err(format!(
                    "variable '{}' has shape {:?}, expected {} chains of {} draws",
                    variable.name, got, self.attrs.chains, self.attrs.draws
                ));
            }
        }
        for (name, got) in self.sample_stats.shapes() {
            if got != expected {
                return Err(format!(
                    "sample stat '{}' has shape {:?}, expected {} chains of {} draws",
                    name, got, self.attrs.chains, self.attrs.draws
                ));
            }
        }
        Ok(())
    }

    pub fn posterior(&self) -> &[Variable] {
        &self.posterior
    }

    pub fn sample_stats(&self) -> &SampleStats {
        &self.sample_stats
    }

    pub fn observed_data(&self) -> &ObservedData {
        &self.observed_data
    }

    pub fn attrs(&self) -> &TraceAttrs {
        &self.attrs
    }

    pub fn n_chains(&self) -> usize {
        self.attrs.chains
    }

    pub fn n_draws(&self) -> usize {
        self.attrs.draws
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.posterior.iter().map(|v| v.name.as_str()).collect()
    }

    /// Draws of `name`, indexed `[chain][draw]`.
    pub fn get(&self, name: &str) -> Option<&[Vec<f64>]> {
        self.posterior
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.draws.as_slice())
    }

    /// Draws of `name` with all chains concatenated.
    pub fn pooled(&self, name: &str) -> Option<Vec<f64>> {
        self.get(name).map(|chains| chains.concat())
    }

    pub fn write<W: Write>(&self, inner: W) -> serde_json::Result<()> {
        let mut writer = BufWriter::new(inner);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush().map_err(serde_json::Error::io)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| AbError::output_write(path, e))?;
        self.write(file).map_err(|e| AbError::output_write(path, e))?;
        debug!("Wrote posterior trace to {}", path.display());
        Ok(())
    }

    pub fn read<R: Read>(inner: R, origin: &Path) -> Result<Self> {
        let trace: PosteriorTrace = serde_json::from_reader(BufReader::new(inner))
            .map_err(|e| AbError::input_read(origin, e))?;
        trace
            .check_shape()
            .map_err(|msg| AbError::input_read(origin, msg))?;
        Ok(trace)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| AbError::input_read(path, e))?;
        Self::read(file, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::Arm;
    use tempfile::NamedTempFile;

    fn arm(arm: Arm) -> ArmData {
        ArmData {
            arm,
            n_users: 3,
            n_converted: 1,
            revenue: vec![0.1 + 0.2],
        }
    }

    fn stats(chains: usize, draws: usize) -> SampleStats {
        SampleStats {
            lp: vec![vec![-1.25; draws]; chains],
            energy: vec![vec![2.0; draws]; chains],
            step_size: vec![vec![0.7; draws]; chains],
            tree_depth: vec![vec![2; draws]; chains],
            n_steps: vec![vec![3; draws]; chains],
            acceptance_rate: vec![vec![0.93; draws]; chains],
            diverging: vec![vec![false; draws]; chains],
        }
    }

    fn attrs(chains: usize, draws: usize) -> TraceAttrs {
        TraceAttrs::from_config(&SamplerConfig {
            chains,
            draws,
            ..SamplerConfig::default()
        })
    }

    fn trace() -> PosteriorTrace {
        let posterior = vec![
            Variable {
                name: "p_control".to_string(),
                draws: vec![vec![0.1, 1.0 / 3.0, 0.12345678901234568], vec![2e-300, 0.5, 0.9999999999999999]],
            },
            Variable {
                name: "mu_control".to_string(),
                draws: vec![vec![1.0, std::f64::consts::PI, 7.25], vec![0.3, 0.2, 1e10]],
            },
        ];
        PosteriorTrace::new(
            posterior,
            stats(2, 3),
            ObservedData {
                control: arm(Arm::Control),
                variant: arm(Arm::Variant),
            },
            attrs(2, 3),
        )
        .unwrap()
    }

    #[test]
    fn test_accessors() {
        let trace = trace();
        assert_eq!(trace.variable_names(), vec!["p_control", "mu_control"]);
        assert_eq!(trace.get("mu_control").unwrap()[1][2], 1e10);
        assert_eq!(trace.pooled("p_control").unwrap().len(), 6);
        assert!(trace.get("alpha").is_none());
        assert_eq!(trace.attrs().sampler, "nuts");
    }

    #[test]
    fn test_save_and_load_exact() {
        let trace = trace();
        let file = NamedTempFile::new().expect("Failed to create temp file");
        trace.save(file.path()).unwrap();
        let reloaded = PosteriorTrace::load(file.path()).unwrap();
        assert_eq!(reloaded, trace);
        for (a, b) in trace.posterior().iter().zip(reloaded.posterior()) {
            for (x, y) in a.draws.concat().iter().zip(b.draws.concat()) {
                assert_eq!(x.to_bits(), y.to_bits());
            }
        }
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let result = PosteriorTrace::new(
            vec![Variable {
                name: "alpha".to_string(),
                draws: vec![vec![1.0, 2.0]],
            }],
            stats(2, 3),
            ObservedData {
                control: arm(Arm::Control),
                variant: arm(Arm::Variant),
            },
            attrs(2, 3),
        );
        assert!(matches!(result, Err(AbError::SamplingFailure(_))));
    }

    #[test]
    fn test_load_failures() {
        let missing = PosteriorTrace::load(Path::new("/nonexistent/trace.json"));
        assert!(matches!(missing, Err(AbError::InputRead { .. })));

        let garbage = PosteriorTrace::read("{\"posterior\": 3}".as_bytes(), Path::new("<memory>"));
        assert!(matches!(garbage, Err(AbError::InputRead { .. })));
    }

    #[test]
    fn test_save_to_missing_directory() {
        let result = trace().save(Path::new("/nonexistent/dir/trace.json"));
        assert!(matches!(result, Err(AbError::OutputWrite { .. })));
    }
}
