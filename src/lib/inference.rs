use crate::arm::Arm;
use crate::density::CompiledModel;
use crate::diagnostics::RunDiagnostics;
use crate::error::{AbError, Result};
use crate::model::{ab_test_model_with_priors, AbPriors};
use crate::nuts::ChainDraws;
use crate::sampler::{sample_chains, SamplerConfig};
use crate::table::UserTable;
use crate::trace::{ObservedData, PosteriorTrace, SampleStats, TraceAttrs, Variable};
use log::info;

/// Posterior trace of a run together with its diagnostics.
#[derive(Clone, Debug)]
pub struct InferenceRun {
    pub trace: PosteriorTrace,
    pub diagnostics: RunDiagnostics,
}

/// Fit the A/B model to `table` with default priors.
pub fn run_inference(table: &UserTable, config: &SamplerConfig) -> Result<InferenceRun> {
    run_inference_with_priors(table, config, &AbPriors::default())
}

pub fn run_inference_with_priors(
    table: &UserTable,
    config: &SamplerConfig,
    priors: &AbPriors,
) -> Result<InferenceRun> {
    config.validate()?;
    table.require_both_arms()?;

    let control = table.arm_data(Arm::Control);
    let variant = table.arm_data(Arm::Variant);
    for arm in [&control, &variant] {
        info!(
            "{}: {} users, {} converted",
            arm.arm, arm.n_users, arm.n_converted
        );
    }

    let model = ab_test_model_with_priors(&control, &variant, priors).compile()?;
    let chains = sample_chains(&model, config)?;
    let trace = build_trace(
        &model,
        &chains,
        ObservedData { control, variant },
        TraceAttrs::from_config(config),
    )?;

    let diagnostics = RunDiagnostics::from_trace(&trace);
    diagnostics.log_warnings();
    info!(
        "Sampling finished with {} divergent transitions",
        diagnostics.total_divergences()
    );
    Ok(InferenceRun { trace, diagnostics })
}

/// Map unconstrained draws back to every model node and assemble the trace.
fn build_trace(
    model: &CompiledModel,
    chains: &[ChainDraws],
    observed: ObservedData,
    attrs: TraceAttrs,
) -> Result<PosteriorTrace> {
    let names = model.names();
    let mut posterior: Vec<Variable> = names
        .iter()
        .map(|name| Variable {
            name: name.clone(),
            draws: Vec::with_capacity(chains.len()),
        })
        .collect();

    for (c, chain) in chains.iter().enumerate() {
        for variable in posterior.iter_mut() {
            variable.draws.push(Vec::with_capacity(chain.positions.len()));
        }
        for (d, position) in chain.positions.iter().enumerate() {
            let values = model.constrain(position);
            if let Some(k) = values.iter().position(|v| !v.is_finite()) {
                return Err(AbError::SamplingFailure(format!(
                    "chain {} draw {}: {} is not finite",
                    c, d, names[k]
                )));
            }
            for (variable, value) in posterior.iter_mut().zip(values) {
                variable.draws[c].push(value);
            }
        }
    }

    PosteriorTrace::new(posterior, SampleStats::from_chains(chains), observed, attrs)
}
