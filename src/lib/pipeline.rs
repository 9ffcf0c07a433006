//! Read, compute and write steps of the two binaries. Each step returns the
//! stage-specific [`AbError`](crate::error::AbError) of whatever failed.

use crate::aggregate::{aggregate_events, AggregationReport};
use crate::error::Result;
use crate::events::load_raw_events;
use crate::inference::{run_inference, InferenceRun};
use crate::sampler::SamplerConfig;
use crate::table::UserTable;
use log::info;
use std::path::Path;

/// Raw events file to aggregated per-user table.
pub fn preprocess(raw: &Path, out: &Path) -> Result<AggregationReport> {
    let events = load_raw_events(raw)?;
    info!("Read {} events from {}", events.len(), raw.display());
    let (table, report) = aggregate_events(&events)?;
    table.save(out)?;
    info!("Wrote {} users to {}", table.len(), out.display());
    Ok(report)
}

/// Aggregated table to posterior samples and diagnostics.
pub fn analyze(table_path: &Path, config: &SamplerConfig) -> Result<InferenceRun> {
    let table = UserTable::load(table_path)?;
    info!("Loaded {} users from {}", table.len(), table_path.display());
    run_inference(&table, config)
}

/// Write the trace and the diagnostics summary. The run stays with the caller
/// whether or not this succeeds.
pub fn persist(run: &InferenceRun, trace_path: &Path, summary_path: &Path) -> Result<()> {
    run.trace.save(trace_path)?;
    info!("Saved posterior trace to {}", trace_path.display());
    run.diagnostics.save_summary(summary_path)?;
    info!("Saved summary to {}", summary_path.display());
    Ok(())
}
