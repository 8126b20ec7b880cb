use std::path::Path;

use crate::analysis::StepAnalysis;
use crate::state::TraceError;

/// Write one step's node metrics as a tab-separated table, one row per node.
pub fn emit_step_tsv<P: AsRef<Path>>(
    path: P,
    step: usize,
    analysis: &StepAnalysis,
) -> Result<(), TraceError> {
    let filename = path.as_ref().join(format!("step{}.tsv", step));
    let mut f = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(filename)?;
    for node in &analysis.nodes {
        f.serialize(node)?;
    }
    f.flush()?;
    Ok(())
}
