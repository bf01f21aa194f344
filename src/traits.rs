//! Host-facing executor contract.
//!
//! The engine never talks to a VM or an executor process directly; the host
//! hands it something that can run a serialized program and report what the
//! kernel did. Everything here is expressed over bytes so that this crate
//! stays free of the program model.

/// Errors from the executor side of the fence.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Executor crashed, timed out, or otherwise failed to produce a result.
    /// Retried by the oracle adapter; not a verdict on the program.
    #[error("executor infrastructure failure: {0}")]
    Infrastructure(String),
}

/// Outcome of one execution of a serialized program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSummary {
    /// Coverage-signal hash observed on the distinguished call, 0 when the
    /// call was not reached or no call was distinguished.
    pub signal_hash: u32,
    /// One coverage hash per call position, 0 for calls that did not run.
    /// Empty when the executor does not collect per-call coverage.
    pub per_call_cov_hash: Vec<u32>,
    /// Whether the whole program ran to completion.
    pub completed: bool,
}

/// Runs serialized programs on the target and reports per-run summaries.
pub trait ExecBackend {
    /// Executes `program` once, observing the call at `call_index` if given.
    fn exec(
        &mut self,
        program: &[u8],
        call_index: Option<usize>,
    ) -> Result<ExecSummary, ExecError>;
}
