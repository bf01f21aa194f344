//! Program-minimization engine.
//!
//! A [`Session`] takes a program that triggered an interesting signal on a
//! distinguished call and produces a smaller, equivalent program: first
//! call-level removal (influence-guided bulk drops, then pairwise), then
//! per-argument shrinking, with every proposal decided by the equivalence
//! oracle. Committed programs strictly shrink; rejected proposals are
//! discarded clones, so no rollback is ever needed.

mod args;
mod calls;

use influence::InfluenceMatrix;
use oracle::{OracleAdapter, OracleError, OracleStats, StepKind, Telemetry};
use prog::{serial, Program, Target};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Errors that abort a session. The session still returns the original
/// program so the host can proceed un-minimized.
#[derive(Debug, thiserror::Error)]
pub enum MinimizeError {
    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The engine kept iterating over a tree that is no longer the
    /// baseline. Always an engine bug.
    #[error("stale iteration: {0}")]
    StaleIteration(String),
}

/// Failure kind reported alongside the unmodified original program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFailure {
    InvariantViolation,
    OracleInfrastructure,
    StaleIteration,
}

/// What the host hands a session.
pub struct MinimizeRequest {
    pub program: Program,
    /// Index of the call whose signal defines equivalence; `None` is
    /// crash-mode without a target.
    pub call_index: Option<usize>,
    pub crash: bool,
    /// Per-call coverage hashes from the host's execution of the original
    /// program; seeds dynamic-influence learning.
    pub baseline_telemetry: Option<Telemetry>,
}

/// Session result. `program` is the minimized program, or the unmodified
/// original when `failure` is set.
#[derive(Debug)]
pub struct MinimizeOutcome {
    pub program: Program,
    pub call_index: Option<usize>,
    pub influence_learned: bool,
    pub stats: OracleStats,
    pub failure: Option<SessionFailure>,
}

/// One single-threaded minimization session.
pub struct Session<'t> {
    target: &'t Target,
    adapter: OracleAdapter<'t>,
    matrix: Option<&'t InfluenceMatrix>,
    shutdown: Option<Arc<AtomicBool>>,
    crash: bool,
    /// Telemetry of the current baseline (last committed execution, or the
    /// host-supplied original run).
    baseline_telemetry: Option<Telemetry>,
    /// Telemetry of the most recent oracle query, committed or not.
    last_telemetry: Option<Telemetry>,
    influence_learned: bool,
}

impl<'t> Session<'t> {
    pub fn new(target: &'t Target, adapter: OracleAdapter<'t>) -> Self {
        Self {
            target,
            adapter,
            matrix: None,
            shutdown: None,
            crash: false,
            baseline_telemetry: None,
            last_telemetry: None,
            influence_learned: false,
        }
    }

    /// Shares the influence matrix with this session; enables the
    /// influence-guided prefix drop and dynamic learning.
    pub fn with_influence(mut self, matrix: &'t InfluenceMatrix) -> Self {
        self.matrix = Some(matrix);
        self
    }

    /// Cooperative cancellation flag, checked between oracle calls. Once
    /// set, every pending proposal is treated as rejected and the session
    /// winds down to its current best program.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Minimizes `request.program` into an equivalent, smaller program.
    ///
    /// Deterministic given the oracle's responses and the starting state of
    /// the influence matrix.
    pub fn minimize(mut self, request: MinimizeRequest) -> MinimizeOutcome {
        let original = request.program.clone();
        let original_index = request.call_index;
        self.crash = request.crash;
        self.baseline_telemetry = request.baseline_telemetry.clone();

        match self.run(request.program, request.call_index) {
            Ok((program, call_index)) => {
                let stats = self.adapter.stats();
                tracing::info!(
                    total = stats.total,
                    call_level = stats.call_level,
                    arg_level = stats.arg_level,
                    calls = program.calls.len(),
                    learned = self.influence_learned,
                    "minimization finished"
                );
                MinimizeOutcome {
                    program,
                    call_index,
                    influence_learned: self.influence_learned,
                    stats,
                    failure: None,
                }
            }
            Err(err) => {
                let failure = match &err {
                    MinimizeError::Oracle(OracleError::Infrastructure { .. }) => {
                        SessionFailure::OracleInfrastructure
                    }
                    MinimizeError::Oracle(OracleError::Invariant { .. })
                    | MinimizeError::Invariant(_) => SessionFailure::InvariantViolation,
                    MinimizeError::StaleIteration(_) => SessionFailure::StaleIteration,
                };
                tracing::error!(error = %err, "minimization aborted");
                MinimizeOutcome {
                    program: original,
                    call_index: original_index,
                    influence_learned: self.influence_learned,
                    stats: self.adapter.stats(),
                    failure: Some(failure),
                }
            }
        }
    }

    fn run(
        &mut self,
        p0: Program,
        k0: Option<usize>,
    ) -> Result<(Program, Option<usize>), MinimizeError> {
        let name0 = match k0 {
            Some(k) => {
                let call = p0.calls.get(k).ok_or_else(|| {
                    MinimizeError::Invariant(format!(
                        "target call index {} out of range ({} calls)",
                        k,
                        p0.calls.len()
                    ))
                })?;
                Some(self.target.syscall(call.meta).name.clone())
            }
            None => None,
        };

        let (mut p0, mut k0) = calls::remove_calls(self, p0, k0)?;
        p0 = calls::reset_call_props(self, p0, k0)?;

        for i in 0..p0.calls.len() {
            if self.target.syscall(p0.calls[i].meta).attrs.no_minimize {
                continue;
            }
            args::minimize_call(self, &mut p0, k0, i)?;
            p0 = calls::minimize_call_props(self, p0, i, k0)?;
        }

        if let Some(k) = k0 {
            let ok = p0
                .calls
                .get(k)
                .map(|c| Some(&self.target.syscall(c.meta).name) == name0.as_ref())
                .unwrap_or(false);
            if !ok {
                return Err(MinimizeError::Invariant(format!(
                    "target call lost after minimization: index {} of {} calls, wanted {:?}\n{}",
                    k,
                    p0.calls.len(),
                    name0,
                    serial::dump(self.target, &p0)
                )));
            }
        }
        Ok((p0, k0))
    }

    /// Runs one oracle query. Under a pending shutdown the proposal is
    /// treated as rejected without consulting the oracle, which drains the
    /// remaining (finite) steps and returns the current best program.
    pub(crate) fn check(
        &mut self,
        p: &mut Program,
        call_index: Option<usize>,
        step: StepKind,
    ) -> Result<bool, MinimizeError> {
        if let Some(flag) = &self.shutdown {
            if flag.load(Ordering::Relaxed) {
                tracing::debug!("shutdown pending, proposal discarded");
                return Ok(false);
            }
        }
        let verdict = self.adapter.check(p, call_index, step)?;
        self.last_telemetry = verdict.telemetry.clone();
        if verdict.equivalent {
            self.baseline_telemetry = verdict.telemetry;
        }
        Ok(verdict.equivalent)
    }

    pub(crate) fn target(&self) -> &'t Target {
        self.target
    }

    pub(crate) fn crash(&self) -> bool {
        self.crash
    }

    pub(crate) fn matrix(&self) -> Option<&'t InfluenceMatrix> {
        self.matrix
    }

    /// Dynamic-influence learning after a rejected pairwise removal of call
    /// `i`: a removed call shifts later calls left by one, so the candidate
    /// hash at `i` lines up with the baseline hash at `i + 1`. Both must be
    /// nonzero and differ, and the bit must be newly set.
    pub(crate) fn learn_from_reject(&mut self, p0: &Program, candidate: &Program, i: usize) {
        let Some(matrix) = self.matrix else { return };
        let (Some(cand), Some(base)) = (&self.last_telemetry, &self.baseline_telemetry) else {
            return;
        };
        if !cand.execution_reached || i >= candidate.calls.len() || i + 1 >= p0.calls.len() {
            return;
        }
        let post = cand.per_call_cov_hash.get(i).copied().unwrap_or(0);
        let pre = base.per_call_cov_hash.get(i + 1).copied().unwrap_or(0);
        if post == 0 || pre == 0 || post == pre {
            return;
        }
        let (src, dst) = (p0.calls[i].meta, p0.calls[i + 1].meta);
        if matrix.set(src, dst) {
            self.influence_learned = true;
            tracing::debug!(
                src = %self.target.syscall(src).name,
                dst = %self.target.syscall(dst).name,
                "dynamic influence learned"
            );
        }
    }
}
