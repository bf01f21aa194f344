//! Oracle adapter: the contract between the engine and the host's
//! equivalence predicate.
//!
//! Before every query the adapter neutralizes harmful arguments, re-runs the
//! size patcher, structurally validates the candidate, and verifies that the
//! committed wire form round-trips. Infrastructure failures are retried with
//! back-off; a verdict of "reject" is normal control flow and never an
//! error. One tracing line is emitted per query, tagged by step kind.

use prog::{serial, size, validate, Call, ModelError, Program, Target};
use std::time::Duration;
use syzmini::traits::{ExecBackend, ExecError};

/// Which minimization layer is asking. Advisory; lets the host bucket its
/// statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    CallLevel,
    ArgLevel,
}

impl StepKind {
    /// Wire number used in logs and by the host protocol.
    pub fn num(self) -> u8 {
        match self {
            StepKind::CallLevel => 1,
            StepKind::ArgLevel => 2,
        }
    }
}

/// Out-of-band execution feedback from the last oracle query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telemetry {
    /// One coverage hash per call position; 0 = call did not run.
    pub per_call_cov_hash: Vec<u32>,
    /// Whether the program executed to completion.
    pub execution_reached: bool,
}

/// Oracle answer for one candidate program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub equivalent: bool,
    /// Absent when the host collects no per-call coverage; dynamic
    /// influence learning is disabled without it.
    pub telemetry: Option<Telemetry>,
}

/// Host-supplied equivalence predicate.
pub trait EquivalenceOracle {
    fn evaluate(
        &mut self,
        p: &Program,
        call_index: Option<usize>,
        step: StepKind,
    ) -> Result<Verdict, ExecError>;
}

/// Target-specific neutralization of harmful arguments (an ioctl that turns
/// off console output, a destructive flag combination). When
/// `fix_structure` is false only value changes are allowed.
pub trait Neutralizer {
    fn neutralize(
        &self,
        target: &Target,
        call: &mut Call,
        fix_structure: bool,
    ) -> Result<(), ModelError>;
}

/// Errors the adapter surfaces to the session. Both are fatal.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("invariant violation: {reason}\nprogram:\n{dump}")]
    Invariant { reason: String, dump: String },

    #[error("oracle infrastructure failure after {attempts} attempts: {last}")]
    Infrastructure { attempts: u32, last: String },
}

/// Query counters reported in the session summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OracleStats {
    pub total: u64,
    pub call_level: u64,
    pub arg_level: u64,
}

/// Wraps the host oracle with the sanitize + validate pass and retry policy.
pub struct OracleAdapter<'t> {
    target: &'t Target,
    inner: Box<dyn EquivalenceOracle + 't>,
    neutralizers: Vec<Box<dyn Neutralizer + 't>>,
    max_attempts: u32,
    backoff: Duration,
    stats: OracleStats,
}

impl<'t> OracleAdapter<'t> {
    pub fn new(target: &'t Target, inner: Box<dyn EquivalenceOracle + 't>) -> Self {
        Self {
            target,
            inner,
            neutralizers: Vec::new(),
            max_attempts: 10,
            backoff: Duration::from_millis(50),
            stats: OracleStats::default(),
        }
    }

    /// Registers a target neutralization rule, applied in order.
    pub fn register_neutralizer(&mut self, n: Box<dyn Neutralizer + 't>) {
        self.neutralizers.push(n);
    }

    /// Overrides the retry policy (tests use a tiny back-off).
    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn stats(&self) -> OracleStats {
        self.stats
    }

    /// Sanitizes and validates `p` in place, then asks the host oracle.
    ///
    /// The candidate is mutated by neutralization and size patching before
    /// the query, so a later commit publishes exactly what was executed.
    pub fn check(
        &mut self,
        p: &mut Program,
        call_index: Option<usize>,
        step: StepKind,
    ) -> Result<Verdict, OracleError> {
        self.sanitize(p)?;
        validate::validate(self.target, p).map_err(|e| self.invariant(p, e.to_string()))?;
        self.check_roundtrip(p)?;

        let verdict = self.query(p, call_index, step)?;

        self.stats.total += 1;
        match step {
            StepKind::CallLevel => self.stats.call_level += 1,
            StepKind::ArgLevel => self.stats.arg_level += 1,
        }
        tracing::debug!(
            step = step.num(),
            accepted = verdict.equivalent,
            calls = p.calls.len(),
            query = self.stats.total,
            "oracle"
        );
        Ok(verdict)
    }

    fn sanitize(&mut self, p: &mut Program) -> Result<(), OracleError> {
        for idx in 0..p.calls.len() {
            for n in &self.neutralizers {
                n.neutralize(self.target, &mut p.calls[idx], true)
                    .map_err(|e| OracleError::Invariant {
                        reason: format!("neutralization failed: {}", e),
                        dump: serial::dump(self.target, p),
                    })?;
            }
            size::patch_call(self.target, p, idx);
        }
        Ok(())
    }

    fn check_roundtrip(&self, p: &Program) -> Result<(), OracleError> {
        let bytes = serial::serialize(p).map_err(|e| self.invariant(p, e.to_string()))?;
        let back = serial::deserialize(&bytes).map_err(|e| self.invariant(p, e.to_string()))?;
        if back != *p {
            return Err(self.invariant(p, "serialization round-trip is not identity".into()));
        }
        Ok(())
    }

    fn query(
        &mut self,
        p: &Program,
        call_index: Option<usize>,
        step: StepKind,
    ) -> Result<Verdict, OracleError> {
        let mut backoff = self.backoff;
        let mut last = String::new();
        for attempt in 1..=self.max_attempts {
            match self.inner.evaluate(p, call_index, step) {
                Ok(verdict) => return Ok(verdict),
                Err(ExecError::Infrastructure(msg)) => {
                    tracing::warn!(attempt, error = %msg, "oracle infrastructure failure");
                    last = msg;
                    if attempt < self.max_attempts {
                        std::thread::sleep(backoff);
                        backoff *= 2;
                    }
                }
            }
        }
        Err(OracleError::Infrastructure {
            attempts: self.max_attempts,
            last,
        })
    }

    fn invariant(&self, p: &Program, reason: String) -> OracleError {
        OracleError::Invariant {
            reason,
            dump: serial::dump(self.target, p),
        }
    }
}

/// Reference host policy over a byte-level executor: run up to 3 attempts
/// and accept iff any attempt reproduces the pre-minimization signal hash
/// on the target call.
pub struct HashOracle<B> {
    backend: B,
    expected_hash: u32,
    attempts: u32,
}

impl<B: ExecBackend> HashOracle<B> {
    pub fn new(backend: B, expected_hash: u32) -> Self {
        Self {
            backend,
            expected_hash,
            attempts: 3,
        }
    }
}

impl<B: ExecBackend> EquivalenceOracle for HashOracle<B> {
    fn evaluate(
        &mut self,
        p: &Program,
        call_index: Option<usize>,
        _step: StepKind,
    ) -> Result<Verdict, ExecError> {
        let bytes =
            serial::serialize(p).map_err(|e| ExecError::Infrastructure(e.to_string()))?;
        let mut telemetry = None;
        for _ in 0..self.attempts {
            let summary = self.backend.exec(&bytes, call_index)?;
            if !summary.per_call_cov_hash.is_empty() {
                telemetry = Some(Telemetry {
                    per_call_cov_hash: summary.per_call_cov_hash.clone(),
                    execution_reached: summary.completed,
                });
            }
            if summary.signal_hash == self.expected_hash {
                return Ok(Verdict {
                    equivalent: true,
                    telemetry,
                });
            }
        }
        Ok(Verdict {
            equivalent: false,
            telemetry,
        })
    }
}
