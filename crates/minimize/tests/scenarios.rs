//! End-to-end minimization scenarios on the built-in test target.

use influence::InfluenceMatrix;
use minimize::{MinimizeOutcome, MinimizeRequest, Session, SessionFailure};
use oracle::{EquivalenceOracle, OracleAdapter, StepKind, Telemetry, Verdict};
use prog::{testing, Arg, PathSeg, Program, Target};
use syzmini::traits::ExecError;

/// Oracle driven by a plain predicate, optionally reporting fixed
/// telemetry with every verdict.
struct TestOracle<F> {
    pred: F,
    telemetry: Option<Telemetry>,
}

impl<F: FnMut(&Program, Option<usize>) -> bool> EquivalenceOracle for TestOracle<F> {
    fn evaluate(
        &mut self,
        p: &Program,
        k: Option<usize>,
        _step: StepKind,
    ) -> Result<Verdict, ExecError> {
        Ok(Verdict {
            equivalent: (self.pred)(p, k),
            telemetry: self.telemetry.clone(),
        })
    }
}

fn run_session<F>(
    target: &Target,
    matrix: Option<&InfluenceMatrix>,
    oracle: TestOracle<F>,
    request: MinimizeRequest,
) -> MinimizeOutcome
where
    F: FnMut(&Program, Option<usize>) -> bool,
{
    let adapter = OracleAdapter::new(target, Box::new(oracle));
    let mut session = Session::new(target, adapter);
    if let Some(m) = matrix {
        session = session.with_influence(m);
    }
    session.minimize(request)
}

/// Accept iff the target call is a `use_r` whose handle is still wired to a
/// producer; models "coverage hash of the target call is unchanged".
fn wired_use_r(target: &Target) -> impl FnMut(&Program, Option<usize>) -> bool + '_ {
    move |p, k| {
        let Some(k) = k else { return false };
        let Some(call) = p.calls.get(k) else { return false };
        if target.syscall(call.meta).name != "use_r" {
            return false;
        }
        matches!(call.args.first(), Some(Arg::Result(r)) if r.producer.is_some())
    }
}

fn request(p: Program, k: usize) -> MinimizeRequest {
    MinimizeRequest {
        program: p,
        call_index: Some(k),
        crash: false,
        baseline_telemetry: None,
    }
}

#[test]
fn scenario_suffix_drop() {
    let target = testing::test_target();
    let matrix = InfluenceMatrix::analyze_static(&target);

    let mut p0 = Program::new();
    let open = testing::push_call(&target, &mut p0, "open_r");
    let use_r = testing::push_call(&target, &mut p0, "use_r");
    testing::bind_resource(&mut p0, open, use_r, &[PathSeg::Index(0)]);
    testing::push_call(&target, &mut p0, "noop");
    testing::push_call(&target, &mut p0, "noop");

    let oracle = TestOracle {
        pred: wired_use_r(&target),
        telemetry: None,
    };
    let out = run_session(&target, Some(&matrix), oracle, request(p0, 1));

    assert!(out.failure.is_none());
    assert_eq!(out.call_index, Some(1));
    assert_eq!(out.program.calls.len(), 2);
    assert_eq!(target.syscall(out.program.calls[0].meta).name, "open_r");
    assert_eq!(target.syscall(out.program.calls[1].meta).name, "use_r");
    // Stage A accepts the bulk suffix drop, stage C rejects dropping the
    // producer; the influence closure keeps stage B silent.
    assert_eq!(out.stats.call_level, 2);
}

#[test]
fn scenario_influence_guided_prefix_drop() {
    let target = testing::test_target();
    let matrix = InfluenceMatrix::analyze_static(&target);

    let mut p0 = Program::new();
    testing::push_call(&target, &mut p0, "noop");
    testing::push_call(&target, &mut p0, "mk_f");
    let open = testing::push_call(&target, &mut p0, "open_r");
    let use_r = testing::push_call(&target, &mut p0, "use_r");
    testing::bind_resource(&mut p0, open, use_r, &[PathSeg::Index(0)]);

    let oracle = TestOracle {
        pred: wired_use_r(&target),
        telemetry: None,
    };
    let out = run_session(&target, Some(&matrix), oracle, request(p0, 3));

    assert!(out.failure.is_none());
    assert_eq!(out.call_index, Some(1));
    assert_eq!(out.program.calls.len(), 2);
    assert_eq!(target.syscall(out.program.calls[0].meta).name, "open_r");
    assert_eq!(target.syscall(out.program.calls[1].meta).name, "use_r");
}

#[test]
fn scenario_dynamic_learning_on_rejected_removal() {
    let target = testing::test_target();
    let matrix = InfluenceMatrix::new(target.syscalls.len());
    let noop = target.syscall_by_name("noop").unwrap().id;
    let use_r = target.syscall_by_name("use_r").unwrap().id;
    assert!(!matrix.get(noop, use_r));

    let mut p0 = Program::new();
    testing::push_call(&target, &mut p0, "noop");
    testing::push_call(&target, &mut p0, "use_r");

    // Every removal is rejected; the candidate's telemetry disagrees with
    // the baseline hash one position to the right.
    let oracle = TestOracle {
        pred: |_p: &Program, _k: Option<usize>| false,
        telemetry: Some(Telemetry {
            per_call_cov_hash: vec![0x2222],
            execution_reached: true,
        }),
    };
    let out = run_session(
        &target,
        Some(&matrix),
        oracle,
        MinimizeRequest {
            program: p0.clone(),
            call_index: Some(1),
            crash: false,
            baseline_telemetry: Some(Telemetry {
                per_call_cov_hash: vec![0x3333, 0x1111],
                execution_reached: true,
            }),
        },
    );

    assert!(out.failure.is_none());
    assert!(out.influence_learned);
    assert!(matrix.get(noop, use_r));
    assert_eq!(out.program, p0);
    assert_eq!(out.call_index, Some(1));
}

#[test]
fn scenario_whole_array_empty() {
    let target = testing::test_target();

    let mut p0 = Program::new();
    let idx = testing::push_call(&target, &mut p0, "write_arr");
    match &mut p0.calls[idx].args[0] {
        Arg::Group(g) => {
            for v in 1..=5u64 {
                g.inner.push(Arg::Const(prog::ConstArg {
                    ty: element_type(&target, "arr_int32"),
                    dir: prog::Dir::In,
                    val: v,
                }));
            }
        }
        other => panic!("unexpected arg {:?}", other),
    }

    let oracle = TestOracle {
        pred: |_p: &Program, _k: Option<usize>| true,
        telemetry: None,
    };
    let out = run_session(&target, None, oracle, request(p0, 0));

    assert!(out.failure.is_none());
    match &out.program.calls[0].args[0] {
        Arg::Group(g) => assert!(g.inner.is_empty(), "array must be emptied in one step"),
        other => panic!("unexpected arg {:?}", other),
    }
    assert_eq!(out.stats.arg_level, 1, "single whole-array proposal");
}

#[test]
fn scenario_pointer_to_null() {
    let target = testing::test_target();

    let mut p0 = Program::new();
    let idx = testing::push_call(&target, &mut p0, "deref_int");
    let pointee = vec![PathSeg::Index(0), PathSeg::Deref];
    match p0.calls[idx].arg_at_mut(&pointee) {
        Some(Arg::Const(c)) => c.val = 7,
        other => panic!("unexpected arg {:?}", other),
    }

    let oracle = TestOracle {
        pred: |_p: &Program, _k: Option<usize>| true,
        telemetry: None,
    };
    let out = run_session(&target, None, oracle, request(p0, 0));

    assert!(out.failure.is_none());
    match &out.program.calls[0].args[0] {
        Arg::Pointer(p) => {
            assert!(p.pointee.is_none(), "pointee must be removed");
            assert_eq!(p.addr, target.special_pointers[0], "NULL sentinel");
        }
        other => panic!("unexpected arg {:?}", other),
    }
    assert_eq!(out.stats.arg_level, 1);
}

#[test]
fn scenario_blob_halving_converges() {
    let target = testing::test_target();

    let mut p0 = Program::new();
    let idx = testing::push_call(&target, &mut p0, "send_blob");
    match &mut p0.calls[idx].args[0] {
        Arg::Data(d) => d.data = vec![0xaa; 100],
        other => panic!("unexpected arg {:?}", other),
    }

    let oracle = TestOracle {
        pred: |p: &Program, _k: Option<usize>| {
            matches!(&p.calls[0].args[0], Arg::Data(d) if d.data.len() >= 40)
        },
        telemetry: None,
    };
    let out = run_session(&target, None, oracle, request(p0, 0));

    assert!(out.failure.is_none());
    match &out.program.calls[0].args[0] {
        Arg::Data(d) => assert_eq!(d.data.len(), 40, "halving must land on the bound"),
        other => panic!("unexpected arg {:?}", other),
    }
    // ceil(log2(90)) halvings plus a constant number of probes.
    assert!(
        out.stats.arg_level <= 14,
        "too many probes: {}",
        out.stats.arg_level
    );
}

#[test]
fn identical_oracle_responses_give_identical_output() {
    let target = testing::test_target();

    let build = || {
        let mut p = Program::new();
        let idx = testing::push_call(&target, &mut p, "send_blob");
        match &mut p.calls[idx].args[0] {
            Arg::Data(d) => d.data = vec![0x55; 100],
            other => panic!("unexpected arg {:?}", other),
        }
        p
    };
    let oracle = || TestOracle {
        pred: |p: &Program, _k: Option<usize>| {
            matches!(&p.calls[0].args[0], Arg::Data(d) if d.data.len() >= 37)
        },
        telemetry: None,
    };

    let a = run_session(&target, None, oracle(), request(build(), 0));
    let b = run_session(&target, None, oracle(), request(build(), 0));
    assert_eq!(a.program, b.program);
    assert_eq!(a.stats, b.stats);
}

#[test]
fn always_rejecting_oracle_returns_original() {
    let target = testing::test_target();
    let matrix = InfluenceMatrix::analyze_static(&target);

    let mut p0 = Program::new();
    let open = testing::push_call(&target, &mut p0, "open_r");
    let use_r = testing::push_call(&target, &mut p0, "use_r");
    testing::bind_resource(&mut p0, open, use_r, &[PathSeg::Index(0)]);
    testing::push_call(&target, &mut p0, "noop");

    let oracle = TestOracle {
        pred: |_p: &Program, _k: Option<usize>| false,
        telemetry: None,
    };
    let out = run_session(&target, Some(&matrix), oracle, request(p0.clone(), 1));

    assert!(out.failure.is_none());
    assert_eq!(out.program, p0);
    assert_eq!(out.call_index, Some(1));
    assert!(out.stats.total > 0);
}

#[test]
fn second_run_is_fixpoint() {
    let target = testing::test_target();

    let mut p0 = Program::new();
    let open = testing::push_call(&target, &mut p0, "open_r");
    let use_r = testing::push_call(&target, &mut p0, "use_r");
    testing::bind_resource(&mut p0, open, use_r, &[PathSeg::Index(0)]);
    testing::push_call(&target, &mut p0, "send_blob");

    let accept = || TestOracle {
        pred: |_p: &Program, _k: Option<usize>| true,
        telemetry: None,
    };
    let first = run_session(&target, None, accept(), request(p0, 1));
    assert!(first.failure.is_none());

    let second = run_session(
        &target,
        None,
        accept(),
        MinimizeRequest {
            program: first.program.clone(),
            call_index: first.call_index,
            crash: false,
            baseline_telemetry: None,
        },
    );
    assert!(second.failure.is_none());
    assert_eq!(second.program, first.program);
    assert_eq!(second.call_index, first.call_index);
}

#[test]
fn no_minimize_calls_survive_untouched() {
    let target = testing::test_target();

    let mut p0 = Program::new();
    testing::push_call(&target, &mut p0, "pack_blob");
    let open = testing::push_call(&target, &mut p0, "open_r");
    let use_r = testing::push_call(&target, &mut p0, "use_r");
    testing::bind_resource(&mut p0, open, use_r, &[PathSeg::Index(0)]);
    let packed_before = p0.calls[0].clone();

    let oracle = TestOracle {
        pred: |_p: &Program, _k: Option<usize>| true,
        telemetry: None,
    };
    let out = run_session(&target, None, oracle, request(p0, 2));

    assert!(out.failure.is_none());
    assert_eq!(
        target.syscall(out.program.calls[0].meta).name,
        "pack_blob",
        "no_minimize call must not be removed"
    );
    assert_eq!(out.program.calls[0], packed_before);
}

#[test]
fn crash_mode_still_empties_whole_array() {
    let target = testing::test_target();

    let mut p0 = Program::new();
    let arr = testing::push_call(&target, &mut p0, "write_arr");
    match &mut p0.calls[arr].args[0] {
        Arg::Group(g) => {
            for v in 1..=3u64 {
                g.inner.push(Arg::Const(prog::ConstArg {
                    ty: element_type(&target, "arr_int32"),
                    dir: prog::Dir::In,
                    val: v,
                }));
            }
        }
        other => panic!("unexpected arg {:?}", other),
    }

    let oracle = TestOracle {
        pred: |_p: &Program, _k: Option<usize>| true,
        telemetry: None,
    };
    let out = run_session(
        &target,
        None,
        oracle,
        MinimizeRequest {
            program: p0,
            call_index: Some(0),
            crash: true,
            baseline_telemetry: None,
        },
    );

    assert!(out.failure.is_none());
    // Crash mode disables per-element removal, not the whole-array empty
    // step: one proposal, committed.
    assert_eq!(out.stats.arg_level, 1);
    match &out.program.calls[0].args[0] {
        Arg::Group(g) => assert!(g.inner.is_empty()),
        other => panic!("unexpected arg {:?}", other),
    }
}

#[test]
fn crash_mode_suppresses_element_and_value_shrinking() {
    let target = testing::test_target();

    let mut p0 = Program::new();
    let open = testing::push_call(&target, &mut p0, "open_r");
    let use_r = testing::push_call(&target, &mut p0, "use_r");
    testing::bind_resource(&mut p0, open, use_r, &[PathSeg::Index(0)]);
    // Bounded array (low bound 2, so no whole-array empty) grown to 4.
    let arr = testing::push_call(&target, &mut p0, "write_bounded");
    match &mut p0.calls[arr].args[0] {
        Arg::Group(g) => {
            for v in [7u64, 8] {
                g.inner.push(Arg::Const(prog::ConstArg {
                    ty: element_type(&target, "arr_bounded"),
                    dir: prog::Dir::In,
                    val: v,
                }));
            }
        }
        other => panic!("unexpected arg {:?}", other),
    }
    let mode = testing::push_call(&target, &mut p0, "set_mode");
    match &mut p0.calls[mode].args[0] {
        Arg::Const(c) => c.val = 5,
        other => panic!("unexpected arg {:?}", other),
    }

    // With an always-rejecting oracle, any element/integer/flag/resource
    // proposal would show up as an argument-level query.
    let oracle = TestOracle {
        pred: |_p: &Program, _k: Option<usize>| false,
        telemetry: None,
    };
    let out = run_session(
        &target,
        None,
        oracle,
        MinimizeRequest {
            program: p0.clone(),
            call_index: Some(1),
            crash: true,
            baseline_telemetry: None,
        },
    );

    assert!(out.failure.is_none());
    assert_eq!(out.stats.arg_level, 0, "no argument shrinking in crash mode");
    assert_eq!(out.program, p0);
    match &out.program.calls[use_r].args[0] {
        Arg::Result(r) => assert!(r.producer.is_some(), "resource edge kept"),
        other => panic!("unexpected arg {:?}", other),
    }
}

#[test]
fn crash_mode_blob_halving_stops_after_first_reject() {
    let target = testing::test_target();

    let mut p0 = Program::new();
    let idx = testing::push_call(&target, &mut p0, "send_blob");
    match &mut p0.calls[idx].args[0] {
        Arg::Data(d) => d.data = vec![0xaa; 100],
        other => panic!("unexpected arg {:?}", other),
    }

    // The first probe trims to the range floor (10 bytes) and is rejected;
    // crash mode then abandons the halving instead of shrinking the step.
    let oracle = TestOracle {
        pred: |p: &Program, _k: Option<usize>| {
            matches!(&p.calls[0].args[0], Arg::Data(d) if d.data.len() >= 40)
        },
        telemetry: None,
    };
    let out = run_session(
        &target,
        None,
        oracle,
        MinimizeRequest {
            program: p0,
            call_index: Some(0),
            crash: true,
            baseline_telemetry: None,
        },
    );

    assert!(out.failure.is_none());
    assert_eq!(out.stats.arg_level, 1, "one probe, then stop");
    match &out.program.calls[0].args[0] {
        Arg::Data(d) => assert_eq!(d.data.len(), 100, "rejected trim restored"),
        other => panic!("unexpected arg {:?}", other),
    }
}

#[test]
fn bounded_array_respects_low_bound() {
    let target = testing::test_target();

    let mut p0 = Program::new();
    let idx = testing::push_call(&target, &mut p0, "write_bounded");
    match &mut p0.calls[idx].args[0] {
        Arg::Group(g) => {
            // Default length is the low bound (2); grow to 4.
            for v in [7u64, 8] {
                g.inner.push(Arg::Const(prog::ConstArg {
                    ty: element_type(&target, "arr_bounded"),
                    dir: prog::Dir::In,
                    val: v,
                }));
            }
        }
        other => panic!("unexpected arg {:?}", other),
    }

    let oracle = TestOracle {
        pred: |_p: &Program, _k: Option<usize>| true,
        telemetry: None,
    };
    let out = run_session(&target, None, oracle, request(p0, 0));

    assert!(out.failure.is_none());
    match &out.program.calls[0].args[0] {
        Arg::Group(g) => assert_eq!(g.inner.len(), 2, "RangeLen low bound must hold"),
        other => panic!("unexpected arg {:?}", other),
    }
}

#[test]
fn invariant_violation_aborts_with_original() {
    let target = testing::test_target();

    let mut p0 = Program::new();
    testing::push_call(&target, &mut p0, "noop");
    let use_r = testing::push_call(&target, &mut p0, "use_r");
    // Corrupt the graph: a producer id that exists nowhere.
    match &mut p0.calls[use_r].args[0] {
        Arg::Result(r) => r.producer = Some(9999),
        other => panic!("unexpected arg {:?}", other),
    }

    let oracle = TestOracle {
        pred: |_p: &Program, _k: Option<usize>| true,
        telemetry: None,
    };
    let out = run_session(&target, None, oracle, request(p0.clone(), 1));

    assert_eq!(out.failure, Some(SessionFailure::InvariantViolation));
    assert_eq!(out.program, p0, "abort must return the unmodified original");
    assert_eq!(out.call_index, Some(1));
}

fn element_type(target: &Target, array_name: &str) -> prog::TypeRef {
    let desc = target
        .types
        .iter()
        .find(|d| d.name == array_name)
        .unwrap_or_else(|| panic!("unknown type {}", array_name));
    match desc.kind {
        prog::TypeKind::Array { elem, .. } => elem,
        _ => panic!("{} is not an array type", array_name),
    }
}
