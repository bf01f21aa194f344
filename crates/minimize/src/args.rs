//! Argument-level minimization: depth-first, path-memoized shrinking.
//!
//! Each pass walks the call's argument tree to find the first applicable
//! untried shrink step, applies it to a fresh clone of the baseline, and
//! asks the oracle. A commit replaces the baseline and the walk restarts
//! from the root; `tried_paths` keys (`-field-3`-style strings, `>` for
//! pointee removal, `*` for the whole-array empty step) guarantee every
//! step is attempted at most once, which bounds the search.

use crate::{MinimizeError, Session};
use oracle::StepKind;
use prog::size;
use prog::{
    const_default, Arg, ArgPath, ArrayKind, BufferKind, Call, Dir, PathSeg, Program, TypeKind,
};
use std::collections::HashSet;

/// Filename buffers are padded to special lengths (PATH_MAX and friends)
/// with this byte; trimming strips it together with NULs.
const FILENAME_PAD: u8 = b'a';

#[derive(Debug)]
struct Planned {
    key: String,
    path: ArgPath,
    step: Step,
}

#[derive(Debug)]
enum Step {
    RemovePointee,
    EmptyArray,
    RemoveElem(usize),
    ResetConst,
    ClearResult,
    TrimBlob { min: u64 },
    TrimFilename { trimmed: Vec<u8> },
}

enum Outcome {
    Committed { patched: bool },
    Rejected,
}

/// Shrinks every argument of call `call_idx` to a local fixpoint.
pub(crate) fn minimize_call(
    s: &mut Session<'_>,
    p0: &mut Program,
    k0: Option<usize>,
    call_idx: usize,
) -> Result<(), MinimizeError> {
    let mut tried: HashSet<String> = HashSet::new();
    loop {
        let Some(plan) = plan_next(s, &p0.calls[call_idx], &mut tried)? else {
            break;
        };
        let mut p = p0.clone();
        let outcome = apply(s, &mut p, k0, call_idx, &plan)?;
        tried.insert(plan.key);
        match outcome {
            Outcome::Committed { patched } => {
                *p0 = p;
                if patched {
                    // A conditional-field patch re-shapes the tree; the
                    // memoized paths no longer mean what they meant.
                    tried.clear();
                }
            }
            Outcome::Rejected => {}
        }
    }
    Ok(())
}

/// Finds the first applicable untried shrink step in declaration order.
/// Subtrees that cannot yield a step are memoized so later passes skip
/// them at the entry check.
fn plan_next(
    s: &Session<'_>,
    call: &Call,
    tried: &mut HashSet<String>,
) -> Result<Option<Planned>, MinimizeError> {
    let syscall = s.target().syscall(call.meta);
    for (i, field) in syscall.args.iter().enumerate() {
        let mut path = vec![PathSeg::Index(i)];
        let key = format!("-{}", field.name);
        if let Some(plan) = walk(s, &call.args[i], key, &mut path, tried)? {
            return Ok(Some(plan));
        }
    }
    Ok(None)
}

fn walk(
    s: &Session<'_>,
    arg: &Arg,
    key: String,
    path: &mut ArgPath,
    tried: &mut HashSet<String>,
) -> Result<Option<Planned>, MinimizeError> {
    if tried.contains(&key) {
        return Ok(None);
    }
    let target = s.target();
    let crash = s.crash();
    let desc = target.ty(arg.ty());

    let planned: Option<Planned> = match (arg, &desc.kind) {
        (Arg::Group(g), TypeKind::Struct { fields }) => {
            for (i, (field, inner)) in fields.iter().zip(&g.inner).enumerate() {
                let child_key = format!("{}-{}", key, field.name);
                path.push(PathSeg::Index(i));
                let found = walk(s, inner, child_key, path, tried)?;
                path.pop();
                if found.is_some() {
                    return Ok(found);
                }
            }
            None
        }

        (Arg::Union(u), TypeKind::Union { options }) => {
            let child_key = format!("{}-{}", key, options[u.index].name);
            path.push(PathSeg::Chosen);
            let found = walk(s, &u.option, child_key, path, tried)?;
            path.pop();
            if found.is_some() {
                return Ok(found);
            }
            None
        }

        (Arg::Pointer(pa), TypeKind::Ptr { .. }) => match pa.pointee.as_deref() {
            None => None,
            Some(pointee) => {
                let null_key = format!("{}>", key);
                if !tried.contains(&null_key) {
                    Some(Planned {
                        key: null_key,
                        path: path.clone(),
                        step: Step::RemovePointee,
                    })
                } else {
                    let child_key = format!("{}-", key);
                    path.push(PathSeg::Deref);
                    let found = walk(s, pointee, child_key, path, tried)?;
                    path.pop();
                    if found.is_some() {
                        return Ok(found);
                    }
                    None
                }
            }
        },

        (Arg::Group(g), TypeKind::Array { kind, .. }) => {
            let low_bound = match kind {
                ArrayKind::Fixed(_) => None,
                ArrayKind::RandLen => Some(0),
                ArrayKind::RangeLen { begin, .. } => Some(*begin),
            };
            if let Some(low) = low_bound {
                // Whole-array empty first: with several removable elements
                // this saves one oracle call per element. Unlike the
                // per-element loop below, this fires in crash mode too.
                let empty_key = format!("{}*", key);
                if low == 0 && g.inner.len() >= 3 && !tried.contains(&empty_key) {
                    return Ok(Some(Planned {
                        key: empty_key,
                        path: path.clone(),
                        step: Step::EmptyArray,
                    }));
                }
                for i in (0..g.inner.len()).rev() {
                    let elem_key = format!("{}-{}", key, i);
                    if !crash && !tried.contains(&elem_key) && g.inner.len() as u64 > low {
                        return Ok(Some(Planned {
                            key: elem_key,
                            path: path.clone(),
                            step: Step::RemoveElem(i),
                        }));
                    }
                    let child_key = format!("{}-", elem_key);
                    path.push(PathSeg::Index(i));
                    let found = walk(s, &g.inner[i], child_key, path, tried)?;
                    path.pop();
                    if found.is_some() {
                        return Ok(found);
                    }
                }
                None
            } else {
                // Fixed-length arrays are only recursed into.
                for i in (0..g.inner.len()).rev() {
                    let child_key = format!("{}-{}-", key, i);
                    path.push(PathSeg::Index(i));
                    let found = walk(s, &g.inner[i], child_key, path, tried)?;
                    path.pop();
                    if found.is_some() {
                        return Ok(found);
                    }
                }
                None
            }
        }

        (Arg::Const(_), TypeKind::Len { .. }) => None,

        (Arg::Const(c), TypeKind::Int { .. }) | (Arg::Const(c), TypeKind::Flags { .. }) => {
            plan_const(target, crash, c, &key, path)
        }

        (Arg::Const(c), TypeKind::Proc { .. }) => {
            // 0 usually collides PID value ranges; only shrink process ids
            // explicitly marked optional.
            if desc.optional {
                plan_const(target, crash, c, &key, path)
            } else {
                None
            }
        }

        (Arg::Result(r), TypeKind::Resource { .. }) => {
            if crash || r.producer.is_none() {
                None
            } else {
                Some(Planned {
                    key: key.clone(),
                    path: path.clone(),
                    step: Step::ClearResult,
                })
            }
        }

        (Arg::Data(d), TypeKind::Buffer(kind)) => {
            if arg.dir() == Dir::Out {
                None
            } else {
                match kind {
                    BufferKind::Compressed => {
                        return Err(MinimizeError::Invariant(format!(
                            "shrinking compressed buffer {}; such calls carry no_minimize",
                            desc.name
                        )));
                    }
                    BufferKind::BlobRand => plan_blob(d, 0, &key, path),
                    BufferKind::BlobRange { begin, .. } => plan_blob(d, *begin, &key, path),
                    BufferKind::Filename { no_terminator } => {
                        let mut trimmed = d.data.clone();
                        while trimmed
                            .last()
                            .map_or(false, |&b| b == FILENAME_PAD || b == 0)
                        {
                            trimmed.pop();
                        }
                        if !no_terminator {
                            trimmed.push(0);
                        }
                        if trimmed == d.data {
                            None
                        } else {
                            Some(Planned {
                                key: key.clone(),
                                path: path.clone(),
                                step: Step::TrimFilename { trimmed },
                            })
                        }
                    }
                }
            }
        }

        // Variant/descriptor mismatches are caught by validation before any
        // oracle query; nothing to shrink here.
        _ => None,
    };

    match planned {
        Some(plan) => Ok(Some(plan)),
        None => {
            tried.insert(key);
            Ok(None)
        }
    }
}

fn plan_const(
    target: &prog::Target,
    crash: bool,
    c: &prog::ConstArg,
    key: &str,
    path: &ArgPath,
) -> Option<Planned> {
    if crash || c.val == const_default(target, c.ty) {
        return None;
    }
    Some(Planned {
        key: key.to_string(),
        path: path.clone(),
        step: Step::ResetConst,
    })
}

fn plan_blob(d: &prog::DataArg, min: u64, key: &str, path: &ArgPath) -> Option<Planned> {
    if d.data.len() as u64 > min {
        Some(Planned {
            key: key.to_string(),
            path: path.clone(),
            step: Step::TrimBlob { min },
        })
    } else {
        None
    }
}

fn stale(plan: &Planned) -> MinimizeError {
    MinimizeError::StaleIteration(format!("planned step {:?} no longer fits the tree", plan))
}

fn apply(
    s: &mut Session<'_>,
    p: &mut Program,
    k0: Option<usize>,
    call_idx: usize,
    plan: &Planned,
) -> Result<Outcome, MinimizeError> {
    let target = s.target();
    match &plan.step {
        Step::RemovePointee => {
            let removed = {
                let Some(Arg::Pointer(pa)) = p.calls[call_idx].arg_at_mut(&plan.path) else {
                    return Err(stale(plan));
                };
                pa.addr = target.special_pointers[0];
                pa.pointee.take()
            };
            if let Some(old) = removed {
                p.detach_cleanup(target, &old);
            }
            size::assign_sizes(target, &mut p.calls[call_idx]);
            commit_if(s, p, k0)
        }

        Step::EmptyArray => {
            let removed: Vec<Arg> = {
                let Some(Arg::Group(g)) = p.calls[call_idx].arg_at_mut(&plan.path) else {
                    return Err(stale(plan));
                };
                g.inner.drain(..).collect()
            };
            for old in &removed {
                p.detach_cleanup(target, old);
            }
            size::assign_sizes(target, &mut p.calls[call_idx]);
            commit_if(s, p, k0)
        }

        Step::RemoveElem(i) => {
            let removed = {
                let Some(Arg::Group(g)) = p.calls[call_idx].arg_at_mut(&plan.path) else {
                    return Err(stale(plan));
                };
                if *i >= g.inner.len() {
                    return Err(stale(plan));
                }
                g.inner.remove(*i)
            };
            p.detach_cleanup(target, &removed);
            size::assign_sizes(target, &mut p.calls[call_idx]);
            commit_if(s, p, k0)
        }

        Step::ResetConst => {
            {
                let Some(Arg::Const(c)) = p.calls[call_idx].arg_at_mut(&plan.path) else {
                    return Err(stale(plan));
                };
                c.val = const_default(target, c.ty);
            }
            // Mutating an integer can flip conditional fields; when it
            // does, the walk restarts with fresh memoization either way.
            let patched = size::set_default_conditions(target, p, call_idx);
            if s.check(p, k0, StepKind::ArgLevel)? {
                Ok(Outcome::Committed { patched })
            } else {
                Ok(Outcome::Rejected)
            }
        }

        Step::ClearResult => {
            if !p.clear_producer(target, call_idx, &plan.path) {
                return Err(stale(plan));
            }
            commit_if(s, p, k0)
        }

        Step::TrimBlob { min } => {
            let original: Vec<u8> = match p.calls[call_idx].arg_at(&plan.path) {
                Some(Arg::Data(d)) => d.data.clone(),
                _ => return Err(stale(plan)),
            };
            let min = *min;
            let len0 = original.len() as u64;
            let mut len = len0;
            let mut step = len.saturating_sub(min);
            while len > min && step > 0 {
                if len - step >= min {
                    let shorter = len - step;
                    set_data(p, call_idx, &plan.path, &original[..shorter as usize], plan)?;
                    size::assign_sizes(target, &mut p.calls[call_idx]);
                    if s.check(p, k0, StepKind::ArgLevel)? {
                        len = shorter;
                        continue;
                    }
                    set_data(p, call_idx, &plan.path, &original[..len as usize], plan)?;
                    size::assign_sizes(target, &mut p.calls[call_idx]);
                }
                step /= 2;
                if s.crash() {
                    break;
                }
            }
            if len != len0 {
                Ok(Outcome::Committed { patched: false })
            } else {
                Ok(Outcome::Rejected)
            }
        }

        Step::TrimFilename { trimmed } => {
            set_data(p, call_idx, &plan.path, trimmed, plan)?;
            size::assign_sizes(target, &mut p.calls[call_idx]);
            commit_if(s, p, k0)
        }
    }
}

fn commit_if(
    s: &mut Session<'_>,
    p: &mut Program,
    k0: Option<usize>,
) -> Result<Outcome, MinimizeError> {
    if s.check(p, k0, StepKind::ArgLevel)? {
        Ok(Outcome::Committed { patched: false })
    } else {
        Ok(Outcome::Rejected)
    }
}

fn set_data(
    p: &mut Program,
    call_idx: usize,
    path: &[PathSeg],
    bytes: &[u8],
    plan: &Planned,
) -> Result<(), MinimizeError> {
    match p.calls[call_idx].arg_at_mut(path) {
        Some(Arg::Data(d)) => {
            d.data = bytes.to_vec();
            Ok(())
        }
        _ => Err(stale(plan)),
    }
}
