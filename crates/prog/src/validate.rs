//! Structural validation of a program against its target.
//!
//! Run by the oracle adapter before every query. A failure here is an
//! engine bug, never an oracle verdict, and aborts the session.

use crate::size::planned_sizes;
use crate::types::{ArrayKind, Target, TypeKind};
use crate::{Arg, ArgId, Call, ModelError, Program};
use std::collections::HashMap;

/// Checks the resource graph, size fields, and tree/descriptor agreement.
pub fn validate(target: &Target, p: &Program) -> Result<(), ModelError> {
    for (ci, call) in p.calls.iter().enumerate() {
        if call.meta.0 as usize >= target.syscalls.len() {
            return Err(ModelError::Invariant(format!(
                "call {} references unknown syscall id {}",
                ci, call.meta.0
            )));
        }
        validate_shape(target, ci, call)?;
        validate_sizes(target, ci, call)?;
    }
    validate_resources(p)
}

fn validate_shape(target: &Target, ci: usize, call: &Call) -> Result<(), ModelError> {
    let syscall = target.syscall(call.meta);
    if call.args.len() != syscall.args.len() {
        return Err(ModelError::Invariant(format!(
            "call {} ({}) has {} args, schema declares {}",
            ci,
            syscall.name,
            call.args.len(),
            syscall.args.len()
        )));
    }
    for (field, arg) in syscall.args.iter().zip(&call.args) {
        check_arg(target, ci, arg, field.ty)?;
    }
    if let (Some(ret), Some(ret_ty)) = (&call.ret, syscall.ret) {
        if ret.ty != ret_ty {
            return Err(ModelError::Invariant(format!(
                "call {} ({}) return type mismatch",
                ci, syscall.name
            )));
        }
    }
    Ok(())
}

fn check_arg(target: &Target, ci: usize, arg: &Arg, expect: crate::TypeRef) -> Result<(), ModelError> {
    if arg.ty() != expect {
        return Err(ModelError::Invariant(format!(
            "call {}: argument type {:?} does not match declared {:?}",
            ci,
            arg.ty(),
            expect
        )));
    }
    let desc = target.ty(arg.ty());
    match (arg, &desc.kind) {
        (Arg::Const(_), TypeKind::Int { .. })
        | (Arg::Const(_), TypeKind::Flags { .. })
        | (Arg::Const(_), TypeKind::Proc { .. })
        | (Arg::Const(_), TypeKind::Len { .. })
        | (Arg::Data(_), TypeKind::Buffer(_))
        | (Arg::Result(_), TypeKind::Resource { .. }) => Ok(()),
        (Arg::Pointer(a), TypeKind::Ptr { elem }) => match a.pointee.as_deref() {
            Some(inner) => check_arg(target, ci, inner, *elem),
            None => Ok(()),
        },
        (Arg::Group(g), TypeKind::Struct { fields }) => {
            if g.inner.len() != fields.len() {
                return Err(ModelError::Invariant(format!(
                    "call {}: struct {} has {} fields, schema declares {}",
                    ci,
                    desc.name,
                    g.inner.len(),
                    fields.len()
                )));
            }
            for (field, inner) in fields.iter().zip(&g.inner) {
                check_arg(target, ci, inner, field.ty)?;
            }
            Ok(())
        }
        (Arg::Group(g), TypeKind::Array { elem, kind }) => {
            let len = g.inner.len() as u64;
            match kind {
                ArrayKind::Fixed(n) if len != *n => {
                    return Err(ModelError::Invariant(format!(
                        "call {}: fixed array {} has {} elements, wants {}",
                        ci, desc.name, len, n
                    )));
                }
                ArrayKind::RangeLen { begin, end } => {
                    if len < *begin || (*end > 0 && len > *end) {
                        return Err(ModelError::Invariant(format!(
                            "call {}: array {} length {} outside [{}, {}]",
                            ci, desc.name, len, begin, end
                        )));
                    }
                }
                _ => {}
            }
            for inner in &g.inner {
                check_arg(target, ci, inner, *elem)?;
            }
            Ok(())
        }
        (Arg::Union(u), TypeKind::Union { options }) => {
            let field = options.get(u.index).ok_or_else(|| {
                ModelError::Invariant(format!(
                    "call {}: union {} option index {} out of range",
                    ci, desc.name, u.index
                ))
            })?;
            check_arg(target, ci, &u.option, field.ty)
        }
        _ => Err(ModelError::Invariant(format!(
            "call {}: argument variant does not match descriptor {}",
            ci, desc.name
        ))),
    }
}

fn validate_sizes(target: &Target, ci: usize, call: &Call) -> Result<(), ModelError> {
    for (path, want) in planned_sizes(target, call) {
        match call.arg_at(&path) {
            Some(Arg::Const(c)) if c.val == want => {}
            Some(Arg::Const(c)) => {
                return Err(ModelError::Invariant(format!(
                    "call {}: size field at {:?} holds {}, referent spans {}",
                    ci, path, c.val, want
                )));
            }
            _ => {
                return Err(ModelError::Invariant(format!(
                    "call {}: size field path {:?} does not resolve",
                    ci, path
                )));
            }
        }
    }
    Ok(())
}

fn validate_resources(p: &Program) -> Result<(), ModelError> {
    // id -> (call index, producer link, users)
    let mut index: HashMap<ArgId, (usize, Option<ArgId>, Vec<ArgId>)> = HashMap::new();
    let mut duplicate = None;
    p.foreach_result(|ci, r| {
        if index
            .insert(r.id, (ci, r.producer, r.uses.iter().copied().collect()))
            .is_some()
        {
            duplicate = Some(r.id);
        }
    });
    if let Some(id) = duplicate {
        return Err(ModelError::Invariant(format!(
            "result id {} appears more than once",
            id
        )));
    }

    for (&id, (ci, producer, uses)) in &index {
        if let Some(pid) = producer {
            let Some((pci, _, puses)) = index.get(pid) else {
                return Err(ModelError::Invariant(format!(
                    "result {} references missing producer {}",
                    id, pid
                )));
            };
            if pci >= ci {
                return Err(ModelError::Invariant(format!(
                    "result {} (call {}) consumes producer {} from call {} (not earlier)",
                    id, ci, pid, pci
                )));
            }
            if !puses.contains(&id) {
                return Err(ModelError::Invariant(format!(
                    "producer {} reverse set misses consumer {}",
                    pid, id
                )));
            }
        }
        for uid in uses {
            match index.get(uid) {
                Some((_, Some(back), _)) if *back == id => {}
                _ => {
                    return Err(ModelError::Invariant(format!(
                        "producer {} lists consumer {} that does not point back",
                        id, uid
                    )));
                }
            }
        }
    }
    Ok(())
}
