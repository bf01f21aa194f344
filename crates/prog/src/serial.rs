//! Committed-program serialization and diagnostic dumps.
//!
//! The wire form is `serde_json`; the engine only requires that
//! serialize ∘ deserialize is the identity on any program it commits. The
//! textual dump is for logs and invariant-violation diagnostics only and is
//! never parsed back.

use crate::{Arg, Call, ModelError, Program, Target};
use std::fmt::Write;

/// Encodes a program to its committed wire form.
pub fn serialize(p: &Program) -> Result<Vec<u8>, ModelError> {
    serde_json::to_vec(p).map_err(|e| ModelError::Encode(e.to_string()))
}

/// Decodes a program from its committed wire form.
pub fn deserialize(bytes: &[u8]) -> Result<Program, ModelError> {
    serde_json::from_slice(bytes).map_err(|e| ModelError::Decode(e.to_string()))
}

/// One-call-per-line textual rendering for diagnostics.
pub fn dump(target: &Target, p: &Program) -> String {
    let mut out = String::new();
    for (i, call) in p.calls.iter().enumerate() {
        let _ = write!(out, "{:>3}: ", i);
        render_call(&mut out, target, call);
        out.push('\n');
    }
    out
}

fn render_call(out: &mut String, target: &Target, call: &Call) {
    let name = &target.syscall(call.meta).name;
    let _ = write!(out, "{}(", name);
    for (j, arg) in call.args.iter().enumerate() {
        if j > 0 {
            out.push_str(", ");
        }
        render_arg(out, target, arg);
    }
    out.push(')');
    if let Some(ret) = &call.ret {
        let _ = write!(out, " -> res{}", ret.id);
    }
    if !call.props.is_default() {
        let _ = write!(
            out,
            " (fail_nth:{} async:{} rerun:{})",
            call.props.fail_nth, call.props.async_exec, call.props.rerun
        );
    }
}

fn render_arg(out: &mut String, target: &Target, arg: &Arg) {
    match arg {
        Arg::Const(c) => {
            let _ = write!(out, "0x{:x}", c.val);
        }
        Arg::Pointer(p) => match p.pointee.as_deref() {
            Some(inner) => {
                out.push('&');
                render_arg(out, target, inner);
            }
            None => {
                let _ = write!(out, "ptr[0x{:x}]", p.addr);
            }
        },
        Arg::Group(g) => {
            out.push('{');
            for (j, inner) in g.inner.iter().enumerate() {
                if j > 0 {
                    out.push_str(", ");
                }
                render_arg(out, target, inner);
            }
            out.push('}');
        }
        Arg::Union(u) => {
            let _ = write!(out, "@{}=", u.index);
            render_arg(out, target, &u.option);
        }
        Arg::Data(d) => {
            out.push('"');
            for b in d.data.iter().take(16) {
                let _ = write!(out, "{:02x}", b);
            }
            out.push('"');
            if d.data.len() > 16 {
                let _ = write!(out, "..({})", d.data.len());
            }
        }
        Arg::Result(r) => match r.producer {
            Some(pid) => {
                let _ = write!(out, "res<{}>", pid);
            }
            None => {
                let _ = write!(out, "0x{:x}", r.val);
            }
        },
    }
}
