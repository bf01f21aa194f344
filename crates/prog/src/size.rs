//! Size patcher: in-band length/offset fields and conditional fields.
//!
//! After any structural change to a call's argument tree the patcher
//! re-walks the tree, re-evaluates every conditional-field predicate, and
//! assigns every length/offset field the current concrete byte size of its
//! referent. A disabled conditional field keeps its slot (field order stays
//! aligned with the descriptor) but is reset to its default value and
//! contributes zero bytes to the enclosing struct.

use crate::types::{Field, Target, TypeKind};
use crate::{is_default, Arg, ArgPath, Call, ModelError, PathSeg, Program};
use serde::{Deserialize, Serialize};

/// Side-effect-free boolean expression over sibling and ancestor integer
/// values, evaluated with 64-bit unsigned arithmetic. Nonzero is true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// `value[a.b]`: integer value of a field, resolved innermost-out
    /// against the enclosing structs, then by name through nested ones.
    Value(Vec<String>),
    Literal(u64),
    /// Named constant from [`Target::consts`].
    Named(String),
    And(Box<Predicate>, Box<Predicate>),
    Eq(Box<Predicate>, Box<Predicate>),
    Ne(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    pub fn eval(&self, scope: &Scope<'_>) -> u64 {
        match self {
            Predicate::Value(path) => scope.lookup(path).unwrap_or(0),
            Predicate::Literal(v) => *v,
            Predicate::Named(name) => scope.target.consts.get(name).copied().unwrap_or(0),
            Predicate::And(l, r) => l.eval(scope) & r.eval(scope),
            Predicate::Eq(l, r) => u64::from(l.eval(scope) == r.eval(scope)),
            Predicate::Ne(l, r) => u64::from(l.eval(scope) != r.eval(scope)),
        }
    }

    pub fn holds(&self, scope: &Scope<'_>) -> bool {
        self.eval(scope) != 0
    }

    /// Parses the textual predicate form: `value[path]`, decimal and `0x`
    /// literals, constant names, `&`, `==`, `!=`, parentheses.
    pub fn parse(src: &str) -> Result<Predicate, ModelError> {
        let mut p = Parser {
            src: src.as_bytes(),
            pos: 0,
        };
        let expr = p.expr()?;
        p.skip_ws();
        if p.pos != p.src.len() {
            return Err(ModelError::Decode(format!(
                "trailing input in predicate at byte {}: {:?}",
                p.pos, src
            )));
        }
        Ok(expr)
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn eat(&mut self, tok: &str) -> bool {
        self.skip_ws();
        if self.src[self.pos..].starts_with(tok.as_bytes()) {
            self.pos += tok.len();
            true
        } else {
            false
        }
    }

    // expr := cmp ('&' cmp)*
    fn expr(&mut self) -> Result<Predicate, ModelError> {
        let mut lhs = self.cmp()?;
        loop {
            self.skip_ws();
            // `&` but not `&&`; the language only has the single form.
            if self.peek() == Some(b'&') {
                self.pos += 1;
                let rhs = self.cmp()?;
                lhs = Predicate::And(Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    // cmp := term (('==' | '!=') term)?
    fn cmp(&mut self) -> Result<Predicate, ModelError> {
        let lhs = self.term()?;
        if self.eat("==") {
            let rhs = self.term()?;
            Ok(Predicate::Eq(Box::new(lhs), Box::new(rhs)))
        } else if self.eat("!=") {
            let rhs = self.term()?;
            Ok(Predicate::Ne(Box::new(lhs), Box::new(rhs)))
        } else {
            Ok(lhs)
        }
    }

    fn term(&mut self) -> Result<Predicate, ModelError> {
        self.skip_ws();
        if self.eat("(") {
            let inner = self.expr()?;
            if !self.eat(")") {
                return Err(ModelError::Decode("expected `)` in predicate".into()));
            }
            return Ok(inner);
        }
        if self.eat("value[") {
            let start = self.pos;
            while self.peek().map_or(false, |c| c != b']') {
                self.pos += 1;
            }
            if !self.eat("]") {
                return Err(ModelError::Decode("expected `]` in predicate".into()));
            }
            let raw = std::str::from_utf8(&self.src[start..self.pos - 1])
                .map_err(|_| ModelError::Decode("non-utf8 predicate path".into()))?;
            let path: Vec<String> = raw
                .split('.')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if path.is_empty() {
                return Err(ModelError::Decode("empty predicate path".into()));
            }
            return Ok(Predicate::Value(path));
        }
        match self.peek() {
            Some(c) if c.is_ascii_digit() => self.literal(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                let start = self.pos;
                while self
                    .peek()
                    .map_or(false, |c| c.is_ascii_alphanumeric() || c == b'_')
                {
                    self.pos += 1;
                }
                let name = std::str::from_utf8(&self.src[start..self.pos])
                    .map_err(|_| ModelError::Decode("non-utf8 predicate name".into()))?;
                Ok(Predicate::Named(name.to_string()))
            }
            _ => Err(ModelError::Decode(format!(
                "unexpected input in predicate at byte {}",
                self.pos
            ))),
        }
    }

    fn literal(&mut self) -> Result<Predicate, ModelError> {
        let hex = self.eat("0x") || self.eat("0X");
        let start = self.pos;
        while self
            .peek()
            .map_or(false, |c| c.is_ascii_alphanumeric())
        {
            self.pos += 1;
        }
        let digits = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        let val = if hex {
            u64::from_str_radix(digits, 16)
        } else {
            digits.parse()
        }
        .map_err(|_| ModelError::Decode(format!("bad literal {:?} in predicate", digits)))?;
        Ok(Predicate::Literal(val))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }
}

/// Name-resolution scope for predicates: one frame per enclosing struct
/// (outermost = the call's parameter list).
pub struct Scope<'a> {
    pub target: &'a Target,
    frames: Vec<(&'a [Field], &'a [Arg])>,
}

impl<'a> Scope<'a> {
    pub fn new(target: &'a Target) -> Self {
        Scope {
            target,
            frames: Vec::new(),
        }
    }

    fn push(&mut self, fields: &'a [Field], args: &'a [Arg]) {
        self.frames.push((fields, args));
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn lookup(&self, path: &[String]) -> Option<u64> {
        let first = path.first()?;
        for (fields, args) in self.frames.iter().rev() {
            if let Some(j) = fields.iter().position(|f| &f.name == first) {
                return self.resolve(args.get(j)?, &path[1..]);
            }
        }
        None
    }

    fn resolve(&self, arg: &Arg, rest: &[String]) -> Option<u64> {
        if rest.is_empty() {
            return match arg {
                Arg::Const(c) => Some(c.val),
                Arg::Result(r) => Some(r.val),
                _ => None,
            };
        }
        match arg {
            Arg::Pointer(p) => self.resolve(p.pointee.as_deref()?, rest),
            Arg::Union(u) => self.resolve(&u.option, rest),
            Arg::Group(g) => match &self.target.ty(g.ty).kind {
                TypeKind::Struct { fields } => {
                    let j = fields.iter().position(|f| f.name == rest[0])?;
                    self.resolve(g.inner.get(j)?, &rest[1..])
                }
                _ => None,
            },
            _ => None,
        }
    }
}

/// Current byte size of an argument. Disabled conditional fields count as
/// zero inside structs.
fn byte_size<'a>(scope: &mut Scope<'a>, arg: &'a Arg) -> u64 {
    let target = scope.target;
    match arg {
        Arg::Const(c) => target.ty(c.ty).scalar_bytes().unwrap_or(0),
        Arg::Pointer(_) => target.ptr_size,
        Arg::Data(d) => d.data.len() as u64,
        Arg::Union(u) => byte_size(scope, &u.option),
        Arg::Result(r) => match target.ty(r.ty).kind {
            TypeKind::Resource { resource } => target.resource(resource).byte_size,
            _ => 0,
        },
        Arg::Group(g) => match &target.ty(g.ty).kind {
            TypeKind::Struct { fields } => group_size(scope, fields, &g.inner),
            _ => {
                let mut total = 0;
                for inner in &g.inner {
                    total += byte_size(scope, inner);
                }
                total
            }
        },
    }
}

fn group_size<'a>(scope: &mut Scope<'a>, fields: &'a [Field], args: &'a [Arg]) -> u64 {
    scope.push(fields, args);
    let mut total = 0;
    for (field, arg) in fields.iter().zip(args) {
        if field_active(scope, field) {
            total += byte_size(scope, arg);
        }
    }
    scope.pop();
    total
}

fn field_active(scope: &Scope<'_>, field: &Field) -> bool {
    match &field.condition {
        Some(cond) => cond.holds(scope),
        None => true,
    }
}

/// Computes the correct value of every length/offset field in `call`
/// without mutating it.
pub(crate) fn planned_sizes(target: &Target, call: &Call) -> Vec<(ArgPath, u64)> {
    let mut plan = Vec::new();
    let syscall = target.syscall(call.meta);
    let mut scope = Scope::new(target);
    plan_group(&mut scope, &syscall.args, &call.args, &mut Vec::new(), &mut plan);
    plan
}

/// Re-assigns every length/offset field in `call` to the current byte size
/// (or byte offset) of its referent.
pub fn assign_sizes(target: &Target, call: &mut Call) {
    for (path, val) in planned_sizes(target, call) {
        if let Some(Arg::Const(c)) = call.arg_at_mut(&path) {
            c.val = val;
        }
    }
}

fn plan_group<'a>(
    scope: &mut Scope<'a>,
    fields: &'a [Field],
    args: &'a [Arg],
    base: &mut ArgPath,
    plan: &mut Vec<(ArgPath, u64)>,
) {
    let target = scope.target;
    scope.push(fields, args);
    for (i, field) in fields.iter().enumerate() {
        if let TypeKind::Len { path, is_offset, .. } = &target.ty(field.ty).kind {
            let val = len_value(scope, fields, args, path, *is_offset);
            let mut at = base.clone();
            at.push(PathSeg::Index(i));
            plan.push((at, val));
        }
    }
    for (i, arg) in args.iter().enumerate() {
        base.push(PathSeg::Index(i));
        descend(scope, arg, base, plan);
        base.pop();
    }
    scope.pop();
}

fn len_value<'a>(
    scope: &mut Scope<'a>,
    fields: &'a [Field],
    args: &'a [Arg],
    path: &[String],
    is_offset: bool,
) -> u64 {
    let Some(name) = path.first() else { return 0 };
    if name == "parent" {
        // Size of the enclosing group itself.
        let mut total = 0;
        for (field, arg) in fields.iter().zip(args) {
            if field_active(scope, field) {
                total += byte_size(scope, arg);
            }
        }
        return total;
    }
    let Some(j) = fields.iter().position(|f| &f.name == name) else {
        return 0;
    };
    if is_offset {
        let mut off = 0;
        for (field, arg) in fields.iter().zip(args).take(j) {
            if field_active(scope, field) {
                off += byte_size(scope, arg);
            }
        }
        off
    } else if field_active(scope, &fields[j]) {
        byte_size(scope, &args[j])
    } else {
        0
    }
}

fn descend<'a>(
    scope: &mut Scope<'a>,
    arg: &'a Arg,
    base: &mut ArgPath,
    plan: &mut Vec<(ArgPath, u64)>,
) {
    let target = scope.target;
    match arg {
        Arg::Group(g) => match &target.ty(g.ty).kind {
            TypeKind::Struct { fields } => plan_group(scope, fields, &g.inner, base, plan),
            _ => {
                for (i, inner) in g.inner.iter().enumerate() {
                    base.push(PathSeg::Index(i));
                    descend(scope, inner, base, plan);
                    base.pop();
                }
            }
        },
        Arg::Pointer(p) => {
            if let Some(inner) = p.pointee.as_deref() {
                base.push(PathSeg::Deref);
                descend(scope, inner, base, plan);
                base.pop();
            }
        }
        Arg::Union(u) => {
            base.push(PathSeg::Chosen);
            descend(scope, &u.option, base, plan);
            base.pop();
        }
        _ => {}
    }
}

/// Re-evaluates every conditional-field predicate in call `call_idx` and
/// resets fields whose predicate is false to their default value. Returns
/// whether anything was re-shaped; the argument-level minimizer restarts its
/// path memoization on `true`.
pub fn set_default_conditions(target: &Target, p: &mut Program, call_idx: usize) -> bool {
    let mut disabled: Vec<ArgPath> = Vec::new();
    {
        let call = &p.calls[call_idx];
        let syscall = target.syscall(call.meta);
        let mut scope = Scope::new(target);
        plan_conditions(
            &mut scope,
            &syscall.args,
            &call.args,
            &mut Vec::new(),
            &mut disabled,
        );
    }
    if disabled.is_empty() {
        return false;
    }
    for path in &disabled {
        let (ty, dir) = match p.calls[call_idx].arg_at(path) {
            Some(arg) => (arg.ty(), arg.dir()),
            None => continue,
        };
        let fresh = p.default_arg(target, ty, dir);
        // replace_arg cleans up any resource edges inside the old subtree.
        let _ = p.replace_arg(target, call_idx, path, fresh);
    }
    true
}

fn plan_conditions<'a>(
    scope: &mut Scope<'a>,
    fields: &'a [Field],
    args: &'a [Arg],
    base: &mut ArgPath,
    disabled: &mut Vec<ArgPath>,
) {
    scope.push(fields, args);
    for (i, (field, arg)) in fields.iter().zip(args).enumerate() {
        if let Some(cond) = &field.condition {
            if !cond.holds(scope) && !is_default(scope.target, arg) {
                let mut at = base.clone();
                at.push(PathSeg::Index(i));
                disabled.push(at);
            }
        }
    }
    for (i, arg) in args.iter().enumerate() {
        base.push(PathSeg::Index(i));
        descend_conditions(scope, arg, base, disabled);
        base.pop();
    }
    scope.pop();
}

fn descend_conditions<'a>(
    scope: &mut Scope<'a>,
    arg: &'a Arg,
    base: &mut ArgPath,
    disabled: &mut Vec<ArgPath>,
) {
    let target = scope.target;
    match arg {
        Arg::Group(g) => match &target.ty(g.ty).kind {
            TypeKind::Struct { fields } => plan_conditions(scope, fields, &g.inner, base, disabled),
            _ => {
                for (i, inner) in g.inner.iter().enumerate() {
                    base.push(PathSeg::Index(i));
                    descend_conditions(scope, inner, base, disabled);
                    base.pop();
                }
            }
        },
        Arg::Pointer(p) => {
            if let Some(inner) = p.pointee.as_deref() {
                base.push(PathSeg::Deref);
                descend_conditions(scope, inner, base, disabled);
                base.pop();
            }
        }
        Arg::Union(u) => {
            base.push(PathSeg::Chosen);
            descend_conditions(scope, &u.option, base, disabled);
            base.pop();
        }
        _ => {}
    }
}

/// Full patch pass for one call: conditions first (shape), then sizes.
pub fn patch_call(target: &Target, p: &mut Program, call_idx: usize) -> bool {
    let patched = set_default_conditions(target, p, call_idx);
    assign_sizes(target, &mut p.calls[call_idx]);
    patched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::{Arg, PathSeg, Program};

    #[test]
    fn test_parse_roundtrip_shapes() {
        let p = Predicate::parse("value[kind] == 1").unwrap();
        assert_eq!(
            p,
            Predicate::Eq(
                Box::new(Predicate::Value(vec!["kind".into()])),
                Box::new(Predicate::Literal(1)),
            )
        );

        let p = Predicate::parse("(value[hdr.mode] & 0x4) != FLAG_X").unwrap();
        assert_eq!(
            p,
            Predicate::Ne(
                Box::new(Predicate::And(
                    Box::new(Predicate::Value(vec!["hdr".into(), "mode".into()])),
                    Box::new(Predicate::Literal(4)),
                )),
                Box::new(Predicate::Named("FLAG_X".into())),
            )
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Predicate::parse("value[").is_err());
        assert!(Predicate::parse("1 == ").is_err());
        assert!(Predicate::parse("(1 == 2").is_err());
        assert!(Predicate::parse("1 2").is_err());
    }

    #[test]
    fn test_assign_sizes_struct_len() {
        let target = testing::test_target();
        let mut p = Program::new();
        let idx = testing::push_call(&target, &mut p, "sized_rec");

        // Grow the payload, then re-patch: the len field must follow.
        let payload = vec![PathSeg::Index(0), PathSeg::Deref, PathSeg::Index(1)];
        match p.calls[idx].arg_at_mut(&payload) {
            Some(Arg::Data(d)) => d.data = vec![7; 13],
            other => panic!("unexpected arg {:?}", other),
        }
        assign_sizes(&target, &mut p.calls[idx]);

        let len_field = vec![PathSeg::Index(0), PathSeg::Deref, PathSeg::Index(0)];
        match p.calls[idx].arg_at(&len_field) {
            Some(Arg::Const(c)) => assert_eq!(c.val, 13),
            other => panic!("unexpected arg {:?}", other),
        }
    }

    #[test]
    fn test_conditional_field_disabled_and_sized() {
        let target = testing::test_target();
        let mut p = Program::new();
        let idx = testing::push_call(&target, &mut p, "cond_msg");

        let kind = vec![PathSeg::Index(0), PathSeg::Deref, PathSeg::Index(0)];
        let big = vec![PathSeg::Index(0), PathSeg::Deref, PathSeg::Index(1)];

        // kind == 1 enables `big`; give it a non-default value.
        match p.calls[idx].arg_at_mut(&kind) {
            Some(Arg::Const(c)) => c.val = 1,
            other => panic!("unexpected arg {:?}", other),
        }
        match p.calls[idx].arg_at_mut(&big) {
            Some(Arg::Const(c)) => c.val = 0xdead,
            other => panic!("unexpected arg {:?}", other),
        }
        assert!(!set_default_conditions(&target, &mut p, idx));

        // Flip kind: the predicate goes false and `big` must be reset.
        match p.calls[idx].arg_at_mut(&kind) {
            Some(Arg::Const(c)) => c.val = 0,
            other => panic!("unexpected arg {:?}", other),
        }
        assert!(set_default_conditions(&target, &mut p, idx));
        match p.calls[idx].arg_at(&big) {
            Some(Arg::Const(c)) => assert_eq!(c.val, 0),
            other => panic!("unexpected arg {:?}", other),
        }
        // Second pass is a no-op.
        assert!(!set_default_conditions(&target, &mut p, idx));
    }

    #[test]
    fn test_disabled_field_counts_zero_bytes() {
        let target = testing::test_target();
        let mut p = Program::new();
        let idx = testing::push_call(&target, &mut p, "cond_msg");

        let kind = vec![PathSeg::Index(0), PathSeg::Deref, PathSeg::Index(0)];
        let total = vec![PathSeg::Index(0), PathSeg::Deref, PathSeg::Index(2)];

        // kind == 0: `big` disabled, struct spans kind (4) + total (4).
        assign_sizes(&target, &mut p.calls[idx]);
        match p.calls[idx].arg_at(&total) {
            Some(Arg::Const(c)) => assert_eq!(c.val, 8),
            other => panic!("unexpected arg {:?}", other),
        }

        // kind == 1: `big` participates (8 more bytes).
        match p.calls[idx].arg_at_mut(&kind) {
            Some(Arg::Const(c)) => c.val = 1,
            other => panic!("unexpected arg {:?}", other),
        }
        assign_sizes(&target, &mut p.calls[idx]);
        match p.calls[idx].arg_at(&total) {
            Some(Arg::Const(c)) => assert_eq!(c.val, 16),
            other => panic!("unexpected arg {:?}", other),
        }
    }
}
