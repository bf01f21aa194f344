//! # Typed syscall-program model
//!
//! **Role**: the argument trees a minimization session mutates, plus the
//! resource graph linking result-producing calls to their users.
//!
//! **Core types**:
//! - [`Program`]: ordered calls, immutable once committed; proposals are
//!   built by cloning.
//! - [`Arg`]: tagged sum over the six argument variants (const, pointer,
//!   group, union, data, result).
//! - [`Target`]: shared immutable syscall/type/resource tables.
//!
//! **Design**:
//! - Resource back-references are stable numeric [`ArgId`]s with a
//!   producer-side reverse set, never owning references. Clones keep ids,
//!   so the graph survives deep copies without a re-stitching pass.
//! - Type descriptors live in a flat table addressed by `TypeRef`; argument
//!   trees are plain owned data and serialize with `serde`.

pub mod serial;
pub mod size;
pub mod testing;
pub mod types;
pub mod validate;

pub use types::{
    ArrayKind, BufferKind, CallAttrs, Dir, Field, ResourceDesc, Syscall, SyscallId, Target,
    TypeDesc, TypeKind, TypeRef,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Errors produced by the program model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A structural invariant does not hold (dangling resource reference,
    /// size-field disagreement, bad index). Fatal to a session.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Serialized form could not be decoded.
    #[error("malformed program: {0}")]
    Decode(String),

    /// Program could not be encoded.
    #[error("serialization failure: {0}")]
    Encode(String),
}

/// Program-unique identity of a result argument.
pub type ArgId = u64;

/// Per-call execution knobs. All-zero is "no special handling".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallProps {
    /// Fault-injection index; 0 = no injection.
    pub fail_nth: u64,
    /// Issue the call without waiting for completion.
    pub async_exec: bool,
    /// Re-execute the call this many times.
    pub rerun: u64,
}

impl CallProps {
    pub fn is_default(&self) -> bool {
        *self == CallProps::default()
    }
}

/// Integer-valued argument: integers, flag sets, process ids, length fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstArg {
    pub ty: TypeRef,
    pub dir: Dir,
    pub val: u64,
}

/// Pointer argument. `pointee == None` means one of the target's special
/// pointer values (`addr` holds it; index 0 of the table is NULL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerArg {
    pub ty: TypeRef,
    pub dir: Dir,
    pub addr: u64,
    pub pointee: Option<Box<Arg>>,
}

/// Ordered sequence of inner arguments; backs both structs and arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupArg {
    pub ty: TypeRef,
    pub dir: Dir,
    pub inner: Vec<Arg>,
}

/// One chosen option of a union. The tag is never mutated by shrinking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnionArg {
    pub ty: TypeRef,
    pub dir: Dir,
    pub index: usize,
    pub option: Box<Arg>,
}

/// Byte-vector argument; backs blob and filename buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataArg {
    pub ty: TypeRef,
    pub dir: Dir,
    pub data: Vec<u8>,
}

/// Resource handle. `producer` is a weak edge to the result argument that
/// created the handle; `uses` is the reverse set on the producing side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultArg {
    pub ty: TypeRef,
    pub dir: Dir,
    pub id: ArgId,
    pub val: u64,
    pub producer: Option<ArgId>,
    pub uses: BTreeSet<ArgId>,
}

/// A syscall argument tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Const(ConstArg),
    Pointer(PointerArg),
    Group(GroupArg),
    Union(UnionArg),
    Data(DataArg),
    Result(ResultArg),
}

impl Arg {
    pub fn ty(&self) -> TypeRef {
        match self {
            Arg::Const(a) => a.ty,
            Arg::Pointer(a) => a.ty,
            Arg::Group(a) => a.ty,
            Arg::Union(a) => a.ty,
            Arg::Data(a) => a.ty,
            Arg::Result(a) => a.ty,
        }
    }

    pub fn dir(&self) -> Dir {
        match self {
            Arg::Const(a) => a.dir,
            Arg::Pointer(a) => a.dir,
            Arg::Group(a) => a.dir,
            Arg::Union(a) => a.dir,
            Arg::Data(a) => a.dir,
            Arg::Result(a) => a.dir,
        }
    }
}

/// One step along an argument path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSeg {
    /// Child of a group (struct field or array element) or, as the first
    /// segment, a top-level parameter.
    Index(usize),
    /// Through a pointer into its pointee.
    Deref,
    /// Into the chosen option of a union.
    Chosen,
}

/// Path from a call's parameter list down to one argument.
pub type ArgPath = Vec<PathSeg>;

/// One syscall invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub meta: SyscallId,
    pub args: Vec<Arg>,
    /// Result argument bound to the return value, present for calls whose
    /// syscall produces a resource.
    pub ret: Option<ResultArg>,
    pub props: CallProps,
}

impl Call {
    /// Resolves `path` to an argument, or `None` if the path does not fit
    /// the current tree shape.
    pub fn arg_at(&self, path: &[PathSeg]) -> Option<&Arg> {
        let (first, rest) = path.split_first()?;
        let mut cur = match first {
            PathSeg::Index(i) => self.args.get(*i)?,
            _ => return None,
        };
        for seg in rest {
            cur = match (seg, cur) {
                (PathSeg::Index(i), Arg::Group(g)) => g.inner.get(*i)?,
                (PathSeg::Deref, Arg::Pointer(p)) => p.pointee.as_deref()?,
                (PathSeg::Chosen, Arg::Union(u)) => &u.option,
                _ => return None,
            };
        }
        Some(cur)
    }

    pub fn arg_at_mut(&mut self, path: &[PathSeg]) -> Option<&mut Arg> {
        let (first, rest) = path.split_first()?;
        let mut cur = match first {
            PathSeg::Index(i) => self.args.get_mut(*i)?,
            _ => return None,
        };
        for seg in rest {
            cur = match (seg, cur) {
                (PathSeg::Index(i), Arg::Group(g)) => g.inner.get_mut(*i)?,
                (PathSeg::Deref, Arg::Pointer(p)) => p.pointee.as_deref_mut()?,
                (PathSeg::Chosen, Arg::Union(u)) => &mut u.option,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Pre-order walk over all arguments of this call, `ret` excluded.
    pub fn foreach_arg<'a, F: FnMut(&'a Arg)>(&'a self, mut f: F) {
        for arg in &self.args {
            foreach_arg_in(arg, &mut f);
        }
    }
}

/// Pre-order walk over one argument subtree.
pub fn foreach_arg_in<'a, F: FnMut(&'a Arg)>(arg: &'a Arg, f: &mut F) {
    f(arg);
    match arg {
        Arg::Group(g) => {
            for inner in &g.inner {
                foreach_arg_in(inner, f);
            }
        }
        Arg::Union(u) => foreach_arg_in(&u.option, f),
        Arg::Pointer(p) => {
            if let Some(inner) = p.pointee.as_deref() {
                foreach_arg_in(inner, f);
            }
        }
        _ => {}
    }
}

fn walk_results_mut<F: FnMut(&mut ResultArg)>(arg: &mut Arg, f: &mut F) {
    match arg {
        Arg::Result(r) => f(r),
        Arg::Group(g) => {
            for inner in &mut g.inner {
                walk_results_mut(inner, f);
            }
        }
        Arg::Union(u) => walk_results_mut(&mut u.option, f),
        Arg::Pointer(p) => {
            if let Some(inner) = p.pointee.as_deref_mut() {
                walk_results_mut(inner, f);
            }
        }
        _ => {}
    }
}

/// Collects the ids of every result argument inside `arg`.
pub fn collect_result_ids(arg: &Arg, ids: &mut BTreeSet<ArgId>) {
    foreach_arg_in(arg, &mut |a| {
        if let Arg::Result(r) = a {
            ids.insert(r.id);
        }
    });
}

/// An ordered sequence of syscall invocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub calls: Vec<Call>,
    next_arg_id: ArgId,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    /// Allocates a fresh program-unique result-argument id.
    pub fn alloc_arg_id(&mut self) -> ArgId {
        self.next_arg_id += 1;
        self.next_arg_id
    }

    /// Visits every result argument (including call returns) in program
    /// order.
    pub fn foreach_result<F: FnMut(usize, &ResultArg)>(&self, mut f: F) {
        for (ci, call) in self.calls.iter().enumerate() {
            for arg in &call.args {
                foreach_arg_in(arg, &mut |a| {
                    if let Arg::Result(r) = a {
                        f(ci, r);
                    }
                });
            }
            if let Some(ret) = &call.ret {
                f(ci, ret);
            }
        }
    }

    fn foreach_result_mut<F: FnMut(&mut ResultArg)>(&mut self, mut f: F) {
        for call in &mut self.calls {
            for arg in &mut call.args {
                walk_results_mut(arg, &mut f);
            }
            if let Some(ret) = &mut call.ret {
                f(ret);
            }
        }
    }

    /// Removes the call at `idx` and cascades over the resource graph:
    /// consumers of any producer inside the call are cleared to the resource
    /// default, and reverse sets drop the call's consumers.
    pub fn remove_call(&mut self, target: &Target, idx: usize) {
        let call = self.calls.remove(idx);
        let mut ids = BTreeSet::new();
        for arg in &call.args {
            collect_result_ids(arg, &mut ids);
        }
        if let Some(ret) = &call.ret {
            ids.insert(ret.id);
        }
        self.purge_ids(target, &ids);
    }

    /// Cleans the resource graph after `removed` was detached from a call:
    /// producers that went away clear their consumers, consumers that went
    /// away leave their producer's reverse set.
    pub fn detach_cleanup(&mut self, target: &Target, removed: &Arg) {
        let mut ids = BTreeSet::new();
        collect_result_ids(removed, &mut ids);
        self.purge_ids(target, &ids);
    }

    /// Replaces the argument at `path` of call `call_idx` and cleans up
    /// after the displaced subtree. The parent link rewires atomically: the
    /// tree never holds both old and new argument.
    pub fn replace_arg(
        &mut self,
        target: &Target,
        call_idx: usize,
        path: &[PathSeg],
        new_arg: Arg,
    ) -> Result<(), ModelError> {
        let slot = self
            .calls
            .get_mut(call_idx)
            .and_then(|c| c.arg_at_mut(path))
            .ok_or_else(|| ModelError::Invariant(format!("no argument at {:?}", path)))?;
        let old = std::mem::replace(slot, new_arg);
        self.detach_cleanup(target, &old);
        Ok(())
    }

    /// Unbinds the result argument at `path` from its producer: the value
    /// falls back to the resource default and the producer's reverse set
    /// drops this consumer. Returns whether a producer link existed.
    pub fn clear_producer(
        &mut self,
        target: &Target,
        call_idx: usize,
        path: &[PathSeg],
    ) -> bool {
        let Some(Arg::Result(r)) = self
            .calls
            .get_mut(call_idx)
            .and_then(|c| c.arg_at_mut(path))
        else {
            return false;
        };
        let Some(pid) = r.producer.take() else {
            return false;
        };
        r.val = target.resource_default(r.ty);
        let cid = r.id;
        self.foreach_result_mut(|other| {
            if other.id == pid {
                other.uses.remove(&cid);
            }
        });
        true
    }

    fn purge_ids(&mut self, target: &Target, ids: &BTreeSet<ArgId>) {
        if ids.is_empty() {
            return;
        }
        self.foreach_result_mut(|r| {
            if let Some(p) = r.producer {
                if ids.contains(&p) {
                    r.producer = None;
                    r.val = target.resource_default(r.ty);
                }
            }
            if !r.uses.is_empty() {
                r.uses.retain(|u| !ids.contains(u));
            }
        });
    }

    /// Constructs the default value for a type, allocating ids for any
    /// resource handles inside it.
    pub fn default_arg(&mut self, target: &Target, ty: TypeRef, dir: Dir) -> Arg {
        match &target.ty(ty).kind {
            TypeKind::Int { .. }
            | TypeKind::Flags { .. }
            | TypeKind::Proc { .. }
            | TypeKind::Len { .. } => Arg::Const(ConstArg {
                ty,
                dir,
                val: const_default(target, ty),
            }),
            TypeKind::Ptr { .. } => Arg::Pointer(PointerArg {
                ty,
                dir,
                addr: target.special_pointers[0],
                pointee: None,
            }),
            TypeKind::Array { elem, kind } => {
                let elem = *elem;
                let n = match kind {
                    ArrayKind::Fixed(n) => *n,
                    ArrayKind::RandLen => 0,
                    ArrayKind::RangeLen { begin, .. } => *begin,
                };
                let inner = (0..n).map(|_| self.default_arg(target, elem, dir)).collect();
                Arg::Group(GroupArg { ty, dir, inner })
            }
            TypeKind::Struct { fields } => {
                let inner = fields
                    .iter()
                    .map(|f| self.default_arg(target, f.ty, f.dir))
                    .collect();
                Arg::Group(GroupArg { ty, dir, inner })
            }
            TypeKind::Union { options } => {
                let (oty, odir) = (options[0].ty, options[0].dir);
                let option = Box::new(self.default_arg(target, oty, odir));
                Arg::Union(UnionArg {
                    ty,
                    dir,
                    index: 0,
                    option,
                })
            }
            TypeKind::Buffer(kind) => Arg::Data(DataArg {
                ty,
                dir,
                data: default_buffer(*kind),
            }),
            TypeKind::Resource { .. } => Arg::Result(ResultArg {
                ty,
                dir,
                id: self.alloc_arg_id(),
                val: target.resource_default(ty),
                producer: None,
                uses: BTreeSet::new(),
            }),
        }
    }
}

/// Default value of an integer-like type.
pub fn const_default(target: &Target, ty: TypeRef) -> u64 {
    match &target.ty(ty).kind {
        TypeKind::Int { default, .. }
        | TypeKind::Flags { default, .. }
        | TypeKind::Proc { default, .. } => *default,
        _ => 0,
    }
}

fn default_buffer(kind: BufferKind) -> Vec<u8> {
    match kind {
        BufferKind::BlobRand | BufferKind::Compressed => Vec::new(),
        BufferKind::BlobRange { begin, .. } => vec![0; begin as usize],
        BufferKind::Filename { no_terminator } => {
            if no_terminator {
                Vec::new()
            } else {
                vec![0]
            }
        }
    }
}

/// Whether `arg` equals the default value of its type, ignoring result ids.
pub fn is_default(target: &Target, arg: &Arg) -> bool {
    match arg {
        Arg::Const(a) => a.val == const_default(target, a.ty),
        Arg::Pointer(a) => a.pointee.is_none() && a.addr == target.special_pointers[0],
        Arg::Group(a) => {
            let default_len = match &target.ty(a.ty).kind {
                TypeKind::Array { kind, .. } => match kind {
                    ArrayKind::Fixed(n) => *n,
                    ArrayKind::RandLen => 0,
                    ArrayKind::RangeLen { begin, .. } => *begin,
                },
                _ => a.inner.len() as u64,
            };
            a.inner.len() as u64 == default_len
                && a.inner.iter().all(|inner| is_default(target, inner))
        }
        Arg::Union(a) => a.index == 0 && is_default(target, &a.option),
        Arg::Data(a) => match &target.ty(a.ty).kind {
            TypeKind::Buffer(kind) => a.data == default_buffer(*kind),
            _ => a.data.is_empty(),
        },
        Arg::Result(a) => {
            a.producer.is_none() && a.uses.is_empty() && a.val == target.resource_default(a.ty)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_clone_preserves_resource_graph() {
        let target = testing::test_target();
        let mut p = Program::new();
        let open = testing::push_call(&target, &mut p, "open_r");
        let use_r = testing::push_call(&target, &mut p, "use_r");
        testing::bind_resource(&mut p, open, use_r, &[PathSeg::Index(0)]);

        let q = p.clone();
        assert_eq!(p, q);
        let ret_id = q.calls[open].ret.as_ref().unwrap().id;
        match &q.calls[use_r].args[0] {
            Arg::Result(r) => assert_eq!(r.producer, Some(ret_id)),
            other => panic!("expected result arg, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_producer_clears_consumers() {
        let target = testing::test_target();
        let mut p = Program::new();
        let open = testing::push_call(&target, &mut p, "open_r");
        let use_r = testing::push_call(&target, &mut p, "use_r");
        testing::bind_resource(&mut p, open, use_r, &[PathSeg::Index(0)]);

        p.remove_call(&target, open);
        match &p.calls[0].args[0] {
            Arg::Result(r) => {
                assert_eq!(r.producer, None);
                assert_eq!(r.val, target.resource_default(r.ty));
            }
            other => panic!("expected result arg, got {:?}", other),
        }
        validate::validate(&target, &p).unwrap();
    }

    #[test]
    fn test_remove_consumer_cleans_reverse_set() {
        let target = testing::test_target();
        let mut p = Program::new();
        let open = testing::push_call(&target, &mut p, "open_r");
        let use_r = testing::push_call(&target, &mut p, "use_r");
        testing::bind_resource(&mut p, open, use_r, &[PathSeg::Index(0)]);

        p.remove_call(&target, use_r);
        assert!(p.calls[0].ret.as_ref().unwrap().uses.is_empty());
        validate::validate(&target, &p).unwrap();
    }

    #[test]
    fn test_replace_arg_rewires_parent() {
        let target = testing::test_target();
        let mut p = Program::new();
        let idx = testing::push_call(&target, &mut p, "deref_int");
        let path = vec![PathSeg::Index(0)];
        let ty = p.calls[idx].args[0].ty();
        let null = Arg::Pointer(PointerArg {
            ty,
            dir: Dir::In,
            addr: 0,
            pointee: None,
        });
        p.replace_arg(&target, idx, &path, null).unwrap();
        assert!(is_default(&target, &p.calls[idx].args[0]));
    }

    #[test]
    fn test_arg_at_mismatched_path() {
        let target = testing::test_target();
        let mut p = Program::new();
        let idx = testing::push_call(&target, &mut p, "noop");
        assert!(p.calls[idx].arg_at(&[PathSeg::Index(0)]).is_none());
        assert!(p.calls[idx].arg_at(&[PathSeg::Deref]).is_none());
    }

    #[test]
    fn test_default_arg_is_default() {
        let target = testing::test_target();
        let mut p = Program::new();
        for call in &target.syscalls {
            for field in &call.args {
                let arg = p.default_arg(&target, field.ty, field.dir);
                assert!(
                    is_default(&target, &arg),
                    "default of {} not recognized",
                    target.ty(field.ty).name
                );
            }
        }
    }
}
