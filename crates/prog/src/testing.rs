//! A tiny built-in target used by unit tests and scenario tests.
//!
//! Two resource types, `fd` (produced by `open_r`) and `fname` (produced by
//! `mk_f`), plus argument-heavy pseudo-syscalls exercising every shrink
//! path: arrays, pointers, blobs, filenames, length fields, conditional
//! fields, and a `no_minimize` call carrying a compressed buffer.

use crate::size::Predicate;
use crate::types::{
    ArrayKind, BufferKind, CallAttrs, Dir, Field, ResourceDesc, Syscall, SyscallId, Target,
    TypeDesc, TypeKind, TypeRef,
};
use crate::{Arg, PathSeg, PointerArg, Program, ResultArg};
use std::collections::{BTreeSet, HashMap};

fn push_ty(types: &mut Vec<TypeDesc>, desc: TypeDesc) -> TypeRef {
    types.push(desc);
    TypeRef(types.len() as u32 - 1)
}

fn call(name: &str, args: Vec<Field>, ret: Option<TypeRef>) -> Syscall {
    Syscall {
        name: name.to_string(),
        id: SyscallId(0), // assigned by finalize
        attrs: CallAttrs::default(),
        args,
        ret,
    }
}

/// Builds the test target. Syscall ids follow declaration order.
pub fn test_target() -> Target {
    let mut types = Vec::new();

    let int32 = push_ty(
        &mut types,
        TypeDesc::new("int32", TypeKind::Int { bits: 32, default: 0 }),
    );
    let int64 = push_ty(
        &mut types,
        TypeDesc::new("int64", TypeKind::Int { bits: 64, default: 0 }),
    );
    let mode_flags = push_ty(
        &mut types,
        TypeDesc::new("mode_flags", TypeKind::Flags { bits: 32, default: 0 }),
    );
    let pid_opt = push_ty(&mut types, {
        let mut d = TypeDesc::new("pid_opt", TypeKind::Proc { bits: 32, default: 0 });
        d.optional = true;
        d
    });
    let pid = push_ty(
        &mut types,
        TypeDesc::new("pid", TypeKind::Proc { bits: 32, default: 0 }),
    );
    let res_fd = push_ty(
        &mut types,
        TypeDesc::new("res_fd", TypeKind::Resource { resource: 0 }),
    );
    let res_fname = push_ty(
        &mut types,
        TypeDesc::new("res_fname", TypeKind::Resource { resource: 1 }),
    );
    let arr_int32 = push_ty(
        &mut types,
        TypeDesc::new(
            "arr_int32",
            TypeKind::Array {
                elem: int32,
                kind: ArrayKind::RandLen,
            },
        ),
    );
    let arr_bounded = push_ty(
        &mut types,
        TypeDesc::new(
            "arr_bounded",
            TypeKind::Array {
                elem: int32,
                kind: ArrayKind::RangeLen { begin: 2, end: 8 },
            },
        ),
    );
    let ptr_int32 = push_ty(
        &mut types,
        TypeDesc::new("ptr_int32", TypeKind::Ptr { elem: int32 }),
    );
    let blob_range = push_ty(
        &mut types,
        TypeDesc::new(
            "blob_range",
            TypeKind::Buffer(BufferKind::BlobRange { begin: 10, end: 100 }),
        ),
    );
    let fname_buf = push_ty(
        &mut types,
        TypeDesc::new(
            "fname_buf",
            TypeKind::Buffer(BufferKind::Filename {
                no_terminator: false,
            }),
        ),
    );
    let len_payload = push_ty(
        &mut types,
        TypeDesc::new(
            "len_payload",
            TypeKind::Len {
                bits: 32,
                path: vec!["payload".to_string()],
                is_offset: false,
            },
        ),
    );
    let payload_blob = push_ty(
        &mut types,
        TypeDesc::new("payload_blob", TypeKind::Buffer(BufferKind::BlobRand)),
    );
    let rec_struct = push_ty(
        &mut types,
        TypeDesc::new(
            "rec",
            TypeKind::Struct {
                fields: vec![
                    Field::new("len", len_payload, Dir::In),
                    Field::new("payload", payload_blob, Dir::In),
                ],
            },
        ),
    );
    let ptr_rec = push_ty(
        &mut types,
        TypeDesc::new("ptr_rec", TypeKind::Ptr { elem: rec_struct }),
    );
    let len_parent = push_ty(
        &mut types,
        TypeDesc::new(
            "len_parent",
            TypeKind::Len {
                bits: 32,
                path: vec!["parent".to_string()],
                is_offset: false,
            },
        ),
    );
    let msg_struct = push_ty(&mut types, {
        let mut big = Field::new("big", int64, Dir::In);
        big.condition = Some(Predicate::parse("value[kind] == 1").expect("predicate"));
        TypeDesc::new(
            "msg",
            TypeKind::Struct {
                fields: vec![
                    Field::new("kind", int32, Dir::In),
                    big,
                    Field::new("total", len_parent, Dir::In),
                ],
            },
        )
    });
    let ptr_msg = push_ty(
        &mut types,
        TypeDesc::new("ptr_msg", TypeKind::Ptr { elem: msg_struct }),
    );
    let packed = push_ty(
        &mut types,
        TypeDesc::new("packed", TypeKind::Buffer(BufferKind::Compressed)),
    );

    let resources = vec![
        ResourceDesc {
            name: "fd".to_string(),
            kind: vec!["fd".to_string()],
            byte_size: 4,
            default: 0xffff_ffff_ffff_ffff,
        },
        ResourceDesc {
            name: "fname".to_string(),
            kind: vec!["fname".to_string()],
            byte_size: 8,
            default: 0,
        },
    ];

    let mut pack_blob = call("pack_blob", vec![Field::new("z", packed, Dir::In)], None);
    pack_blob.attrs.no_minimize = true;

    let syscalls = vec![
        call("open_r", vec![], Some(res_fd)),
        call("use_r", vec![Field::new("fd", res_fd, Dir::In)], None),
        call("mk_f", vec![], Some(res_fname)),
        call("use_f", vec![Field::new("f", res_fname, Dir::In)], None),
        call("noop", vec![], None),
        call("write_arr", vec![Field::new("vals", arr_int32, Dir::In)], None),
        call(
            "write_bounded",
            vec![Field::new("vals", arr_bounded, Dir::In)],
            None,
        ),
        call("deref_int", vec![Field::new("p", ptr_int32, Dir::In)], None),
        call("send_blob", vec![Field::new("buf", blob_range, Dir::In)], None),
        call("send_name", vec![Field::new("name", fname_buf, Dir::In)], None),
        call("sized_rec", vec![Field::new("p", ptr_rec, Dir::In)], None),
        call("cond_msg", vec![Field::new("m", ptr_msg, Dir::In)], None),
        pack_blob,
        call(
            "set_mode",
            vec![
                Field::new("mode", mode_flags, Dir::In),
                Field::new("who", pid_opt, Dir::In),
                Field::new("owner", pid, Dir::In),
            ],
            None,
        ),
    ];

    Target {
        os: "test".to_string(),
        arch: "64".to_string(),
        revision: "test-rev-1".to_string(),
        ptr_size: 8,
        syscalls,
        resources,
        types,
        special_pointers: Vec::new(),
        special_file_lengths: Vec::new(),
        consts: HashMap::new(),
    }
    .finalize()
    .expect("test target")
}

/// Appends a call with materialized arguments (pointers get real pointees,
/// unlike pure defaults) and a bound return handle when the syscall
/// produces one. Returns the call index.
pub fn push_call(target: &Target, p: &mut Program, name: &str) -> usize {
    let syscall = target
        .syscall_by_name(name)
        .unwrap_or_else(|| panic!("unknown test syscall {}", name))
        .clone();
    let args = syscall
        .args
        .iter()
        .map(|f| materialized_arg(target, p, f.ty, f.dir))
        .collect();
    let ret = syscall.ret.map(|ty| ResultArg {
        ty,
        dir: Dir::Out,
        id: p.alloc_arg_id(),
        val: target.resource_default(ty),
        producer: None,
        uses: BTreeSet::new(),
    });
    p.calls.push(crate::Call {
        meta: syscall.id,
        args,
        ret,
        props: crate::CallProps::default(),
    });
    let idx = p.calls.len() - 1;
    crate::size::assign_sizes(target, &mut p.calls[idx]);
    idx
}

fn materialized_arg(target: &Target, p: &mut Program, ty: TypeRef, dir: Dir) -> Arg {
    match &target.ty(ty).kind {
        TypeKind::Ptr { elem } => {
            let elem = *elem;
            let pointee = materialized_arg(target, p, elem, dir);
            Arg::Pointer(PointerArg {
                ty,
                dir,
                addr: 0x1_0000,
                pointee: Some(Box::new(pointee)),
            })
        }
        _ => p.default_arg(target, ty, dir),
    }
}

/// Wires the return handle of `producer` into the result argument of
/// `consumer` at `path`.
pub fn bind_resource(p: &mut Program, producer: usize, consumer: usize, path: &[PathSeg]) {
    let pid = p.calls[producer]
        .ret
        .as_ref()
        .expect("producer call has no return handle")
        .id;
    let cid = match p.calls[consumer].arg_at_mut(path) {
        Some(Arg::Result(r)) => {
            r.producer = Some(pid);
            r.val = 0;
            r.id
        }
        other => panic!("bind_resource: not a result argument: {:?}", other),
    };
    p.calls[producer]
        .ret
        .as_mut()
        .expect("producer call has no return handle")
        .uses
        .insert(cid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_is_consistent() {
        let target = test_target();
        assert_eq!(target.syscall_by_name("noop").unwrap().id.0, 4);
        assert!(target.syscall_by_name("pack_blob").unwrap().attrs.no_minimize);
        assert!(target.ty(TypeRef(3)).optional);
    }

    #[test]
    fn test_push_call_materializes_pointees() {
        let target = test_target();
        let mut p = Program::new();
        let idx = push_call(&target, &mut p, "deref_int");
        match &p.calls[idx].args[0] {
            Arg::Pointer(ptr) => assert!(ptr.pointee.is_some()),
            other => panic!("unexpected arg {:?}", other),
        }
        crate::validate::validate(&target, &p).unwrap();
    }

    #[test]
    fn test_bound_programs_validate() {
        let target = test_target();
        let mut p = Program::new();
        let open = push_call(&target, &mut p, "open_r");
        let use_r = push_call(&target, &mut p, "use_r");
        bind_resource(&mut p, open, use_r, &[PathSeg::Index(0)]);
        crate::validate::validate(&target, &p).unwrap();
    }
}
