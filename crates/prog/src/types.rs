//! Syscall and type descriptors.
//!
//! Descriptors are shared, immutable after [`Target::finalize`], and
//! addressed by flat table index ([`TypeRef`]), so argument trees stay plain
//! owned data and never hold references into the target.

use crate::size::Predicate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Data-flow direction of an argument, inherited from its declared position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dir {
    In,
    Out,
    InOut,
}

/// Index into [`Target::types`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeRef(pub u32);

/// Index into [`Target::syscalls`]; doubles as the row/column id in the
/// influence matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyscallId(pub u32);

/// Length discipline of an array type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArrayKind {
    /// Exactly `n` elements, never resized.
    Fixed(u64),
    /// Any length, including zero.
    RandLen,
    /// Length within `[begin, end]`; `end == 0` means unbounded above.
    RangeLen { begin: u64, end: u64 },
}

/// Payload discipline of a buffer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferKind {
    BlobRand,
    /// Byte length within `[begin, end]`.
    BlobRange { begin: u64, end: u64 },
    /// Path-like data; `no_terminator` forbids the trailing NUL.
    Filename { no_terminator: bool },
    /// Opaque compressed image. Calls carrying one are `no_minimize`.
    Compressed,
}

/// One field of a struct, union, or syscall parameter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: TypeRef,
    pub dir: Dir,
    /// Present iff this predicate over sibling/ancestor values holds.
    pub condition: Option<Predicate>,
}

impl Field {
    pub fn new(name: &str, ty: TypeRef, dir: Dir) -> Self {
        Self {
            name: name.to_string(),
            ty,
            dir,
            condition: None,
        }
    }
}

/// Structural kind of a type descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeKind {
    Int {
        bits: u32,
        default: u64,
    },
    Flags {
        bits: u32,
        default: u64,
    },
    /// Per-process value ranges (pids and friends). Shrinkable to the
    /// default only when the descriptor is marked optional.
    Proc {
        bits: u32,
        default: u64,
    },
    /// In-band length/offset field. `path` names the referent among the
    /// siblings of the field (or `parent` for the enclosing struct).
    Len {
        bits: u32,
        path: Vec<String>,
        is_offset: bool,
    },
    Ptr {
        elem: TypeRef,
    },
    Array {
        elem: TypeRef,
        kind: ArrayKind,
    },
    Struct {
        fields: Vec<Field>,
    },
    Union {
        options: Vec<Field>,
    },
    Buffer(BufferKind),
    /// Index into [`Target::resources`].
    Resource {
        resource: usize,
    },
}

/// A shared, immutable type descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDesc {
    pub name: String,
    pub optional: bool,
    pub kind: TypeKind,
}

impl TypeDesc {
    pub fn new(name: &str, kind: TypeKind) -> Self {
        Self {
            name: name.to_string(),
            optional: false,
            kind,
        }
    }

    /// Byte size of the scalar kinds; `None` for variable-size kinds.
    pub fn scalar_bytes(&self) -> Option<u64> {
        match &self.kind {
            TypeKind::Int { bits, .. }
            | TypeKind::Flags { bits, .. }
            | TypeKind::Proc { bits, .. }
            | TypeKind::Len { bits, .. } => Some(u64::from(*bits) / 8),
            _ => None,
        }
    }
}

/// A typed kernel handle: produced by some calls, consumed by others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDesc {
    pub name: String,
    /// Kind path; a producer is construction-compatible with a consumer when
    /// one path is a prefix of the other (e.g. `["fd"]` vs `["fd", "sock"]`).
    pub kind: Vec<String>,
    pub byte_size: u64,
    /// Sentinel written into consumers whose producer went away.
    pub default: u64,
}

/// Schema-level attributes of a syscall.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAttrs {
    /// No shrink step may touch a call of this syscall.
    pub no_minimize: bool,
}

/// Immutable metadata of one syscall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Syscall {
    pub name: String,
    pub id: SyscallId,
    pub attrs: CallAttrs,
    pub args: Vec<Field>,
    /// Resource type produced by the return value, if any.
    pub ret: Option<TypeRef>,
}

/// Target OS/arch description: syscall table, type table, resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub os: String,
    pub arch: String,
    /// Unique hash of the syscall descriptions this target was built from.
    pub revision: String,
    pub ptr_size: u64,
    pub syscalls: Vec<Syscall>,
    pub resources: Vec<ResourceDesc>,
    pub types: Vec<TypeDesc>,
    /// Reserved invalid pointer values; index 0 is NULL.
    pub special_pointers: Vec<u64>,
    /// File name lengths that provoke bugs (PATH_MAX and friends); filename
    /// buffers padded to one of these are trimmed back during shrinking.
    pub special_file_lengths: Vec<u64>,
    /// Named constants available to conditional-field predicates.
    pub consts: HashMap<String, u64>,
}

impl Target {
    /// Checks table consistency and installs the fixed special values.
    ///
    /// The NULL pointer stays at index 0 (shrinking relies on it), the
    /// unmapped kernel address and a non-canonical address follow.
    pub fn finalize(mut self) -> Result<Self, crate::ModelError> {
        for (i, call) in self.syscalls.iter_mut().enumerate() {
            call.id = SyscallId(i as u32);
        }
        if self.special_pointers.is_empty() {
            self.special_pointers = vec![0, 0xffff_ffff_ffff_ffff, 0x9999_9999_9999_9999];
        }
        if self.special_pointers[0] != 0 {
            return Err(crate::ModelError::Invariant(
                "special pointer index 0 must be NULL".into(),
            ));
        }
        if self.special_file_lengths.is_empty() {
            self.special_file_lengths = vec![256, 512, 4096];
        }
        for ty in &self.types {
            if let TypeKind::Resource { resource } = ty.kind {
                if resource >= self.resources.len() {
                    return Err(crate::ModelError::Invariant(format!(
                        "type {} references unknown resource {}",
                        ty.name, resource
                    )));
                }
            }
        }
        Ok(self)
    }

    pub fn ty(&self, r: TypeRef) -> &TypeDesc {
        &self.types[r.0 as usize]
    }

    pub fn syscall(&self, id: SyscallId) -> &Syscall {
        &self.syscalls[id.0 as usize]
    }

    pub fn syscall_by_name(&self, name: &str) -> Option<&Syscall> {
        self.syscalls.iter().find(|s| s.name == name)
    }

    pub fn resource(&self, idx: usize) -> &ResourceDesc {
        &self.resources[idx]
    }

    /// Whether a producer of `a` can stand in for a consumer of `b`.
    pub fn resources_compatible(&self, a: usize, b: usize) -> bool {
        let (ka, kb) = (&self.resources[a].kind, &self.resources[b].kind);
        let n = ka.len().min(kb.len());
        ka[..n] == kb[..n]
    }

    /// Default sentinel for a resource-typed argument.
    pub fn resource_default(&self, ty: TypeRef) -> u64 {
        match self.ty(ty).kind {
            TypeKind::Resource { resource } => self.resources[resource].default,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_assigns_ids() {
        let target = crate::testing::test_target();
        for (i, call) in target.syscalls.iter().enumerate() {
            assert_eq!(call.id.0 as usize, i);
        }
    }

    #[test]
    fn test_finalize_installs_special_values() {
        let target = crate::testing::test_target();
        assert_eq!(target.special_pointers[0], 0);
        assert!(target.special_pointers.len() >= 3);
        assert_eq!(target.special_file_lengths, vec![256, 512, 4096]);
    }

    #[test]
    fn test_resource_compatibility_is_prefix_based() {
        let mut target = crate::testing::test_target();
        target.resources.push(ResourceDesc {
            name: "sock".into(),
            kind: vec!["fd".into(), "sock".into()],
            byte_size: 4,
            default: 0xffff_ffff_ffff_ffff,
        });
        let fd = target
            .resources
            .iter()
            .position(|r| r.name == "fd")
            .unwrap();
        let sock = target.resources.len() - 1;
        let fname = target
            .resources
            .iter()
            .position(|r| r.name == "fname")
            .unwrap();
        assert!(target.resources_compatible(fd, sock));
        assert!(target.resources_compatible(sock, fd));
        assert!(!target.resources_compatible(fd, fname));
    }

    #[test]
    fn test_scalar_bytes() {
        let d = TypeDesc::new("int32", TypeKind::Int { bits: 32, default: 0 });
        assert_eq!(d.scalar_bytes(), Some(4));
        let p = TypeDesc::new(
            "ptr",
            TypeKind::Ptr {
                elem: TypeRef(0),
            },
        );
        assert_eq!(p.scalar_bytes(), None);
    }
}
