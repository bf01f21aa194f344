//! Syscall influence relation.
//!
//! `M[s, d] = 1` means a call of syscall `s` at an earlier position can
//! causally affect a call of syscall `d` at a later position. The matrix is
//! seeded statically from shared resource types, optionally dithered for
//! sensitivity studies, and grows monotonically through dynamic learning
//! while minimization sessions run.

use prog::{Dir, SyscallId, Target, TypeKind, TypeRef};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use syzmini::InfluenceSnapshot;

/// Errors from influence-matrix construction and persistence.
#[derive(Debug, thiserror::Error)]
pub enum InfluenceError {
    #[error("snapshot mismatch: {0}")]
    SnapshotMismatch(String),
}

/// Dense `n x n` bit matrix over syscall ids, shared across sessions.
///
/// Reads are relaxed loads; dynamic learning is a relaxed `fetch_or`.
/// Correctness depends only on bits being monotonic (0 -> 1), not on any
/// ordering between concurrent sessions.
pub struct InfluenceMatrix {
    n: usize,
    words: Vec<AtomicU64>,
}

impl InfluenceMatrix {
    /// All-zero matrix over `n` syscall ids.
    pub fn new(n: usize) -> Self {
        let word_count = (n * n).div_ceil(64);
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self { n, words }
    }

    /// Number of syscall ids covered.
    pub fn n(&self) -> usize {
        self.n
    }

    fn locate(&self, s: SyscallId, d: SyscallId) -> (usize, u64) {
        let (s, d) = (s.0 as usize, d.0 as usize);
        assert!(s < self.n && d < self.n, "syscall id out of matrix range");
        let bit = s * self.n + d;
        (bit / 64, 1u64 << (bit % 64))
    }

    pub fn get(&self, s: SyscallId, d: SyscallId) -> bool {
        let (word, mask) = self.locate(s, d);
        self.words[word].load(Ordering::Relaxed) & mask != 0
    }

    /// Sets `M[s, d]`; returns whether the bit was newly learned.
    pub fn set(&self, s: SyscallId, d: SyscallId) -> bool {
        let (word, mask) = self.locate(s, d);
        self.words[word].fetch_or(mask, Ordering::Relaxed) & mask == 0
    }

    fn clear(&self, s: SyscallId, d: SyscallId) {
        let (word, mask) = self.locate(s, d);
        self.words[word].fetch_and(!mask, Ordering::Relaxed);
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Seeds the matrix from the syscall schemas: for every resource type,
    /// each producing call (Out direction, return values included) can
    /// influence each construction-compatible consuming call (In/InOut).
    pub fn analyze_static(target: &Target) -> Self {
        let n = target.syscalls.len();
        let matrix = Self::new(n);

        let res_count = target.resources.len();
        let mut producers: Vec<HashSet<SyscallId>> = vec![HashSet::new(); res_count];
        let mut consumers: Vec<HashSet<SyscallId>> = vec![HashSet::new(); res_count];

        for syscall in &target.syscalls {
            let mut uses: Vec<(usize, Dir)> = Vec::new();
            let mut visited = HashSet::new();
            for field in &syscall.args {
                collect_resource_uses(target, field.ty, field.dir, &mut visited, &mut uses);
            }
            if let Some(ret) = syscall.ret {
                collect_resource_uses(target, ret, Dir::Out, &mut visited, &mut uses);
            }
            for (res, dir) in uses {
                match dir {
                    Dir::Out => {
                        producers[res].insert(syscall.id);
                    }
                    Dir::In | Dir::InOut => {
                        consumers[res].insert(syscall.id);
                    }
                }
            }
        }

        for pa in 0..res_count {
            for ca in 0..res_count {
                if !target.resources_compatible(pa, ca) {
                    continue;
                }
                for &src in &producers[pa] {
                    for &dst in &consumers[ca] {
                        if src != dst {
                            matrix.set(src, dst);
                        }
                    }
                }
            }
        }
        matrix
    }

    /// Zeroes a uniformly random `(100 - proportion)%` of the set bits.
    ///
    /// The ChaCha stream makes the perturbation reproducible from `seed`;
    /// the seed is always logged so a study can be replayed.
    pub fn dither(&self, proportion: u8, seed: u64) {
        let proportion = proportion.min(100);
        if proportion == 100 {
            return;
        }
        let mut ones: Vec<(SyscallId, SyscallId)> = Vec::new();
        for s in 0..self.n {
            for d in 0..self.n {
                let (s, d) = (SyscallId(s as u32), SyscallId(d as u32));
                if self.get(s, d) {
                    ones.push((s, d));
                }
            }
        }
        let to_zero = ones.len() * usize::from(100 - proportion) / 100;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        ones.shuffle(&mut rng);
        for &(s, d) in ones.iter().take(to_zero) {
            self.clear(s, d);
        }
        tracing::info!(
            seed,
            proportion,
            zeroed = to_zero,
            remaining = self.count_ones(),
            "dithered influence matrix"
        );
    }

    /// Captures the matrix for persistence, stamped with the target
    /// revision the bits were computed against.
    pub fn to_snapshot(&self, target: &Target) -> InfluenceSnapshot {
        InfluenceSnapshot {
            syscall_count: self.n as u32,
            revision: target.revision.clone(),
            words: self
                .words
                .iter()
                .map(|w| w.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Restores a matrix from a snapshot, rejecting stale ones.
    pub fn from_snapshot(
        snap: &InfluenceSnapshot,
        target: &Target,
    ) -> Result<Self, InfluenceError> {
        if snap.revision != target.revision {
            return Err(InfluenceError::SnapshotMismatch(format!(
                "snapshot revision {:?} vs target {:?}",
                snap.revision, target.revision
            )));
        }
        let n = target.syscalls.len();
        if snap.syscall_count as usize != n {
            return Err(InfluenceError::SnapshotMismatch(format!(
                "snapshot covers {} syscalls, target has {}",
                snap.syscall_count, n
            )));
        }
        let want_words = (n * n).div_ceil(64);
        if snap.words.len() != want_words {
            return Err(InfluenceError::SnapshotMismatch(format!(
                "snapshot has {} words, want {}",
                snap.words.len(),
                want_words
            )));
        }
        Ok(Self {
            n,
            words: snap.words.iter().map(|&w| AtomicU64::new(w)).collect(),
        })
    }
}

fn collect_resource_uses(
    target: &Target,
    ty: TypeRef,
    dir: Dir,
    visited: &mut HashSet<(TypeRef, Dir)>,
    uses: &mut Vec<(usize, Dir)>,
) {
    if !visited.insert((ty, dir)) {
        return;
    }
    match &target.ty(ty).kind {
        TypeKind::Resource { resource } => uses.push((*resource, dir)),
        TypeKind::Ptr { elem } => collect_resource_uses(target, *elem, dir, visited, uses),
        TypeKind::Array { elem, .. } => collect_resource_uses(target, *elem, dir, visited, uses),
        TypeKind::Struct { fields } => {
            for f in fields {
                collect_resource_uses(target, f.ty, f.dir, visited, uses);
            }
        }
        TypeKind::Union { options } => {
            for f in options {
                collect_resource_uses(target, f.ty, f.dir, visited, uses);
            }
        }
        _ => {}
    }
}
