//! Call-level minimization: staged, bounded removal of whole calls.
//!
//! Stage A drops the suffix after the target call in one step. Stage B
//! drops every predecessor outside the influence closure of the target;
//! when no influence matrix is configured, stage D falls back to a
//! resource-sharing closure instead. Stage C removes the survivors pairwise
//! from last to first and is where dynamic influence learning happens.
//! Call properties are reset in bulk after removal and re-minimized per
//! call after the argument pass.

use crate::{MinimizeError, Session};
use oracle::StepKind;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::Bfs;
use prog::{Arg, BufferKind, CallProps, Program, TypeKind};
use std::collections::VecDeque;

/// Stages A-D. Returns the surviving program and the shifted target index.
pub(crate) fn remove_calls(
    s: &mut Session<'_>,
    mut p0: Program,
    mut k0: Option<usize>,
) -> Result<(Program, Option<usize>), MinimizeError> {
    // Stage A: with at least two calls after the target, they are
    // frequently all unnecessary. Drop them in one step.
    if let Some(k) = k0 {
        if k + 2 < p0.calls.len() {
            let drops: Vec<usize> = (k + 1..p0.calls.len())
                .filter(|&i| !no_minimize(s, &p0, i))
                .collect();
            if !drops.is_empty() {
                let mut p = p0.clone();
                for &i in drops.iter().rev() {
                    p.remove_call(s.target(), i);
                }
                if s.check(&mut p, Some(k), StepKind::CallLevel)? {
                    p0 = p;
                }
            }
        }
    }

    // Stage B / D: bulk-drop predecessors unrelated to the target.
    if let Some(k) = k0 {
        let unrelated = match s.matrix() {
            Some(_) => influence_unrelated(s, &p0, k),
            None => resource_unrelated(s, &p0, k),
        };
        let drops: Vec<usize> = unrelated
            .into_iter()
            .filter(|&i| !no_minimize(s, &p0, i))
            .collect();
        if !drops.is_empty() {
            let mut p = p0.clone();
            for &i in drops.iter().rev() {
                p.remove_call(s.target(), i);
            }
            let shift = drops.iter().filter(|&&i| i < k).count();
            let nk = k - shift;
            if s.check(&mut p, Some(nk), StepKind::CallLevel)? {
                p0 = p;
                k0 = Some(nk);
            }
        }
    }

    // Stage C: pairwise removal from last to first, skipping the target.
    let mut i = p0.calls.len();
    while i > 0 {
        i -= 1;
        if Some(i) == k0 || no_minimize(s, &p0, i) {
            continue;
        }
        let nk = k0.map(|k| if i < k { k - 1 } else { k });
        let mut p = p0.clone();
        p.remove_call(s.target(), i);
        if s.check(&mut p, nk, StepKind::CallLevel)? {
            p0 = p;
            k0 = nk;
        } else {
            s.learn_from_reject(&p0, &p, i);
        }
    }

    Ok((p0, k0))
}

fn no_minimize(s: &Session<'_>, p: &Program, i: usize) -> bool {
    s.target().syscall(p.calls[i].meta).attrs.no_minimize
}

/// Stage B relevance: closed BFS over the influence matrix. Seeds are the
/// predecessors that can influence the target's syscall; the closure then
/// pulls in anything that can influence a seed, transitively.
fn influence_unrelated(s: &Session<'_>, p0: &Program, k: usize) -> Vec<usize> {
    let Some(matrix) = s.matrix() else {
        return Vec::new();
    };
    let target_id = p0.calls[k].meta;
    let mut influenced = vec![false; k];
    let mut queued = vec![false; k];
    let mut queue = VecDeque::new();

    for i in (0..k).rev() {
        if matrix.get(p0.calls[i].meta, target_id) {
            influenced[i] = true;
            queued[i] = true;
            queue.push_back(i);
            while let Some(id) = queue.pop_front() {
                for j in (0..id).rev() {
                    if matrix.get(p0.calls[j].meta, p0.calls[id].meta) {
                        influenced[j] = true;
                        if !queued[j] {
                            queued[j] = true;
                            queue.push_back(j);
                        }
                    }
                }
            }
        }
    }

    (0..k).filter(|&i| !influenced[i]).collect()
}

/// Stage D relevance: transitive closure of calls sharing resource handles
/// or filename bytes with the target call. Only proposed when it prunes at
/// least 3 calls; with fewer, stage C handles them at the same cost.
fn resource_unrelated(s: &Session<'_>, p0: &Program, k: usize) -> Vec<usize> {
    let target = s.target();
    let mut graph: UnGraph<usize, ()> = UnGraph::new_undirected();
    let nodes: Vec<NodeIndex> = (0..p0.calls.len()).map(|i| graph.add_node(i)).collect();

    // Resource edges: producer call <-> consumer call.
    let mut producer_call = std::collections::HashMap::new();
    p0.foreach_result(|ci, r| {
        if !r.uses.is_empty() {
            producer_call.insert(r.id, ci);
        }
    });
    let mut edges: Vec<(usize, usize)> = Vec::new();
    p0.foreach_result(|ci, r| {
        if let Some(pid) = r.producer {
            if let Some(&pci) = producer_call.get(&pid) {
                edges.push((pci, ci));
            }
        }
    });

    // Filename edges: calls carrying identical filename bytes.
    let mut filenames: Vec<(usize, &[u8])> = Vec::new();
    for (ci, call) in p0.calls.iter().enumerate() {
        call.foreach_arg(|arg| {
            if let Arg::Data(d) = arg {
                if let TypeKind::Buffer(BufferKind::Filename { .. }) = &target.ty(d.ty).kind {
                    if !d.data.is_empty() {
                        filenames.push((ci, &d.data));
                    }
                }
            }
        });
    }
    for (ai, (ca, da)) in filenames.iter().enumerate() {
        for (cb, db) in filenames.iter().skip(ai + 1) {
            if ca != cb && da == db {
                edges.push((*ca, *cb));
            }
        }
    }

    for (a, b) in edges {
        graph.update_edge(nodes[a], nodes[b], ());
    }

    let mut related = vec![false; p0.calls.len()];
    let mut bfs = Bfs::new(&graph, nodes[k]);
    while let Some(nx) = bfs.next(&graph) {
        related[graph[nx]] = true;
    }

    let unrelated: Vec<usize> = (0..p0.calls.len())
        .filter(|&i| i != k && !related[i])
        .collect();
    if unrelated.len() >= 3 {
        unrelated
    } else {
        Vec::new()
    }
}

/// Proposes resetting every call's properties to their defaults in one
/// step. Reasonable for many programs, and a no-op (no oracle query) when
/// nothing differs.
pub(crate) fn reset_call_props(
    s: &mut Session<'_>,
    p0: Program,
    k0: Option<usize>,
) -> Result<Program, MinimizeError> {
    let mut p = p0.clone();
    let mut any_different = false;
    for i in 0..p.calls.len() {
        if no_minimize(s, &p, i) {
            continue;
        }
        if !p.calls[i].props.is_default() {
            p.calls[i].props = CallProps::default();
            any_different = true;
        }
    }
    if any_different && s.check(&mut p, k0, StepKind::CallLevel)? {
        return Ok(p);
    }
    Ok(p0)
}

/// Stage E: per-call property minimization, each knob independently.
pub(crate) fn minimize_call_props(
    s: &mut Session<'_>,
    mut p0: Program,
    call_idx: usize,
    k0: Option<usize>,
) -> Result<Program, MinimizeError> {
    let props = p0.calls[call_idx].props;

    if props.fail_nth > 0 {
        let mut p = p0.clone();
        p.calls[call_idx].props.fail_nth = 0;
        if s.check(&mut p, k0, StepKind::CallLevel)? {
            p0 = p;
        }
    }

    if props.async_exec {
        let mut p = p0.clone();
        p.calls[call_idx].props.async_exec = false;
        if s.check(&mut p, k0, StepKind::CallLevel)? {
            p0 = p;
        }
    }

    if props.rerun > 0 {
        let mut p = p0.clone();
        p.calls[call_idx].props.rerun = 0;
        if s.check(&mut p, k0, StepKind::CallLevel)? {
            p0 = p;
        }
    }

    Ok(p0)
}
