//! Structural operations on the decision tree
//!
//! Everything here works on `&mut NodePtr` under the branch-before-write
//! discipline: a vertex is unshared right before it is changed, so concurrent
//! readers of the old structure are never affected. `prune` restores the
//! canonical form after a mutation pass; the other operations assume their
//! input is canonical.

use crate::engine::{EnginePtr, Matrix2x2};
use crate::error::{Result, StateError};
use crate::node::{branch_node, is_equal, is_equal_under, BdtNode, NodeKind, NodePtr};
use num_complex::Complex64;
use std::sync::Arc;

const ONE: Complex64 = Complex64::new(1.0, 0.0);

/// Canonicalize the tree down to `depth` levels below `node`.
///
/// Leaves-up: zero subtrees collapse to the canonical zero node, a common
/// factor is extracted from every child pair, and children that are equal
/// within `eps` end up as one shared vertex.
///
/// The extracted factor carries magnitude `sqrt(|s0|^2 + |s1|^2)` and the
/// phase of the dominant child, so every surviving interior vertex keeps
/// `|s0|^2 + |s1|^2 = 1`. Child-scale norms then read directly as conditional
/// probabilities, which the measurement paths rely on. The dominant child's
/// scale is exactly 1 whenever its sibling is zero.
pub fn prune(node: &mut NodePtr, depth: usize, eps: f64) {
    if node.is_zero(eps) {
        if node.scale.norm_sqr() != 0.0 || !matches!(node.kind, NodeKind::Leaf) {
            *node = Arc::new(BdtNode::zero());
        }
        return;
    }
    if depth == 0 || !matches!(node.kind, NodeKind::Interior(_)) {
        return;
    }

    let vertex = Arc::make_mut(node);
    let NodeKind::Interior(branches) = &mut vertex.kind else {
        unreachable!()
    };
    let (left, right) = branches.split_at_mut(1);
    let b0 = &mut left[0];
    let b1 = &mut right[0];
    if Arc::ptr_eq(b0, b1) {
        prune(b0, depth - 1, eps);
        *b1 = b0.clone();
    } else {
        prune(b0, depth - 1, eps);
        prune(b1, depth - 1, eps);
    }

    let s0 = b0.scale;
    let s1 = b1.scale;
    let n0 = s0.norm_sqr();
    let n1 = s1.norm_sqr();
    if n0 <= eps && n1 <= eps {
        vertex.set_zero();
        return;
    }

    let dominant = if n0 >= n1 { s0 } else { s1 };
    let factor = Complex64::from_polar((n0 + n1).sqrt(), dominant.arg());
    vertex.scale *= factor;
    if n0 > eps {
        Arc::make_mut(b0).scale = s0 / factor;
    }
    if n1 > eps {
        Arc::make_mut(b1).scale = s1 / factor;
    }

    if is_equal(b0, b1, eps) {
        *b1 = b0.clone();
    }
}

/// Push every interior scale down into its children, leaving 1 behind.
///
/// Used after bulk amplitude writes so a following [`prune`] can re-extract
/// canonical factors from scratch.
pub fn pop_state_vector(node: &mut NodePtr, depth: usize, eps: f64) {
    if depth == 0 || node.is_zero(eps) || !matches!(node.kind, NodeKind::Interior(_)) {
        return;
    }
    let vertex = Arc::make_mut(node);
    let scale = vertex.scale;
    vertex.scale = ONE;
    let NodeKind::Interior(branches) = &mut vertex.kind else {
        unreachable!()
    };
    for branch in branches.iter_mut() {
        if branch.is_zero(eps) {
            continue;
        }
        Arc::make_mut(branch).scale *= scale;
        pop_state_vector(branch, depth - 1, eps);
    }
}

/// Splice a copy of `sub` (a block of `length` tree levels) at every nonzero
/// path of length `depth` below `node`.
///
/// Whatever hung at each splice point before — children, an attached engine,
/// or a terminal leaf — re-hangs under every nonzero leaf of the grafted
/// block, shared between graft points. When both the splice point and the
/// block's leaves are attached, the two engines merge (grafted qubits low,
/// pre-existing qubits high).
pub fn insert_at_depth(node: &mut NodePtr, sub: &NodePtr, depth: usize, length: usize, eps: f64) {
    if node.is_zero(eps) {
        return;
    }
    if depth > 0 {
        let vertex = branch_node(node);
        if let NodeKind::Interior(branches) = &mut vertex.kind {
            let (left, right) = branches.split_at_mut(1);
            insert_at_depth(&mut left[0], sub, depth - 1, length, eps);
            insert_at_depth(&mut right[0], sub, depth - 1, length, eps);
        }
        return;
    }

    let vertex = branch_node(node);
    let continuation = std::mem::replace(&mut vertex.kind, NodeKind::Leaf);
    vertex.scale *= sub.scale;
    vertex.kind = graft_kind(sub, length, &continuation, eps);
}

fn graft_kind(sub: &NodePtr, length: usize, continuation: &NodeKind, eps: f64) -> NodeKind {
    if matches!(continuation, NodeKind::Leaf) {
        // splicing past the deepest level: adopt the block wholesale
        return sub.kind.clone();
    }
    match &sub.kind {
        NodeKind::Interior([b0, b1]) => NodeKind::Interior([
            graft_child(b0, length.saturating_sub(1), continuation, eps),
            graft_child(b1, length.saturating_sub(1), continuation, eps),
        ]),
        NodeKind::Attached(engine) => merge_attached(engine, continuation),
        NodeKind::Leaf => continuation.clone(),
    }
}

fn graft_child(child: &NodePtr, remaining: usize, continuation: &NodeKind, eps: f64) -> NodePtr {
    if child.is_zero(eps) {
        return Arc::new(BdtNode::zero());
    }
    if remaining == 0 {
        let kind = match &child.kind {
            NodeKind::Attached(engine) => merge_attached(engine, continuation),
            _ => continuation.clone(),
        };
        return Arc::new(BdtNode { scale: child.scale, kind });
    }
    match &child.kind {
        NodeKind::Interior([c0, c1]) => Arc::new(BdtNode::interior(
            child.scale,
            [
                graft_child(c0, remaining - 1, continuation, eps),
                graft_child(c1, remaining - 1, continuation, eps),
            ],
        )),
        _ => child.shallow_clone(),
    }
}

fn merge_attached(low: &EnginePtr, continuation: &NodeKind) -> NodeKind {
    match continuation {
        NodeKind::Attached(high) => {
            let merged = low.lock().clone_shared();
            merged.lock().compose(&*high.lock());
            NodeKind::Attached(merged)
        }
        _ => continuation.clone(),
    }
}

/// Detach the block of `length` levels starting `depth` levels below `node`.
///
/// Verifies first, commits after: every nonzero depth-`depth` subtree must be
/// equal up to its top scale, and within that block every depth-`length`
/// continuation must agree as well. On failure the tree is untouched and
/// [`StateError::NotSeparable`] is returned. On success the detached block is
/// returned as a fresh root (scale 1) and the tree is re-linked around it.
pub fn remove_separable_at_depth(
    node: &mut NodePtr,
    depth: usize,
    length: usize,
    eps: f64,
) -> Result<NodePtr> {
    let not_separable = StateError::NotSeparable {
        start: depth,
        length,
    };
    let rep = first_at_depth(node, depth, eps).ok_or(not_separable.clone())?;
    if !subtrees_uniform(node, depth, &rep, eps) {
        return Err(not_separable);
    }
    let cont = first_at_depth(&rep, length, eps).ok_or(not_separable.clone())?;
    if !subtrees_uniform(&rep, length, &cont, eps) {
        return Err(not_separable);
    }

    let block = Arc::new(BdtNode {
        scale: ONE,
        kind: strip_kind(&rep.kind, length, eps),
    });
    relink(node, depth, length, eps);
    Ok(block)
}

/// First nonzero vertex `depth` levels below `node`
fn first_at_depth(node: &NodePtr, depth: usize, eps: f64) -> Option<NodePtr> {
    if node.is_zero(eps) {
        return None;
    }
    if depth == 0 {
        return Some(node.clone());
    }
    match &node.kind {
        NodeKind::Interior([b0, b1]) => {
            first_at_depth(b0, depth - 1, eps).or_else(|| first_at_depth(b1, depth - 1, eps))
        }
        _ => None,
    }
}

/// Every nonzero vertex `depth` levels below `node` is equal-under `rep`
fn subtrees_uniform(node: &NodePtr, depth: usize, rep: &NodePtr, eps: f64) -> bool {
    if node.is_zero(eps) {
        return true;
    }
    if depth == 0 {
        return is_equal_under(node, rep, eps);
    }
    match &node.kind {
        NodeKind::Interior([b0, b1]) => {
            subtrees_uniform(b0, depth - 1, rep, eps) && subtrees_uniform(b1, depth - 1, rep, eps)
        }
        _ => false,
    }
}

fn strip_kind(kind: &NodeKind, remaining: usize, eps: f64) -> NodeKind {
    match kind {
        NodeKind::Interior([b0, b1]) => NodeKind::Interior([
            strip_child(b0, remaining.saturating_sub(1), eps),
            strip_child(b1, remaining.saturating_sub(1), eps),
        ]),
        _ => NodeKind::Leaf,
    }
}

fn strip_child(child: &NodePtr, remaining: usize, eps: f64) -> NodePtr {
    if child.is_zero(eps) {
        return Arc::new(BdtNode::zero());
    }
    if remaining == 0 {
        return Arc::new(BdtNode::leaf(child.scale));
    }
    Arc::new(BdtNode {
        scale: child.scale,
        kind: strip_kind(&child.kind, remaining, eps),
    })
}

fn relink(node: &mut NodePtr, depth: usize, length: usize, eps: f64) {
    if node.is_zero(eps) {
        return;
    }
    if depth > 0 {
        let vertex = branch_node(node);
        if let NodeKind::Interior(branches) = &mut vertex.kind {
            let (left, right) = branches.split_at_mut(1);
            relink(&mut left[0], depth - 1, length, eps);
            relink(&mut right[0], depth - 1, length, eps);
        }
        return;
    }
    let continuation = first_at_depth(node, length, eps);
    let vertex = branch_node(node);
    match continuation {
        Some(cont) => vertex.kind = cont.kind.clone(),
        None => vertex.set_zero(),
    }
}

/// Apply a 2×2 unitary to the qubit whose two edges leave `node`.
///
/// `child_depth` is the number of tree levels below each child; the touched
/// child subtrees are re-canonicalized before returning, so a following
/// shallow [`prune`] restores the gauge all the way up.
pub fn apply_2x2(node: &mut NodePtr, mtrx: &Matrix2x2, child_depth: usize, eps: f64, par: usize) {
    if node.is_zero(eps) {
        return;
    }
    let vertex = branch_node(node);
    let NodeKind::Interior(branches) = &mut vertex.kind else {
        return;
    };
    let (left, right) = branches.split_at_mut(1);
    push_state_vector(mtrx, &mut left[0], &mut right[0], eps, par);
    prune(&mut left[0], child_depth, eps);
    prune(&mut right[0], child_depth, eps);
}

/// Transform the subtree pair `(b0, b1)` by a 2×2 matrix.
///
/// The pair is treated as a two-component vector of sub-states. Equal
/// sub-structures (and zero sides, which rematerialize sharing the live
/// side's structure) combine in the scales alone; differing interiors push
/// their scales one level down and recurse pairwise; differing attached
/// engines combine amplitude-wise through the engine interface, with the
/// resulting norms folded back into the node scales.
pub fn push_state_vector(
    mtrx: &Matrix2x2,
    b0: &mut NodePtr,
    b1: &mut NodePtr,
    eps: f64,
    par: usize,
) {
    let s0 = b0.scale;
    let s1 = b1.scale;
    let z0 = s0.norm_sqr() <= eps;
    let z1 = s1.norm_sqr() <= eps;
    if z0 && z1 {
        return;
    }
    if z1 {
        let kind = b0.kind.clone();
        *b1 = Arc::new(BdtNode {
            scale: mtrx[1][0] * s0,
            kind: kind.clone(),
        });
        *b0 = Arc::new(BdtNode {
            scale: mtrx[0][0] * s0,
            kind,
        });
        return;
    }
    if z0 {
        let kind = b1.kind.clone();
        *b0 = Arc::new(BdtNode {
            scale: mtrx[0][1] * s1,
            kind: kind.clone(),
        });
        *b1 = Arc::new(BdtNode {
            scale: mtrx[1][1] * s1,
            kind,
        });
        return;
    }
    if is_equal_under(b0, b1, eps) {
        let kind = b0.kind.clone();
        *b0 = Arc::new(BdtNode {
            scale: mtrx[0][0] * s0 + mtrx[0][1] * s1,
            kind: kind.clone(),
        });
        *b1 = Arc::new(BdtNode {
            scale: mtrx[1][0] * s0 + mtrx[1][1] * s1,
            kind,
        });
        return;
    }

    let v0 = branch_node(b0);
    let v1 = branch_node(b1);
    match (&mut v0.kind, &mut v1.kind) {
        (NodeKind::Interior(c0), NodeKind::Interior(c1)) => {
            v0.scale = ONE;
            v1.scale = ONE;
            for child in c0.iter_mut() {
                if !child.is_zero(eps) {
                    Arc::make_mut(child).scale *= s0;
                }
            }
            for child in c1.iter_mut() {
                if !child.is_zero(eps) {
                    Arc::make_mut(child).scale *= s1;
                }
            }
            let (l0, r0) = c0.split_at_mut(1);
            let (l1, r1) = c1.split_at_mut(1);
            if par > 0 {
                rayon::join(
                    || push_state_vector(mtrx, &mut l0[0], &mut l1[0], eps, par - 1),
                    || push_state_vector(mtrx, &mut r0[0], &mut r1[0], eps, par - 1),
                );
            } else {
                push_state_vector(mtrx, &mut l0[0], &mut l1[0], eps, 0);
                push_state_vector(mtrx, &mut r0[0], &mut r1[0], eps, 0);
            }
        }
        (NodeKind::Attached(e0), NodeKind::Attached(e1)) => {
            let dim = e0.lock().max_q_power();
            let (snap0, snap1): (Vec<Complex64>, Vec<Complex64>) = {
                let g0 = e0.lock();
                let g1 = e1.lock();
                (
                    (0..dim).map(|p| g0.get_amplitude(p)).collect(),
                    (0..dim).map(|p| g1.get_amplitude(p)).collect(),
                )
            };
            {
                let mut g0 = e0.lock();
                for p in 0..dim {
                    let amp = mtrx[0][0] * s0 * snap0[p as usize] + mtrx[0][1] * s1 * snap1[p as usize];
                    g0.set_amplitude(p, amp);
                }
            }
            {
                let mut g1 = e1.lock();
                for p in 0..dim {
                    let amp = mtrx[1][0] * s0 * snap0[p as usize] + mtrx[1][1] * s1 * snap1[p as usize];
                    g1.set_amplitude(p, amp);
                }
            }
            let n0 = e0.lock().normalize();
            let n1 = e1.lock().normalize();
            if n0 * n0 <= eps {
                v0.set_zero();
            } else {
                v0.scale = Complex64::new(n0, 0.0);
            }
            if n1 * n1 <= eps {
                v1.set_zero();
            } else {
                v1.scale = Complex64::new(n1, 0.0);
            }
        }
        _ => debug_assert!(false, "mismatched vertex kinds in gate push"),
    }
}

/// Exchange the qubits at `depth` and `depth + 1` below `node`.
///
/// At each nonzero vertex of the shallower depth, the four grandchild
/// subtrees transpose, with child scales folded down so the path products
/// are preserved. The caller prunes afterwards.
pub fn transpose_at_depth(node: &mut NodePtr, depth: usize, eps: f64) {
    if node.is_zero(eps) {
        return;
    }
    if depth > 0 {
        let vertex = branch_node(node);
        if let NodeKind::Interior(branches) = &mut vertex.kind {
            let (left, right) = branches.split_at_mut(1);
            transpose_at_depth(&mut left[0], depth - 1, eps);
            transpose_at_depth(&mut right[0], depth - 1, eps);
        }
        return;
    }

    let vertex = branch_node(node);
    let grandchild = |child: &NodePtr, bit: usize| -> NodePtr {
        if child.is_zero(eps) {
            return Arc::new(BdtNode::zero());
        }
        match &child.kind {
            NodeKind::Interior(grand) => {
                let g = &grand[bit];
                if g.is_zero(eps) {
                    Arc::new(BdtNode::zero())
                } else {
                    Arc::new(BdtNode {
                        scale: child.scale * g.scale,
                        kind: g.kind.clone(),
                    })
                }
            }
            _ => Arc::new(BdtNode::zero()),
        }
    };
    let new_branches = {
        let NodeKind::Interior([c0, c1]) = &vertex.kind else {
            return;
        };
        [
            Arc::new(BdtNode::interior(
                ONE,
                [grandchild(c0, 0), grandchild(c1, 0)],
            )),
            Arc::new(BdtNode::interior(
                ONE,
                [grandchild(c0, 1), grandchild(c1, 1)],
            )),
        ]
    };
    vertex.kind = NodeKind::Interior(new_branches);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::select_bit;
    use approx::assert_relative_eq;

    const EPS: f64 = 1e-24;

    fn c(re: f64) -> Complex64 {
        Complex64::new(re, 0.0)
    }

    /// Product of scales along the path selected by `perm`
    fn amplitude_of(root: &NodePtr, perm: u64, depth: usize) -> Complex64 {
        let mut node = root.clone();
        let mut scale = node.scale;
        for level in 0..depth {
            if scale.norm_sqr() <= EPS {
                return Complex64::new(0.0, 0.0);
            }
            let Some(branches) = node.branches() else {
                return Complex64::new(0.0, 0.0);
            };
            let next = branches[select_bit(perm, level)].clone();
            scale *= next.scale;
            node = next;
        }
        scale
    }

    /// |b0⟩ basis spine of the given depth
    fn basis_tree(perm: u64, depth: usize) -> NodePtr {
        let mut child = Arc::new(BdtNode::leaf(c(1.0)));
        for level in (0..depth).rev() {
            let bit = select_bit(perm, level);
            let mut branches = [Arc::new(BdtNode::zero()), Arc::new(BdtNode::zero())];
            branches[bit] = child;
            child = Arc::new(BdtNode::interior(c(1.0), branches));
        }
        child
    }

    /// (|00⟩ + |11⟩)/√2, built without canonical factors
    fn bell_tree() -> NodePtr {
        let h = std::f64::consts::FRAC_1_SQRT_2;
        let spine0 = Arc::new(BdtNode::interior(
            c(h),
            [Arc::new(BdtNode::leaf(c(1.0))), Arc::new(BdtNode::zero())],
        ));
        let spine1 = Arc::new(BdtNode::interior(
            c(h),
            [Arc::new(BdtNode::zero()), Arc::new(BdtNode::leaf(c(1.0)))],
        ));
        Arc::new(BdtNode::interior(c(1.0), [spine0, spine1]))
    }

    #[test]
    fn test_prune_collapses_double_zero() {
        let mut root = Arc::new(BdtNode::interior(
            c(1.0),
            [Arc::new(BdtNode::zero()), Arc::new(BdtNode::zero())],
        ));
        prune(&mut root, 1, EPS);
        assert!(root.is_zero(EPS));
        assert!(matches!(root.kind, NodeKind::Leaf));
    }

    #[test]
    fn test_prune_merges_equal_children() {
        let h = std::f64::consts::FRAC_1_SQRT_2;
        let make_spine = || {
            Arc::new(BdtNode::interior(
                c(h),
                [Arc::new(BdtNode::leaf(c(1.0))), Arc::new(BdtNode::zero())],
            ))
        };
        // (|00⟩ + |10⟩)/√2: both children identical but separately allocated
        let mut root = Arc::new(BdtNode::interior(c(1.0), [make_spine(), make_spine()]));
        prune(&mut root, 2, EPS);
        let branches = root.branches().unwrap();
        assert!(Arc::ptr_eq(&branches[0], &branches[1]));
    }

    #[test]
    fn test_prune_preserves_amplitudes() {
        let mut root = bell_tree();
        let before: Vec<Complex64> = (0..4).map(|p| amplitude_of(&root, p, 2)).collect();
        prune(&mut root, 2, EPS);
        for (p, amp) in before.iter().enumerate() {
            let after = amplitude_of(&root, p as u64, 2);
            assert_relative_eq!(after.re, amp.re, epsilon = 1e-12);
            assert_relative_eq!(after.im, amp.im, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_prune_normalizes_child_pair() {
        let mut root = bell_tree();
        prune(&mut root, 2, EPS);
        let branches = root.branches().unwrap();
        let pair_norm = branches[0].scale.norm_sqr() + branches[1].scale.norm_sqr();
        assert_relative_eq!(pair_norm, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pop_state_vector_pushes_scales() {
        let mut root = bell_tree();
        prune(&mut root, 2, EPS);
        pop_state_vector(&mut root, 2, EPS);
        // interior scales are 1 again, path products unchanged
        assert_relative_eq!((root.scale - c(1.0)).norm(), 0.0, epsilon = 1e-12);
        let h = std::f64::consts::FRAC_1_SQRT_2;
        assert_relative_eq!(amplitude_of(&root, 0b00, 2).norm(), h, epsilon = 1e-12);
        assert_relative_eq!(amplitude_of(&root, 0b11, 2).norm(), h, epsilon = 1e-12);
    }

    #[test]
    fn test_insert_then_remove_round_trip() {
        // |01⟩ host, |1⟩ block spliced at depth 1 → |0⟩,|1⟩,|1⟩ layering
        let mut host = basis_tree(0b10, 2);
        let block = basis_tree(0b1, 1);
        insert_at_depth(&mut host, &block, 1, 1, EPS);
        // path bit order: depth 0 from host, depth 1 the block, depth 2 host's old depth 1
        assert_relative_eq!(amplitude_of(&host, 0b110, 3).norm(), 1.0, epsilon = 1e-12);

        let removed = remove_separable_at_depth(&mut host, 1, 1, EPS).unwrap();
        assert_relative_eq!(amplitude_of(&removed, 0b1, 1).norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(amplitude_of(&host, 0b10, 2).norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_remove_rejects_entangled_block() {
        let mut root = bell_tree();
        prune(&mut root, 2, EPS);
        let before: Vec<Complex64> = (0..4).map(|p| amplitude_of(&root, p, 2)).collect();
        let err = remove_separable_at_depth(&mut root, 1, 1, EPS).unwrap_err();
        assert!(matches!(err, StateError::NotSeparable { .. }));
        // state untouched on failure
        for (p, amp) in before.iter().enumerate() {
            let after = amplitude_of(&root, p as u64, 2);
            assert_relative_eq!((after - amp).norm(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_apply_2x2_hadamard_on_basis() {
        let h = std::f64::consts::FRAC_1_SQRT_2;
        let hadamard: Matrix2x2 = [[c(h), c(h)], [c(h), c(-h)]];
        let mut root = basis_tree(0, 1);
        apply_2x2(&mut root, &hadamard, 0, EPS, 0);
        prune(&mut root, 1, EPS);
        assert_relative_eq!(amplitude_of(&root, 0, 1).norm(), h, epsilon = 1e-12);
        assert_relative_eq!(amplitude_of(&root, 1, 1).norm(), h, epsilon = 1e-12);
    }

    #[test]
    fn test_apply_2x2_pauli_x_flips() {
        let x: Matrix2x2 = [[c(0.0), c(1.0)], [c(1.0), c(0.0)]];
        let mut root = basis_tree(0b0, 1);
        apply_2x2(&mut root, &x, 0, EPS, 0);
        prune(&mut root, 1, EPS);
        assert!(amplitude_of(&root, 0b0, 1).norm_sqr() <= EPS);
        assert_relative_eq!(amplitude_of(&root, 0b1, 1).norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_transpose_swaps_adjacent_qubits() {
        let mut root = basis_tree(0b01, 2);
        transpose_at_depth(&mut root, 0, EPS);
        prune(&mut root, 2, EPS);
        assert_relative_eq!(amplitude_of(&root, 0b10, 2).norm(), 1.0, epsilon = 1e-12);
        assert!(amplitude_of(&root, 0b01, 2).norm_sqr() <= EPS);
    }
}
