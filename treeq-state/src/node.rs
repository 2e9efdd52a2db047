//! Binary-decision-tree vertices with copy-on-write structural sharing
//!
//! A tree of `BdtNode`s encodes an amplitude vector: the amplitude of a basis
//! permutation is the product of `scale` values along the path selected by its
//! bits, times the attached engine's amplitude for the high-order bits when
//! the path ends in an [`NodeKind::Attached`] leaf. Sub-states common to many
//! paths are shared through `Arc`, so the structure is a DAG for reads; every
//! write first localizes visibility with [`branch_node`], the
//! unshare-on-write step.

use crate::engine::EnginePtr;
use num_complex::Complex64;
use std::sync::Arc;

/// Shared handle to a tree vertex
pub type NodePtr = Arc<BdtNode>;

/// One vertex of the decision tree
#[derive(Clone, Debug)]
pub struct BdtNode {
    /// Complex factor this vertex contributes to every path through it
    pub scale: Complex64,
    /// What hangs below the vertex
    pub kind: NodeKind,
}

/// Vertex variant
#[derive(Clone, Debug)]
pub enum NodeKind {
    /// Terminal vertex at full tree depth (or the canonical zero node)
    Leaf,
    /// Two child edges; index = the bit value of the qubit at this depth
    Interior([NodePtr; 2]),
    /// Opaque dense sub-state-vector holding the attached qubits
    Attached(EnginePtr),
}

impl BdtNode {
    /// Terminal vertex with the given scale
    pub fn leaf(scale: Complex64) -> Self {
        Self {
            scale,
            kind: NodeKind::Leaf,
        }
    }

    /// The canonical zero vertex
    pub fn zero() -> Self {
        Self::leaf(Complex64::new(0.0, 0.0))
    }

    /// Interior vertex over two children
    pub fn interior(scale: Complex64, branches: [NodePtr; 2]) -> Self {
        Self {
            scale,
            kind: NodeKind::Interior(branches),
        }
    }

    /// Leaf wrapping a dense sub-engine
    pub fn attached(scale: Complex64, engine: EnginePtr) -> Self {
        Self {
            scale,
            kind: NodeKind::Attached(engine),
        }
    }

    /// Whether the squared scale magnitude is at or below the amplitude floor
    #[inline]
    pub fn is_zero(&self, eps: f64) -> bool {
        self.scale.norm_sqr() <= eps
    }

    /// Turn this vertex into the canonical zero node, dropping children
    pub fn set_zero(&mut self) {
        self.scale = Complex64::new(0.0, 0.0);
        self.kind = NodeKind::Leaf;
    }

    /// Child edges, when interior
    pub fn branches(&self) -> Option<&[NodePtr; 2]> {
        match &self.kind {
            NodeKind::Interior(branches) => Some(branches),
            _ => None,
        }
    }

    /// New shared handle to a shallow copy (children still shared)
    pub fn shallow_clone(&self) -> NodePtr {
        Arc::new(self.clone())
    }
}

/// Bit `bit` of `perm`, as a branch index
#[inline]
pub fn select_bit(perm: u64, bit: usize) -> usize {
    ((perm >> bit) & 1) as usize
}

/// Unshare a vertex for writing
///
/// This is the `Branch` step: after it, mutating the returned vertex cannot be
/// observed through any other handle. An attached leaf additionally gets a
/// private engine copy when its engine is still shared. Re-branching an
/// already-unique vertex changes nothing.
pub fn branch_node(node: &mut NodePtr) -> &mut BdtNode {
    let vertex = Arc::make_mut(node);
    if let NodeKind::Attached(engine) = &mut vertex.kind {
        if Arc::strong_count(engine) > 1 {
            let private = engine.lock().clone_shared();
            *engine = private;
        }
    }
    vertex
}

/// Structural equality below the top scale, within `eps`
///
/// Two vertices are equal-under when their sub-structures match: leaves
/// trivially, attached leaves by engine identity or amplitude agreement,
/// interiors by pairwise child equality (pointer identity short-circuits the
/// recursion).
pub fn is_equal_under(a: &NodePtr, b: &NodePtr, eps: f64) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    match (&a.kind, &b.kind) {
        (NodeKind::Leaf, NodeKind::Leaf) => true,
        (NodeKind::Attached(ea), NodeKind::Attached(eb)) => engines_equal(ea, eb, eps),
        (NodeKind::Interior([a0, a1]), NodeKind::Interior([b0, b1])) => {
            is_equal(a0, b0, eps) && is_equal(a1, b1, eps)
        }
        _ => false,
    }
}

/// Engine equality: pointer identity, else amplitude-wise within `eps`
///
/// Locks are taken in address order so concurrent comparisons of the same
/// pair from different directions cannot deadlock.
fn engines_equal(a: &EnginePtr, b: &EnginePtr, eps: f64) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    let addr_a = Arc::as_ptr(a).cast::<()>() as usize;
    let addr_b = Arc::as_ptr(b).cast::<()>() as usize;
    let (first, second) = if addr_a <= addr_b { (a, b) } else { (b, a) };
    let guard_first = first.lock();
    let guard_second = second.lock();
    if guard_first.qubit_count() != guard_second.qubit_count() {
        return false;
    }
    (0..guard_first.max_q_power()).all(|perm| {
        (guard_first.get_amplitude(perm) - guard_second.get_amplitude(perm)).norm_sqr() <= eps
    })
}

/// Full equality within `eps`: scales match and sub-structures match
pub fn is_equal(a: &NodePtr, b: &NodePtr, eps: f64) -> bool {
    if a.is_zero(eps) && b.is_zero(eps) {
        return true;
    }
    (a.scale - b.scale).norm_sqr() <= eps && is_equal_under(a, b, eps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-24;

    fn one() -> Complex64 {
        Complex64::new(1.0, 0.0)
    }

    #[test]
    fn test_zero_node_is_canonical() {
        let node = BdtNode::zero();
        assert!(node.is_zero(EPS));
        assert!(matches!(node.kind, NodeKind::Leaf));
    }

    #[test]
    fn test_set_zero_drops_children() {
        let mut node = BdtNode::interior(
            one(),
            [Arc::new(BdtNode::leaf(one())), Arc::new(BdtNode::zero())],
        );
        node.set_zero();
        assert!(node.branches().is_none());
        assert!(node.is_zero(EPS));
    }

    #[test]
    fn test_shallow_clone_shares_children() {
        let child = Arc::new(BdtNode::leaf(one()));
        let node = BdtNode::interior(one(), [child.clone(), child.clone()]);
        let copy = node.shallow_clone();
        let branches = copy.branches().unwrap();
        assert!(Arc::ptr_eq(&branches[0], &child));
        assert!(Arc::ptr_eq(&branches[1], &child));
    }

    #[test]
    fn test_branch_unshares() {
        let shared = Arc::new(BdtNode::leaf(one()));
        let mut handle1 = shared.clone();
        let handle2 = shared.clone();

        branch_node(&mut handle1).scale = Complex64::new(0.5, 0.0);

        // handle2 still sees the original scale
        assert_eq!(handle2.scale, one());
        assert_eq!(handle1.scale, Complex64::new(0.5, 0.0));
    }

    #[test]
    fn test_branch_idempotent() {
        let mut handle = Arc::new(BdtNode::leaf(one()));
        branch_node(&mut handle);
        let first = Arc::as_ptr(&handle);
        // already unique: branching again must not reallocate
        branch_node(&mut handle);
        assert_eq!(first, Arc::as_ptr(&handle));
    }

    #[test]
    fn test_equality_tolerance() {
        let a = Arc::new(BdtNode::leaf(one()));
        let b = Arc::new(BdtNode::leaf(Complex64::new(1.0 + 1e-14, 0.0)));
        let c = Arc::new(BdtNode::leaf(Complex64::new(0.5, 0.0)));
        assert!(is_equal(&a, &b, 1e-24));
        assert!(!is_equal(&a, &c, 1e-24));
    }

    #[test]
    fn test_zero_nodes_equal_regardless_of_shape() {
        let plain = Arc::new(BdtNode::zero());
        let zero_interior = Arc::new(BdtNode::interior(
            Complex64::new(0.0, 0.0),
            [Arc::new(BdtNode::leaf(one())), Arc::new(BdtNode::zero())],
        ));
        assert!(is_equal(&plain, &zero_interior, 1e-24));
    }

    #[test]
    fn test_select_bit() {
        assert_eq!(select_bit(0b101, 0), 1);
        assert_eq!(select_bit(0b101, 1), 0);
        assert_eq!(select_bit(0b101, 2), 1);
    }
}
