//! SSA form: a doubly linked instruction graph over single-assignment value
//! ids, with branch bodies as nested chains. The reference-count insertion
//! pass edits the graph in place, which is why nodes live in an arena with
//! explicit prev/next links rather than a flat vector.

use crate::ast::{Binop, Toplvl, Unop};
use ether_core::location::Loc;
use ether_core::symbol::Symbol;
use ether_core::types::Type;
use ether_core::value::Value;
use std::collections::HashMap;
use std::rc::Rc;

pub type SsaId = usize;
pub type NodeId = usize;

/// Sentinel for "no value": the result of an instruction sequence that never
/// falls through (a tail loop or an explicit return).
pub const NO_VAL: SsaId = usize::MAX;

/// Reference-count policy classes attached to every SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcRules {
    /// Fresh value owned by its register; lifetime decided by last-use
    /// analysis.
    Default,
    /// Borrowed or constant; no reference traffic.
    Disable,
    /// Branch-merged value; traffic happens at the moves feeding the phi.
    Phi,
    /// Release pinned to a fixed point (the caught exception).
    Unref,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOp {
    Is,
    Equal,
}

#[derive(Debug)]
pub enum SsaPattern {
    Dummy,
    /// Binds at build time by aliasing value ids; no runtime action.
    Ident,
    Constant { val: Value, op: TestOp, dotest: bool },
    Unpack {
        ty: Rc<Type>,
        offs: Vec<usize>,
        vids: Vec<SsaId>,
        subpats: Vec<SsaPattern>,
        dotest: bool,
    },
    Record { ids: Vec<Symbol>, vids: Vec<SsaId>, subpats: Vec<SsaPattern> },
}

#[derive(Debug)]
pub enum SsaTest {
    NotFalse,
    Type(Rc<Type>),
    Match(SsaPattern),
    Update { vids: Vec<SsaId>, ids: Vec<Symbol> },
}

#[derive(Debug)]
pub enum SsaInsn {
    Nop,
    Cval { out: SsaId, val: Value },
    Apply { out: SsaId, f: SsaId, args: Vec<SsaId> },
    Applytc { out: SsaId, f: SsaId, args: Vec<SsaId> },
    Loop { args: Vec<SsaId> },
    If {
        out: Option<SsaId>,
        cond: SsaId,
        test: SsaTest,
        thenbr: NodeId,
        elsebr: NodeId,
        toplvl: Toplvl,
        likely: i8,
    },
    Try { out: Option<SsaId>, tryid: usize, trybr: NodeId, catchbr: NodeId, likely: i8 },
    Catch { tryid: usize, vid: SsaId },
    Getexn { out: SsaId },
    Mov { out: SsaId, vid: SsaId },
    Ref { vid: SsaId },
    Dec { vid: SsaId },
    Unref { vid: SsaId },
    Drop { vid: SsaId },
    Ret { vid: SsaId },
    Binop { op: Binop, out: SsaId, lhs: SsaId, rhs: SsaId },
    Unop { op: Unop, out: SsaId, vid: SsaId },
    Fn { out: SsaId, arity: usize, caps: Vec<SsaId>, body: Rc<Ssa> },
    Alcfn { out: SsaId, arity: usize },
    Finfn { out: SsaId, arity: usize, caps: Vec<SsaId>, body: Rc<Ssa> },
    Mkscp { clos: Vec<SsaId> },
    Pop { vids: Vec<SsaId> },
    Cap { vids: Vec<SsaId> },
    Mkrcrd { out: SsaId, ty: Rc<Type>, vids: Vec<SsaId> },
    Trace { vid: SsaId, loc: Loc },
}

#[derive(Debug)]
struct Node {
    insn: SsaInsn,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

#[derive(Debug, Default)]
pub struct SsaGraph {
    nodes: Vec<Node>,
}

impl SsaGraph {
    pub fn alloc(&mut self, insn: SsaInsn) -> NodeId {
        self.nodes.push(Node { insn, prev: None, next: None });
        self.nodes.len() - 1
    }

    pub fn insn(&self, id: NodeId) -> &SsaInsn {
        &self.nodes[id].insn
    }

    pub fn insn_mut(&mut self, id: NodeId) -> &mut SsaInsn {
        &mut self.nodes[id].insn
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].next
    }

    /// Link `b` directly after `a`, before whatever followed `a`.
    pub fn insert_after(&mut self, a: NodeId, insn: SsaInsn) -> NodeId {
        let b = self.alloc(insn);
        let after = self.nodes[a].next;
        self.nodes[b].prev = Some(a);
        self.nodes[b].next = after;
        self.nodes[a].next = Some(b);
        if let Some(after) = after {
            self.nodes[after].prev = Some(b);
        }
        b
    }

    /// Link a new node directly before `a`. `a` must not be a chain head;
    /// chains begin with a `Nop` so this holds by construction.
    pub fn insert_before(&mut self, a: NodeId, insn: SsaInsn) -> NodeId {
        let prev = self.nodes[a].prev.expect("insert_before a chain head");
        let b = self.alloc(insn);
        self.nodes[b].prev = Some(prev);
        self.nodes[b].next = Some(a);
        self.nodes[prev].next = Some(b);
        self.nodes[a].prev = Some(b);
        b
    }

    pub fn last_of(&self, head: NodeId) -> NodeId {
        let mut at = head;
        while let Some(next) = self.nodes[at].next {
            at = next;
        }
        at
    }

    pub fn iter_from(&self, head: NodeId) -> ChainIter<'_> {
        ChainIter { graph: self, at: Some(head) }
    }
}

pub struct ChainIter<'a> {
    graph: &'a SsaGraph,
    at: Option<NodeId>,
}

impl Iterator for ChainIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let at = self.at?;
        self.at = self.graph.nodes[at].next;
        Some(at)
    }
}

/// Append-only cursor used while lowering. Chains always start with a `Nop`.
pub struct Tape {
    pub head: NodeId,
    pub point: NodeId,
}

impl Tape {
    pub fn new(graph: &mut SsaGraph) -> Tape {
        let head = graph.alloc(SsaInsn::Nop);
        Tape { head, point: head }
    }

    /// Continue an existing chain at an arbitrary node.
    pub fn at(point: NodeId) -> Tape {
        Tape { head: point, point }
    }

    pub fn write(&mut self, graph: &mut SsaGraph, insn: SsaInsn) -> NodeId {
        let id = graph.insert_after(self.point, insn);
        self.point = id;
        id
    }
}

/// A finished SSA unit for one function body.
#[derive(Debug)]
pub struct Ssa {
    pub nvals: usize,
    pub ntries: usize,
    pub head: NodeId,
    pub graph: SsaGraph,
    /// Loop target sits immediately after this prologue node, when present.
    pub entry_node: Option<NodeId>,
    /// Per traced move/kill instruction: which operand slots transfer the
    /// register's ownership instead of cloning it.
    pub moves: HashMap<NodeId, Vec<bool>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_before_and_after() {
        let mut g = SsaGraph::default();
        let mut tape = Tape::new(&mut g);
        let a = tape.write(&mut g, SsaInsn::Ret { vid: 0 });
        g.insert_before(a, SsaInsn::Drop { vid: 1 });
        g.insert_after(a, SsaInsn::Nop);
        let chain: Vec<NodeId> = g.iter_from(tape.head).collect();
        assert_eq!(chain.len(), 4);
        assert!(matches!(g.insn(chain[1]), SsaInsn::Drop { vid: 1 }));
        assert!(matches!(g.insn(chain[2]), SsaInsn::Ret { vid: 0 }));
    }

    #[test]
    fn test_last_of() {
        let mut g = SsaGraph::default();
        let mut tape = Tape::new(&mut g);
        tape.write(&mut g, SsaInsn::Nop);
        let last = tape.write(&mut g, SsaInsn::Ret { vid: 0 });
        assert_eq!(g.last_of(tape.head), last);
    }
}
