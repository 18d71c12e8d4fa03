//! The IR: a desugared tree where identifiers are dense variable ids local
//! to one function unit, record patterns carry sorted symbol ids, and
//! `let rec` is bracketed in `Startfix`/`Endfix` so the SSA builder can
//! introduce a closure scope.

use crate::ast::{Binop, Toplvl, Unop};
use ether_core::attr::Attr;
use ether_core::location::Loc;
use ether_core::symbol::Symbol;
use ether_core::types::Type;
use ether_core::value::Value;
use std::rc::Rc;

#[derive(Debug)]
pub struct IrNode {
    pub ir: Ir,
    pub loc: Option<Loc>,
}

impl IrNode {
    pub fn new(ir: Ir, loc: Option<Loc>) -> IrNode {
        IrNode { ir, loc }
    }

    pub fn is_cval(&self) -> Option<&Value> {
        match &self.ir {
            Ir::Cval(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum Ir {
    /// Placeholder produced on build errors; never reaches the SSA stage.
    Error,
    Cval(Value),
    Var(usize),
    Apply { f: Box<IrNode>, args: Vec<IrNode> },
    If { cond: Box<IrNode>, thenbr: Box<IrNode>, elsebr: Box<IrNode>, toplvl: Toplvl, likely: i8 },
    Try { exnvar: usize, trybr: Box<IrNode>, catchbr: Box<IrNode>, likely: i8 },
    Seq { e1: Box<IrNode>, e2: Box<IrNode> },
    Binop { op: Binop, lhs: Box<IrNode>, rhs: Box<IrNode> },
    Unop { op: Unop, expr: Box<IrNode> },
    Fn { arity: usize, caps: Vec<usize>, capvars: Vec<usize>, body: Rc<IrUnit> },
    Match {
        pat: IrPattern,
        expr: Box<IrNode>,
        thenbr: Box<IrNode>,
        elsebr: Box<IrNode>,
        toplvl: Toplvl,
        likely: i8,
    },
    Multimatch { table: IrMatchTable, exprs: Vec<IrNode> },
    Startfix { vars: Vec<usize>, body: Box<IrNode> },
    Endfix { vars: Vec<usize>, body: Box<IrNode> },
    MkRcrd { ty: Rc<Type>, fields: Vec<IrNode> },
    Update { src: Box<IrNode>, fields: Vec<IrNode>, ids: Vec<Symbol> },
    Throw { exn: Box<IrNode> },
    Return { expr: Box<IrNode> },
}

#[derive(Debug, Clone)]
pub enum IrPattern {
    Dummy,
    Ident { vid: usize },
    Unpack { varid: usize, ty: Rc<Type>, offs: Vec<usize>, subpats: Vec<IrPattern> },
    Constant { val: Value },
    Record { varid: usize, ids: Vec<Symbol>, subpats: Vec<IrPattern> },
}

#[derive(Debug)]
pub struct IrMatchTable {
    pub rows: Vec<Vec<IrPattern>>,
    pub actions: Vec<IrNode>,
}

/// Optional type facts a caller may seed the SSA builder with.
#[derive(Debug)]
pub enum Spec {
    Type { varid: usize, ty: Rc<Type> },
}

/// One function's worth of IR: the body plus the number of variable ids it
/// uses. Ids are dense in `[0, nvars)`.
#[derive(Debug)]
pub struct IrUnit {
    pub body: IrNode,
    pub nvars: usize,
    pub specs: Vec<Spec>,
}

/// A public binding of a compiled module body.
#[derive(Debug)]
pub struct IrDef {
    pub ident: String,
    pub attr: Attr,
    pub kind: IrDefKind,
}

#[derive(Debug)]
pub enum IrDefKind {
    Var(usize),
    Cval(Value),
}

/// Result of lowering one source unit.
#[derive(Debug)]
pub struct IrProgram {
    pub ir: IrUnit,
    pub defs: Vec<IrDef>,
}
