//! The abstract syntax tree: an immutable, shared expression tree produced
//! by the parser and consumed by the IR builder. Factory functions build
//! located nodes.

use ether_core::attr::Attr;
use ether_core::location::Loc;
use ether_core::types::Type;
use ether_core::value::Value;
use std::rc::Rc;

pub type AstRef = Rc<Ast>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binop {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Land,
    Lor,
    Lxor,
    Lshl,
    Lshr,
    Ashl,
    Ashr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Is,
    Equal,
    Cons,
}

impl Binop {
    /// Surface spelling, also the identifier the operator may be rebound to.
    pub fn sym(self) -> &'static str {
        match self {
            Binop::Add => "+",
            Binop::Sub => "-",
            Binop::Mul => "*",
            Binop::Div => "/",
            Binop::Mod => "mod",
            Binop::Pow => "^",
            Binop::Land => "land",
            Binop::Lor => "lor",
            Binop::Lxor => "lxor",
            Binop::Lshl => "lsl",
            Binop::Lshr => "lsr",
            Binop::Ashl => "asl",
            Binop::Ashr => "asr",
            Binop::Lt => "<",
            Binop::Le => "<=",
            Binop::Gt => ">",
            Binop::Ge => ">=",
            Binop::Eq => "=",
            Binop::Ne => "<>",
            Binop::Is => "is",
            Binop::Equal => "==",
            Binop::Cons => "::",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unop {
    Not,
    Lnot,
}

impl Unop {
    pub fn sym(self) -> &'static str {
        match self {
            Unop::Not => "not",
            Unop::Lnot => "lnot",
        }
    }
}

/// Marks the spine of top-level `let` chains so the SSA builder can find the
/// point where module definitions are all in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Toplvl {
    #[default]
    None,
    Then,
    Else,
}

#[derive(Debug)]
pub struct Ast {
    pub node: AstNode,
    pub loc: Option<Loc>,
}

#[derive(Debug)]
pub enum AstNode {
    Cval(Value),
    Ident(String),
    Apply { f: AstRef, args: Vec<AstRef> },
    If { cond: AstRef, then: AstRef, els: AstRef },
    Seq { e1: AstRef, e2: AstRef },
    Let { pats: Vec<AstPattern>, vals: Vec<AstRef>, body: AstRef },
    Letrec { pats: Vec<AstPattern>, vals: Vec<AstRef>, body: AstRef },
    Binop { op: Binop, lhs: AstRef, rhs: AstRef },
    Unop { op: Unop, expr: AstRef },
    Fn { args: Vec<AstPattern>, body: AstRef },
    Match { pat: AstPattern, expr: AstRef, thenbr: AstRef, elsebr: AstRef },
    And { lhs: AstRef, rhs: AstRef },
    Or { lhs: AstRef, rhs: AstRef },
    Access { expr: AstRef, field: String },
    /// `try e with p1 -> h1 | ...`. Patterns match the exception payload; an
    /// unmatched or exit-carrying exception is rethrown.
    Try { pats: Vec<AstPattern>, trybr: AstRef, handlers: Vec<AstRef>, check_exit: bool },
    MkRcrd { ty: Rc<Type>, fields: Vec<(String, AstRef)> },
    Update { src: AstRef, fields: Vec<(String, AstRef)> },
    Assert { expr: AstRef },
    Defined { ident: String },
    Evmac { expr: AstRef },
    Multimatch { table: MatchTable, exprs: Vec<AstRef> },
    Assign { ident: String, val: AstRef },
    Return { expr: AstRef },
    /// Bind a module's public values as constants over `body`.
    Import { module: String, body: AstRef },
}

/// Pattern matrix of a multi-scrutinee match: one row of patterns per
/// branch, one column per scrutinee expression.
#[derive(Debug)]
pub struct MatchTable {
    pub rows: Vec<Vec<AstPattern>>,
    pub actions: Vec<AstRef>,
}

#[derive(Debug, Clone)]
pub enum AstPattern {
    Dummy,
    Ident { name: String, attr: Option<Attr> },
    Unpack { ty: Rc<Type>, fields: Vec<(String, AstPattern)>, alias: Option<String> },
    Constant(Value),
    Record { fields: Vec<(String, AstPattern)>, alias: Option<String> },
    RecordStar { attr: Option<Attr>, alias: Option<String> },
}

impl AstPattern {
    pub fn ident(name: &str) -> AstPattern {
        AstPattern::Ident { name: name.to_string(), attr: None }
    }
}

fn at(node: AstNode, loc: Option<Loc>) -> AstRef {
    Rc::new(Ast { node, loc })
}

impl Ast {
    pub fn cval(val: Value, loc: Option<Loc>) -> AstRef {
        at(AstNode::Cval(val), loc)
    }

    pub fn ident(name: &str, loc: Option<Loc>) -> AstRef {
        at(AstNode::Ident(name.to_string()), loc)
    }

    pub fn apply(f: AstRef, args: Vec<AstRef>, loc: Option<Loc>) -> AstRef {
        at(AstNode::Apply { f, args }, loc)
    }

    pub fn iff(cond: AstRef, then: AstRef, els: AstRef, loc: Option<Loc>) -> AstRef {
        at(AstNode::If { cond, then, els }, loc)
    }

    pub fn seq(e1: AstRef, e2: AstRef, loc: Option<Loc>) -> AstRef {
        at(AstNode::Seq { e1, e2 }, loc)
    }

    pub fn let_(
        pats: Vec<AstPattern>,
        vals: Vec<AstRef>,
        body: AstRef,
        loc: Option<Loc>,
    ) -> AstRef {
        at(AstNode::Let { pats, vals, body }, loc)
    }

    pub fn letrec(
        pats: Vec<AstPattern>,
        vals: Vec<AstRef>,
        body: AstRef,
        loc: Option<Loc>,
    ) -> AstRef {
        at(AstNode::Letrec { pats, vals, body }, loc)
    }

    pub fn binop(op: Binop, lhs: AstRef, rhs: AstRef, loc: Option<Loc>) -> AstRef {
        at(AstNode::Binop { op, lhs, rhs }, loc)
    }

    pub fn unop(op: Unop, expr: AstRef, loc: Option<Loc>) -> AstRef {
        at(AstNode::Unop { op, expr }, loc)
    }

    pub fn fn_(args: Vec<AstPattern>, body: AstRef, loc: Option<Loc>) -> AstRef {
        at(AstNode::Fn { args, body }, loc)
    }

    pub fn match_(
        pat: AstPattern,
        expr: AstRef,
        thenbr: AstRef,
        elsebr: AstRef,
        loc: Option<Loc>,
    ) -> AstRef {
        at(AstNode::Match { pat, expr, thenbr, elsebr }, loc)
    }

    pub fn and(lhs: AstRef, rhs: AstRef, loc: Option<Loc>) -> AstRef {
        at(AstNode::And { lhs, rhs }, loc)
    }

    pub fn or(lhs: AstRef, rhs: AstRef, loc: Option<Loc>) -> AstRef {
        at(AstNode::Or { lhs, rhs }, loc)
    }

    pub fn access(expr: AstRef, field: &str, loc: Option<Loc>) -> AstRef {
        at(AstNode::Access { expr, field: field.to_string() }, loc)
    }

    pub fn try_(
        pats: Vec<AstPattern>,
        trybr: AstRef,
        handlers: Vec<AstRef>,
        check_exit: bool,
        loc: Option<Loc>,
    ) -> AstRef {
        at(AstNode::Try { pats, trybr, handlers, check_exit }, loc)
    }

    pub fn mkrcrd(ty: Rc<Type>, fields: Vec<(String, AstRef)>, loc: Option<Loc>) -> AstRef {
        at(AstNode::MkRcrd { ty, fields }, loc)
    }

    pub fn update(src: AstRef, fields: Vec<(String, AstRef)>, loc: Option<Loc>) -> AstRef {
        at(AstNode::Update { src, fields }, loc)
    }

    pub fn assert(expr: AstRef, loc: Option<Loc>) -> AstRef {
        at(AstNode::Assert { expr }, loc)
    }

    pub fn defined(ident: &str, loc: Option<Loc>) -> AstRef {
        at(AstNode::Defined { ident: ident.to_string() }, loc)
    }

    pub fn evmac(expr: AstRef, loc: Option<Loc>) -> AstRef {
        at(AstNode::Evmac { expr }, loc)
    }

    pub fn multimatch(table: MatchTable, exprs: Vec<AstRef>, loc: Option<Loc>) -> AstRef {
        at(AstNode::Multimatch { table, exprs }, loc)
    }

    pub fn assign(ident: &str, val: AstRef, loc: Option<Loc>) -> AstRef {
        at(AstNode::Assign { ident: ident.to_string(), val }, loc)
    }

    pub fn return_(expr: AstRef, loc: Option<Loc>) -> AstRef {
        at(AstNode::Return { expr }, loc)
    }

    pub fn import(module: &str, body: AstRef, loc: Option<Loc>) -> AstRef {
        at(AstNode::Import { module: module.to_string(), body }, loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factories_carry_locations() {
        let loc = Loc::point(None, 1, 1);
        let node = Ast::ident("x", Some(loc.clone()));
        assert_eq!(node.loc.as_ref(), Some(&loc));
        match &node.node {
            AstNode::Ident(name) => assert_eq!(name, "x"),
            _ => panic!("expected ident"),
        }
    }

    #[test]
    fn test_operator_spellings() {
        assert_eq!(Binop::Cons.sym(), "::");
        assert_eq!(Binop::Equal.sym(), "==");
        assert_eq!(Unop::Not.sym(), "not");
    }
}
