//! AST → IR lowering: name resolution, closure conversion, constant folding,
//! and pattern desugaring.
//!
//! The builder keeps a stack of function frames, each holding its variable
//! list. Resolving an identifier walks outward; a hit in an enclosing frame
//! that is not a constant records a capture at every level in between.
//! Constants are never captured; their value is inlined at each use.

use crate::ast::{Ast, AstNode, AstPattern, AstRef, Binop, Toplvl, Unop};
use crate::ir::{Ir, IrDef, IrDefKind, IrMatchTable, IrNode, IrPattern, IrProgram, IrUnit};
use ether_core::attr::Attr;
use ether_core::exception::exn_sym;
use ether_core::location::Loc;
use ether_core::module::Module;
use ether_core::number::Number;
use ether_core::symbol::Symbol;
use ether_core::types;
use ether_core::value::Value;
use ether_core::{eth_debug, eth_warning};
use std::collections::VecDeque;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("cannot import '{name}': {message}{}", fmt_loc(.loc))]
    ImportFailed { name: String, message: String, loc: Option<Loc> },
    #[error("undefined variable '{name}'{}", fmt_loc(.loc))]
    UndefinedVariable { name: String, loc: Option<Loc> },
    #[error("pattern in let-expression will not match the bound constant{}", fmt_loc(.loc))]
    PatternWontMatch { loc: Option<Loc> },
    #[error("no field '{field}' of type '{ty}'{}", fmt_loc(.loc))]
    NoField { field: String, ty: String, loc: Option<Loc> },
    #[error("'{name}' is not a plain type{}", fmt_loc(.loc))]
    NotPlain { name: String, loc: Option<Loc> },
    #[error("only closures are allowed in a recursive scope{}", fmt_loc(.loc))]
    LetrecRequiresFn { loc: Option<Loc> },
    #[error("recursive bindings must be plain identifiers{}", fmt_loc(.loc))]
    LetrecRequiresIdent { loc: Option<Loc> },
    #[error("wild record {{*}} is only allowed against constant expressions{}", fmt_loc(.loc))]
    RecordStarContext { loc: Option<Loc> },
    #[error("wild record {{*}} target is not a record{}", fmt_loc(.loc))]
    RecordStarNotRecord { loc: Option<Loc> },
    #[error("invalid operands for binary {op}{}", fmt_loc(.loc))]
    InvalidConstantOperands { op: &'static str, loc: Option<Loc> },
    #[error("trying to assign a non-mutable variable '{name}'{}", fmt_loc(.loc))]
    AssignImmutable { name: String, loc: Option<Loc> },
    #[error("public bindings are only allowed at the top level{}", fmt_loc(.loc))]
    PubOutsideToplevel { loc: Option<Loc> },
    #[error("failed to evaluate compile-time expression: {message}{}", fmt_loc(.loc))]
    MacroFailed { message: String, loc: Option<Loc> },
    #[error("missing builtin '{name}'")]
    MissingBuiltin { name: String },
}

fn fmt_loc(loc: &Option<Loc>) -> String {
    match loc {
        Some(loc) => format!(" at {}", loc),
        None => String::new(),
    }
}

/// Seam to the module loader: `$( ... )` compiles and runs the inner
/// expression in a scratch module and substitutes the result as a constant,
/// and `import` pulls a module's public values in as constants.
pub trait MacroEvaluator {
    fn eval(&mut self, ast: &AstRef) -> Result<Value, String>;
    fn load(&mut self, module: &str) -> Result<Vec<ModuleDef>, String>;
}

type BResult<T> = Result<T, BuildError>;

/// One imported binding: identifier, value, attributes.
pub type ModuleDef = (String, Value, Attr);

#[derive(Debug, Clone)]
struct Var {
    ident: String,
    cval: Option<Value>,
    vid: Option<usize>,
    attr: Option<Attr>,
}

#[derive(Debug, Default)]
struct Frame {
    /// Locals at the front (newest first), captures appended at the back.
    vars: VecDeque<Var>,
    capoffs: usize,
    nvars: usize,
}

impl Frame {
    fn find(&self, ident: &str) -> Option<&Var> {
        self.vars.iter().find(|v| v.ident == ident)
    }

    fn nlocals(&self) -> usize {
        self.vars.len() - self.capoffs
    }

    fn pop_locals(&mut self, n: usize) {
        for _ in 0..n {
            self.vars.pop_front();
        }
    }

    fn new_vid(&mut self) -> usize {
        let vid = self.nvars;
        self.nvars += 1;
        vid
    }
}

pub struct IrBuilder<'a> {
    root: &'a Module,
    mac: Option<&'a mut dyn MacroEvaluator>,
    frames: Vec<Frame>,
    defs: Vec<IrDef>,
    istoplvl: bool,
}

pub fn build_ir<'a>(
    ast: &AstRef,
    root: &'a Module,
    mac: Option<&'a mut dyn MacroEvaluator>,
) -> Result<IrProgram, BuildError> {
    let mut bldr = IrBuilder {
        root,
        mac,
        frames: vec![Frame::default()],
        defs: Vec::new(),
        istoplvl: true,
    };
    let body = bldr.build(ast)?;
    let frame = bldr.frames.pop().expect("root frame");
    Ok(IrProgram {
        ir: IrUnit { body, nvars: frame.nvars, specs: Vec::new() },
        defs: bldr.defs,
    })
}

impl<'a> IrBuilder<'a> {
    fn frame(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("at least one frame")
    }

    fn new_vid(&mut self) -> usize {
        self.frame().new_vid()
    }

    /// Resolve an identifier, capturing it into every intermediate frame.
    /// Constants resolve directly and are never captured.
    fn require_var(&mut self, ident: &str) -> Option<Var> {
        self.require_at(self.frames.len() - 1, ident)
    }

    fn require_at(&mut self, depth: usize, ident: &str) -> Option<Var> {
        if let Some(var) = self.frames[depth].find(ident) {
            return Some(var.clone());
        }
        if depth == 0 {
            return self.root.get(ident).map(|def| Var {
                ident: ident.to_string(),
                cval: Some(def.val.clone()),
                vid: None,
                attr: Some(def.attr.clone()),
            });
        }
        let parent = self.require_at(depth - 1, ident)?;
        if parent.cval.is_some() {
            return Some(parent);
        }
        let frame = &mut self.frames[depth];
        let vid = frame.new_vid();
        let var =
            Var { ident: ident.to_string(), cval: None, vid: Some(vid), attr: parent.attr };
        frame.vars.push_back(var.clone());
        frame.capoffs += 1;
        Some(var)
    }

    /// Lookup without capturing, used by redefinition and `defined?` checks.
    fn find_var_deep(&self, ident: &str) -> Option<Var> {
        for frame in self.frames.iter().rev() {
            if let Some(var) = frame.find(ident) {
                return Some(var.clone());
            }
        }
        self.root.get(ident).map(|def| Var {
            ident: ident.to_string(),
            cval: Some(def.val.clone()),
            vid: None,
            attr: Some(def.attr.clone()),
        })
    }

    fn is_redefined(&self, ident: &str) -> bool {
        match self.find_var_deep(ident) {
            None => false,
            Some(var) => !var.attr.is_some_and(|a| a.is_builtin()),
        }
    }

    /// Reference a resolved variable: constants inline, dynamics by id.
    fn var_node(&self, var: &Var, loc: &Option<Loc>) -> IrNode {
        match &var.cval {
            Some(cval) => IrNode::new(Ir::Cval(cval.clone()), loc.clone()),
            None => IrNode::new(
                Ir::Var(var.vid.expect("dynamic variable has a vid")),
                loc.clone(),
            ),
        }
    }

    fn builtin(&self, name: &str) -> BResult<Value> {
        self.root
            .get(name)
            .map(|def| def.val.clone())
            .ok_or_else(|| BuildError::MissingBuiltin { name: name.to_string() })
    }

    fn trace_pub_var(
        &mut self,
        ident: &str,
        varid: usize,
        attr: &Attr,
        loc: &Option<Loc>,
    ) -> BResult<()> {
        if !self.istoplvl {
            return Err(BuildError::PubOutsideToplevel { loc: loc.clone() });
        }
        self.defs.push(IrDef {
            ident: ident.to_string(),
            attr: attr.clone(),
            kind: IrDefKind::Var(varid),
        });
        Ok(())
    }

    fn trace_pub_cval(
        &mut self,
        ident: &str,
        cval: Value,
        attr: &Attr,
        loc: &Option<Loc>,
    ) -> BResult<()> {
        if !self.istoplvl {
            return Err(BuildError::PubOutsideToplevel { loc: loc.clone() });
        }
        self.defs.push(IrDef {
            ident: ident.to_string(),
            attr: attr.clone(),
            kind: IrDefKind::Cval(cval),
        });
        Ok(())
    }

    fn build_sub(&mut self, ast: &AstRef) -> BResult<IrNode> {
        let saved = self.istoplvl;
        self.istoplvl = false;
        let ret = self.build(ast);
        self.istoplvl = saved;
        ret
    }

    fn build(&mut self, ast: &AstRef) -> BResult<IrNode> {
        let loc = ast.loc.clone();
        match &ast.node {
            AstNode::Cval(val) => Ok(IrNode::new(Ir::Cval(val.clone()), loc)),

            AstNode::Ident(name) => {
                let var = self.require_var(name).ok_or_else(|| {
                    BuildError::UndefinedVariable { name: name.clone(), loc: loc.clone() }
                })?;
                if var.attr.as_ref().is_some_and(|a| a.is_deprecated()) {
                    eth_warning!("use of deprecated variable '{}'", name);
                }
                if var.attr.as_ref().is_some_and(|a| a.is_mut()) {
                    // a mutable binding holds a strong reference; reads
                    // dereference it, whether the cell is a constant or not
                    let deref = self.builtin("__dereference")?;
                    let cell = self.var_node(&var, &loc);
                    let args = vec![cell];
                    return Ok(IrNode::new(
                        Ir::Apply { f: Box::new(IrNode::new(Ir::Cval(deref), None)), args },
                        loc,
                    ));
                }
                if let Some(cval) = var.cval {
                    return Ok(IrNode::new(Ir::Cval(cval), loc));
                }
                let vid = var.vid.expect("dynamic variable has a vid");
                Ok(IrNode::new(Ir::Var(vid), loc))
            }

            AstNode::Apply { f, args } => {
                let f = self.build_sub(f)?;
                let args = args.iter().map(|a| self.build_sub(a)).collect::<BResult<_>>()?;
                Ok(IrNode::new(Ir::Apply { f: Box::new(f), args }, loc))
            }

            AstNode::If { cond, then, els } => {
                let cond = self.build_sub(cond)?;
                if let Some(cval) = cond.is_cval() {
                    // constant condition reduces to one branch
                    return if cval.is_false() {
                        self.build_sub(els)
                    } else {
                        self.build_sub(then)
                    };
                }
                let thenbr = self.build_sub(then)?;
                let elsebr = self.build_sub(els)?;
                Ok(IrNode::new(
                    Ir::If {
                        cond: Box::new(cond),
                        thenbr: Box::new(thenbr),
                        elsebr: Box::new(elsebr),
                        toplvl: Toplvl::None,
                        likely: 0,
                    },
                    loc,
                ))
            }

            AstNode::Seq { e1, e2 } => {
                let e1 = self.build_sub(e1)?;
                let e2 = self.build(e2)?;
                Ok(IrNode::new(Ir::Seq { e1: Box::new(e1), e2: Box::new(e2) }, loc))
            }

            AstNode::Let { pats, vals, body } => {
                let vals: Vec<IrNode> =
                    vals.iter().map(|v| self.build_sub(v)).collect::<BResult<_>>()?;
                let nvars0 = self.frame().nlocals();
                self.build_let(0, pats, vals, body, nvars0, &loc)
            }

            AstNode::Letrec { pats, vals, body } => self.build_letrec(pats, vals, body, &loc),

            AstNode::Binop { op, lhs, rhs } => {
                if self.is_redefined(op.sym()) {
                    eth_debug!("redefined operator '{}'", op.sym());
                    let apply = Ast::apply(
                        Ast::ident(op.sym(), loc.clone()),
                        vec![lhs.clone(), rhs.clone()],
                        loc.clone(),
                    );
                    return self.build_sub(&apply);
                }
                let lhs = self.build_sub(lhs)?;
                let rhs = self.build_sub(rhs)?;
                if let (Some(a), Some(b)) = (lhs.is_cval(), rhs.is_cval()) {
                    return self.constexpr_binop(*op, a.clone(), b.clone(), &loc);
                }
                Ok(IrNode::new(
                    Ir::Binop { op: *op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                    loc,
                ))
            }

            AstNode::Unop { op, expr } => {
                if self.is_redefined(op.sym()) {
                    eth_debug!("redefined operator '{}'", op.sym());
                    let apply = Ast::apply(
                        Ast::ident(op.sym(), loc.clone()),
                        vec![expr.clone()],
                        loc.clone(),
                    );
                    return self.build_sub(&apply);
                }
                let expr = self.build_sub(expr)?;
                if let Some(x) = expr.is_cval() {
                    return Ok(IrNode::new(Ir::Cval(constexpr_unop(*op, x)), loc));
                }
                Ok(IrNode::new(Ir::Unop { op: *op, expr: Box::new(expr) }, loc))
            }

            AstNode::Fn { args, body } => self.build_fn(args, body, &loc),

            AstNode::Match { pat, expr, thenbr, elsebr } => {
                let expr = self.build_sub(expr)?;
                let n1 = self.frame().nlocals();
                let pat = self.build_pattern(pat, &loc)?;
                let n2 = self.frame().nlocals();
                let thenbr = self.build_sub(thenbr)?;
                self.frame().pop_locals(n2 - n1);
                let elsebr = self.build_sub(elsebr)?;
                Ok(IrNode::new(
                    Ir::Match {
                        pat,
                        expr: Box::new(expr),
                        thenbr: Box::new(thenbr),
                        elsebr: Box::new(elsebr),
                        toplvl: Toplvl::None,
                        likely: 0,
                    },
                    loc,
                ))
            }

            AstNode::Multimatch { table, exprs } => {
                let exprs: Vec<IrNode> =
                    exprs.iter().map(|e| self.build_sub(e)).collect::<BResult<_>>()?;
                let mut rows = Vec::new();
                let mut actions = Vec::new();
                for (row, action) in table.rows.iter().zip(&table.actions) {
                    let n1 = self.frame().nlocals();
                    let mut irrow = Vec::new();
                    for pat in row {
                        irrow.push(self.build_pattern(pat, &loc)?);
                    }
                    let n2 = self.frame().nlocals();
                    actions.push(self.build_sub(action)?);
                    self.frame().pop_locals(n2 - n1);
                    rows.push(irrow);
                }
                Ok(IrNode::new(
                    Ir::Multimatch { table: IrMatchTable { rows, actions }, exprs },
                    loc,
                ))
            }

            AstNode::And { lhs, rhs } => {
                if self.is_redefined("&&") {
                    let apply = Ast::apply(
                        Ast::ident("&&", loc.clone()),
                        vec![lhs.clone(), rhs.clone()],
                        loc.clone(),
                    );
                    return self.build_sub(&apply);
                }
                let lhs = self.build_sub(lhs)?;
                let rhs = self.build_sub(rhs)?;
                let tmp = self.new_vid();
                let iff = IrNode::new(
                    Ir::If {
                        cond: Box::new(IrNode::new(Ir::Var(tmp), None)),
                        thenbr: Box::new(rhs),
                        elsebr: Box::new(IrNode::new(Ir::Cval(Value::Bool(false)), None)),
                        toplvl: Toplvl::None,
                        likely: 0,
                    },
                    loc.clone(),
                );
                Ok(bind_var(tmp, lhs, iff, loc))
            }

            AstNode::Or { lhs, rhs } => {
                if self.is_redefined("||") {
                    let apply = Ast::apply(
                        Ast::ident("||", loc.clone()),
                        vec![lhs.clone(), rhs.clone()],
                        loc.clone(),
                    );
                    return self.build_sub(&apply);
                }
                let lhs = self.build_sub(lhs)?;
                let rhs = self.build_sub(rhs)?;
                let tmp = self.new_vid();
                let iff = IrNode::new(
                    Ir::If {
                        cond: Box::new(IrNode::new(Ir::Var(tmp), None)),
                        thenbr: Box::new(IrNode::new(Ir::Var(tmp), None)),
                        elsebr: Box::new(rhs),
                        toplvl: Toplvl::None,
                        likely: 0,
                    },
                    loc.clone(),
                );
                Ok(bind_var(tmp, lhs, iff, loc))
            }

            AstNode::Access { expr, field } => {
                let expr = self.build_sub(expr)?;
                if let Some(rec) = expr.is_cval() {
                    let ty = rec.type_of();
                    if !ty.is_plain() {
                        return Err(BuildError::NotPlain { name: ty.name.to_string(), loc });
                    }
                    let idx = ty.field_index(Symbol::intern(field));
                    if idx == ty.nfields() {
                        return Err(BuildError::NoField {
                            field: field.clone(),
                            ty: ty.name.to_string(),
                            loc,
                        });
                    }
                    let val = rec.field(idx).expect("field index in range");
                    return Ok(IrNode::new(Ir::Cval(val), loc));
                }
                // match expr with { field = tmp } -> tmp, else raise access_error
                let tmp = self.new_vid();
                let alias = self.new_vid();
                let pat = IrPattern::Record {
                    varid: alias,
                    ids: vec![Symbol::intern(field)],
                    subpats: vec![IrPattern::Ident { vid: tmp }],
                };
                let throw = IrNode::new(
                    Ir::Throw {
                        exn: Box::new(IrNode::new(Ir::Cval(exn_sym("access_error")), loc.clone())),
                    },
                    loc.clone(),
                );
                Ok(IrNode::new(
                    Ir::Match {
                        pat,
                        expr: Box::new(expr),
                        thenbr: Box::new(IrNode::new(Ir::Var(tmp), loc.clone())),
                        elsebr: Box::new(throw),
                        toplvl: Toplvl::None,
                        likely: 1,
                    },
                    loc,
                ))
            }

            AstNode::Try { pats, trybr, handlers, check_exit } => {
                self.build_try(pats, trybr, handlers, *check_exit, &loc)
            }

            AstNode::MkRcrd { ty, fields } => {
                if !ty.is_plain() {
                    return Err(BuildError::NotPlain { name: ty.name.to_string(), loc });
                }
                // evaluate fields in the type's canonical order
                let mut ordered = Vec::with_capacity(ty.nfields());
                for fld in ty.fields() {
                    let entry = fields.iter().find(|(name, _)| *name == *fld.name);
                    match entry {
                        Some((_, val)) => ordered.push(self.build_sub(val)?),
                        None => {
                            return Err(BuildError::NoField {
                                field: fld.name.to_string(),
                                ty: ty.name.to_string(),
                                loc,
                            })
                        }
                    }
                }
                Ok(IrNode::new(Ir::MkRcrd { ty: ty.clone(), fields: ordered }, loc))
            }

            AstNode::Update { src, fields } => {
                let src = self.build_sub(src)?;
                let mut sorted: Vec<(Symbol, &AstRef)> = fields
                    .iter()
                    .map(|(name, val)| (Symbol::intern(name), val))
                    .collect();
                sorted.sort_unstable_by_key(|(sym, _)| sym.id());
                let mut ids = Vec::with_capacity(sorted.len());
                let mut vals = Vec::with_capacity(sorted.len());
                for (sym, val) in sorted {
                    ids.push(sym);
                    vals.push(self.build_sub(val)?);
                }
                Ok(IrNode::new(Ir::Update { src: Box::new(src), fields: vals, ids }, loc))
            }

            AstNode::Assert { expr } => {
                let expr = self.build_sub(expr)?;
                let okbr = IrNode::new(Ir::Cval(Value::Nil), loc.clone());
                let errbr = IrNode::new(
                    Ir::Throw {
                        exn: Box::new(IrNode::new(
                            Ir::Cval(exn_sym("assertion_failed")),
                            loc.clone(),
                        )),
                    },
                    loc.clone(),
                );
                Ok(IrNode::new(
                    Ir::If {
                        cond: Box::new(expr),
                        thenbr: Box::new(okbr),
                        elsebr: Box::new(errbr),
                        toplvl: Toplvl::None,
                        likely: 1,
                    },
                    loc,
                ))
            }

            AstNode::Defined { ident } => {
                let defined = self.find_var_deep(ident).is_some();
                Ok(IrNode::new(Ir::Cval(Value::Bool(defined)), loc))
            }

            AstNode::Evmac { expr } => {
                match self.mac.as_deref_mut() {
                    None => Err(BuildError::MacroFailed {
                        message: "no compile-time evaluator installed".to_string(),
                        loc,
                    }),
                    Some(mac) => match mac.eval(expr) {
                        Ok(val) if val.is_exn() => Err(BuildError::MacroFailed {
                            message: format!("exception thrown: {}", val),
                            loc,
                        }),
                        Ok(val) => Ok(IrNode::new(Ir::Cval(val), loc)),
                        Err(message) => Err(BuildError::MacroFailed { message, loc }),
                    },
                }
            }

            AstNode::Assign { ident, val } => {
                let var = self.require_var(ident).ok_or_else(|| {
                    BuildError::UndefinedVariable { name: ident.clone(), loc: loc.clone() }
                })?;
                if !var.attr.as_ref().is_some_and(|a| a.is_mut()) {
                    return Err(BuildError::AssignImmutable { name: ident.clone(), loc });
                }
                let assign = self.builtin("__assign")?;
                let cell = self.var_node(&var, &loc);
                let args = vec![cell, self.build_sub(val)?];
                Ok(IrNode::new(
                    Ir::Apply { f: Box::new(IrNode::new(Ir::Cval(assign), None)), args },
                    loc,
                ))
            }

            AstNode::Return { expr } => {
                let expr = self.build_sub(expr)?;
                Ok(IrNode::new(Ir::Return { expr: Box::new(expr) }, loc))
            }

            AstNode::Import { module, body } => {
                let defs = match self.mac.as_deref_mut() {
                    None => Err("no module loader installed".to_string()),
                    Some(mac) => mac.load(module),
                };
                let defs = defs.map_err(|message| BuildError::ImportFailed {
                    name: module.clone(),
                    message,
                    loc: loc.clone(),
                })?;
                // imported bindings are constants over the body
                let n = defs.len();
                for (ident, val, attr) in defs {
                    self.frame().vars.push_front(Var {
                        ident,
                        cval: Some(val),
                        vid: None,
                        attr: Some(attr),
                    });
                }
                let ret = self.build(body)?;
                self.frame().pop_locals(n);
                Ok(ret)
            }
        }
    }

    fn build_let(
        &mut self,
        idx: usize,
        pats: &[AstPattern],
        mut vals: Vec<IrNode>,
        body: &AstRef,
        nvars0: usize,
        loc: &Option<Loc>,
    ) -> BResult<IrNode> {
        if idx == pats.len() {
            let nvars = self.frame().nlocals() - nvars0;
            let ret = self.build(body)?;
            self.frame().pop_locals(nvars);
            return Ok(ret);
        }
        let val = std::mem::replace(&mut vals[idx], IrNode::new(Ir::Error, None));
        if let Some(cval) = val.is_cval() {
            let cval = cval.clone();
            if !self.build_pattern_constexpr(&pats[idx], &cval, loc)? {
                eth_warning!("pattern in let-expression will not match `{}`", cval);
                return Err(BuildError::PatternWontMatch { loc: loc.clone() });
            }
            return self.build_let(idx + 1, pats, vals, body, nvars0, loc);
        }
        let pat = self.build_pattern(&pats[idx], loc)?;
        let thenbr = self.build_let(idx + 1, pats, vals, body, nvars0, loc)?;
        let elsebr = IrNode::new(
            Ir::Throw { exn: Box::new(IrNode::new(Ir::Cval(exn_sym("type_error")), loc.clone())) },
            loc.clone(),
        );
        Ok(IrNode::new(
            Ir::Match {
                pat,
                expr: Box::new(val),
                thenbr: Box::new(thenbr),
                elsebr: Box::new(elsebr),
                toplvl: if self.istoplvl { Toplvl::Then } else { Toplvl::None },
                likely: 1,
            },
            loc.clone(),
        ))
    }

    fn build_letrec(
        &mut self,
        pats: &[AstPattern],
        vals: &[AstRef],
        body: &AstRef,
        loc: &Option<Loc>,
    ) -> BResult<IrNode> {
        for val in vals {
            if !matches!(val.node, AstNode::Fn { .. }) {
                return Err(BuildError::LetrecRequiresFn { loc: loc.clone() });
            }
        }
        let mut varids = Vec::with_capacity(pats.len());
        for pat in pats {
            let irpat = self.build_pattern(pat, loc)?;
            match irpat {
                IrPattern::Ident { vid } => varids.push(vid),
                _ => return Err(BuildError::LetrecRequiresIdent { loc: loc.clone() }),
            }
        }
        let chain = self.build_letrec_chain(0, &varids, vals, body, loc)?;
        self.frame().pop_locals(pats.len());
        Ok(IrNode::new(
            Ir::Startfix { vars: varids, body: Box::new(chain) },
            loc.clone(),
        ))
    }

    fn build_letrec_chain(
        &mut self,
        idx: usize,
        varids: &[usize],
        vals: &[AstRef],
        body: &AstRef,
        loc: &Option<Loc>,
    ) -> BResult<IrNode> {
        if idx == vals.len() {
            let inner = self.build(body)?;
            return Ok(IrNode::new(
                Ir::Endfix { vars: varids.to_vec(), body: Box::new(inner) },
                loc.clone(),
            ));
        }
        let expr = self.build_sub(&vals[idx])?;
        let thenbr = self.build_letrec_chain(idx + 1, varids, vals, body, loc)?;
        let elsebr = IrNode::new(
            Ir::Throw { exn: Box::new(IrNode::new(Ir::Cval(exn_sym("type_error")), loc.clone())) },
            loc.clone(),
        );
        Ok(IrNode::new(
            Ir::Match {
                pat: IrPattern::Ident { vid: varids[idx] },
                expr: Box::new(expr),
                thenbr: Box::new(thenbr),
                elsebr: Box::new(elsebr),
                toplvl: Toplvl::Then,
                likely: 1,
            },
            loc.clone(),
        ))
    }

    fn build_fn(
        &mut self,
        args: &[AstPattern],
        body: &AstRef,
        loc: &Option<Loc>,
    ) -> BResult<IrNode> {
        self.frames.push(Frame::default());
        let saved_toplvl = std::mem::replace(&mut self.istoplvl, false);

        let result = (|| -> BResult<(IrUnit, Vec<usize>, Vec<usize>)> {
            // argument vids come first and are dense from zero
            let arity = args.len();
            let argvids: Vec<usize> = (0..arity).map(|_| self.new_vid()).collect();
            let mut argpats = Vec::with_capacity(arity);
            for pat in args {
                argpats.push(self.build_pattern(pat, loc)?);
            }
            let nargvars = self.frame().vars.len() - self.frame().capoffs;

            let mut acc = self.build(body)?;
            for (argvid, pat) in argvids.into_iter().zip(argpats).rev() {
                let throw = IrNode::new(
                    Ir::Throw {
                        exn: Box::new(IrNode::new(Ir::Cval(exn_sym("type_error")), loc.clone())),
                    },
                    loc.clone(),
                );
                acc = IrNode::new(
                    Ir::Match {
                        pat,
                        expr: Box::new(IrNode::new(Ir::Var(argvid), None)),
                        thenbr: Box::new(acc),
                        elsebr: Box::new(throw),
                        toplvl: Toplvl::None,
                        likely: 1,
                    },
                    loc.clone(),
                );
            }

            // pop locals so only captures remain
            self.frame().pop_locals(nargvars);
            let frame = self.frames.last().expect("fn frame");
            let mut capvars = Vec::with_capacity(frame.vars.len());
            let mut capidents = Vec::with_capacity(frame.vars.len());
            for cap in &frame.vars {
                capvars.push(cap.vid.expect("captures are dynamic"));
                capidents.push(cap.ident.clone());
            }
            let nvars = frame.nvars;

            // resolve capture sources in the enclosing frame
            let parent = self.frames.len() - 2;
            let mut caps = Vec::with_capacity(capidents.len());
            for ident in &capidents {
                let var = self.frames[parent]
                    .find(ident)
                    .expect("capture source exists in the parent frame");
                caps.push(var.vid.expect("captured variables are dynamic"));
            }
            Ok((IrUnit { body: acc, nvars, specs: Vec::new() }, caps, capvars))
        })();

        self.frames.pop();
        self.istoplvl = saved_toplvl;
        let (unit, caps, capvars) = result?;
        Ok(IrNode::new(
            Ir::Fn { arity: args.len(), caps, capvars, body: Rc::new(unit) },
            loc.clone(),
        ))
    }

    fn build_try(
        &mut self,
        pats: &[AstPattern],
        trybr: &AstRef,
        handlers: &[AstRef],
        check_exit: bool,
        loc: &Option<Loc>,
    ) -> BResult<IrNode> {
        let trybr = self.build_sub(trybr)?;
        let exnvar = self.new_vid();
        let whatvid = self.new_vid();

        let rethrow = |loc: &Option<Loc>| {
            IrNode::new(
                Ir::Throw { exn: Box::new(IrNode::new(Ir::Var(exnvar), loc.clone())) },
                loc.clone(),
            )
        };

        // handler chain over the payload; unmatched exceptions rethrow
        let mut chain = rethrow(loc);
        for (pat, handler) in pats.iter().zip(handlers).rev() {
            let n1 = self.frame().nlocals();
            let pat = self.build_pattern(pat, loc)?;
            let n2 = self.frame().nlocals();
            let body = self.build_sub(handler)?;
            self.frame().pop_locals(n2 - n1);
            chain = IrNode::new(
                Ir::Match {
                    pat,
                    expr: Box::new(IrNode::new(Ir::Var(whatvid), None)),
                    thenbr: Box::new(body),
                    elsebr: Box::new(chain),
                    toplvl: Toplvl::None,
                    likely: 0,
                },
                loc.clone(),
            );
        }

        // exit objects pass through every user handler
        if check_exit {
            let dummy = self.new_vid();
            let exitpat = IrPattern::Unpack {
                varid: dummy,
                ty: types::exit_type(),
                offs: Vec::new(),
                subpats: Vec::new(),
            };
            chain = IrNode::new(
                Ir::Match {
                    pat: exitpat,
                    expr: Box::new(IrNode::new(Ir::Var(whatvid), None)),
                    thenbr: Box::new(rethrow(loc)),
                    elsebr: Box::new(chain),
                    toplvl: Toplvl::None,
                    likely: -1,
                },
                loc.clone(),
            );
        }

        // unpack the payload out of the caught exception
        let alias = self.new_vid();
        let unpack = IrPattern::Unpack {
            varid: alias,
            ty: types::exception_type(),
            offs: vec![0],
            subpats: vec![IrPattern::Ident { vid: whatvid }],
        };
        let catchbr = IrNode::new(
            Ir::Match {
                pat: unpack,
                expr: Box::new(IrNode::new(Ir::Var(exnvar), None)),
                thenbr: Box::new(chain),
                elsebr: Box::new(rethrow(loc)),
                toplvl: Toplvl::None,
                likely: 1,
            },
            loc.clone(),
        );

        Ok(IrNode::new(
            Ir::Try {
                exnvar,
                trybr: Box::new(trybr),
                catchbr: Box::new(catchbr),
                likely: 1,
            },
            loc.clone(),
        ))
    }

    fn constexpr_binop(
        &mut self,
        op: Binop,
        lhs: Value,
        rhs: Value,
        loc: &Option<Loc>,
    ) -> BResult<IrNode> {
        let ret = match op {
            Binop::Is => Value::Bool(lhs.is_identical(&rhs)),
            Binop::Equal => Value::Bool(lhs.equal(&rhs)),
            Binop::Cons => Value::cons(lhs, rhs),
            _ => {
                let (Some(x), Some(y)) = (lhs.as_num(), rhs.as_num()) else {
                    eth_warning!(
                        "invalid operands for binary {} ({} and {})",
                        op.sym(),
                        lhs.type_of().name,
                        rhs.type_of().name
                    );
                    return Err(BuildError::InvalidConstantOperands {
                        op: op.sym(),
                        loc: loc.clone(),
                    });
                };
                fold_numeric_binop(op, x, y)
            }
        };
        Ok(IrNode::new(Ir::Cval(ret), loc.clone()))
    }

    // -- patterns --

    fn build_pattern(&mut self, pat: &AstPattern, loc: &Option<Loc>) -> BResult<IrPattern> {
        match pat {
            AstPattern::Dummy => Ok(IrPattern::Dummy),

            AstPattern::Ident { name, attr } => {
                let varid = self.new_vid();
                if let Some(attr) = attr {
                    if attr.is_pub() {
                        self.trace_pub_var(name, varid, attr, loc)?;
                    }
                }
                self.frame().vars.push_front(Var {
                    ident: name.clone(),
                    cval: None,
                    vid: Some(varid),
                    attr: attr.clone(),
                });
                Ok(IrPattern::Ident { vid: varid })
            }

            AstPattern::Unpack { ty, fields, alias } => {
                let varid = self.new_vid();
                if let Some(alias) = alias {
                    self.frame().vars.push_front(Var {
                        ident: alias.clone(),
                        cval: None,
                        vid: Some(varid),
                        attr: None,
                    });
                }
                let mut offs = Vec::with_capacity(fields.len());
                let mut subpats = Vec::with_capacity(fields.len());
                for (name, sub) in fields {
                    let idx = ty.field_index(Symbol::intern(name));
                    if idx == ty.nfields() {
                        return Err(BuildError::NoField {
                            field: name.clone(),
                            ty: ty.name.to_string(),
                            loc: loc.clone(),
                        });
                    }
                    offs.push(idx);
                    subpats.push(self.build_pattern(sub, loc)?);
                }
                Ok(IrPattern::Unpack { varid, ty: ty.clone(), offs, subpats })
            }

            AstPattern::Constant(val) => Ok(IrPattern::Constant { val: val.clone() }),

            AstPattern::Record { fields, alias } => {
                let varid = self.new_vid();
                if let Some(alias) = alias {
                    self.frame().vars.push_front(Var {
                        ident: alias.clone(),
                        cval: None,
                        vid: Some(varid),
                        attr: None,
                    });
                }
                let mut entries: Vec<(Symbol, &AstPattern)> = fields
                    .iter()
                    .map(|(name, sub)| (Symbol::intern(name), sub))
                    .collect();
                // sorted ids enable the linear-probe record load
                entries.sort_unstable_by_key(|(sym, _)| sym.id());
                let mut ids = Vec::with_capacity(entries.len());
                let mut subpats = Vec::with_capacity(entries.len());
                for (sym, sub) in entries {
                    ids.push(sym);
                    subpats.push(self.build_pattern(sub, loc)?);
                }
                Ok(IrPattern::Record { varid, ids, subpats })
            }

            AstPattern::RecordStar { .. } => {
                Err(BuildError::RecordStarContext { loc: loc.clone() })
            }
        }
    }

    /// Match a pattern against a compile-time constant, binding everything it
    /// names as constants. Returns false when the pattern cannot match.
    fn build_pattern_constexpr(
        &mut self,
        pat: &AstPattern,
        expr: &Value,
        loc: &Option<Loc>,
    ) -> BResult<bool> {
        match pat {
            AstPattern::Dummy => Ok(true),

            AstPattern::Ident { name, attr } => {
                if let Some(attr) = attr {
                    if attr.is_pub() {
                        self.trace_pub_cval(name, expr.clone(), attr, loc)?;
                    }
                }
                self.frame().vars.push_front(Var {
                    ident: name.clone(),
                    cval: Some(expr.clone()),
                    vid: None,
                    attr: attr.clone(),
                });
                Ok(true)
            }

            AstPattern::Unpack { ty, fields, alias } => {
                if !expr.has_type(ty) {
                    return Ok(false);
                }
                if let Some(alias) = alias {
                    self.frame().vars.push_front(Var {
                        ident: alias.clone(),
                        cval: Some(expr.clone()),
                        vid: None,
                        attr: None,
                    });
                }
                for (name, sub) in fields {
                    let idx = ty.field_index(Symbol::intern(name));
                    if idx == ty.nfields() {
                        return Err(BuildError::NoField {
                            field: name.clone(),
                            ty: ty.name.to_string(),
                            loc: loc.clone(),
                        });
                    }
                    let val = expr.field(idx).expect("field index in range");
                    if !self.build_pattern_constexpr(sub, &val, loc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            AstPattern::Constant(val) => Ok(expr.equal(val)),

            AstPattern::Record { fields, alias } => {
                let ty = expr.type_of();
                if !ty.is_record() {
                    return Ok(false);
                }
                if let Some(alias) = alias {
                    self.frame().vars.push_front(Var {
                        ident: alias.clone(),
                        cval: Some(expr.clone()),
                        vid: None,
                        attr: None,
                    });
                }
                for (name, sub) in fields {
                    let idx = ty.field_index(Symbol::intern(name));
                    if idx == ty.nfields() {
                        eth_warning!("no field '{}' in type '{}'", name, ty.name);
                        return Ok(false);
                    }
                    let val = expr.field(idx).expect("field index in range");
                    if !self.build_pattern_constexpr(sub, &val, loc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            AstPattern::RecordStar { attr, alias } => {
                let ty = expr.type_of();
                if !ty.is_record() {
                    return Err(BuildError::RecordStarNotRecord { loc: loc.clone() });
                }
                // bind every field of the record, newest first
                for (idx, fld) in ty.fields().iter().enumerate().rev() {
                    let val = expr.field(idx).expect("field index in range");
                    if let Some(attr) = attr {
                        if attr.is_pub() {
                            self.trace_pub_cval(&fld.name, val.clone(), attr, loc)?;
                        }
                    }
                    self.frame().vars.push_front(Var {
                        ident: fld.name.to_string(),
                        cval: Some(val),
                        vid: None,
                        attr: attr.clone(),
                    });
                }
                if let Some(alias) = alias {
                    self.frame().vars.push_front(Var {
                        ident: alias.clone(),
                        cval: Some(expr.clone()),
                        vid: None,
                        attr: None,
                    });
                }
                Ok(true)
            }
        }
    }
}

/// `match tmp = val in body` with an always-matching identifier pattern.
fn bind_var(vid: usize, val: IrNode, body: IrNode, loc: Option<Loc>) -> IrNode {
    IrNode::new(
        Ir::Match {
            pat: IrPattern::Ident { vid },
            expr: Box::new(val),
            thenbr: Box::new(body),
            elsebr: Box::new(IrNode::new(Ir::Error, None)),
            toplvl: Toplvl::None,
            likely: 0,
        },
        loc,
    )
}

fn fold_numeric_binop(op: Binop, x: Number, y: Number) -> Value {
    match op {
        Binop::Add => Value::Num(x.add(y)),
        Binop::Sub => Value::Num(x.sub(y)),
        Binop::Mul => Value::Num(x.mul(y)),
        Binop::Div => Value::Num(x.div(y)),
        Binop::Mod => Value::Num(x.rem(y)),
        Binop::Pow => Value::Num(x.pow(y)),
        Binop::Land => Value::Num(Number::Int(x.as_bits() & y.as_bits())),
        Binop::Lor => Value::Num(Number::Int(x.as_bits() | y.as_bits())),
        Binop::Lxor => Value::Num(Number::Int(x.as_bits() ^ y.as_bits())),
        Binop::Lshl | Binop::Ashl => {
            Value::Num(Number::Int(((x.as_bits() as u64) << (y.as_bits() as u32 & 63)) as i64))
        }
        Binop::Lshr => {
            Value::Num(Number::Int(((x.as_bits() as u64) >> (y.as_bits() as u32 & 63)) as i64))
        }
        Binop::Ashr => Value::Num(Number::Int(x.as_bits() >> (y.as_bits() as u32 & 63))),
        // comparisons yield the right operand so chains keep flowing
        Binop::Lt => {
            if x < y {
                Value::Num(y)
            } else {
                Value::Bool(false)
            }
        }
        Binop::Le => {
            if x <= y {
                Value::Num(y)
            } else {
                Value::Bool(false)
            }
        }
        Binop::Gt => {
            if x > y {
                Value::Num(y)
            } else {
                Value::Bool(false)
            }
        }
        Binop::Ge => {
            if x >= y {
                Value::Num(y)
            } else {
                Value::Bool(false)
            }
        }
        Binop::Eq => Value::Bool(x == y),
        Binop::Ne => Value::Bool(x != y),
        Binop::Is | Binop::Equal | Binop::Cons => unreachable!("handled by the caller"),
    }
}

fn constexpr_unop(op: Unop, x: &Value) -> Value {
    match op {
        Unop::Not => Value::Bool(x.is_false()),
        Unop::Lnot => match x.as_num() {
            Some(n) => Value::Num(Number::Int(!n.as_bits())),
            None => Value::Bool(false),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn build(src: &str) -> Result<IrProgram, BuildError> {
        let tokens = Lexer::new(src).tokenize().unwrap();
        let ast = Parser::new(tokens).parse_program().unwrap();
        let root = Module::new("test");
        build_ir(&ast, &root, None)
    }

    fn build_with_root(src: &str, root: &Module) -> Result<IrProgram, BuildError> {
        let tokens = Lexer::new(src).tokenize().unwrap();
        let ast = Parser::new(tokens).parse_program().unwrap();
        build_ir(&ast, root, None)
    }

    #[test]
    fn test_constant_folding_arithmetic() {
        let prog = build("1 + 2 * 3").unwrap();
        match &prog.ir.body.ir {
            Ir::Cval(v) => assert!(v.equal(&Value::num(7))),
            other => panic!("expected folded constant, got {:?}", other),
        }
    }

    #[test]
    fn test_division_by_zero_folds_to_inf() {
        let prog = build("1 / 0").unwrap();
        match &prog.ir.body.ir {
            Ir::Cval(Value::Num(n)) => assert!(n.as_f64().is_infinite()),
            other => panic!("expected Inf constant, got {:?}", other),
        }
    }

    #[test]
    fn test_constant_if_reduces() {
        let prog = build("if 1 < 2 then 10 else 20").unwrap();
        match &prog.ir.body.ir {
            Ir::Cval(v) => assert!(v.equal(&Value::num(10))),
            other => panic!("expected folded if, got {:?}", other),
        }
    }

    #[test]
    fn test_constant_let_binds_constant() {
        // x is a constant, so the whole body folds
        let prog = build("let x = 21 in x + x").unwrap();
        match &prog.ir.body.ir {
            Ir::Cval(v) => assert!(v.equal(&Value::num(42))),
            other => panic!("expected folded constant, got {:?}", other),
        }
    }

    #[test]
    fn test_incompatible_constant_pattern_is_an_error() {
        let err = build("let 2 = 1 in nil").unwrap_err();
        assert!(matches!(err, BuildError::PatternWontMatch { .. }));
    }

    #[test]
    fn test_undefined_variable() {
        let err = build("x + 1").unwrap_err();
        assert!(matches!(err, BuildError::UndefinedVariable { name, .. } if name == "x"));
    }

    #[test]
    fn test_letrec_rejects_non_fn() {
        let err = build("let rec x = 1 in x").unwrap_err();
        assert!(matches!(err, BuildError::LetrecRequiresFn { .. }));
    }

    #[test]
    fn test_letrec_builds_startfix() {
        let prog = build("let rec f x = f x in f").unwrap();
        fn find_startfix(node: &IrNode) -> bool {
            match &node.ir {
                Ir::Startfix { .. } => true,
                Ir::Match { expr, thenbr, elsebr, .. } => {
                    find_startfix(expr) || find_startfix(thenbr) || find_startfix(elsebr)
                }
                _ => false,
            }
        }
        assert!(find_startfix(&prog.ir.body));
    }

    #[test]
    fn test_captures_are_recorded() {
        // the inner function encloses the outer function's argument
        let prog = build("fn a -> fn x -> a").unwrap();
        let Ir::Fn { body: outer, caps, .. } = &prog.ir.body.ir else {
            panic!("expected the outer fn")
        };
        assert!(caps.is_empty());
        fn find_fn(node: &IrNode) -> Option<(&Vec<usize>, &Vec<usize>)> {
            match &node.ir {
                Ir::Fn { caps, capvars, .. } => Some((caps, capvars)),
                Ir::Match { expr, thenbr, elsebr, .. } => find_fn(expr)
                    .or_else(|| find_fn(thenbr))
                    .or_else(|| find_fn(elsebr)),
                _ => None,
            }
        }
        let (caps, capvars) = find_fn(&outer.body).expect("inner fn node");
        assert_eq!(caps.len(), 1);
        assert_eq!(capvars.len(), 1);
    }

    #[test]
    fn test_constants_are_not_captured() {
        let prog = build("let a = 1 in fn x -> a").unwrap();
        fn find_fn(node: &IrNode) -> Option<&Vec<usize>> {
            match &node.ir {
                Ir::Fn { caps, .. } => Some(caps),
                Ir::Match { expr, thenbr, elsebr, .. } => find_fn(expr)
                    .or_else(|| find_fn(thenbr))
                    .or_else(|| find_fn(elsebr)),
                _ => None,
            }
        }
        let caps = find_fn(&prog.ir.body).expect("fn node");
        assert!(caps.is_empty(), "constants must be inlined, not captured");
    }

    #[test]
    fn test_operator_redefinition_rewrites_to_apply() {
        let prog = build("let (+) a b = a * b in 2 + 3").unwrap();
        fn has_runtime_apply(node: &IrNode) -> bool {
            match &node.ir {
                Ir::Apply { .. } => true,
                Ir::Match { expr, thenbr, elsebr, .. } => {
                    has_runtime_apply(expr)
                        || has_runtime_apply(thenbr)
                        || has_runtime_apply(elsebr)
                }
                _ => false,
            }
        }
        assert!(has_runtime_apply(&prog.ir.body));
    }

    #[test]
    fn test_pub_defs_are_traced() {
        let prog = build("let pub answer = 42\nnil").unwrap();
        assert_eq!(prog.defs.len(), 1);
        assert_eq!(prog.defs[0].ident, "answer");
        assert!(matches!(&prog.defs[0].kind, IrDefKind::Cval(v) if v.equal(&Value::num(42))));
    }

    #[test]
    fn test_pub_outside_toplevel_is_an_error() {
        let err = build("let f = fn x -> let pub y = x in y in f").unwrap_err();
        assert!(matches!(err, BuildError::PubOutsideToplevel { .. }));
    }

    #[test]
    fn test_access_on_constant_record_folds() {
        let prog = build("{ x = 1, y = 2 }.y").unwrap();
        match &prog.ir.body.ir {
            Ir::Cval(v) => assert!(v.equal(&Value::num(2))),
            other => panic!("expected folded access, got {:?}", other),
        }
    }

    #[test]
    fn test_record_star_binds_all_fields() {
        let prog = build("let {*} = { a = 1, b = 2 } in a + b").unwrap();
        match &prog.ir.body.ir {
            Ir::Cval(v) => assert!(v.equal(&Value::num(3))),
            other => panic!("expected folded constant, got {:?}", other),
        }
    }

    #[test]
    fn test_record_star_against_runtime_value_is_an_error() {
        let root = {
            let mut m = Module::new("root");
            m.define("id", Value::num(1), Attr::builtin());
            m
        };
        // force a non-constant via a function argument
        let err = build_with_root("let f = fn r -> let {*} = r in nil in f", &root).unwrap_err();
        assert!(matches!(err, BuildError::RecordStarContext { .. }));
    }

    #[test]
    fn test_deprecated_use_builds_fine() {
        let mut root = Module::new("root");
        let mut attr = Attr::builtin();
        attr.flags |= ether_core::attr::AttrFlags::DEPRECATED;
        root.define("old", Value::num(1), attr);
        let prog = build_with_root("old + 1", &root).unwrap();
        assert!(matches!(&prog.ir.body.ir, Ir::Cval(v) if v.equal(&Value::num(2))));
    }

    #[test]
    fn test_assign_requires_mut() {
        let mut root = Module::new("root");
        root.define(
            "__assign",
            Value::num(0), // placeholder, never called at build time
            Attr::builtin(),
        );
        let err = build_with_root("let x = 1 in x := 2", &root).unwrap_err();
        // x is bound as a constant, so assignment fails the mutability check
        assert!(matches!(err, BuildError::AssignImmutable { .. }));
    }
}
