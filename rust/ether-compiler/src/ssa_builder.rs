//! IR → SSA lowering: type-flow analysis, pattern-match compilation, tail
//! call recognition, exception plumbing, and reference-count placement.
//!
//! Type and constant facts learned while compiling patterns are recorded in
//! an undo log scoped to logical blocks: entering a block snapshots the log,
//! leaving it rolls every action back, so facts proven inside one branch
//! never leak into its sibling.

use crate::ast::{Binop, Toplvl, Unop};
use crate::ir::{Ir, IrDef, IrDefKind, IrMatchTable, IrNode, IrPattern, IrUnit, Spec};
use crate::ssa::{
    NodeId, RcRules, Ssa, SsaGraph, SsaId, SsaInsn, SsaPattern, SsaTest, Tape, TestOp, NO_VAL,
};
use ether_core::exception::exn_sym;
use ether_core::location::Loc;
use ether_core::symbol::Symbol;
use ether_core::types::{self, Type};
use ether_core::value::Value;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SsaError {
    #[error("expression will fail: expected number, got {got}{}", fmt_loc(.loc))]
    NumberExpected { got: String, loc: Option<Loc> },
    #[error("unsupported pattern in multi-way match{}", fmt_loc(.loc))]
    UnsupportedMultimatch { loc: Option<Loc> },
    #[error("unsupported constant in match pattern: {val}")]
    UnsupportedConstantPattern { val: String },
    #[error("internal error: {what}")]
    Internal { what: String },
}

fn fmt_loc(loc: &Option<Loc>) -> String {
    match loc {
        Some(loc) => format!(" at {}", loc),
        None => String::new(),
    }
}

type SResult<T> = Result<T, SsaError>;

/// Information about one enclosed variable of a function under construction.
#[derive(Debug, Clone)]
pub struct CapInfo {
    pub varid_local: usize,
    pub ty: Option<Rc<Type>>,
    pub cval: Option<Value>,
    pub isthis: bool,
}

#[derive(Debug, Default)]
struct ValueInfo {
    rules: Option<RcRules>,
    cval: Option<Value>,
    ty: Option<Rc<Type>>,
    creatloc: Option<NodeId>,
    /// Known (field id, value id) pairs unpacked out of this value.
    fields: Vec<(Symbol, SsaId)>,
    isthis: bool,
}

#[derive(Debug, Default, Clone)]
struct IrVarInfo {
    ssavid: Option<SsaId>,
    ty: Option<Rc<Type>>,
}

enum Action {
    SetCval { vid: SsaId, old_cval: Option<Value>, old_ty: Option<Rc<Type>> },
    SetType { vid: SsaId, old_ty: Option<Rc<Type>> },
    SetField { vid: SsaId, fid: Symbol },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchRes {
    Unknown,
    Success,
    Failure,
}

fn combine(a: MatchRes, b: MatchRes) -> MatchRes {
    if a == MatchRes::Failure || b == MatchRes::Failure {
        MatchRes::Failure
    } else if a == MatchRes::Unknown || b == MatchRes::Unknown {
        MatchRes::Unknown
    } else {
        MatchRes::Success
    }
}

struct Builder {
    irv: Vec<IrVarInfo>,
    vals: Vec<ValueInfo>,
    movs: Vec<NodeId>,
    ntries: usize,
    istry: usize,
    tryid: usize,
    actions: Vec<Action>,
    graph: SsaGraph,
    testexn: bool,
}

impl Builder {
    fn new(nirvars: usize) -> Builder {
        Builder {
            irv: vec![IrVarInfo::default(); nirvars],
            vals: Vec::new(),
            movs: Vec::new(),
            ntries: 0,
            istry: 0,
            tryid: 0,
            actions: Vec::new(),
            graph: SsaGraph::default(),
            testexn: true,
        }
    }

    fn new_val(&mut self, rules: RcRules) -> SsaId {
        self.vals.push(ValueInfo { rules: Some(rules), ..ValueInfo::default() });
        self.vals.len() - 1
    }

    fn rules(&self, vid: SsaId) -> RcRules {
        self.vals[vid].rules.expect("rc rules assigned at creation")
    }

    fn new_try(&mut self) -> usize {
        let id = self.ntries;
        self.ntries += 1;
        id
    }

    fn trace_mov(&mut self, node: NodeId) {
        self.movs.push(node);
    }

    fn ssavid(&self, irvar: usize) -> SResult<SsaId> {
        self.irv[irvar]
            .ssavid
            .ok_or_else(|| SsaError::Internal { what: format!("unbound IR variable {}", irvar) })
    }

    fn block(&mut self) -> Tape {
        Tape::new(&mut self.graph)
    }

    // -- logical blocks (transactional type flow) --

    fn begin_logical_block(&self) -> usize {
        self.actions.len()
    }

    fn end_logical_block(&mut self, start: usize) {
        while self.actions.len() > start {
            let action = self.actions.pop().expect("non-empty action log");
            match action {
                Action::SetCval { vid, old_cval, old_ty } => {
                    self.vals[vid].cval = old_cval;
                    self.vals[vid].ty = old_ty;
                }
                Action::SetType { vid, old_ty } => {
                    self.vals[vid].ty = old_ty;
                }
                Action::SetField { vid, fid } => {
                    let fields = &mut self.vals[vid].fields;
                    if let Some(at) = fields.iter().position(|(id, _)| *id == fid) {
                        fields.remove(at);
                    }
                }
            }
        }
    }

    fn set_cval(&mut self, vid: SsaId, val: Value) {
        self.actions.push(Action::SetCval {
            vid,
            old_cval: self.vals[vid].cval.clone(),
            old_ty: self.vals[vid].ty.clone(),
        });
        self.vals[vid].ty = Some(val.type_of());
        self.vals[vid].cval = Some(val);
    }

    fn set_type(&mut self, vid: SsaId, ty: Rc<Type>) {
        self.actions.push(Action::SetType { vid, old_ty: self.vals[vid].ty.clone() });
        self.vals[vid].ty = Some(ty);
    }

    fn set_field(&mut self, vid: SsaId, fid: Symbol, fldvid: SsaId) {
        self.actions.push(Action::SetField { vid, fid });
        self.vals[vid].fields.push((fid, fldvid));
    }

    // -- throw sites --

    /// Trace the raise site, then route to the innermost catch handler or
    /// return the exception for the caller to re-test.
    fn write_throw(&mut self, tape: &mut Tape, exnvid: SsaId, loc: Option<&Loc>) {
        if let Some(loc) = loc {
            tape.write(&mut self.graph, SsaInsn::Trace { vid: exnvid, loc: loc.clone() });
        }
        if self.istry > 0 {
            let node = tape
                .write(&mut self.graph, SsaInsn::Catch { tryid: self.tryid, vid: exnvid });
            self.trace_mov(node);
        } else {
            tape.write(&mut self.graph, SsaInsn::Ret { vid: exnvid });
        }
    }

    fn assert_number(
        &mut self,
        tape: &mut Tape,
        vid: SsaId,
        loc: Option<&Loc>,
    ) -> SResult<()> {
        if let Some(ty) = &self.vals[vid].ty {
            if !Rc::ptr_eq(ty, &types::number_type()) {
                return Err(SsaError::NumberExpected {
                    got: ty.name.to_string(),
                    loc: loc.cloned(),
                });
            }
            return Ok(());
        }
        let mut errtape = self.block();
        let exn = self.new_val(RcRules::Disable);
        errtape.write(&mut self.graph, SsaInsn::Cval { out: exn, val: exn_sym("type_error") });
        self.write_throw(&mut errtape, exn, loc);
        let noptape = self.block();
        tape.write(
            &mut self.graph,
            SsaInsn::If {
                out: None,
                cond: vid,
                test: SsaTest::Type(types::number_type()),
                thenbr: noptape.head,
                elsebr: errtape.head,
                toplvl: Toplvl::None,
                likely: 1,
            },
        );
        Ok(())
    }

    fn write_exception_test(&mut self, tape: &mut Tape, vid: SsaId, loc: Option<&Loc>) {
        if !self.testexn {
            return;
        }
        let mut throwtape = self.block();
        self.write_throw(&mut throwtape, vid, loc);
        let noptape = self.block();
        tape.write(
            &mut self.graph,
            SsaInsn::If {
                out: None,
                cond: vid,
                test: SsaTest::Type(types::exception_type()),
                thenbr: throwtape.head,
                elsebr: noptape.head,
                toplvl: Toplvl::None,
                likely: -1,
            },
        );
    }

    // -- phi plumbing --

    fn move_to_phi(&mut self, tape: &mut Tape, phi: SsaId, vid: SsaId) {
        let node = tape.write(&mut self.graph, SsaInsn::Mov { out: phi, vid });
        self.trace_mov(node);
    }

    fn resolve_phi(
        &mut self,
        t1: &mut Tape,
        r1: SsaId,
        t2: &mut Tape,
        r2: SsaId,
    ) -> SsaId {
        if self.rules(r1) == RcRules::Disable && self.rules(r2) == RcRules::Disable {
            let phi = self.new_val(RcRules::Disable);
            // constant merge: plain moves, no reference traffic
            t1.write(&mut self.graph, SsaInsn::Mov { out: phi, vid: r1 });
            t2.write(&mut self.graph, SsaInsn::Mov { out: phi, vid: r2 });
            phi
        } else {
            let phi = self.new_val(RcRules::Phi);
            self.move_to_phi(t1, phi, r1);
            self.move_to_phi(t2, phi, r2);
            phi
        }
    }

    // -- patterns --

    fn build_pattern(
        &mut self,
        pat: &IrPattern,
        expr: SsaId,
    ) -> SResult<(SsaPattern, MatchRes)> {
        match pat {
            IrPattern::Dummy => Ok((SsaPattern::Dummy, MatchRes::Success)),

            IrPattern::Ident { vid } => {
                self.irv[*vid].ssavid = Some(expr);
                Ok((SsaPattern::Ident, MatchRes::Success))
            }

            IrPattern::Unpack { varid, ty, offs, subpats } => {
                let mut res = MatchRes::Unknown;
                if let Some(known) = &self.vals[expr].ty {
                    res = if Rc::ptr_eq(known, ty) {
                        MatchRes::Success
                    } else {
                        MatchRes::Failure
                    };
                }
                // fix the type for the inner branch
                self.set_type(expr, ty.clone());
                self.irv[*varid].ssavid = Some(expr);

                let mut vids = Vec::with_capacity(subpats.len());
                let mut subs = Vec::with_capacity(subpats.len());
                for (off, sub) in offs.iter().zip(subpats) {
                    let vid = self.new_val(RcRules::Default);
                    vids.push(vid);
                    self.set_field(expr, ty.fields()[*off].sym, vid);
                    let (sub, subres) = self.build_pattern(sub, vid)?;
                    subs.push(sub);
                    res = combine(res, subres);
                }
                let dotest = res != MatchRes::Success;
                Ok((
                    SsaPattern::Unpack {
                        ty: ty.clone(),
                        offs: offs.clone(),
                        vids,
                        subpats: subs,
                        dotest,
                    },
                    res,
                ))
            }

            IrPattern::Constant { val } => {
                let ty = val.type_of();
                let op = if Rc::ptr_eq(&ty, &types::nil_type())
                    || Rc::ptr_eq(&ty, &types::boolean_type())
                    || Rc::ptr_eq(&ty, &types::symbol_type())
                {
                    TestOp::Is
                } else if Rc::ptr_eq(&ty, &types::string_type())
                    || Rc::ptr_eq(&ty, &types::number_type())
                {
                    TestOp::Equal
                } else {
                    return Err(SsaError::UnsupportedConstantPattern {
                        val: val.to_string(),
                    });
                };
                let info = &self.vals[expr];
                let (res, dotest) = match (&info.cval, &info.ty) {
                    (Some(cval), _) if cval.equal(val) => (MatchRes::Success, false),
                    (_, Some(known)) if !Rc::ptr_eq(known, &ty) => (MatchRes::Failure, true),
                    _ => (MatchRes::Unknown, true),
                };
                if res == MatchRes::Unknown {
                    // fix value and type for the inner branch
                    self.set_cval(expr, val.clone());
                }
                Ok((SsaPattern::Constant { val: val.clone(), op, dotest }, res))
            }

            IrPattern::Record { varid, ids, subpats } => {
                self.irv[*varid].ssavid = Some(expr);
                let mut res = MatchRes::Unknown;

                if let Some(known) = self.vals[expr].ty.clone() {
                    // known scrutinee type: resolve every field now and emit
                    // offset loads instead of a runtime probe
                    let mut offs = Vec::with_capacity(ids.len());
                    let mut missing = false;
                    for id in ids {
                        let idx = known.field_index(*id);
                        if idx == known.nfields() {
                            missing = true;
                            break;
                        }
                        offs.push(idx);
                    }
                    if !missing {
                        // the scrutinee trivially has its own type, so the
                        // match outcome rests on the subpatterns alone
                        res = MatchRes::Success;
                        let mut vids = Vec::with_capacity(subpats.len());
                        let mut subs = Vec::with_capacity(subpats.len());
                        for sub in subpats {
                            let vid = self.new_val(RcRules::Default);
                            vids.push(vid);
                            let (sub, subres) = self.build_pattern(sub, vid)?;
                            subs.push(sub);
                            res = combine(res, subres);
                        }
                        let dotest = res != MatchRes::Success;
                        return Ok((
                            SsaPattern::Unpack {
                                ty: known,
                                offs,
                                vids,
                                subpats: subs,
                                dotest,
                            },
                            res,
                        ));
                    }
                    res = MatchRes::Failure;
                }

                let mut vids = Vec::with_capacity(subpats.len());
                let mut subs = Vec::with_capacity(subpats.len());
                for (id, sub) in ids.iter().zip(subpats) {
                    let vid = self.new_val(RcRules::Default);
                    vids.push(vid);
                    self.set_field(expr, *id, vid);
                    let (sub, subres) = self.build_pattern(sub, vid)?;
                    subs.push(sub);
                    res = combine(res, subres);
                }
                Ok((SsaPattern::Record { ids: ids.clone(), vids, subpats: subs }, res))
            }
        }
    }

    // -- functions --

    fn build_fn(
        &mut self,
        tape: &mut Tape,
        arity: usize,
        caps: &[usize],
        capvars: &[usize],
        body: &IrUnit,
        self_outer: Option<usize>,
    ) -> SResult<SsaId> {
        let mut parent_vids = Vec::with_capacity(caps.len());
        let mut capinfo = Vec::with_capacity(caps.len());
        for (outer, local) in caps.iter().zip(capvars) {
            let pvid = self.ssavid(*outer)?;
            parent_vids.push(pvid);
            capinfo.push(CapInfo {
                varid_local: *local,
                ty: self.vals[pvid].ty.clone(),
                cval: self.vals[pvid].cval.clone(),
                isthis: self_outer == Some(*outer),
            });
        }
        let ssa = build_fn_body(body, arity, capinfo)?;
        let ret = self.new_val(RcRules::Default);
        let node = tape.write(
            &mut self.graph,
            SsaInsn::Fn { out: ret, arity, caps: parent_vids, body: Rc::new(ssa) },
        );
        self.vals[ret].creatloc = Some(node);
        self.trace_mov(node);
        Ok(ret)
    }

    fn build_finfn(
        &mut self,
        tape: &mut Tape,
        out: SsaId,
        arity: usize,
        caps: &[usize],
        capvars: &[usize],
        body: &IrUnit,
        self_outer: Option<usize>,
    ) -> SResult<()> {
        let mut parent_vids = Vec::with_capacity(caps.len());
        let mut capinfo = Vec::with_capacity(caps.len());
        for (outer, local) in caps.iter().zip(capvars) {
            let pvid = self.ssavid(*outer)?;
            parent_vids.push(pvid);
            capinfo.push(CapInfo {
                varid_local: *local,
                ty: self.vals[pvid].ty.clone(),
                cval: self.vals[pvid].cval.clone(),
                isthis: self_outer == Some(*outer),
            });
        }
        let ssa = build_fn_body(body, arity, capinfo)?;
        let node = tape.write(
            &mut self.graph,
            SsaInsn::Finfn { out, arity, caps: parent_vids, body: Rc::new(ssa) },
        );
        self.trace_mov(node);
        Ok(())
    }

    // -- main lowering --

    fn build_logical_block(
        &mut self,
        tape: &mut Tape,
        ir: &IrNode,
        istc: bool,
    ) -> SResult<SsaId> {
        let start = self.begin_logical_block();
        let ret = self.build(tape, ir, istc);
        self.end_logical_block(start);
        ret
    }

    fn build(&mut self, tape: &mut Tape, ir: &IrNode, istc: bool) -> SResult<SsaId> {
        let loc = ir.loc.as_ref();
        match &ir.ir {
            Ir::Error => Err(SsaError::Internal { what: "error node reached SSA".into() }),

            Ir::Cval(val) => {
                let ret = self.new_val(RcRules::Disable);
                self.vals[ret].cval = Some(val.clone());
                self.vals[ret].ty = Some(val.type_of());
                tape.write(&mut self.graph, SsaInsn::Cval { out: ret, val: val.clone() });
                Ok(ret)
            }

            Ir::Var(vid) => self.ssavid(*vid),

            Ir::Apply { f, args } => {
                let f = self.build(tape, f, false)?;
                let mut argvids = Vec::with_capacity(args.len());
                for arg in args {
                    argvids.push(self.build(tape, arg, false)?);
                }

                if istc && self.rules(f) == RcRules::Disable && self.vals[f].isthis {
                    // tail self-call: rebind the argument registers and jump
                    // back to the function entry
                    tape.write(&mut self.graph, SsaInsn::Loop { args: argvids });
                    return Ok(NO_VAL);
                }

                let ret = self.new_val(RcRules::Default);
                let insn = if istc && self.rules(f) == RcRules::Disable {
                    SsaInsn::Applytc { out: ret, f, args: argvids }
                } else {
                    SsaInsn::Apply { out: ret, f, args: argvids }
                };
                let node = tape.write(&mut self.graph, insn);
                self.vals[ret].creatloc = Some(node);
                self.write_exception_test(tape, ret, loc);
                Ok(ret)
            }

            Ir::If { cond, thenbr, elsebr, toplvl, likely } => {
                let cond = self.build(tape, cond, false)?;
                let mut thentape = self.block();
                let thenret = self.build_logical_block(&mut thentape, thenbr, istc)?;
                let mut elsetape = self.block();
                let elseret = self.build_logical_block(&mut elsetape, elsebr, istc)?;

                let ret = if istc {
                    if thenret != NO_VAL {
                        thentape.write(&mut self.graph, SsaInsn::Ret { vid: thenret });
                    }
                    if elseret != NO_VAL {
                        elsetape.write(&mut self.graph, SsaInsn::Ret { vid: elseret });
                    }
                    NO_VAL
                } else {
                    self.resolve_phi(&mut thentape, thenret, &mut elsetape, elseret)
                };

                let node = tape.write(
                    &mut self.graph,
                    SsaInsn::If {
                        out: (ret != NO_VAL).then_some(ret),
                        cond,
                        test: SsaTest::NotFalse,
                        thenbr: thentape.head,
                        elsebr: elsetape.head,
                        toplvl: *toplvl,
                        likely: *likely,
                    },
                );
                if ret != NO_VAL {
                    self.vals[ret].creatloc = Some(node);
                }
                Ok(ret)
            }

            Ir::Try { exnvar, trybr, catchbr, likely } => {
                let mut trytape = self.block();
                self.istry += 1;
                let oldid = self.tryid;
                let tryid = self.new_try();
                self.tryid = tryid;
                // the try arm is never in tail position: the frame must stay
                // alive for its catch handler
                let tryret = self.build_logical_block(&mut trytape, trybr, false)?;
                self.istry -= 1;
                self.tryid = oldid;

                let mut cchtape = self.block();
                let exnvid = self.new_val(RcRules::Unref);
                self.vals[exnvid].ty = Some(types::exception_type());
                let getexn = cchtape.write(&mut self.graph, SsaInsn::Getexn { out: exnvid });
                self.vals[exnvid].creatloc = Some(getexn);
                self.irv[*exnvar].ssavid = Some(exnvid);
                let cchret = self.build_logical_block(&mut cchtape, catchbr, istc)?;

                let ret = if istc {
                    trytape.write(&mut self.graph, SsaInsn::Ret { vid: tryret });
                    if cchret != NO_VAL {
                        cchtape.write(&mut self.graph, SsaInsn::Ret { vid: cchret });
                    }
                    NO_VAL
                } else {
                    self.resolve_phi(&mut trytape, tryret, &mut cchtape, cchret)
                };

                let node = tape.write(
                    &mut self.graph,
                    SsaInsn::Try {
                        out: (ret != NO_VAL).then_some(ret),
                        tryid,
                        trybr: trytape.head,
                        catchbr: cchtape.head,
                        likely: *likely,
                    },
                );
                if ret != NO_VAL {
                    self.vals[ret].creatloc = Some(node);
                }
                Ok(ret)
            }

            Ir::Seq { e1, e2 } => {
                self.build(tape, e1, false)?;
                self.build(tape, e2, istc)
            }

            Ir::Binop { op, lhs, rhs } => {
                let lhs = self.build(tape, lhs, false)?;
                let rhs = self.build(tape, rhs, false)?;

                let (rules, testnum, ty) = match op {
                    Binop::Add
                    | Binop::Sub
                    | Binop::Mul
                    | Binop::Div
                    | Binop::Mod
                    | Binop::Pow
                    | Binop::Land
                    | Binop::Lor
                    | Binop::Lxor
                    | Binop::Lshl
                    | Binop::Lshr
                    | Binop::Ashl
                    | Binop::Ashr => {
                        (RcRules::Default, true, Some(types::number_type()))
                    }
                    // comparisons yield the right operand or false, so the
                    // result type stays open
                    Binop::Lt | Binop::Le | Binop::Gt | Binop::Ge => {
                        (RcRules::Default, true, None)
                    }
                    Binop::Eq | Binop::Ne => {
                        (RcRules::Disable, true, Some(types::boolean_type()))
                    }
                    Binop::Is | Binop::Equal => {
                        (RcRules::Disable, false, Some(types::boolean_type()))
                    }
                    Binop::Cons => (RcRules::Default, false, Some(types::pair_type())),
                };

                if testnum {
                    self.assert_number(tape, lhs, loc)?;
                    self.assert_number(tape, rhs, loc)?;
                    self.set_type(lhs, types::number_type());
                    self.set_type(rhs, types::number_type());
                }

                let ret = self.new_val(rules);
                self.vals[ret].ty = ty;
                let node = tape
                    .write(&mut self.graph, SsaInsn::Binop { op: *op, out: ret, lhs, rhs });
                self.vals[ret].creatloc = Some(node);
                if *op == Binop::Cons {
                    self.trace_mov(node);
                }
                Ok(ret)
            }

            Ir::Unop { op, expr } => {
                let expr = self.build(tape, expr, false)?;
                match op {
                    Unop::Not => {
                        let ret = self.new_val(RcRules::Disable);
                        self.vals[ret].ty = Some(types::boolean_type());
                        let node = tape.write(
                            &mut self.graph,
                            SsaInsn::Unop { op: *op, out: ret, vid: expr },
                        );
                        self.vals[ret].creatloc = Some(node);
                        Ok(ret)
                    }
                    Unop::Lnot => {
                        self.assert_number(tape, expr, loc)?;
                        self.set_type(expr, types::number_type());
                        let ret = self.new_val(RcRules::Default);
                        self.vals[ret].ty = Some(types::number_type());
                        let node = tape.write(
                            &mut self.graph,
                            SsaInsn::Unop { op: *op, out: ret, vid: expr },
                        );
                        self.vals[ret].creatloc = Some(node);
                        Ok(ret)
                    }
                }
            }

            Ir::Fn { arity, caps, capvars, body } => {
                self.build_fn(tape, *arity, caps, capvars, body, None)
            }

            Ir::Startfix { vars, body } => self.build_startfix(tape, vars, body, istc),

            Ir::Endfix { .. } => Err(SsaError::Internal {
                what: "endfix outside of a recursive scope chain".into(),
            }),

            Ir::Match { pat, expr, thenbr, elsebr, toplvl, likely } => {
                let expr = self.build(tape, expr, false)?;

                if let IrPattern::Ident { vid } = pat {
                    // trivial identifier match binds and vanishes
                    self.irv[*vid].ssavid = Some(expr);
                    return self.build(tape, thenbr, istc);
                }

                let start = self.begin_logical_block();
                let n1 = self.vals.len();
                let (pat, _res) = self.build_pattern(pat, expr)?;
                let n2 = self.vals.len();

                let mut thentape = self.block();
                let ctor = thentape.head;
                let thenret = self.build(&mut thentape, thenbr, istc)?;
                self.end_logical_block(start);

                let mut elsetape = self.block();
                let elseret = self.build_logical_block(&mut elsetape, elsebr, istc)?;

                let ret = if istc {
                    if thenret != NO_VAL {
                        thentape.write(&mut self.graph, SsaInsn::Ret { vid: thenret });
                    }
                    if elseret != NO_VAL {
                        elsetape.write(&mut self.graph, SsaInsn::Ret { vid: elseret });
                    }
                    NO_VAL
                } else {
                    self.resolve_phi(&mut thentape, thenret, &mut elsetape, elseret)
                };

                // pattern-created values materialize at the head of the
                // then-branch
                for vid in n1..n2 {
                    if self.vals[vid].creatloc.is_none() {
                        self.vals[vid].creatloc = Some(ctor);
                    }
                }

                let node = tape.write(
                    &mut self.graph,
                    SsaInsn::If {
                        out: (ret != NO_VAL).then_some(ret),
                        cond: expr,
                        test: SsaTest::Match(pat),
                        thenbr: thentape.head,
                        elsebr: elsetape.head,
                        toplvl: *toplvl,
                        likely: *likely,
                    },
                );
                if ret != NO_VAL {
                    self.vals[ret].creatloc = Some(node);
                }
                Ok(ret)
            }

            Ir::Multimatch { table, exprs } => {
                self.build_multimatch(tape, table, exprs, istc, loc)
            }

            Ir::MkRcrd { ty, fields } => {
                let mut vids = Vec::with_capacity(fields.len());
                for field in fields {
                    vids.push(self.build(tape, field, false)?);
                }
                let ret = self.new_val(RcRules::Default);
                self.vals[ret].ty = Some(ty.clone());
                let node = tape.write(
                    &mut self.graph,
                    SsaInsn::Mkrcrd { out: ret, ty: ty.clone(), vids },
                );
                self.vals[ret].creatloc = Some(node);
                self.trace_mov(node);
                Ok(ret)
            }

            Ir::Update { src, fields, ids } => {
                let src = self.build(tape, src, false)?;
                let mut vids = Vec::with_capacity(fields.len());
                for field in fields {
                    vids.push(self.build(tape, field, false)?);
                }
                let ret = self.new_val(RcRules::Phi);
                self.vals[ret].ty = self.vals[src].ty.clone();

                let mut errtape = self.block();
                let exn = self.new_val(RcRules::Disable);
                errtape
                    .write(&mut self.graph, SsaInsn::Cval { out: exn, val: exn_sym("update_error") });
                self.write_throw(&mut errtape, exn, loc);
                let noptape = self.block();

                let node = tape.write(
                    &mut self.graph,
                    SsaInsn::If {
                        out: Some(ret),
                        cond: src,
                        test: SsaTest::Update { vids, ids: ids.clone() },
                        thenbr: noptape.head,
                        elsebr: errtape.head,
                        toplvl: Toplvl::None,
                        likely: 1,
                    },
                );
                self.vals[ret].creatloc = Some(node);
                Ok(ret)
            }

            Ir::Throw { exn } => {
                let vid = self.build(tape, exn, false)?;
                self.write_throw(tape, vid, loc);
                Ok(vid)
            }

            Ir::Return { expr } => {
                let vid = self.build(tape, expr, istc)?;
                if vid != NO_VAL {
                    tape.write(&mut self.graph, SsaInsn::Ret { vid });
                }
                Ok(vid)
            }
        }
    }

    /// Lower a `let rec` bracket: allocate placeholder closures so forward
    /// references resolve, finalize each body, then wire the shared scope.
    fn build_startfix(
        &mut self,
        tape: &mut Tape,
        vars: &[usize],
        body: &IrNode,
        istc: bool,
    ) -> SResult<SsaId> {
        // collect the (var, fn) chain the IR builder emitted
        let mut fns: Vec<(usize, &IrNode)> = Vec::new();
        let mut at = body;
        let inner = loop {
            match &at.ir {
                Ir::Match { pat: IrPattern::Ident { vid }, expr, thenbr, .. } => {
                    fns.push((*vid, expr));
                    at = thenbr;
                }
                Ir::Endfix { body, .. } => break body,
                _ => {
                    return Err(SsaError::Internal {
                        what: "malformed recursive-scope chain".into(),
                    })
                }
            }
        };

        let start = self.begin_logical_block();

        let mut vids = Vec::with_capacity(fns.len());
        for (var, fnnode) in &fns {
            let Ir::Fn { arity, .. } = &fnnode.ir else {
                return Err(SsaError::Internal {
                    what: "recursive scope binds a non-function".into(),
                });
            };
            let vid = self.new_val(RcRules::Default);
            let node =
                tape.write(&mut self.graph, SsaInsn::Alcfn { out: vid, arity: *arity });
            self.vals[vid].creatloc = Some(node);
            self.set_type(vid, types::function_type());
            self.irv[*var].ssavid = Some(vid);
            vids.push(vid);
        }

        debug_assert_eq!(vars.len(), vids.len());
        for ((var, fnnode), vid) in fns.iter().zip(&vids) {
            let Ir::Fn { arity, caps, capvars, body } = &fnnode.ir else {
                unreachable!("validated above")
            };
            self.build_finfn(tape, *vid, *arity, caps, capvars, body, Some(*var))?;
        }

        tape.write(&mut self.graph, SsaInsn::Mkscp { clos: vids });

        let ret = self.build(tape, inner, istc);
        self.end_logical_block(start);
        ret
    }

    // -- multi-way match compilation --

    fn build_multimatch(
        &mut self,
        tape: &mut Tape,
        table: &IrMatchTable,
        exprs: &[IrNode],
        istc: bool,
        loc: Option<&Loc>,
    ) -> SResult<SsaId> {
        let mut occs = Vec::with_capacity(exprs.len());
        for expr in exprs {
            occs.push(self.build(tape, expr, false)?);
        }
        let phi = if istc { NO_VAL } else { self.new_val(RcRules::Default) };
        let rows: Vec<MatrixRow> = table
            .rows
            .iter()
            .zip(&table.actions)
            .map(|(cells, action)| MatrixRow { cells: cells.clone(), action })
            .collect();
        self.compile_matrix(tape, rows, occs, phi, istc, loc)?;
        if !istc {
            // the phi materializes right after the whole decision tree
            let nop = tape.write(&mut self.graph, SsaInsn::Nop);
            self.vals[phi].creatloc = Some(nop);
        }
        Ok(phi)
    }

    fn compile_matrix(
        &mut self,
        tape: &mut Tape,
        rows: Vec<MatrixRow<'_>>,
        occs: Vec<SsaId>,
        phi: SsaId,
        istc: bool,
        loc: Option<&Loc>,
    ) -> SResult<()> {
        // no rows: matching fails
        if rows.is_empty() {
            let exn = self.new_val(RcRules::Disable);
            tape.write(&mut self.graph, SsaInsn::Cval { out: exn, val: exn_sym("type_error") });
            self.write_throw(tape, exn, loc);
            return Ok(());
        }

        // first row all wildcards: bind and take its action
        if rows[0].cells.iter().all(is_wildcard) {
            for (cell, occ) in rows[0].cells.iter().zip(&occs) {
                if let IrPattern::Ident { vid } = cell {
                    self.irv[*vid].ssavid = Some(*occ);
                }
            }
            let ret = self.build(tape, rows[0].action, istc)?;
            if istc {
                if ret != NO_VAL {
                    tape.write(&mut self.graph, SsaInsn::Ret { vid: ret });
                }
            } else {
                self.move_to_phi(tape, phi, ret);
            }
            return Ok(());
        }

        // pick a column by the first-row heuristic
        let col = rows[0]
            .cells
            .iter()
            .position(|c| !is_wildcard(c))
            .expect("a non-wildcard cell exists");

        // constructor equivalence classes, in first-occurrence order
        let mut classes: Vec<Rc<Type>> = Vec::new();
        for row in &rows {
            match &row.cells[col] {
                IrPattern::Dummy | IrPattern::Ident { .. } => {}
                IrPattern::Unpack { ty, .. } => {
                    if !classes.iter().any(|c| Rc::ptr_eq(c, ty)) {
                        classes.push(ty.clone());
                    }
                }
                IrPattern::Constant { .. } | IrPattern::Record { .. } => {
                    return Err(SsaError::UnsupportedMultimatch { loc: loc.cloned() })
                }
            }
        }

        self.compile_classes(tape, &classes, 0, &rows, &occs, col, phi, istc, loc)
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_classes(
        &mut self,
        tape: &mut Tape,
        classes: &[Rc<Type>],
        ci: usize,
        rows: &[MatrixRow<'_>],
        occs: &[SsaId],
        col: usize,
        phi: SsaId,
        istc: bool,
        loc: Option<&Loc>,
    ) -> SResult<()> {
        if ci == classes.len() {
            // default matrix: rows with a wildcard in the tested column
            let mut drows = Vec::new();
            for row in rows {
                if is_wildcard(&row.cells[col]) {
                    // the wildcard cell still binds its occurrence
                    let mut cells = row.cells.clone();
                    let cell = cells.remove(col);
                    if let IrPattern::Ident { vid } = cell {
                        self.irv[vid].ssavid = Some(occs[col]);
                    }
                    drows.push(MatrixRow { cells, action: row.action });
                }
            }
            let mut doccs = occs.to_vec();
            doccs.remove(col);
            return self.compile_matrix(tape, drows, doccs, phi, istc, loc);
        }

        let ty = &classes[ci];
        let nf = ty.nfields();

        // specialize: expand matching rows, pad wildcard rows
        let mut vids = Vec::with_capacity(nf);
        for _ in 0..nf {
            vids.push(self.new_val(RcRules::Default));
        }
        let mut srows = Vec::new();
        for row in rows {
            match &row.cells[col] {
                IrPattern::Unpack { ty: rty, offs, subpats, varid } if Rc::ptr_eq(rty, ty) => {
                    let mut sub = vec![IrPattern::Dummy; nf];
                    for (off, pat) in offs.iter().zip(subpats) {
                        sub[*off] = pat.clone();
                    }
                    // alias variables bind the scrutinee occurrence
                    self.irv[*varid].ssavid = Some(occs[col]);
                    let mut cells = row.cells.clone();
                    cells.splice(col..col + 1, sub);
                    srows.push(MatrixRow { cells, action: row.action });
                }
                IrPattern::Dummy | IrPattern::Ident { .. } => {
                    let mut cells = row.cells.clone();
                    if let IrPattern::Ident { vid } = &cells[col] {
                        self.irv[*vid].ssavid = Some(occs[col]);
                    }
                    cells.splice(col..col + 1, vec![IrPattern::Dummy; nf]);
                    srows.push(MatrixRow { cells, action: row.action });
                }
                _ => {}
            }
        }
        let mut soccs = occs.to_vec();
        soccs.splice(col..col + 1, vids.iter().copied());

        let dotest = !matches!(&self.vals[occs[col]].ty, Some(t) if Rc::ptr_eq(t, ty));
        // ident subpatterns force every field load; the specialized matrix
        // tests the loaded occurrences
        let pat = SsaPattern::Unpack {
            ty: ty.clone(),
            offs: (0..nf).collect(),
            vids: vids.clone(),
            subpats: (0..nf).map(|_| SsaPattern::Ident).collect(),
            dotest,
        };

        let start = self.begin_logical_block();
        self.set_type(occs[col], ty.clone());
        let mut thentape = self.block();
        let ctor = thentape.head;
        self.compile_matrix(&mut thentape, srows, soccs, phi, istc, loc)?;
        self.end_logical_block(start);
        for vid in &vids {
            if self.vals[*vid].creatloc.is_none() {
                self.vals[*vid].creatloc = Some(ctor);
            }
        }

        let mut elsetape = self.block();
        self.compile_classes(&mut elsetape, classes, ci + 1, rows, occs, col, phi, istc, loc)?;

        tape.write(
            &mut self.graph,
            SsaInsn::If {
                out: None,
                cond: occs[col],
                test: SsaTest::Match(pat),
                thenbr: thentape.head,
                elsebr: elsetape.head,
                toplvl: Toplvl::None,
                likely: 0,
            },
        );
        Ok(())
    }
}

struct MatrixRow<'a> {
    cells: Vec<IrPattern>,
    action: &'a IrNode,
}

fn is_wildcard(pat: &IrPattern) -> bool {
    matches!(pat, IrPattern::Dummy | IrPattern::Ident { .. })
}

// -- entry points --

/// Build the SSA of a whole script body. With `defs`, the script's public
/// bindings are packed, together with the body's result, into a tuple
/// returned from the unit, which is how the loader extracts a module.
pub fn build_ssa(unit: &IrUnit, defs: Option<&[IrDef]>) -> Result<Ssa, SsaError> {
    let mut b = Builder::new(unit.nvars);
    for spec in &unit.specs {
        match spec {
            Spec::Type { varid, ty } => b.irv[*varid].ty = Some(ty.clone()),
        }
    }
    let mut tape = Tape::new(&mut b.graph);
    let start = b.begin_logical_block();
    let ret = b.build(&mut tape, &unit.body, false)?;
    b.end_logical_block(start);

    match defs {
        None => {
            tape.write(&mut b.graph, SsaInsn::Ret { vid: ret });
        }
        Some(defs) => {
            let last = find_last_toplevel_insn(&b.graph, tape.head);
            let diverted = last != tape.point;
            let mut tl = if diverted { Tape::at(last) } else { Tape::at(tape.point) };

            let mut vids = Vec::with_capacity(defs.len() + 1);
            vids.push(ret);
            for def in defs {
                match &def.kind {
                    IrDefKind::Var(varid) => vids.push(b.ssavid(*varid)?),
                    IrDefKind::Cval(val) => {
                        let vid = b.new_val(RcRules::Disable);
                        b.vals[vid].cval = Some(val.clone());
                        b.vals[vid].ty = Some(val.type_of());
                        tl.write(&mut b.graph, SsaInsn::Cval { out: vid, val: val.clone() });
                        vids.push(vid);
                    }
                }
            }
            let out = b.new_val(RcRules::Default);
            let ty = types::tuple_type(vids.len());
            let node = tl.write(&mut b.graph, SsaInsn::Mkrcrd { out, ty, vids });
            b.vals[out].creatloc = Some(node);
            b.trace_mov(node);
            tl.write(&mut b.graph, SsaInsn::Ret { vid: out });

            if diverted {
                // the fall-through path past the top-level spine is only
                // reachable when a definition failed to bind
                let exn = b.new_val(RcRules::Disable);
                tape.write(&mut b.graph, SsaInsn::Cval { out: exn, val: exn_sym("import_error") });
                tape.write(&mut b.graph, SsaInsn::Ret { vid: exn });
            }
        }
    }

    let moves = insert_rc(&mut b, tape.head);
    Ok(Ssa {
        nvals: b.vals.len(),
        ntries: b.ntries,
        head: tape.head,
        graph: b.graph,
        entry_node: None,
        moves,
    })
}

/// Build the SSA of one function body: `Pop` prologue for arguments, `Cap`
/// prologue for enclosed values, then the body in tail position.
pub fn build_fn_body(unit: &IrUnit, arity: usize, caps: Vec<CapInfo>) -> Result<Ssa, SsaError> {
    let mut b = Builder::new(unit.nvars);
    let mut tape = Tape::new(&mut b.graph);

    let mut entry_node = None;

    let mut argvids = Vec::with_capacity(arity);
    if arity > 0 {
        for i in 0..arity {
            let vid = b.new_val(RcRules::Default);
            // argument variable ids are dense from zero by construction
            b.irv[i].ssavid = Some(vid);
            argvids.push(vid);
        }
        let pop = tape.write(&mut b.graph, SsaInsn::Pop { vids: argvids.clone() });
        for vid in &argvids {
            b.vals[*vid].creatloc = Some(pop);
        }
        entry_node = Some(pop);
    }

    if !caps.is_empty() {
        let mut capvids = Vec::with_capacity(caps.len());
        for cap in &caps {
            let vid = b.new_val(RcRules::Disable);
            b.irv[cap.varid_local].ssavid = Some(vid);
            b.vals[vid].ty = cap.ty.clone();
            b.vals[vid].cval = cap.cval.clone();
            b.vals[vid].isthis = cap.isthis;
            capvids.push(vid);
        }
        let capnode = tape.write(&mut b.graph, SsaInsn::Cap { vids: capvids });
        // the loop entry point sits after the capture prologue
        entry_node = Some(capnode);
        for vid in &argvids {
            b.vals[*vid].creatloc = Some(capnode);
        }
    }

    let start = b.begin_logical_block();
    let ret = b.build(&mut tape, &unit.body, true)?;
    b.end_logical_block(start);
    if ret != NO_VAL {
        tape.write(&mut b.graph, SsaInsn::Ret { vid: ret });
    }

    let moves = insert_rc(&mut b, tape.head);
    Ok(Ssa {
        nvals: b.vals.len(),
        ntries: b.ntries,
        head: tape.head,
        graph: b.graph,
        entry_node,
        moves,
    })
}

fn find_last_toplevel_insn(graph: &SsaGraph, head: NodeId) -> NodeId {
    let mut at = head;
    loop {
        if let SsaInsn::If { toplvl, thenbr, elsebr, .. } = graph.insn(at) {
            match toplvl {
                Toplvl::Then => return find_last_toplevel_insn(graph, *thenbr),
                Toplvl::Else => return find_last_toplevel_insn(graph, *elsebr),
                Toplvl::None => {}
            }
        }
        match graph.next(at) {
            Some(next) => at = next,
            None => return at,
        }
    }
}

// ><+><+><+><+><+><+><+><+><+><+><+><+><+><+><+><+><+><+><+><+><+><+><+><+><
//                             RC INSERTION
// -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- --

fn is_using(insn: &SsaInsn, vid: SsaId) -> bool {
    match insn {
        SsaInsn::Nop | SsaInsn::Cval { .. } => false,
        SsaInsn::Apply { f, args, .. } | SsaInsn::Applytc { f, args, .. } => {
            *f == vid || args.contains(&vid)
        }
        SsaInsn::Loop { args } => args.contains(&vid),
        SsaInsn::If { cond, test, .. } => {
            if let SsaTest::Update { vids, .. } = test {
                if vids.contains(&vid) {
                    return true;
                }
            }
            *cond == vid
        }
        SsaInsn::Try { .. } => false,
        SsaInsn::Mov { out, vid: src } => *out == vid || *src == vid,
        SsaInsn::Ref { vid: v }
        | SsaInsn::Dec { vid: v }
        | SsaInsn::Unref { vid: v }
        | SsaInsn::Drop { vid: v } => *v == vid,
        SsaInsn::Ret { vid: v } => *v == vid,
        SsaInsn::Binop { lhs, rhs, .. } => *lhs == vid || *rhs == vid,
        SsaInsn::Unop { vid: v, .. } => *v == vid,
        SsaInsn::Fn { caps, .. } | SsaInsn::Finfn { caps, .. } => caps.contains(&vid),
        SsaInsn::Alcfn { .. } => false,
        SsaInsn::Mkscp { clos } => clos.contains(&vid),
        SsaInsn::Pop { .. } | SsaInsn::Cap { .. } => false,
        SsaInsn::Catch { vid: v, .. } => *v == vid,
        SsaInsn::Getexn { .. } => false,
        SsaInsn::Mkrcrd { vids, .. } => vids.contains(&vid),
        SsaInsn::Trace { vid: v, .. } => *v == vid,
    }
}

/// Killing uses transfer the register's ownership to the consumer.
fn is_killing(insn: &SsaInsn, vid: SsaId) -> bool {
    match insn {
        SsaInsn::Apply { args, .. } | SsaInsn::Applytc { args, .. } => args.contains(&vid),
        SsaInsn::Loop { args } => args.contains(&vid),
        SsaInsn::Ret { vid: v } => *v == vid,
        _ => false,
    }
}

/// Moving uses store the value into a container with its own count.
fn is_moving(insn: &SsaInsn, vid: SsaId) -> bool {
    match insn {
        SsaInsn::Mov { vid: v, .. } => *v == vid,
        SsaInsn::Fn { caps, .. } | SsaInsn::Finfn { caps, .. } => caps.contains(&vid),
        SsaInsn::Catch { vid: v, .. } => *v == vid,
        SsaInsn::Mkrcrd { vids, .. } => vids.contains(&vid),
        SsaInsn::Binop { op: Binop::Cons, lhs, rhs, .. } => *lhs == vid || *rhs == vid,
        _ => false,
    }
}

fn moved_vids(insn: &SsaInsn) -> Vec<SsaId> {
    match insn {
        SsaInsn::Mov { vid, .. } => vec![*vid],
        SsaInsn::Fn { caps, .. } | SsaInsn::Finfn { caps, .. } => caps.clone(),
        SsaInsn::Catch { vid, .. } => vec![*vid],
        SsaInsn::Mkrcrd { vids, .. } => vids.clone(),
        SsaInsn::Binop { op: Binop::Cons, lhs, rhs, .. } => vec![*lhs, *rhs],
        _ => Vec::new(),
    }
}

/// Slots of killing instructions, for the move plan.
fn killed_slots(insn: &SsaInsn) -> Vec<SsaId> {
    match insn {
        SsaInsn::Apply { args, .. } | SsaInsn::Applytc { args, .. } => args.clone(),
        SsaInsn::Loop { args } => args.clone(),
        SsaInsn::Ret { vid } => vec![*vid],
        _ => Vec::new(),
    }
}

fn is_end(insn: &SsaInsn) -> bool {
    matches!(insn, SsaInsn::Ret { .. } | SsaInsn::Catch { .. } | SsaInsn::Loop { .. })
}

struct KillInfo {
    killers: Vec<Vec<NodeId>>,
}

impl KillInfo {
    fn new(nvals: usize) -> KillInfo {
        KillInfo { killers: vec![Vec::new(); nvals] }
    }

    fn add_killer(&mut self, vid: SsaId, node: NodeId) {
        self.killers[vid].push(node);
    }
}

/// Does every path from `begin` end in a return-like instruction?
fn is_dead_end(graph: &SsaGraph, begin: NodeId) -> bool {
    let mut at = Some(begin);
    while let Some(node) = at {
        if let SsaInsn::If { thenbr, elsebr, .. } = graph.insn(node) {
            let a = is_dead_end(graph, *thenbr);
            let b = is_dead_end(graph, *elsebr);
            return (a && b)
                || graph.next(node).map(|n| is_dead_end(graph, n)).unwrap_or(false);
        }
        if is_end(graph.insn(node)) {
            return true;
        }
        at = graph.next(node);
    }
    false
}

fn force_kill(graph: &mut SsaGraph, kinfo: &mut KillInfo, branch_head: NodeId, vid: SsaId) {
    let node = graph.insert_after(branch_head, SsaInsn::Unref { vid });
    kinfo.add_killer(vid, node);
}

/// Walk forward from `begin` looking for the place where `vid` dies; when
/// the walk succeeds, emit the matching release (`Dec` before a killing use,
/// nothing at a move, `Unref` after a borrow) and report true.
fn kill_value_t(
    graph: &mut SsaGraph,
    kinfo: &mut KillInfo,
    begin: NodeId,
    vid: SsaId,
) -> bool {
    let mut lastusr: Option<NodeId> = None;
    let mut at = Some(begin);
    while let Some(node) = at {
        if is_using(graph.insn(node), vid) {
            lastusr = Some(node);
        }
        match graph.insn(node) {
            SsaInsn::If { .. } => {
                if kill_value_t_if(graph, kinfo, node, vid) {
                    return true;
                }
                break;
            }
            SsaInsn::Try { .. } => {
                if kill_value_t_try(graph, kinfo, node, vid) {
                    return true;
                }
                break;
            }
            insn if is_end(insn) => break,
            _ => {}
        }
        at = graph.next(node);
    }

    let Some(lastusr) = lastusr else { return false };

    if is_killing(graph.insn(lastusr), vid) {
        graph.insert_before(lastusr, SsaInsn::Dec { vid });
        kinfo.add_killer(vid, lastusr);
    } else if is_moving(graph.insn(lastusr), vid) {
        // move semantics reuses the refcount
        kinfo.add_killer(vid, lastusr);
    } else if let SsaInsn::If { thenbr, elsebr, .. } = graph.insn(lastusr) {
        let (thenbr, elsebr) = (*thenbr, *elsebr);
        let u1 = graph.insert_after(thenbr, SsaInsn::Unref { vid });
        let u2 = graph.insert_after(elsebr, SsaInsn::Unref { vid });
        kinfo.add_killer(vid, u1);
        kinfo.add_killer(vid, u2);
    } else {
        let node = graph.insert_after(lastusr, SsaInsn::Unref { vid });
        kinfo.add_killer(vid, node);
    }
    true
}

fn kill_value_t_if(
    graph: &mut SsaGraph,
    kinfo: &mut KillInfo,
    node: NodeId,
    vid: SsaId,
) -> bool {
    let SsaInsn::If { thenbr, elsebr, .. } = graph.insn(node) else { unreachable!() };
    let (b1, b2) = (*thenbr, *elsebr);
    let d1 = is_dead_end(graph, b1);
    let d2 = is_dead_end(graph, b2);
    let cont = graph.next(node);

    let killed_after = if d1 && d2 {
        false
    } else {
        cont.map(|n| kill_value_t(graph, kinfo, n, vid)).unwrap_or(false)
    };

    if !killed_after {
        let k1 = kill_value_t(graph, kinfo, b1, vid);
        let k2 = kill_value_t(graph, kinfo, b2, vid);
        if k1 || k2 {
            if !k1 {
                force_kill(graph, kinfo, b1, vid);
            }
            if !k2 {
                force_kill(graph, kinfo, b2, vid);
            }
            true
        } else {
            false
        }
    } else {
        for (branch, dead) in [(b1, d1), (b2, d2)] {
            if dead {
                if !kill_value_t(graph, kinfo, branch, vid) {
                    force_kill(graph, kinfo, branch, vid);
                }
            } else {
                kill_value_f(graph, kinfo, branch, vid);
            }
        }
        true
    }
}

fn kill_value_t_try(
    graph: &mut SsaGraph,
    kinfo: &mut KillInfo,
    node: NodeId,
    vid: SsaId,
) -> bool {
    let SsaInsn::Try { trybr, catchbr, .. } = graph.insn(node) else { unreachable!() };
    let (t, c) = (*trybr, *catchbr);
    let cont = graph.next(node);

    if cont.map(|n| kill_value_t(graph, kinfo, n, vid)).unwrap_or(false) {
        if is_dead_end(graph, c) {
            if !kill_value_t(graph, kinfo, c, vid) {
                force_kill(graph, kinfo, c, vid);
            }
        } else {
            kill_value_f(graph, kinfo, c, vid);
        }
        true
    } else if kill_value_t(graph, kinfo, c, vid) {
        // the try arm falls through without killing; release at its end so
        // both arms agree
        let last = graph.last_of(t);
        let node = graph.insert_after(last, SsaInsn::Unref { vid });
        kinfo.add_killer(vid, node);
        true
    } else {
        kill_value_t(graph, kinfo, t, vid)
    }
}

/// Branch-only release walk for regions whose continuation already handled
/// the value.
fn kill_value_f(graph: &mut SsaGraph, kinfo: &mut KillInfo, begin: NodeId, vid: SsaId) {
    let mut at = Some(begin);
    while let Some(node) = at {
        match graph.insn(node) {
            SsaInsn::If { thenbr, elsebr, .. } => {
                let (b1, b2) = (*thenbr, *elsebr);
                for branch in [b1, b2] {
                    if is_dead_end(graph, branch) {
                        if !kill_value_t(graph, kinfo, branch, vid) {
                            force_kill(graph, kinfo, branch, vid);
                        }
                    } else {
                        kill_value_f(graph, kinfo, branch, vid);
                    }
                }
            }
            SsaInsn::Try { catchbr, .. } => {
                let c = *catchbr;
                if is_dead_end(graph, c) {
                    if !kill_value_t(graph, kinfo, c, vid) {
                        force_kill(graph, kinfo, c, vid);
                    }
                } else {
                    kill_value_f(graph, kinfo, c, vid);
                }
            }
            _ => {}
        }
        at = graph.next(node);
    }
}

fn find_mov(graph: &SsaGraph, head: NodeId, out: SsaId) -> Option<NodeId> {
    graph
        .iter_from(head)
        .find(|&n| matches!(graph.insn(n), SsaInsn::Mov { out: o, .. } if *o == out))
}

fn insert_rc(b: &mut Builder, _head: NodeId) -> HashMap<NodeId, Vec<bool>> {
    let mut kinfo = KillInfo::new(b.vals.len());

    for vid in 0..b.vals.len() {
        let rules = b.vals[vid].rules.expect("rc rules assigned");
        let Some(creatloc) = b.vals[vid].creatloc else {
            continue;
        };
        match rules {
            RcRules::Default => {
                if kill_value_t(&mut b.graph, &mut kinfo, creatloc, vid) {
                    b.graph.insert_after(creatloc, SsaInsn::Ref { vid });
                } else {
                    b.graph.insert_after(creatloc, SsaInsn::Drop { vid });
                }
            }
            RcRules::Phi => {
                let killed = b
                    .graph
                    .next(creatloc)
                    .map(|n| kill_value_t(&mut b.graph, &mut kinfo, n, vid))
                    .unwrap_or(false);
                if !killed {
                    let (br1, br2) = match b.graph.insn(creatloc) {
                        SsaInsn::If { thenbr, elsebr, .. } => (*thenbr, *elsebr),
                        SsaInsn::Try { trybr, catchbr, .. } => (*trybr, *catchbr),
                        _ => (creatloc, creatloc),
                    };
                    let mut any = false;
                    for branch in [br1, br2] {
                        if branch == creatloc {
                            continue;
                        }
                        if let Some(mov) = find_mov(&b.graph, branch, vid) {
                            any = true;
                            let after = b.graph.next(mov);
                            let dead = after
                                .map(|n| kill_value_t(&mut b.graph, &mut kinfo, n, vid))
                                .unwrap_or(false);
                            if !dead {
                                let node = b.graph.insert_after(mov, SsaInsn::Unref { vid });
                                kinfo.add_killer(vid, node);
                            }
                        }
                    }
                    if !any {
                        // no feeding moves (a record update): release right
                        // after creation if nothing downstream consumed it
                        let node = b.graph.insert_after(creatloc, SsaInsn::Unref { vid });
                        kinfo.add_killer(vid, node);
                    }
                }
            }
            RcRules::Unref => {
                let killed = b
                    .graph
                    .next(creatloc)
                    .map(|n| kill_value_t(&mut b.graph, &mut kinfo, n, vid))
                    .unwrap_or(false);
                if !killed {
                    let node = b.graph.insert_after(creatloc, SsaInsn::Unref { vid });
                    kinfo.add_killer(vid, node);
                }
            }
            RcRules::Disable => {}
        }
    }

    // decide clone-vs-move per operand slot of every traced move
    let mut moves: HashMap<NodeId, Vec<bool>> = HashMap::new();
    let movs = b.movs.clone();
    for mov in movs {
        let vids = moved_vids(b.graph.insn(mov));
        let mut flags = vec![false; vids.len()];
        for (i, &vid) in vids.iter().enumerate() {
            let mut doref = true;
            if b.vals[vid].rules != Some(RcRules::Disable)
                && kinfo.killers[vid].contains(&mov)
            {
                // this move is the killer; but only one slot per instruction
                // may reuse the refcount
                doref = vids[..i].contains(&vid);
            }
            if doref {
                b.graph.insert_before(mov, SsaInsn::Ref { vid });
            } else {
                flags[i] = true;
            }
        }
        if flags.iter().any(|&f| f) {
            moves.insert(mov, flags);
        }
    }

    // mark the argument slots whose register is consumed by a killing use
    let mut kill_nodes: Vec<(SsaId, NodeId)> = Vec::new();
    for (vid, killers) in kinfo.killers.iter().enumerate() {
        for &node in killers {
            if !killed_slots(b.graph.insn(node)).is_empty() {
                kill_nodes.push((vid, node));
            }
        }
    }
    for (vid, node) in kill_nodes {
        let slots = killed_slots(b.graph.insn(node));
        let entry = moves.entry(node).or_insert_with(|| vec![false; slots.len()]);
        if let Some(last) = slots.iter().rposition(|&s| s == vid) {
            entry[last] = true;
        }
    }

    moves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_builder::build_ir;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use ether_core::attr::Attr;
    use ether_core::function::FunRef;
    use ether_core::module::Module;

    fn root_with_builtins() -> Module {
        let mut root = Module::new("root");
        for name in ["raise", "|>", "++"] {
            let proc = FunRef::proc(name, 2, Rc::new(|_: &mut dyn ether_core::function::Applier, args: Vec<Value>| {
                args.into_iter().next().unwrap_or(Value::Nil)
            }));
            root.define(name, Value::Func(proc), Attr::builtin());
        }
        root
    }

    fn build(src: &str) -> Result<Ssa, SsaError> {
        let tokens = Lexer::new(src).tokenize().unwrap();
        let ast = Parser::new(tokens).parse_program().unwrap();
        let root = root_with_builtins();
        let prog = build_ir(&ast, &root, None).unwrap();
        build_ssa(&prog.ir, None)
    }

    fn collect_insns<'a>(ssa: &'a Ssa, head: NodeId, out: &mut Vec<&'a SsaInsn>) {
        for node in ssa.graph.iter_from(head) {
            let insn = ssa.graph.insn(node);
            out.push(insn);
            match insn {
                SsaInsn::If { thenbr, elsebr, .. } => {
                    collect_insns(ssa, *thenbr, out);
                    collect_insns(ssa, *elsebr, out);
                }
                SsaInsn::Try { trybr, catchbr, .. } => {
                    collect_insns(ssa, *trybr, out);
                    collect_insns(ssa, *catchbr, out);
                }
                _ => {}
            }
        }
    }

    fn all_insns(ssa: &Ssa) -> Vec<&SsaInsn> {
        let mut out = Vec::new();
        collect_insns(ssa, ssa.head, &mut out);
        out
    }

    fn fn_bodies(ssa: &Ssa) -> Vec<Rc<Ssa>> {
        all_insns(ssa)
            .into_iter()
            .filter_map(|insn| match insn {
                SsaInsn::Fn { body, .. } | SsaInsn::Finfn { body, .. } => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_tail_self_call_compiles_to_loop() {
        let ssa = build("let rec f n a = if n = 0 then a else f (n - 1) (n * a) in f").unwrap();
        let mut found = false;
        for body in fn_bodies(&ssa) {
            if all_insns(&body).iter().any(|i| matches!(i, SsaInsn::Loop { .. })) {
                found = true;
            }
        }
        assert!(found, "self tail call must lower to LOOP");
    }

    #[test]
    fn test_non_tail_self_call_is_an_apply() {
        let ssa = build("let rec f n = if n < 2 then n else f (n - 1) + f (n - 2) in f").unwrap();
        for body in fn_bodies(&ssa) {
            let insns = all_insns(&body);
            assert!(!insns.iter().any(|i| matches!(i, SsaInsn::Loop { .. })));
            assert!(insns.iter().any(|i| matches!(i, SsaInsn::Apply { .. })));
        }
    }

    #[test]
    fn test_letrec_emits_scope_construction() {
        let ssa = build("let rec f x = g x and g x = f x in f").unwrap();
        let insns = all_insns(&ssa);
        let nalc = insns.iter().filter(|i| matches!(i, SsaInsn::Alcfn { .. })).count();
        let nfin = insns.iter().filter(|i| matches!(i, SsaInsn::Finfn { .. })).count();
        assert_eq!(nalc, 2);
        assert_eq!(nfin, 2);
        assert!(insns
            .iter()
            .any(|i| matches!(i, SsaInsn::Mkscp { clos } if clos.len() == 2)));
    }

    #[test]
    fn test_apply_is_followed_by_exception_test() {
        let ssa = build("let f = fn x -> x in f 1").unwrap();
        let insns = all_insns(&ssa);
        let has_test = insns.iter().any(|i| {
            matches!(i, SsaInsn::If { test: SsaTest::Type(ty), likely: -1, .. }
                if Rc::ptr_eq(ty, &types::exception_type()))
        });
        assert!(has_test, "every apply is followed by an exception-type test");
    }

    #[test]
    fn test_known_type_elides_pattern_test() {
        // the tuple type of (1, x) is known, so the unpack needs no test
        let ssa = build("let f = fn p -> let (a, b) = (1, p) in a + b in f").unwrap();
        for body in fn_bodies(&ssa) {
            for insn in all_insns(&body) {
                if let SsaInsn::If { test: SsaTest::Match(SsaPattern::Unpack { ty, dotest, .. }), .. } = insn {
                    if ty.is_tuple() {
                        assert!(!dotest, "statically known unpack must skip its test");
                    }
                }
            }
        }
    }

    #[test]
    fn test_default_values_get_release_insns() {
        let ssa = build("let f = fn x -> x :: [1] in f").unwrap();
        let mut any_rc = false;
        for body in fn_bodies(&ssa) {
            for insn in all_insns(&body) {
                if matches!(
                    insn,
                    SsaInsn::Ref { .. }
                        | SsaInsn::Dec { .. }
                        | SsaInsn::Unref { .. }
                        | SsaInsn::Drop { .. }
                ) {
                    any_rc = true;
                }
            }
        }
        assert!(any_rc, "reference traffic must be inserted for owned values");
    }

    #[test]
    fn test_killed_argument_is_marked_for_move() {
        // the cons cell built for the argument dies into the call, so its
        // register hands the value over instead of cloning it
        let ssa = build("let g = fn f x -> f (x :: []) in g").unwrap();
        let mut found = false;
        for body in fn_bodies(&ssa) {
            for (&node, takes) in &body.moves {
                if matches!(body.graph.insn(node), SsaInsn::Apply { .. })
                    && takes.iter().any(|&take| take)
                {
                    found = true;
                }
            }
        }
        assert!(found, "a last-use argument must transfer ownership");
    }

    #[test]
    fn test_multimatch_builds_decision_tree() {
        let ssa = build(
            "let f = fn a b -> match (a, b) with ((x, y), _) -> x + y | (_, (p, q)) -> p * q | (_, _) -> 0 in f",
        );
        let ssa = ssa.unwrap();
        let mut unpack_tests = 0;
        for body in fn_bodies(&ssa) {
            for insn in all_insns(&body) {
                if matches!(insn, SsaInsn::If { test: SsaTest::Match(SsaPattern::Unpack { .. }), .. }) {
                    unpack_tests += 1;
                }
            }
        }
        assert!(unpack_tests >= 1, "multimatch compiles through constructor tests");
    }

    #[test]
    fn test_multimatch_rejects_constant_columns() {
        use crate::ast::{Ast, AstPattern, MatchTable};
        // built by hand: the parser itself refuses to form such a table
        let table = MatchTable {
            rows: vec![
                vec![AstPattern::Constant(Value::num(1)), AstPattern::Dummy],
                vec![AstPattern::Dummy, AstPattern::Dummy],
            ],
            actions: vec![Ast::cval(Value::num(1), None), Ast::cval(Value::num(2), None)],
        };
        let body = Ast::multimatch(
            table,
            vec![Ast::ident("a", None), Ast::ident("b", None)],
            None,
        );
        let f = Ast::fn_(
            vec![AstPattern::ident("a"), AstPattern::ident("b")],
            body,
            None,
        );
        let root = Module::new("root");
        let prog = build_ir(&f, &root, None).unwrap();
        let err = build_ssa(&prog.ir, None).unwrap_err();
        assert!(matches!(err, SsaError::UnsupportedMultimatch { .. }));
    }

    #[test]
    fn test_static_number_mismatch_fails_the_build() {
        let err = build("let f = fn x -> \"a\" + x in f").unwrap_err();
        assert!(matches!(err, SsaError::NumberExpected { .. }));
    }

    #[test]
    fn test_module_defs_pack_into_a_tuple() {
        let tokens = Lexer::new("let pub one = 1\nlet pub two = 2\nnil").tokenize().unwrap();
        let ast = Parser::new(tokens).parse_program().unwrap();
        let root = Module::new("root");
        let prog = build_ir(&ast, &root, None).unwrap();
        let ssa = build_ssa(&prog.ir, Some(&prog.defs)).unwrap();
        let insns = all_insns(&ssa);
        assert!(insns
            .iter()
            .any(|i| matches!(i, SsaInsn::Mkrcrd { ty, vids, .. }
                if ty.is_tuple() && vids.len() == 3)));
    }
}
