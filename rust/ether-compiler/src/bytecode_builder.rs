//! SSA → bytecode: flattens the instruction graph into a linear tape with
//! relative jumps. Registers map one-to-one onto SSA value ids, so a frame's
//! register count is the unit's value count. Unlikely arms are deferred and
//! appended after the body with a jump back.
//!
//! Reference traffic dissolves here: `Ref`/`Dec` decide whether an operand
//! slot clones or moves its register (the move plan computed by the SSA
//! pass), `Unref`/`Drop` become register releases.

use crate::ast::{Binop, Unop};
use crate::ssa::{NodeId, Ssa, SsaInsn, SsaPattern, SsaTest, TestOp, NO_VAL};
use ether_core::bytecode::{Chunk, FnPayload, Insn, PushArg, Reg};
use std::rc::Rc;

struct DeffBlock {
    jmppos: usize,
    retpos: usize,
    head: NodeId,
}

struct CatchJmp {
    pos: usize,
    tryid: usize,
}

struct BcBuilder<'a> {
    ssa: &'a Ssa,
    code: Vec<Insn>,
    deff: Vec<DeffBlock>,
    cchjmps: Vec<CatchJmp>,
    catches: Vec<usize>,
    entry: usize,
}

pub fn build_bytecode(ssa: &Ssa) -> Rc<Chunk> {
    let mut b = BcBuilder {
        ssa,
        code: Vec::new(),
        deff: Vec::new(),
        cchjmps: Vec::new(),
        catches: vec![usize::MAX; ssa.ntries],
        entry: 0,
    };
    b.build_chain(ssa.head);

    // flush deferred arms; building one may defer more
    let mut i = 0;
    while i < b.deff.len() {
        let DeffBlock { jmppos, retpos, head } = b.deff[i];
        let target = b.code.len();
        b.patch_jump(jmppos, target);
        b.build_chain(head);
        let back = b.code.len();
        b.code.push(Insn::Jmp { offs: retpos as i32 - back as i32 });
        i += 1;
    }

    for jmp in &b.cchjmps {
        let target = b.catches[jmp.tryid];
        debug_assert_ne!(target, usize::MAX, "catch handler must be emitted");
        b.code[jmp.pos] = Insn::Jmp { offs: target as i32 - jmp.pos as i32 };
    }

    Rc::new(Chunk { nreg: ssa.nvals, entry: b.entry, code: b.code })
}

impl BcBuilder<'_> {
    fn reg(&self, vid: usize) -> Reg {
        debug_assert_ne!(vid, NO_VAL);
        vid as Reg
    }

    fn patch_jump(&mut self, pos: usize, target: usize) {
        let offs = target as i32 - pos as i32;
        match &mut self.code[pos] {
            Insn::Jmp { offs: o } | Insn::Jze { offs: o } | Insn::Jnz { offs: o } => *o = offs,
            other => unreachable!("patching a non-jump {:?}", other),
        }
    }

    fn takes(&self, node: NodeId, nslots: usize) -> Vec<bool> {
        self.ssa.moves.get(&node).cloned().unwrap_or_else(|| vec![false; nslots])
    }

    /// Registers whose handle was consumed by a container instruction are
    /// released right after it; the container already holds its own clone.
    fn release_taken(&mut self, takes: &[bool], slots: &[usize]) {
        for (take, &vid) in takes.iter().zip(slots) {
            if *take {
                self.code.push(Insn::Unref { reg: self.reg(vid) });
            }
        }
    }

    fn build_chain(&mut self, head: NodeId) {
        let mut at = Some(head);
        while let Some(node) = at {
            self.build_insn(node);
            if self.ssa.entry_node == Some(node) {
                self.entry = self.code.len();
            }
            at = self.ssa.graph.next(node);
        }
    }

    fn build_insn(&mut self, node: NodeId) {
        match self.ssa.graph.insn(node) {
            SsaInsn::Nop => {}

            SsaInsn::Cval { out, val } => {
                self.code.push(Insn::Cval { out: self.reg(*out), val: val.clone() });
            }

            SsaInsn::Apply { out, f, args } | SsaInsn::Applytc { out, f, args } => {
                let takes = self.takes(node, args.len());
                let pushed: Box<[PushArg]> = args
                    .iter()
                    .zip(&takes)
                    .map(|(&vid, &take)| PushArg { reg: self.reg(vid), take })
                    .collect();
                self.code.push(Insn::Push { args: pushed });
                let insn = match self.ssa.graph.insn(node) {
                    SsaInsn::Applytc { .. } => {
                        Insn::Applytc { out: self.reg(*out), f: self.reg(*f) }
                    }
                    _ => Insn::Apply { out: self.reg(*out), f: self.reg(*f) },
                };
                self.code.push(insn);
            }

            SsaInsn::Loop { args } => {
                let takes = self.takes(node, args.len());
                let rebind: Box<[PushArg]> = args
                    .iter()
                    .zip(&takes)
                    .map(|(&vid, &take)| PushArg { reg: self.reg(vid), take })
                    .collect();
                self.code.push(Insn::Loop { args: rebind });
            }

            SsaInsn::If { out, cond, test, thenbr, elsebr, likely, .. } => {
                let mut jmps: Vec<usize> = Vec::new();
                match test {
                    SsaTest::NotFalse => {
                        self.code.push(Insn::Test { reg: self.reg(*cond) });
                    }
                    SsaTest::Type(ty) => {
                        self.code
                            .push(Insn::Testty { reg: self.reg(*cond), ty: ty.clone() });
                    }
                    SsaTest::Update { vids, ids } => {
                        let phi = out.expect("record update produces a value");
                        let args: Box<[Reg]> = vids.iter().map(|&v| self.reg(v)).collect();
                        self.code.push(Insn::Updtrcrd {
                            out: self.reg(phi),
                            src: self.reg(*cond),
                            ids: ids.clone().into_boxed_slice(),
                            args,
                        });
                    }
                    SsaTest::Match(pat) => {
                        self.build_test_pattern(pat, *cond, &mut jmps);
                        self.finish_match(&jmps, *thenbr, *elsebr, *likely);
                        return;
                    }
                }
                self.finish_single_test(*thenbr, *elsebr, *likely);
            }

            SsaInsn::Try { tryid, trybr, catchbr, .. } => {
                self.build_chain(*trybr);
                let jmpidx = self.code.len();
                self.code.push(Insn::Jmp { offs: 0 });
                self.catches[*tryid] = self.code.len();
                self.build_chain(*catchbr);
                let end = self.code.len();
                self.patch_jump(jmpidx, end);
            }

            SsaInsn::Catch { tryid, vid } => {
                let takes = self.takes(node, 1);
                self.code.push(Insn::Setexn { reg: self.reg(*vid) });
                self.release_taken(&takes, &[*vid]);
                let pos = self.code.len();
                self.code.push(Insn::Jmp { offs: 0 });
                self.cchjmps.push(CatchJmp { pos, tryid: *tryid });
            }

            SsaInsn::Getexn { out } => {
                self.code.push(Insn::Getexn { out: self.reg(*out) });
            }

            SsaInsn::Mov { out, vid } => {
                let takes = self.takes(node, 1);
                if takes[0] {
                    self.code.push(Insn::Mov { out: self.reg(*out), src: self.reg(*vid) });
                } else {
                    self.code.push(Insn::Dup { out: self.reg(*out), src: self.reg(*vid) });
                }
            }

            // reference bookkeeping dissolves into the move plan
            SsaInsn::Ref { .. } | SsaInsn::Dec { .. } => {}

            SsaInsn::Unref { vid } => {
                self.code.push(Insn::Unref { reg: self.reg(*vid) });
            }

            SsaInsn::Drop { vid } => {
                self.code.push(Insn::Drop { reg: self.reg(*vid) });
            }

            SsaInsn::Ret { vid } => {
                if *vid != NO_VAL {
                    self.code.push(Insn::Ret { reg: self.reg(*vid) });
                }
            }

            SsaInsn::Binop { op, out, lhs, rhs } => {
                let (out, lhs_r, rhs_r) = (self.reg(*out), self.reg(*lhs), self.reg(*rhs));
                let insn = match op {
                    Binop::Add => Insn::Add { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Sub => Insn::Sub { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Mul => Insn::Mul { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Div => Insn::Div { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Mod => Insn::Mod { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Pow => Insn::Pow { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Land => Insn::Land { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Lor => Insn::Lor { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Lxor => Insn::Lxor { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Lshl => Insn::Lshl { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Lshr => Insn::Lshr { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Ashl => Insn::Ashl { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Ashr => Insn::Ashr { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Lt => Insn::Lt { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Le => Insn::Le { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Gt => Insn::Gt { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Ge => Insn::Ge { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Eq => Insn::Eq { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Ne => Insn::Ne { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Is => Insn::Is { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Equal => Insn::Equal { out, lhs: lhs_r, rhs: rhs_r },
                    Binop::Cons => Insn::Cons { out, lhs: lhs_r, rhs: rhs_r },
                };
                self.code.push(insn);
                if *op == Binop::Cons {
                    let takes = self.takes(node, 2);
                    self.release_taken(&takes, &[*lhs, *rhs]);
                }
            }

            SsaInsn::Unop { op, out, vid } => {
                let insn = match op {
                    Unop::Not => Insn::Not { out: self.reg(*out), src: self.reg(*vid) },
                    Unop::Lnot => Insn::Lnot { out: self.reg(*out), src: self.reg(*vid) },
                };
                self.code.push(insn);
            }

            SsaInsn::Fn { out, arity, caps, body } => {
                let chunk = build_bytecode(body);
                let capregs: Box<[Reg]> = caps.iter().map(|&c| self.reg(c)).collect();
                let takes = self.takes(node, caps.len());
                self.code.push(Insn::Fn {
                    out: self.reg(*out),
                    data: Rc::new(FnPayload { arity: *arity, caps: capregs, chunk }),
                });
                let slots: Vec<usize> = caps.clone();
                self.release_taken(&takes, &slots);
            }

            SsaInsn::Alcfn { out, arity } => {
                self.code.push(Insn::Alcfn { out: self.reg(*out), arity: *arity });
            }

            SsaInsn::Finfn { out, arity, caps, body } => {
                let chunk = build_bytecode(body);
                let capregs: Box<[Reg]> = caps.iter().map(|&c| self.reg(c)).collect();
                let takes = self.takes(node, caps.len());
                self.code.push(Insn::Finfn {
                    out: self.reg(*out),
                    data: Rc::new(FnPayload { arity: *arity, caps: capregs, chunk }),
                });
                let slots: Vec<usize> = caps.clone();
                self.release_taken(&takes, &slots);
            }

            SsaInsn::Mkscp { clos } => {
                let members: Box<[Reg]> = clos.iter().map(|&c| self.reg(c)).collect();
                self.code.push(Insn::Mkscp { members });
            }

            SsaInsn::Pop { vids } => {
                self.code.push(Insn::Pop { base: self.reg(vids[0]), n: vids.len() as u16 });
            }

            SsaInsn::Cap { vids } => {
                self.code.push(Insn::Cap { base: self.reg(vids[0]), n: vids.len() as u16 });
            }

            SsaInsn::Mkrcrd { out, ty, vids } => {
                let args: Box<[Reg]> = vids.iter().map(|&v| self.reg(v)).collect();
                let takes = self.takes(node, vids.len());
                self.code
                    .push(Insn::Mkrcrd { out: self.reg(*out), ty: ty.clone(), args });
                let slots: Vec<usize> = vids.clone();
                self.release_taken(&takes, &slots);
            }

            SsaInsn::Trace { vid, loc } => {
                self.code.push(Insn::Trace { reg: self.reg(*vid), loc: loc.clone() });
            }
        }
    }

    /// Branch selection for the single-test forms, honoring the likelihood
    /// hint: the likely arm is emitted inline, the other deferred.
    fn finish_single_test(&mut self, thenbr: NodeId, elsebr: NodeId, likely: i8) {
        if likely > 0 {
            let jmpidx = self.code.len();
            self.code.push(Insn::Jze { offs: 0 });
            self.build_chain(thenbr);
            self.deff.push(DeffBlock { jmppos: jmpidx, retpos: self.code.len(), head: elsebr });
        } else if likely < 0 {
            let jmpidx = self.code.len();
            self.code.push(Insn::Jnz { offs: 0 });
            self.build_chain(elsebr);
            self.deff.push(DeffBlock { jmppos: jmpidx, retpos: self.code.len(), head: thenbr });
        } else {
            let jmpidx = self.code.len();
            self.code.push(Insn::Jze { offs: 0 });
            self.build_chain(thenbr);
            let sepidx = self.code.len();
            self.code.push(Insn::Jmp { offs: 0 });
            self.build_chain(elsebr);
            self.patch_jump(jmpidx, sepidx + 1);
            let end = self.code.len();
            self.patch_jump(sepidx, end);
        }
    }

    /// Branches of a pattern test: every emitted check jumps on failure. No
    /// checks at all means the match is statically known to succeed and the
    /// else-arm disappears.
    fn finish_match(&mut self, jmps: &[usize], thenbr: NodeId, elsebr: NodeId, likely: i8) {
        if jmps.is_empty() {
            self.build_chain(thenbr);
            return;
        }
        if likely > 0 {
            self.build_chain(thenbr);
            let retpos = self.code.len();
            for &jmppos in jmps {
                self.deff.push(DeffBlock { jmppos, retpos, head: elsebr });
            }
        } else if likely < 0 {
            // invert: the failure jumps fall into the else-arm inline
            for &jmppos in jmps {
                let Insn::Jze { .. } = self.code[jmppos] else {
                    unreachable!("pattern checks emit JZE")
                };
                self.code[jmppos] = Insn::Jnz { offs: 0 };
            }
            self.build_chain(elsebr);
            let retpos = self.code.len();
            for &jmppos in jmps {
                self.deff.push(DeffBlock { jmppos, retpos, head: thenbr });
            }
        } else {
            self.build_chain(thenbr);
            let sepidx = self.code.len();
            self.code.push(Insn::Jmp { offs: 0 });
            for &jmppos in jmps {
                self.patch_jump(jmppos, sepidx + 1);
            }
            self.build_chain(elsebr);
            let end = self.code.len();
            self.patch_jump(sepidx, end);
        }
    }

    fn build_test_pattern(&mut self, pat: &SsaPattern, src: usize, jmps: &mut Vec<usize>) {
        match pat {
            SsaPattern::Dummy | SsaPattern::Ident => {}

            SsaPattern::Constant { val, op, dotest } => {
                if !*dotest {
                    return;
                }
                let insn = match op {
                    TestOp::Is => Insn::Testis { reg: self.reg(src), val: val.clone() },
                    TestOp::Equal => {
                        Insn::Testequal { reg: self.reg(src), val: val.clone() }
                    }
                };
                self.code.push(insn);
                jmps.push(self.code.len());
                self.code.push(Insn::Jze { offs: 0 });
            }

            SsaPattern::Unpack { ty, offs, vids, subpats, dotest } => {
                if *dotest {
                    self.code.push(Insn::Testty { reg: self.reg(src), ty: ty.clone() });
                    jmps.push(self.code.len());
                    self.code.push(Insn::Jze { offs: 0 });
                }
                for ((off, vid), sub) in offs.iter().zip(vids).zip(subpats) {
                    if matches!(sub, SsaPattern::Dummy) {
                        continue;
                    }
                    self.code.push(Insn::Load {
                        out: self.reg(*vid),
                        src: self.reg(src),
                        idx: *off as u16,
                    });
                    self.build_test_pattern(sub, *vid, jmps);
                }
            }

            SsaPattern::Record { ids, vids, subpats } => {
                if ids.len() == 1 {
                    self.code.push(Insn::Loadrcrd1 {
                        out: self.reg(vids[0]),
                        src: self.reg(src),
                        id: ids[0],
                    });
                } else {
                    self.code.push(Insn::Loadrcrd {
                        src: self.reg(src),
                        ids: ids.clone().into_boxed_slice(),
                        outs: vids.iter().map(|&v| self.reg(v)).collect(),
                    });
                }
                jmps.push(self.code.len());
                self.code.push(Insn::Jze { offs: 0 });
                for (vid, sub) in vids.iter().zip(subpats) {
                    self.build_test_pattern(sub, *vid, jmps);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_builder::build_ir;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::ssa_builder::build_ssa;
    use ether_core::attr::Attr;
    use ether_core::function::FunRef;
    use ether_core::module::Module;
    use ether_core::value::Value;

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

    fn compile(src: &str) -> Rc<Chunk> {
        let tokens = Lexer::new(src).tokenize().unwrap();
        let ast = Parser::new(tokens).parse_program().unwrap();
        let root = root_with_builtins();
        let prog = build_ir(&ast, &root, None).unwrap();
        let ssa = build_ssa(&prog.ir, None).unwrap();
        build_bytecode(&ssa)
    }

    fn chunks_of(chunk: &Chunk) -> Vec<Rc<Chunk>> {
        let mut out = Vec::new();
        for insn in &chunk.code {
            if let Insn::Fn { data, .. } | Insn::Finfn { data, .. } = insn {
                out.push(data.chunk.clone());
                out.extend(chunks_of(&data.chunk));
            }
        }
        out
    }

    #[test]
    fn test_constant_body_is_cval_ret() {
        let chunk = compile("1 + 2");
        assert!(matches!(chunk.code[0], Insn::Cval { .. }));
        assert!(matches!(chunk.code.last(), Some(Insn::Ret { .. })));
    }

    #[test]
    fn test_jump_offsets_are_relative_and_resolve() {
        let chunk = compile("let f = fn x -> if x then 1 else 2 in f");
        for inner in chunks_of(&chunk) {
            for (i, insn) in inner.code.iter().enumerate() {
                if let Insn::Jmp { offs } | Insn::Jze { offs } | Insn::Jnz { offs } = insn {
                    let target = i as i32 + offs;
                    assert!(
                        target >= 0 && (target as usize) <= inner.code.len(),
                        "jump at {} lands outside the tape",
                        i
                    );
                    assert_ne!(*offs, 0, "unpatched jump at {}", i);
                }
            }
        }
    }

    #[test]
    fn test_loop_targets_entry_after_prologue() {
        let chunk = compile("let rec f n a = if n = 0 then a else f (n - 1) (a * n) in f");
        let mut found = false;
        for inner in chunks_of(&chunk) {
            for insn in &inner.code {
                if matches!(insn, Insn::Loop { .. }) {
                    found = true;
                    assert!(inner.entry > 0, "letrec member must have a prologue entry");
                }
            }
        }
        assert!(found, "tail-recursive function compiles to LOOP");
    }

    #[test]
    fn test_pattern_failure_jumps_are_emitted() {
        let chunk = compile("let f = fn l -> match l with x :: _ -> x | _ -> nil in f");
        let mut has_testty = false;
        for inner in chunks_of(&chunk) {
            for insn in &inner.code {
                if matches!(insn, Insn::Testty { .. }) {
                    has_testty = true;
                }
            }
        }
        assert!(has_testty, "pair pattern on unknown value needs a type test");
    }

    #[test]
    fn test_record_pattern_uses_loadrcrd() {
        let chunk = compile("let f = fn r -> match r with { x, y } -> x + y | _ -> 0 in f");
        let mut has_loadrcrd = false;
        for inner in chunks_of(&chunk) {
            for insn in &inner.code {
                if matches!(insn, Insn::Loadrcrd { .. }) {
                    has_loadrcrd = true;
                }
            }
        }
        assert!(has_loadrcrd);
    }

    #[test]
    fn test_single_field_record_uses_loadrcrd1() {
        let chunk = compile("let f = fn r -> r.x in f");
        let mut found = false;
        for inner in chunks_of(&chunk) {
            for insn in &inner.code {
                if matches!(insn, Insn::Loadrcrd1 { .. }) {
                    found = true;
                }
            }
        }
        assert!(found, "field access compiles to a single-id record load");
    }

    #[test]
    fn test_update_emits_updtrcrd() {
        let chunk = compile("let f = fn r -> r with { y = 20 } in f");
        let mut found = false;
        for inner in chunks_of(&chunk) {
            for insn in &inner.code {
                if matches!(insn, Insn::Updtrcrd { .. }) {
                    found = true;
                }
            }
        }
        assert!(found);
    }

    #[test]
    fn test_try_emits_setexn_getexn() {
        let chunk = compile("try 1 with _ -> 2");
        let code = &chunk.code;
        assert!(code.iter().any(|i| matches!(i, Insn::Getexn { .. })));
    }
}
