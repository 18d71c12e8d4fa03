//! The register machine.
//!
//! One frame per bytecode chunk, registers in a plain vector. Arguments
//! travel over a shared stack: callers push, the callee's `Pop` prologue
//! claims them. A tail `Applytc` swaps the running chunk in place when the
//! callee's frame fits; a self tail-call `Loop` just rebinds the argument
//! registers and jumps to the entry point.

use ether_core::bytecode::{Chunk, Insn};
use ether_core::exception::{exn_sym, push_trace};
use ether_core::function::{Applier, Func, FunRef, Scope};
use ether_core::number::Number;
use ether_core::value::{Record, Value};
use ether_core::eth_error;
use std::rc::Rc;

/// Call-depth guard: fail fast with a `stack_overflow` exception instead of
/// exhausting the native stack. Sized for the small default stacks of
/// spawned threads.
pub const MAX_CALL_DEPTH: usize = 1024;

pub struct Vm {
    stack: Vec<Value>,
    depth: usize,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Applier for Vm {
    fn apply(&mut self, f: Value, args: Vec<Value>) -> Value {
        let nargs = args.len();
        self.stack.extend(args);
        self.apply_stack(f, nargs)
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm { stack: Vec::new(), depth: 0 }
    }

    /// Run a chunk that is not a function body (a compiled script).
    pub fn run_chunk(&mut self, chunk: Rc<Chunk>) -> Value {
        self.run(chunk, None)
    }

    fn drain_args(&mut self, nargs: usize) -> Vec<Value> {
        let at = self.stack.len() - nargs;
        self.stack.split_off(at)
    }

    /// Calling convention: exact arity dispatches directly; a shortfall
    /// builds a partial-application closure; excess applies the function to
    /// its arity's worth of arguments and then the rest to the result.
    fn apply_stack(&mut self, f: Value, nargs: usize) -> Value {
        let Value::Func(fr) = f else {
            self.drain_args(nargs);
            return exn_sym("apply_error");
        };
        if fr.arity() == nargs {
            self.raw_apply(&fr, nargs)
        } else {
            self.partial_apply(fr, nargs)
        }
    }

    fn raw_apply(&mut self, fr: &FunRef, nargs: usize) -> Value {
        match fr.get() {
            Func::Proc(p) => {
                let args = self.drain_args(nargs);
                let handler = p.handler.clone();
                handler(self, args)
            }
            Func::Lambda(lam) => {
                if self.depth >= MAX_CALL_DEPTH {
                    self.drain_args(nargs);
                    return exn_sym("stack_overflow");
                }
                let chunk = lam.bytecode.borrow().clone();
                match chunk {
                    None => {
                        eth_error!("evaluation of a deactivated closure");
                        self.drain_args(nargs);
                        return exn_sym("invalid_argument");
                    }
                    Some(chunk) => {
                        self.depth += 1;
                        let ret = self.run(chunk, Some(fr.clone()));
                        self.depth -= 1;
                        ret
                    }
                }
            }
        }
    }

    fn partial_apply(&mut self, fr: FunRef, nargs: usize) -> Value {
        let arity = fr.arity();
        if arity < nargs {
            let mut args = self.drain_args(nargs);
            let rest = args.split_off(arity);
            self.stack.extend(args);
            let tmp = self.raw_apply(&fr, arity);
            match tmp {
                Value::Func(_) => {
                    let n = rest.len();
                    self.stack.extend(rest);
                    self.apply_stack(tmp, n)
                }
                Value::Exn(_) => tmp,
                other => {
                    drop(other);
                    exn_sym("apply_error")
                }
            }
        } else {
            // under-application: close over what we got
            let part = self.drain_args(nargs);
            let f = Value::Func(fr);
            let handler = Rc::new(move |vm: &mut dyn Applier, mut args: Vec<Value>| {
                let mut all = part.clone();
                all.append(&mut args);
                vm.apply(f.clone(), all)
            });
            Value::Func(FunRef::proc("<partial>", arity - nargs, handler))
        }
    }

    fn run(&mut self, chunk: Rc<Chunk>, this: Option<FunRef>) -> Value {
        let mut chunk = chunk;
        let mut this = this;
        let mut r: Vec<Value> = vec![Value::Nil; chunk.nreg];
        let mut test = false;
        let mut exn_slot = Value::Nil;
        let mut nstack = 0usize;

        'frame: loop {
            let code = chunk.clone();
            let mut pc = 0usize;

            loop {
                match &code.code[pc] {
                    Insn::Cval { out, val } => {
                        r[*out as usize] = val.clone();
                    }

                    Insn::Dup { out, src } => {
                        r[*out as usize] = r[*src as usize].clone();
                    }

                    Insn::Mov { out, src } => {
                        r[*out as usize] = std::mem::take(&mut r[*src as usize]);
                    }

                    Insn::Push { args } => {
                        for arg in args.iter() {
                            let val = if arg.take {
                                std::mem::take(&mut r[arg.reg as usize])
                            } else {
                                r[arg.reg as usize].clone()
                            };
                            self.stack.push(val);
                        }
                        nstack += args.len();
                    }

                    Insn::Pop { base, n } => {
                        let at = self.stack.len() - *n as usize;
                        for (i, val) in self.stack.split_off(at).into_iter().enumerate() {
                            r[*base as usize + i] = val;
                        }
                    }

                    Insn::Cap { base, n } => {
                        if let Some(fr) = &this {
                            if let Some(lam) = fr.as_lambda() {
                                let caps = lam.captures.borrow();
                                for i in 0..*n as usize {
                                    r[*base as usize + i] = caps[i].clone();
                                }
                            }
                        }
                    }

                    Insn::Apply { out, f } => {
                        let f = r[*f as usize].clone();
                        let n = nstack;
                        nstack = 0;
                        r[*out as usize] = self.apply_stack(f, n);
                    }

                    Insn::Applytc { out, f } => {
                        let f = r[*f as usize].clone();
                        let n = nstack;
                        nstack = 0;
                        let mut reused = false;
                        if let Value::Func(fr) = &f {
                            if let Some(lam) = fr.as_lambda() {
                                if lam.arity == n {
                                    let bc = lam.bytecode.borrow().clone();
                                    if let Some(bc) = bc {
                                        if bc.nreg <= r.len() {
                                            chunk = bc;
                                            this = Some(fr.clone());
                                            reused = true;
                                        }
                                    }
                                }
                            }
                        }
                        if reused {
                            continue 'frame;
                        }
                        r[*out as usize] = self.apply_stack(f, n);
                    }

                    Insn::Loop { args } => {
                        let vals: Vec<Value> = args
                            .iter()
                            .map(|arg| {
                                if arg.take {
                                    std::mem::take(&mut r[arg.reg as usize])
                                } else {
                                    r[arg.reg as usize].clone()
                                }
                            })
                            .collect();
                        for (i, val) in vals.into_iter().enumerate() {
                            r[i] = val;
                        }
                        pc = code.entry;
                        continue;
                    }

                    Insn::Test { reg } => {
                        test = !r[*reg as usize].is_false();
                    }

                    Insn::Testty { reg, ty } => {
                        test = r[*reg as usize].has_type(ty);
                    }

                    Insn::Testis { reg, val } => {
                        test = r[*reg as usize].is_identical(val);
                    }

                    Insn::Testequal { reg, val } => {
                        test = r[*reg as usize].equal(val);
                    }

                    Insn::Gettest { out } => {
                        r[*out as usize] = Value::Bool(test);
                    }

                    Insn::Jmp { offs } => {
                        pc = (pc as i64 + *offs as i64) as usize;
                        continue;
                    }

                    Insn::Jze { offs } => {
                        if !test {
                            pc = (pc as i64 + *offs as i64) as usize;
                            continue;
                        }
                    }

                    Insn::Jnz { offs } => {
                        if test {
                            pc = (pc as i64 + *offs as i64) as usize;
                            continue;
                        }
                    }

                    Insn::Ret { reg } => {
                        return std::mem::take(&mut r[*reg as usize]);
                    }

                    Insn::Unref { reg } | Insn::Drop { reg } => {
                        r[*reg as usize] = Value::Nil;
                    }

                    Insn::Add { out, lhs, rhs } => {
                        r[*out as usize] = arith(&r[*lhs as usize], &r[*rhs as usize], Number::add)
                    }
                    Insn::Sub { out, lhs, rhs } => {
                        r[*out as usize] = arith(&r[*lhs as usize], &r[*rhs as usize], Number::sub)
                    }
                    Insn::Mul { out, lhs, rhs } => {
                        r[*out as usize] = arith(&r[*lhs as usize], &r[*rhs as usize], Number::mul)
                    }
                    Insn::Div { out, lhs, rhs } => {
                        r[*out as usize] = arith(&r[*lhs as usize], &r[*rhs as usize], Number::div)
                    }
                    Insn::Mod { out, lhs, rhs } => {
                        r[*out as usize] = arith(&r[*lhs as usize], &r[*rhs as usize], Number::rem)
                    }
                    Insn::Pow { out, lhs, rhs } => {
                        r[*out as usize] = arith(&r[*lhs as usize], &r[*rhs as usize], Number::pow)
                    }

                    Insn::Land { out, lhs, rhs } => {
                        r[*out as usize] = bitop(&r[*lhs as usize], &r[*rhs as usize], |a, b| a & b)
                    }
                    Insn::Lor { out, lhs, rhs } => {
                        r[*out as usize] = bitop(&r[*lhs as usize], &r[*rhs as usize], |a, b| a | b)
                    }
                    Insn::Lxor { out, lhs, rhs } => {
                        r[*out as usize] = bitop(&r[*lhs as usize], &r[*rhs as usize], |a, b| a ^ b)
                    }
                    Insn::Lshl { out, lhs, rhs } | Insn::Ashl { out, lhs, rhs } => {
                        r[*out as usize] = bitop(&r[*lhs as usize], &r[*rhs as usize], |a, b| {
                            ((a as u64) << (b as u32 & 63)) as i64
                        })
                    }
                    Insn::Lshr { out, lhs, rhs } => {
                        r[*out as usize] = bitop(&r[*lhs as usize], &r[*rhs as usize], |a, b| {
                            ((a as u64) >> (b as u32 & 63)) as i64
                        })
                    }
                    Insn::Ashr { out, lhs, rhs } => {
                        r[*out as usize] =
                            bitop(&r[*lhs as usize], &r[*rhs as usize], |a, b| a >> (b as u32 & 63))
                    }

                    // comparisons yield the right operand or false so that
                    // chained comparisons keep flowing
                    Insn::Lt { out, lhs, rhs } => {
                        r[*out as usize] = cmp(&r[*lhs as usize], &r[*rhs as usize], |a, b| a < b)
                    }
                    Insn::Le { out, lhs, rhs } => {
                        r[*out as usize] = cmp(&r[*lhs as usize], &r[*rhs as usize], |a, b| a <= b)
                    }
                    Insn::Gt { out, lhs, rhs } => {
                        r[*out as usize] = cmp(&r[*lhs as usize], &r[*rhs as usize], |a, b| a > b)
                    }
                    Insn::Ge { out, lhs, rhs } => {
                        r[*out as usize] = cmp(&r[*lhs as usize], &r[*rhs as usize], |a, b| a >= b)
                    }

                    Insn::Eq { out, lhs, rhs } => {
                        let eq = match (r[*lhs as usize].as_num(), r[*rhs as usize].as_num()) {
                            (Some(a), Some(b)) => a == b,
                            _ => false,
                        };
                        r[*out as usize] = Value::Bool(eq);
                    }
                    Insn::Ne { out, lhs, rhs } => {
                        let ne = match (r[*lhs as usize].as_num(), r[*rhs as usize].as_num()) {
                            (Some(a), Some(b)) => a != b,
                            _ => true,
                        };
                        r[*out as usize] = Value::Bool(ne);
                    }

                    Insn::Is { out, lhs, rhs } => {
                        r[*out as usize] =
                            Value::Bool(r[*lhs as usize].is_identical(&r[*rhs as usize]));
                    }
                    Insn::Equal { out, lhs, rhs } => {
                        r[*out as usize] =
                            Value::Bool(r[*lhs as usize].equal(&r[*rhs as usize]));
                    }

                    Insn::Cons { out, lhs, rhs } => {
                        r[*out as usize] = Value::cons(
                            r[*lhs as usize].clone(),
                            r[*rhs as usize].clone(),
                        );
                    }

                    Insn::Not { out, src } => {
                        r[*out as usize] = Value::Bool(r[*src as usize].is_false());
                    }
                    Insn::Lnot { out, src } => {
                        r[*out as usize] = match r[*src as usize].as_num() {
                            Some(n) => Value::num(!n.as_bits()),
                            None => exn_sym("type_error"),
                        };
                    }

                    Insn::Fn { out, data } => {
                        let caps: Vec<Value> =
                            data.caps.iter().map(|&c| r[c as usize].clone()).collect();
                        r[*out as usize] = Value::Func(FunRef::closure(
                            data.arity,
                            data.chunk.clone(),
                            caps,
                        ));
                    }

                    Insn::Alcfn { out, arity } => {
                        r[*out as usize] = Value::Func(FunRef::unfinished(*arity));
                    }

                    Insn::Finfn { out, data } => {
                        let caps: Vec<Value> =
                            data.caps.iter().map(|&c| r[c as usize].clone()).collect();
                        if let Value::Func(fr) = &r[*out as usize] {
                            fr.finalize(data.chunk.clone(), caps);
                        }
                    }

                    Insn::Mkscp { members } => {
                        let mut closures = Vec::with_capacity(members.len());
                        for &m in members.iter() {
                            if let Value::Func(fr) = &r[m as usize] {
                                closures.push(fr.clone());
                            }
                        }
                        Scope::create(&closures);
                    }

                    Insn::Load { out, src, idx } => {
                        r[*out as usize] =
                            r[*src as usize].field(*idx as usize).unwrap_or(Value::Nil);
                    }

                    Insn::Loadrcrd { src, ids, outs } => {
                        let mut loaded: Vec<Value> = Vec::with_capacity(ids.len());
                        test = match &r[*src as usize] {
                            Value::Record(rec) if rec.ty.is_record() => {
                                let mut ok = true;
                                for id in ids.iter() {
                                    let idx = rec.ty.field_index(*id);
                                    if idx == rec.ty.nfields() {
                                        ok = false;
                                        break;
                                    }
                                    loaded.push(rec.vals[idx].clone());
                                }
                                ok
                            }
                            _ => false,
                        };
                        if test {
                            for (out, val) in outs.iter().zip(loaded) {
                                r[*out as usize] = val;
                            }
                        }
                    }

                    Insn::Loadrcrd1 { out, src, id } => {
                        let value = {
                            let v = &r[*src as usize];
                            let ty = v.type_of();
                            if ty.is_plain() {
                                let idx = ty.field_index(*id);
                                if idx == ty.nfields() {
                                    None
                                } else {
                                    v.field(idx)
                                }
                            } else {
                                None
                            }
                        };
                        match value {
                            Some(val) => {
                                test = true;
                                r[*out as usize] = val;
                            }
                            None => test = false,
                        }
                    }

                    Insn::Setexn { reg } => {
                        exn_slot = r[*reg as usize].clone();
                    }

                    Insn::Getexn { out } => {
                        r[*out as usize] = std::mem::take(&mut exn_slot);
                    }

                    Insn::Mkrcrd { out, ty, args } => {
                        let vals: Vec<Value> =
                            args.iter().map(|&a| r[a as usize].clone()).collect();
                        r[*out as usize] = Value::record(ty.clone(), vals);
                    }

                    Insn::Updtrcrd { out, src, ids, args } => {
                        let updated = match &r[*src as usize] {
                            Value::Record(rec) if rec.ty.is_record() => {
                                let mut vals: Vec<Value> = rec.vals.to_vec();
                                let mut ok = true;
                                for (id, &arg) in ids.iter().zip(args.iter()) {
                                    let idx = rec.ty.field_index(*id);
                                    if idx == rec.ty.nfields() {
                                        ok = false;
                                        break;
                                    }
                                    vals[idx] = r[arg as usize].clone();
                                }
                                ok.then(|| {
                                    Value::Record(Rc::new(Record {
                                        ty: rec.ty.clone(),
                                        vals: vals.into_boxed_slice(),
                                    }))
                                })
                            }
                            _ => None,
                        };
                        match updated {
                            Some(val) => {
                                test = true;
                                r[*out as usize] = val;
                            }
                            None => test = false,
                        }
                    }

                    Insn::Trace { reg, loc } => {
                        let val = std::mem::take(&mut r[*reg as usize]);
                        r[*reg as usize] = push_trace(val, loc.clone());
                    }
                }
                pc += 1;
            }
        }
    }
}

fn arith(lhs: &Value, rhs: &Value, op: fn(Number, Number) -> Number) -> Value {
    match (lhs.as_num(), rhs.as_num()) {
        (Some(a), Some(b)) => Value::Num(op(a, b)),
        _ => exn_sym("type_error"),
    }
}

fn bitop(lhs: &Value, rhs: &Value, op: fn(i64, i64) -> i64) -> Value {
    match (lhs.as_num(), rhs.as_num()) {
        (Some(a), Some(b)) => Value::num(op(a.as_bits(), b.as_bits())),
        _ => exn_sym("type_error"),
    }
}

fn cmp(lhs: &Value, rhs: &Value, op: fn(Number, Number) -> bool) -> Value {
    match (lhs.as_num(), rhs.as_num()) {
        (Some(a), Some(b)) => {
            if op(a, b) {
                rhs.clone()
            } else {
                Value::Bool(false)
            }
        }
        _ => exn_sym("type_error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ether_core::bytecode::PushArg;

    fn chunk(nreg: usize, code: Vec<Insn>) -> Rc<Chunk> {
        Rc::new(Chunk { nreg, entry: 0, code })
    }

    #[test]
    fn test_cval_ret() {
        let mut vm = Vm::new();
        let c = chunk(
            1,
            vec![Insn::Cval { out: 0, val: Value::num(42) }, Insn::Ret { reg: 0 }],
        );
        assert!(vm.run_chunk(c).equal(&Value::num(42)));
    }

    #[test]
    fn test_arith_and_jump() {
        // if 1 < 2 then 10 else 20, hand-assembled
        let mut vm = Vm::new();
        let c = chunk(
            4,
            vec![
                Insn::Cval { out: 0, val: Value::num(1) },
                Insn::Cval { out: 1, val: Value::num(2) },
                Insn::Lt { out: 2, lhs: 0, rhs: 1 },
                Insn::Test { reg: 2 },
                Insn::Jze { offs: 3 },
                Insn::Cval { out: 3, val: Value::num(10) },
                Insn::Ret { reg: 3 },
                Insn::Cval { out: 3, val: Value::num(20) },
                Insn::Ret { reg: 3 },
            ],
        );
        assert!(vm.run_chunk(c).equal(&Value::num(10)));
    }

    #[test]
    fn test_apply_native_proc() {
        let mut vm = Vm::new();
        let double = FunRef::proc(
            "double",
            1,
            Rc::new(|_: &mut dyn Applier, args: Vec<Value>| {
                let n = args[0].as_num().unwrap();
                Value::Num(n.add(n))
            }),
        );
        let c = chunk(
            3,
            vec![
                Insn::Cval { out: 0, val: Value::Func(double) },
                Insn::Cval { out: 1, val: Value::num(21) },
                Insn::Push { args: Box::new([PushArg { reg: 1, take: true }]) },
                Insn::Apply { out: 2, f: 0 },
                Insn::Ret { reg: 2 },
            ],
        );
        assert!(vm.run_chunk(c).equal(&Value::num(42)));
    }

    #[test]
    fn test_partial_application() {
        let mut vm = Vm::new();
        let sub = FunRef::proc(
            "sub",
            2,
            Rc::new(|_: &mut dyn Applier, args: Vec<Value>| {
                let a = args[0].as_num().unwrap();
                let b = args[1].as_num().unwrap();
                Value::Num(a.sub(b))
            }),
        );
        // (sub 10) 3 = 7
        let partial = vm.apply(Value::Func(sub.clone()), vec![Value::num(10)]);
        assert!(matches!(&partial, Value::Func(f) if f.arity() == 1));
        let result = vm.apply(partial, vec![Value::num(3)]);
        assert!(result.equal(&Value::num(7)));
        // over-application: sub 10 3 via one call of a curried wrapper
        let partial = vm.apply(Value::Func(sub), vec![Value::num(10), Value::num(3)]);
        assert!(partial.equal(&Value::num(7)));
    }

    #[test]
    fn test_gettest_materializes_the_flag() {
        let mut vm = Vm::new();
        let c = chunk(
            2,
            vec![
                Insn::Cval { out: 0, val: Value::Bool(false) },
                Insn::Test { reg: 0 },
                Insn::Gettest { out: 1 },
                Insn::Ret { reg: 1 },
            ],
        );
        assert!(vm.run_chunk(c).is_false());
    }

    #[test]
    fn test_apply_non_function_is_apply_error() {
        let mut vm = Vm::new();
        let ret = vm.apply(Value::num(3), vec![Value::num(1)]);
        match ret {
            Value::Exn(e) => assert!(e.what.is_identical(&Value::sym("apply_error"))),
            other => panic!("expected exception, got {}", other),
        }
    }

    #[test]
    fn test_loop_rebinds_simultaneously() {
        // swap the two arguments once, then return the first: a register
        // flag distinguishes the first pass from the second
        let mut vm = Vm::new();
        let body = Rc::new(Chunk {
            nreg: 3,
            entry: 1,
            code: vec![
                Insn::Pop { base: 0, n: 2 },
                Insn::Test { reg: 2 }, // nil on the first pass, false after
                Insn::Jze { offs: 3 },
                Insn::Cval { out: 2, val: Value::Bool(false) },
                Insn::Loop {
                    args: Box::new([
                        PushArg { reg: 1, take: false },
                        PushArg { reg: 0, take: false },
                    ]),
                },
                Insn::Ret { reg: 0 },
            ],
        });
        let f = FunRef::closure(2, body, vec![]);
        let ret = vm.apply(Value::Func(f), vec![Value::num(1), Value::num(2)]);
        // both rebinds read the pre-loop registers, so a swap stays a swap
        assert!(ret.equal(&Value::num(2)), "got {}", ret);
    }
}
