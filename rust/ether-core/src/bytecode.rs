//! The flat bytecode executed by the VM.
//!
//! Operands are dense register indices; branches use relative offsets.
//! Reference traffic is encoded structurally: `Dup` clones a handle into a
//! register, `Mov` moves one out, `Push` moves or clones per argument slot,
//! and `Unref`/`Drop` release a register at the end of a value's lifetime.
//! Bytecode is an in-memory program only; it is never persisted.

use crate::location::Loc;
use crate::symbol::Symbol;
use crate::types::Type;
use crate::value::Value;
use std::rc::Rc;
use strum_macros::IntoStaticStr;

pub type Reg = u16;

/// One argument slot of a `Push`: `take` moves the handle out of the
/// register (the consumer absorbs its ownership), otherwise it is cloned.
#[derive(Debug, Clone, Copy)]
pub struct PushArg {
    pub reg: Reg,
    pub take: bool,
}

/// Payload of `Fn`/`Finfn`: everything needed to build a closure at runtime.
#[derive(Debug)]
pub struct FnPayload {
    pub arity: usize,
    pub caps: Box<[Reg]>,
    pub chunk: Rc<Chunk>,
}

#[derive(Debug, Clone, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Insn {
    Cval { out: Reg, val: Value },
    Dup { out: Reg, src: Reg },
    Mov { out: Reg, src: Reg },

    Push { args: Box<[PushArg]> },
    Pop { base: Reg, n: u16 },
    Cap { base: Reg, n: u16 },

    Apply { out: Reg, f: Reg },
    Applytc { out: Reg, f: Reg },
    Loop { args: Box<[PushArg]> },

    Test { reg: Reg },
    Testty { reg: Reg, ty: Rc<Type> },
    Testis { reg: Reg, val: Value },
    Testequal { reg: Reg, val: Value },
    Gettest { out: Reg },

    Jmp { offs: i32 },
    Jze { offs: i32 },
    Jnz { offs: i32 },
    Ret { reg: Reg },

    Unref { reg: Reg },
    Drop { reg: Reg },

    Add { out: Reg, lhs: Reg, rhs: Reg },
    Sub { out: Reg, lhs: Reg, rhs: Reg },
    Mul { out: Reg, lhs: Reg, rhs: Reg },
    Div { out: Reg, lhs: Reg, rhs: Reg },
    Mod { out: Reg, lhs: Reg, rhs: Reg },
    Pow { out: Reg, lhs: Reg, rhs: Reg },
    Land { out: Reg, lhs: Reg, rhs: Reg },
    Lor { out: Reg, lhs: Reg, rhs: Reg },
    Lxor { out: Reg, lhs: Reg, rhs: Reg },
    Lshl { out: Reg, lhs: Reg, rhs: Reg },
    Lshr { out: Reg, lhs: Reg, rhs: Reg },
    Ashl { out: Reg, lhs: Reg, rhs: Reg },
    Ashr { out: Reg, lhs: Reg, rhs: Reg },
    Lt { out: Reg, lhs: Reg, rhs: Reg },
    Le { out: Reg, lhs: Reg, rhs: Reg },
    Gt { out: Reg, lhs: Reg, rhs: Reg },
    Ge { out: Reg, lhs: Reg, rhs: Reg },
    Eq { out: Reg, lhs: Reg, rhs: Reg },
    Ne { out: Reg, lhs: Reg, rhs: Reg },
    Is { out: Reg, lhs: Reg, rhs: Reg },
    Equal { out: Reg, lhs: Reg, rhs: Reg },
    Cons { out: Reg, lhs: Reg, rhs: Reg },

    Not { out: Reg, src: Reg },
    Lnot { out: Reg, src: Reg },

    Fn { out: Reg, data: Rc<FnPayload> },
    Alcfn { out: Reg, arity: usize },
    Finfn { out: Reg, data: Rc<FnPayload> },
    Mkscp { members: Box<[Reg]> },

    Load { out: Reg, src: Reg, idx: u16 },
    Loadrcrd { src: Reg, ids: Box<[Symbol]>, outs: Box<[Reg]> },
    Loadrcrd1 { out: Reg, src: Reg, id: Symbol },

    Setexn { reg: Reg },
    Getexn { out: Reg },

    Mkrcrd { out: Reg, ty: Rc<Type>, args: Box<[Reg]> },
    Updtrcrd { out: Reg, src: Reg, ids: Box<[Symbol]>, args: Box<[Reg]> },

    /// Pushes a raise-site location onto an exception's trace.
    Trace { reg: Reg, loc: Loc },
}

impl Insn {
    pub fn mnemonic(&self) -> &'static str {
        self.into()
    }
}

/// A compiled function body.
#[derive(Debug)]
pub struct Chunk {
    /// Register count of a frame running this chunk.
    pub nreg: usize,
    /// Loop entry point: first instruction after the `Pop`/`Cap` prologue.
    pub entry: usize,
    pub code: Vec<Insn>,
}

impl Chunk {
    /// Human-readable listing, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (i, insn) in self.code.iter().enumerate() {
            let marker = if i == self.entry { ">" } else { " " };
            out.push_str(&format!("{}{:4}  {}\n", marker, i, format_insn(insn)));
        }
        out
    }

    /// JSON dump used by `--dump-bytecode`.
    pub fn dump_json(&self) -> serde_json::Value {
        serde_json::json!({
            "nreg": self.nreg,
            "entry": self.entry,
            "code": self
                .code
                .iter()
                .map(|insn| serde_json::json!({
                    "op": insn.mnemonic(),
                    "text": format_insn(insn),
                }))
                .collect::<Vec<_>>(),
        })
    }
}

fn regs(rs: &[Reg]) -> String {
    rs.iter().map(|r| format!("r{}", r)).collect::<Vec<_>>().join(", ")
}

fn format_insn(insn: &Insn) -> String {
    use Insn::*;
    match insn {
        Cval { out, val } => format!("CVAL r{}, {}", out, val),
        Dup { out, src } => format!("DUP r{}, r{}", out, src),
        Mov { out, src } => format!("MOV r{}, r{}", out, src),
        Push { args } => {
            let parts: Vec<String> = args
                .iter()
                .map(|a| format!("{}r{}", if a.take { "*" } else { "" }, a.reg))
                .collect();
            format!("PUSH {}", parts.join(", "))
        }
        Pop { base, n } => format!("POP r{}..{}", base, *base as u32 + *n as u32),
        Cap { base, n } => format!("CAP r{}..{}", base, *base as u32 + *n as u32),
        Apply { out, f } => format!("APPLY r{}, r{}", out, f),
        Applytc { out, f } => format!("APPLYTC r{}, r{}", out, f),
        Loop { args } => {
            let parts: Vec<String> = args
                .iter()
                .map(|a| format!("{}r{}", if a.take { "*" } else { "" }, a.reg))
                .collect();
            format!("LOOP {}", parts.join(", "))
        }
        Test { reg } => format!("TEST r{}", reg),
        Testty { reg, ty } => format!("TESTTY r{}, {}", reg, ty.name),
        Testis { reg, val } => format!("TESTIS r{}, {}", reg, val),
        Testequal { reg, val } => format!("TESTEQUAL r{}, {}", reg, val),
        Gettest { out } => format!("GETTEST r{}", out),
        Jmp { offs } => format!("JMP {:+}", offs),
        Jze { offs } => format!("JZE {:+}", offs),
        Jnz { offs } => format!("JNZ {:+}", offs),
        Ret { reg } => format!("RET r{}", reg),
        Unref { reg } => format!("UNREF r{}", reg),
        Drop { reg } => format!("DROP r{}", reg),
        Add { out, lhs, rhs } => format!("ADD r{}, r{}, r{}", out, lhs, rhs),
        Sub { out, lhs, rhs } => format!("SUB r{}, r{}, r{}", out, lhs, rhs),
        Mul { out, lhs, rhs } => format!("MUL r{}, r{}, r{}", out, lhs, rhs),
        Div { out, lhs, rhs } => format!("DIV r{}, r{}, r{}", out, lhs, rhs),
        Mod { out, lhs, rhs } => format!("MOD r{}, r{}, r{}", out, lhs, rhs),
        Pow { out, lhs, rhs } => format!("POW r{}, r{}, r{}", out, lhs, rhs),
        Land { out, lhs, rhs } => format!("LAND r{}, r{}, r{}", out, lhs, rhs),
        Lor { out, lhs, rhs } => format!("LOR r{}, r{}, r{}", out, lhs, rhs),
        Lxor { out, lhs, rhs } => format!("LXOR r{}, r{}, r{}", out, lhs, rhs),
        Lshl { out, lhs, rhs } => format!("LSHL r{}, r{}, r{}", out, lhs, rhs),
        Lshr { out, lhs, rhs } => format!("LSHR r{}, r{}, r{}", out, lhs, rhs),
        Ashl { out, lhs, rhs } => format!("ASHL r{}, r{}, r{}", out, lhs, rhs),
        Ashr { out, lhs, rhs } => format!("ASHR r{}, r{}, r{}", out, lhs, rhs),
        Lt { out, lhs, rhs } => format!("LT r{}, r{}, r{}", out, lhs, rhs),
        Le { out, lhs, rhs } => format!("LE r{}, r{}, r{}", out, lhs, rhs),
        Gt { out, lhs, rhs } => format!("GT r{}, r{}, r{}", out, lhs, rhs),
        Ge { out, lhs, rhs } => format!("GE r{}, r{}, r{}", out, lhs, rhs),
        Eq { out, lhs, rhs } => format!("EQ r{}, r{}, r{}", out, lhs, rhs),
        Ne { out, lhs, rhs } => format!("NE r{}, r{}, r{}", out, lhs, rhs),
        Is { out, lhs, rhs } => format!("IS r{}, r{}, r{}", out, lhs, rhs),
        Equal { out, lhs, rhs } => format!("EQUAL r{}, r{}, r{}", out, lhs, rhs),
        Cons { out, lhs, rhs } => format!("CONS r{}, r{}, r{}", out, lhs, rhs),
        Not { out, src } => format!("NOT r{}, r{}", out, src),
        Lnot { out, src } => format!("LNOT r{}, r{}", out, src),
        Fn { out, data } => format!("FN r{}, /{} caps [{}]", out, data.arity, regs(&data.caps)),
        Alcfn { out, arity } => format!("ALCFN r{}, /{}", out, arity),
        Finfn { out, data } => {
            format!("FINFN r{}, /{} caps [{}]", out, data.arity, regs(&data.caps))
        }
        Mkscp { members } => format!("MKSCP {}", regs(members)),
        Load { out, src, idx } => format!("LOAD r{}, r{}[{}]", out, src, idx),
        Loadrcrd { src, ids, outs } => {
            let fields: Vec<String> = ids
                .iter()
                .zip(outs.iter())
                .map(|(id, out)| format!("{} -> r{}", id, out))
                .collect();
            format!("LOADRCRD r{}, {{{}}}", src, fields.join(", "))
        }
        Loadrcrd1 { out, src, id } => format!("LOADRCRD1 r{}, r{}.{}", out, src, id),
        Setexn { reg } => format!("SETEXN r{}", reg),
        Getexn { out } => format!("GETEXN r{}", out),
        Mkrcrd { out, ty, args } => format!("MKRCRD r{}, {} [{}]", out, ty.name, regs(args)),
        Updtrcrd { out, src, ids, args } => {
            let fields: Vec<String> = ids
                .iter()
                .zip(args.iter())
                .map(|(id, reg)| format!("{} = r{}", id, reg))
                .collect();
            format!("UPDTRCRD r{}, r{} with {{{}}}", out, src, fields.join(", "))
        }
        Trace { reg, loc } => format!("TRACE r{}, {}", reg, loc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonics() {
        let insn = Insn::Jmp { offs: 3 };
        assert_eq!(insn.mnemonic(), "JMP");
        let insn = Insn::Gettest { out: 0 };
        assert_eq!(insn.mnemonic(), "GETTEST");
    }

    #[test]
    fn test_disassembly_marks_entry() {
        let chunk = Chunk {
            nreg: 2,
            entry: 1,
            code: vec![
                Insn::Pop { base: 0, n: 1 },
                Insn::Test { reg: 0 },
                Insn::Ret { reg: 0 },
            ],
        };
        let text = chunk.disassemble();
        assert!(text.contains(">   1  TEST r0"));
        assert!(text.contains("POP r0..1"));
    }

    #[test]
    fn test_json_dump_shape() {
        let chunk = Chunk { nreg: 1, entry: 0, code: vec![Insn::Ret { reg: 0 }] };
        let json = chunk.dump_json();
        assert_eq!(json["nreg"], 1);
        assert_eq!(json["code"][0]["op"], "RET");
    }
}
