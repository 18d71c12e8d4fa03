//! Native procedures of the root environment.
//!
//! Every builtin obeys the calling convention: it receives its arguments by
//! value and returns either a result or an exception value, which the
//! compiled call site tests and propagates.

use ether_core::attr::Attr;
use ether_core::exception::{exit_value, exn, exn_sym};
use ether_core::function::{Applier, FunRef, ProcHandler};
use ether_core::module::Module;
use ether_core::value::{FileKind, FileObj, Regexp, Value};
use ether_core::vector::Vector;
use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Write};
use std::rc::Rc;

fn def(m: &mut Module, name: &str, arity: usize, handler: ProcHandler) {
    let proc = FunRef::proc(name, arity, handler);
    m.define(name, Value::Func(proc), Attr::builtin());
}

macro_rules! native {
    (|$vm:ident, $args:ident| $body:expr) => {
        Rc::new(move |$vm: &mut dyn Applier, $args: Vec<Value>| {
            let _ = &$vm;
            $body
        })
    };
}

fn type_error() -> Value {
    exn_sym("type_error")
}

fn invalid_argument() -> Value {
    exn_sym("invalid_argument")
}

/// String or list concatenation.
fn concat(lhs: Value, rhs: Value) -> Value {
    match (&lhs, &rhs) {
        (Value::Str(a), Value::Str(b)) => Value::str(format!("{}{}", a, b)),
        (Value::Nil, _) => rhs,
        (Value::Pair(_), _) => {
            // collect the left spine, then rebuild onto the right list
            let mut items = Vec::new();
            let mut at = lhs;
            loop {
                match at {
                    Value::Nil => break,
                    Value::Pair(p) => {
                        items.push(p.car.clone());
                        at = p.cdr.clone();
                    }
                    _ => return exn_sym("improper_list"),
                }
            }
            let mut acc = rhs;
            for item in items.into_iter().rev() {
                acc = Value::cons(item, acc);
            }
            acc
        }
        _ => type_error(),
    }
}

fn list_of(value: &Value) -> Option<Vec<Value>> {
    let mut items = Vec::new();
    let mut at = value.clone();
    loop {
        match at {
            Value::Nil => return Some(items),
            Value::Pair(p) => {
                items.push(p.car.clone());
                at = p.cdr.clone();
            }
            _ => return None,
        }
    }
}

/// Install every builtin into the given module.
pub fn install(m: &mut Module) {
    def(m, "print", 1, native!(|_vm, args| {
        println!("{}", args[0].display());
        Value::Nil
    }));

    def(m, "display", 1, native!(|_vm, args| {
        print!("{}", args[0].display());
        let _ = std::io::stdout().flush();
        Value::Nil
    }));

    def(m, "newline", 0, native!(|_vm, _args| {
        println!();
        Value::Nil
    }));

    def(m, "to_string", 1, native!(|_vm, args| Value::str(args[0].to_string())));

    def(m, "raise", 1, native!(|_vm, args| {
        let what = args.into_iter().next().expect("one argument");
        match what {
            // re-raising keeps the trace accumulated so far
            Value::Exn(_) => what,
            payload => exn(payload),
        }
    }));

    def(m, "exit", 1, native!(|_vm, args| {
        match args[0].as_num().and_then(|n| n.as_int()) {
            Some(status) => exn(exit_value(status as i32)),
            None => invalid_argument(),
        }
    }));

    def(m, "car", 1, native!(|_vm, args| {
        match &args[0] {
            Value::Pair(p) => p.car.clone(),
            _ => type_error(),
        }
    }));

    def(m, "cdr", 1, native!(|_vm, args| {
        match &args[0] {
            Value::Pair(p) => p.cdr.clone(),
            _ => type_error(),
        }
    }));

    // type predicates
    def(m, "pair?", 1, native!(|_vm, args| Value::Bool(matches!(args[0], Value::Pair(_)))));
    def(m, "nil?", 1, native!(|_vm, args| Value::Bool(matches!(args[0], Value::Nil))));
    def(m, "number?", 1, native!(|_vm, args| Value::Bool(matches!(args[0], Value::Num(_)))));
    def(m, "string?", 1, native!(|_vm, args| Value::Bool(matches!(args[0], Value::Str(_)))));
    def(m, "symbol?", 1, native!(|_vm, args| Value::Bool(matches!(args[0], Value::Sym(_)))));
    def(m, "boolean?", 1, native!(|_vm, args| Value::Bool(matches!(args[0], Value::Bool(_)))));
    def(m, "function?", 1, native!(|_vm, args| Value::Bool(matches!(args[0], Value::Func(_)))));
    def(m, "vector?", 1, native!(|_vm, args| Value::Bool(matches!(args[0], Value::Vector(_)))));
    def(m, "record?", 1, native!(|_vm, args| {
        Value::Bool(matches!(&args[0], Value::Record(r) if r.ty.is_record()))
    }));
    def(m, "tuple?", 1, native!(|_vm, args| {
        Value::Bool(matches!(&args[0], Value::Record(r) if r.ty.is_tuple()))
    }));

    // the pipe operator and concatenation back the surface `|>` and `++`
    def(m, "|>", 2, native!(|vm, args| {
        let mut it = args.into_iter();
        let x = it.next().expect("two arguments");
        let f = it.next().expect("two arguments");
        vm.apply(f, vec![x])
    }));

    def(m, "++", 2, native!(|_vm, args| {
        let mut it = args.into_iter();
        let lhs = it.next().expect("two arguments");
        let rhs = it.next().expect("two arguments");
        concat(lhs, rhs)
    }));

    // strong references back mutable bindings
    def(m, "__ref", 1, native!(|_vm, args| {
        Value::Ref(Rc::new(RefCell::new(args[0].clone())))
    }));
    def(m, "__dereference", 1, native!(|_vm, args| {
        match &args[0] {
            Value::Ref(cell) => cell.borrow().clone(),
            _ => type_error(),
        }
    }));
    def(m, "__assign", 2, native!(|_vm, args| {
        match &args[0] {
            Value::Ref(cell) => {
                *cell.borrow_mut() = args[1].clone();
                Value::Nil
            }
            _ => type_error(),
        }
    }));

    def(m, "strlen", 1, native!(|_vm, args| {
        match &args[0] {
            Value::Str(s) => Value::num(s.chars().count() as i64),
            _ => type_error(),
        }
    }));

    def(m, "substr", 3, native!(|_vm, args| {
        let (Value::Str(s), Some(start), Some(len)) = (
            &args[0],
            args[1].as_num().and_then(|n| n.as_int()),
            args[2].as_num().and_then(|n| n.as_int()),
        ) else {
            return type_error();
        };
        let (start, len) = (start as usize, len as usize);
        let chars: Vec<char> = s.chars().collect();
        if start + len > chars.len() {
            return invalid_argument();
        }
        Value::str(chars[start..start + len].iter().collect::<String>())
    }));

    def(m, "format", 2, native!(|_vm, args| {
        let Value::Str(fmt) = &args[0] else { return type_error() };
        let Some(values) = list_of(&args[1]) else { return type_error() };
        let mut out = String::new();
        let mut values = values.into_iter();
        for ch in fmt.chars() {
            if ch == '~' {
                match values.next() {
                    Some(v) => out.push_str(&v.display()),
                    None => return exn_sym("format_error"),
                }
            } else {
                out.push(ch);
            }
        }
        if values.next().is_some() {
            return exn_sym("format_error");
        }
        Value::str(out)
    }));

    def(m, "assoc", 2, native!(|_vm, args| {
        let Some(entries) = list_of(&args[1]) else { return type_error() };
        for entry in entries {
            if let Value::Record(r) = &entry {
                if r.ty.is_tuple() && r.vals.len() == 2 && r.vals[0].equal(&args[0]) {
                    return r.vals[1].clone();
                }
            }
        }
        exn_sym("not_found")
    }));

    // numeric helpers
    def(m, "abs", 1, native!(|_vm, args| {
        match args[0].as_num() {
            Some(n) => Value::Num(if n.as_f64() < 0.0 {
                ether_core::number::Number::Int(0).sub(n)
            } else {
                n
            }),
            None => type_error(),
        }
    }));
    def(m, "floor", 1, native!(|_vm, args| {
        match args[0].as_num() {
            Some(n) => Value::num(n.as_f64().floor()),
            None => type_error(),
        }
    }));
    def(m, "ceil", 1, native!(|_vm, args| {
        match args[0].as_num() {
            Some(n) => Value::num(n.as_f64().ceil()),
            None => type_error(),
        }
    }));
    def(m, "sqrt", 1, native!(|_vm, args| {
        match args[0].as_num() {
            Some(n) => Value::num(n.as_f64().sqrt()),
            None => type_error(),
        }
    }));

    // vectors
    def(m, "vector", 1, native!(|_vm, args| {
        match list_of(&args[0]) {
            Some(items) => Value::Vector(Rc::new(Vector::from_values(items))),
            None => type_error(),
        }
    }));
    def(m, "vlen", 1, native!(|_vm, args| {
        match &args[0] {
            Value::Vector(v) => Value::num(v.len() as i64),
            _ => type_error(),
        }
    }));
    def(m, "vget", 2, native!(|_vm, args| {
        let (Value::Vector(v), Some(idx)) =
            (&args[0], args[1].as_num().and_then(|n| n.as_int()))
        else {
            return type_error();
        };
        match v.get(idx as usize) {
            Some(val) => val,
            None => invalid_argument(),
        }
    }));
    def(m, "vset", 3, native!(|_vm, args| {
        let (Value::Vector(v), Some(idx)) =
            (&args[0], args[1].as_num().and_then(|n| n.as_int()))
        else {
            return type_error();
        };
        match v.set(idx as usize, args[2].clone()) {
            Some(next) => Value::Vector(Rc::new(next)),
            None => invalid_argument(),
        }
    }));
    def(m, "vpush", 2, native!(|_vm, args| {
        match &args[0] {
            Value::Vector(v) => Value::Vector(Rc::new(v.push(args[1].clone()))),
            _ => type_error(),
        }
    }));

    // regular expressions
    def(m, "regex", 1, native!(|_vm, args| {
        let Value::Str(src) = &args[0] else { return type_error() };
        match regex::Regex::new(src) {
            Ok(re) => Value::Regexp(Rc::new(Regexp { source: (**src).clone(), re })),
            Err(_) => exn_sym("regexp_error"),
        }
    }));
    def(m, "regex_match", 2, native!(|_vm, args| {
        let (Value::Regexp(re), Value::Str(s)) = (&args[0], &args[1]) else {
            return type_error();
        };
        match re.re.captures(s) {
            None => Value::Bool(false),
            Some(caps) => Value::list(
                caps.iter()
                    .map(|c| match c {
                        Some(c) => Value::str(c.as_str()),
                        None => Value::Nil,
                    })
                    .collect::<Vec<_>>(),
            ),
        }
    }));

    // files
    def(m, "open", 2, native!(|_vm, args| {
        let (Value::Str(path), Value::Str(mode)) = (&args[0], &args[1]) else {
            return type_error();
        };
        let file = match mode.as_str() {
            "r" => File::open(path.as_str()),
            "w" => File::create(path.as_str()),
            _ => return invalid_argument(),
        };
        match file {
            Ok(f) => Value::File(Rc::new(FileObj { kind: RefCell::new(FileKind::Handle(f)) })),
            Err(_) => exn_sym("system_error"),
        }
    }));
    def(m, "close", 1, native!(|_vm, args| {
        match &args[0] {
            Value::File(f) => {
                *f.kind.borrow_mut() = FileKind::Closed;
                Value::Nil
            }
            _ => type_error(),
        }
    }));
    def(m, "read_line", 1, native!(|_vm, args| {
        let Value::File(f) = &args[0] else { return type_error() };
        let mut kind = f.kind.borrow_mut();
        match &mut *kind {
            FileKind::Handle(file) => {
                // unbuffered byte reads keep the handle's position exact
                let mut line = Vec::new();
                let mut byte = [0u8; 1];
                loop {
                    match file.read(&mut byte) {
                        Ok(0) => {
                            if line.is_empty() {
                                return Value::Nil;
                            }
                            break;
                        }
                        Ok(_) if byte[0] == b'\n' => break,
                        Ok(_) => line.push(byte[0]),
                        Err(_) => return exn_sym("system_error"),
                    }
                }
                Value::str(String::from_utf8_lossy(&line).into_owned())
            }
            FileKind::Stdin => {
                let mut line = String::new();
                match std::io::stdin().read_line(&mut line) {
                    Ok(0) => Value::Nil,
                    Ok(_) => Value::str(line.trim_end_matches('\n')),
                    Err(_) => exn_sym("system_error"),
                }
            }
            _ => invalid_argument(),
        }
    }));
    def(m, "read_file", 1, native!(|_vm, args| {
        let Value::Str(path) = &args[0] else { return type_error() };
        let mut out = String::new();
        match File::open(path.as_str()).and_then(|mut f| f.read_to_string(&mut out)) {
            Ok(_) => Value::str(out),
            Err(_) => exn_sym("system_error"),
        }
    }));
    def(m, "write", 2, native!(|_vm, args| {
        let (Value::File(f), Value::Str(s)) = (&args[0], &args[1]) else {
            return type_error();
        };
        let mut kind = f.kind.borrow_mut();
        match &mut *kind {
            FileKind::Handle(file) => match file.write_all(s.as_bytes()) {
                Ok(()) => Value::Nil,
                Err(_) => exn_sym("system_error"),
            },
            FileKind::Stdout => {
                print!("{}", s);
                Value::Nil
            }
            FileKind::Stderr => {
                eprint!("{}", s);
                Value::Nil
            }
            _ => invalid_argument(),
        }
    }));

    m.define(
        "stdin",
        Value::File(Rc::new(FileObj { kind: RefCell::new(FileKind::Stdin) })),
        Attr::builtin(),
    );
    m.define(
        "stdout",
        Value::File(Rc::new(FileObj { kind: RefCell::new(FileKind::Stdout) })),
        Attr::builtin(),
    );
    m.define(
        "stderr",
        Value::File(Rc::new(FileObj { kind: RefCell::new(FileKind::Stderr) })),
        Attr::builtin(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    fn call(name: &str, args: Vec<Value>) -> Value {
        let mut m = Module::new("b");
        install(&mut m);
        let f = m.get(name).expect("builtin").val.clone();
        Vm::new().apply(f, args)
    }

    #[test]
    fn test_concat_lists() {
        let a = Value::list(vec![Value::num(1), Value::num(2)]);
        let b = Value::list(vec![Value::num(3)]);
        let c = call("++", vec![a, b]);
        assert!(c.equal(&Value::list(vec![Value::num(1), Value::num(2), Value::num(3)])));
    }

    #[test]
    fn test_concat_improper_list_raises() {
        let a = Value::cons(Value::num(1), Value::num(2));
        let c = call("++", vec![a, Value::Nil]);
        match c {
            Value::Exn(e) => assert!(e.what.is_identical(&Value::sym("improper_list"))),
            other => panic!("expected exception, got {}", other),
        }
    }

    #[test]
    fn test_raise_wraps_and_rethrows() {
        let e = call("raise", vec![Value::sym("foo")]);
        assert!(e.is_exn());
        let again = call("raise", vec![e.clone()]);
        assert!(again.is_identical(&e), "re-raise must keep the same exception");
    }

    #[test]
    fn test_exit_is_not_a_plain_exception_payload() {
        let e = call("exit", vec![Value::num(3)]);
        match e {
            Value::Exn(exn) => match &exn.what {
                Value::Exit(x) => assert_eq!(x.status, 3),
                other => panic!("expected exit payload, got {}", other),
            },
            other => panic!("expected exception, got {}", other),
        }
    }

    #[test]
    fn test_format() {
        let out = call(
            "format",
            vec![
                Value::str("~ + ~"),
                Value::list(vec![Value::num(1), Value::num(2)]),
            ],
        );
        assert!(out.equal(&Value::str("1 + 2")));
        let err = call("format", vec![Value::str("~ ~"), Value::list(vec![Value::num(1)])]);
        match err {
            Value::Exn(e) => assert!(e.what.is_identical(&Value::sym("format_error"))),
            other => panic!("expected format_error, got {}", other),
        }
    }

    #[test]
    fn test_assoc() {
        let alist = Value::list(vec![
            Value::tuple(vec![Value::sym("a"), Value::num(1)]),
            Value::tuple(vec![Value::sym("b"), Value::num(2)]),
        ]);
        assert!(call("assoc", vec![Value::sym("b"), alist.clone()]).equal(&Value::num(2)));
        let miss = call("assoc", vec![Value::sym("c"), alist]);
        match miss {
            Value::Exn(e) => assert!(e.what.is_identical(&Value::sym("not_found"))),
            other => panic!("expected not_found, got {}", other),
        }
    }

    #[test]
    fn test_vector_roundtrip() {
        let v = call("vector", vec![Value::list(vec![Value::num(1), Value::num(2)])]);
        assert!(call("vlen", vec![v.clone()]).equal(&Value::num(2)));
        assert!(call("vget", vec![v.clone(), Value::num(1)]).equal(&Value::num(2)));
        let v2 = call("vset", vec![v.clone(), Value::num(0), Value::num(9)]);
        assert!(call("vget", vec![v2, Value::num(0)]).equal(&Value::num(9)));
        // the original vector is untouched
        assert!(call("vget", vec![v, Value::num(0)]).equal(&Value::num(1)));
    }

    #[test]
    fn test_regex() {
        let re = call("regex", vec![Value::str("a(b+)c")]);
        assert!(matches!(re, Value::Regexp(_)));
        let caps = call("regex_match", vec![re.clone(), Value::str("xabbc")]);
        assert!(
            caps.equal(&Value::list(vec![Value::str("abbc"), Value::str("bb")])),
            "got {}",
            caps
        );
        assert!(call("regex_match", vec![re, Value::str("zzz")]).is_false());
        let bad = call("regex", vec![Value::str("(")]);
        match bad {
            Value::Exn(e) => assert!(e.what.is_identical(&Value::sym("regexp_error"))),
            other => panic!("expected regexp_error, got {}", other),
        }
    }

    #[test]
    fn test_pipe_applies() {
        let mut m = Module::new("b");
        install(&mut m);
        let pipe = m.get("|>").unwrap().val.clone();
        let strlen = m.get("strlen").unwrap().val.clone();
        let out = Vm::new().apply(pipe, vec![Value::str("abc"), strlen]);
        assert!(out.equal(&Value::num(3)));
    }
}
