//! Runtime values.
//!
//! A `Value` is a cheap handle: nil, booleans, numbers, and symbols are
//! unboxed; everything else is a reference-counted pointer to a heap object.
//! Heap objects are immutable except for strong references and vectors.

use crate::exception::{Exception, ExitObj};
use crate::function::FunRef;
use crate::number::Number;
use crate::symbol::Symbol;
use crate::types::{self, Type};
use crate::vector::Vector;
use serde::{Serialize, Serializer};
use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Num(Number),
    Sym(Symbol),
    Str(Rc<String>),
    Pair(Rc<Pair>),
    Func(FunRef),
    /// Tuples, records, and variants: a type descriptor plus field values in
    /// the descriptor's field order.
    Record(Rc<Record>),
    Exn(Rc<Exception>),
    Exit(Rc<ExitObj>),
    Ref(Rc<RefCell<Value>>),
    Vector(Rc<Vector>),
    File(Rc<FileObj>),
    Regexp(Rc<Regexp>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

#[derive(Debug)]
pub struct Pair {
    pub car: Value,
    pub cdr: Value,
}

#[derive(Debug)]
pub struct Record {
    pub ty: Rc<Type>,
    pub vals: Box<[Value]>,
}

#[derive(Debug)]
pub enum FileKind {
    Stdin,
    Stdout,
    Stderr,
    Handle(File),
    Closed,
}

#[derive(Debug)]
pub struct FileObj {
    pub kind: RefCell<FileKind>,
}

#[derive(Debug)]
pub struct Regexp {
    pub source: String,
    pub re: regex::Regex,
}

impl Value {
    pub fn num(n: impl Into<Number>) -> Value {
        Value::Num(n.into())
    }

    pub fn sym(name: &str) -> Value {
        Value::Sym(Symbol::intern(name))
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(Rc::new(s.into()))
    }

    pub fn cons(car: Value, cdr: Value) -> Value {
        Value::Pair(Rc::new(Pair { car, cdr }))
    }

    pub fn list<I>(items: I) -> Value
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: DoubleEndedIterator,
    {
        let mut acc = Value::Nil;
        for item in items.into_iter().rev() {
            acc = Value::cons(item, acc);
        }
        acc
    }

    pub fn tuple(vals: Vec<Value>) -> Value {
        let ty = types::tuple_type(vals.len());
        Value::Record(Rc::new(Record { ty, vals: vals.into_boxed_slice() }))
    }

    pub fn record(ty: Rc<Type>, vals: Vec<Value>) -> Value {
        debug_assert_eq!(ty.nfields(), vals.len());
        Value::Record(Rc::new(Record { ty, vals: vals.into_boxed_slice() }))
    }

    pub fn variant(tag: &str, payload: Value) -> Value {
        let ty = types::variant_type(tag);
        Value::Record(Rc::new(Record { ty, vals: Box::new([payload]) }))
    }

    pub fn type_of(&self) -> Rc<Type> {
        match self {
            Value::Nil => types::nil_type(),
            Value::Bool(_) => types::boolean_type(),
            Value::Num(_) => types::number_type(),
            Value::Sym(_) => types::symbol_type(),
            Value::Str(_) => types::string_type(),
            Value::Pair(_) => types::pair_type(),
            Value::Func(_) => types::function_type(),
            Value::Record(r) => r.ty.clone(),
            Value::Exn(_) => types::exception_type(),
            Value::Exit(_) => types::exit_type(),
            Value::Ref(_) => types::strong_ref_type(),
            Value::Vector(_) => types::vector_type(),
            Value::File(_) => types::file_type(),
            Value::Regexp(_) => types::regexp_type(),
        }
    }

    pub fn has_type(&self, ty: &Rc<Type>) -> bool {
        match self {
            Value::Record(r) => Rc::ptr_eq(&r.ty, ty),
            _ => Rc::ptr_eq(&self.type_of(), ty),
        }
    }

    /// Only `false` is false.
    pub fn is_false(&self) -> bool {
        matches!(self, Value::Bool(false))
    }

    pub fn is_exn(&self) -> bool {
        matches!(self, Value::Exn(_))
    }

    pub fn as_num(&self) -> Option<Number> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    /// Field value of a plain object by position.
    pub fn field(&self, idx: usize) -> Option<Value> {
        match self {
            Value::Record(r) => r.vals.get(idx).cloned(),
            Value::Pair(p) => match idx {
                0 => Some(p.car.clone()),
                1 => Some(p.cdr.clone()),
                _ => None,
            },
            Value::Exn(e) => (idx == 0).then(|| e.what.clone()),
            _ => None,
        }
    }

    /// Identity: pointer equality for heap objects, value equality for
    /// immediates.
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Sym(a), Value::Sym(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b),
            (Value::Pair(a), Value::Pair(b)) => Rc::ptr_eq(a, b),
            (Value::Func(a), Value::Func(b)) => a.ptr_eq(b),
            (Value::Record(a), Value::Record(b)) => Rc::ptr_eq(a, b),
            (Value::Exn(a), Value::Exn(b)) => Rc::ptr_eq(a, b),
            (Value::Exit(a), Value::Exit(b)) => Rc::ptr_eq(a, b),
            (Value::Ref(a), Value::Ref(b)) => Rc::ptr_eq(a, b),
            (Value::Vector(a), Value::Vector(b)) => Rc::ptr_eq(a, b),
            (Value::File(a), Value::File(b)) => Rc::ptr_eq(a, b),
            (Value::Regexp(a), Value::Regexp(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Structural equality. Functions, files, and references compare by
    /// identity; records additionally require the same type descriptor.
    pub fn equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Pair(a), Value::Pair(b)) => {
                a.car.equal(&b.car) && a.cdr.equal(&b.cdr)
            }
            (Value::Record(a), Value::Record(b)) => {
                Rc::ptr_eq(&a.ty, &b.ty)
                    && a.vals.iter().zip(b.vals.iter()).all(|(x, y)| x.equal(y))
            }
            (Value::Vector(a), Value::Vector(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equal(&y))
            }
            (Value::Exn(a), Value::Exn(b)) => a.what.equal(&b.what),
            _ => self.is_identical(other),
        }
    }

    /// Raw form: strings print without quotes. Everything else matches the
    /// written form.
    pub fn display(&self) -> String {
        match self {
            Value::Str(s) => (**s).clone(),
            other => other.to_string(),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, pair: &Pair) -> fmt::Result {
    write!(f, "[{}", pair.car)?;
    let mut tail = pair.cdr.clone();
    loop {
        match tail {
            Value::Nil => return write!(f, "]"),
            Value::Pair(p) => {
                write!(f, ", {}", p.car)?;
                tail = p.cdr.clone();
            }
            other => return write!(f, " :: {}]", other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Num(n) => write!(f, "{}", n),
            Value::Sym(s) => write!(f, "`{}", s),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Pair(p) => write_list(f, p),
            Value::Func(func) => write!(f, "{:?}", func),
            Value::Record(r) => {
                if r.ty.is_tuple() {
                    let items: Vec<String> = r.vals.iter().map(|v| v.to_string()).collect();
                    write!(f, "({})", items.join(", "))
                } else if r.ty.is_variant() {
                    match &r.vals[0] {
                        Value::Nil => write!(f, "`{}", r.ty.name),
                        payload => write!(f, "`{} {}", r.ty.name, payload),
                    }
                } else {
                    let fields: Vec<String> = r
                        .ty
                        .fields()
                        .iter()
                        .zip(r.vals.iter())
                        .map(|(fld, v)| format!("{} = {}", fld.name, v))
                        .collect();
                    write!(f, "{{{}}}", fields.join(", "))
                }
            }
            Value::Exn(e) => write!(f, "exception {}", e.what),
            Value::Exit(e) => write!(f, "exit {}", e.status),
            Value::Ref(r) => write!(f, "ref {}", r.borrow()),
            Value::Vector(v) => {
                let items: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "#[{}]", items.join(", "))
            }
            Value::File(_) => write!(f, "<file>"),
            Value::Regexp(r) => write!(f, "/{}/", r.source),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_display() {
        let l = Value::list(vec![Value::num(1), Value::num(2), Value::num(3)]);
        assert_eq!(l.to_string(), "[1, 2, 3]");
    }

    #[test]
    fn test_improper_list_display() {
        let p = Value::cons(Value::num(1), Value::num(2));
        assert_eq!(p.to_string(), "[1 :: 2]");
    }

    #[test]
    fn test_tuple_and_record_display() {
        let t = Value::tuple(vec![Value::num(1), Value::str("a")]);
        assert_eq!(t.to_string(), "(1, \"a\")");
        let ty = types::record_type(&["x", "y"]);
        let xi = ty.field_by_name("x").unwrap();
        let mut vals = vec![Value::Nil, Value::Nil];
        vals[xi] = Value::num(1);
        vals[1 - xi] = Value::num(2);
        let r = Value::record(ty, vals);
        let s = r.to_string();
        assert!(s.contains("x = 1") && s.contains("y = 2"), "got {}", s);
    }

    #[test]
    fn test_structural_equality() {
        let a = Value::list(vec![Value::num(1), Value::num(2)]);
        let b = Value::list(vec![Value::num(1), Value::num(2)]);
        assert!(a.equal(&b));
        assert!(!a.is_identical(&b));
        assert!(a.is_identical(&a.clone()));
    }

    #[test]
    fn test_record_equality_requires_same_type() {
        let t1 = Value::tuple(vec![Value::num(1)]);
        let v1 = Value::variant("one", Value::num(1));
        assert!(!t1.equal(&v1));
        let v2 = Value::variant("one", Value::num(1));
        assert!(v1.equal(&v2));
    }

    #[test]
    fn test_only_false_is_false() {
        assert!(Value::Bool(false).is_false());
        assert!(!Value::Nil.is_false());
        assert!(!Value::num(0).is_false());
        assert!(!Value::str("").is_false());
    }

    #[test]
    fn test_truthiness_of_symbols() {
        let v = Value::sym("foo");
        assert!(!v.is_false());
        assert!(v.is_identical(&Value::sym("foo")));
        assert!(!v.is_identical(&Value::sym("bar")));
    }

    #[test]
    fn test_field_access() {
        let p = Value::cons(Value::num(1), Value::Nil);
        assert!(p.field(0).unwrap().equal(&Value::num(1)));
        assert!(p.field(1).unwrap().equal(&Value::Nil));
        assert!(p.field(2).is_none());
    }
}
