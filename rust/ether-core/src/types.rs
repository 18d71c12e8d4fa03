//! Type descriptors and the process-wide interning registry.
//!
//! Tuple types are keyed by arity, record types by the symbol-id-sorted set
//! of field names, variant types by tag. Interned descriptors are pointer
//! equal across lookups, which lets the compiler decide record-pattern
//! matches statically whenever the scrutinee type is known.

use crate::symbol::Symbol;
use crate::value::Value;
use crate::{eth_debug, eth_warning};
use bitflags::bitflags;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u8 {
        /// Has an ordered field list addressable by position.
        const PLAIN = 1 << 0;
        const TUPLE = 1 << 1;
        const RECORD = 1 << 2;
        const VARIANT = 1 << 3;
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: Rc<str>,
    pub sym: Symbol,
}

/// How many methods a type may carry before the table switches from a sorted
/// array to a hash map.
const METHOD_PROMOTE_THRESHOLD: usize = 30;

#[derive(Debug)]
enum MethodTable {
    Small(Vec<(Symbol, Value)>),
    Large(HashMap<u32, Value>),
}

#[derive(Debug)]
pub struct Type {
    pub name: Rc<str>,
    pub flags: TypeFlags,
    fields: Vec<Field>,
    /// Field symbol ids with one extra sentinel slot so the probe loop in
    /// `field_index` always terminates.
    ids: RefCell<Vec<u32>>,
    methods: RefCell<MethodTable>,
}

impl Type {
    pub fn new(name: &str, flags: TypeFlags, field_names: &[&str]) -> Rc<Type> {
        let fields: Vec<Field> = field_names
            .iter()
            .map(|&name| Field { name: Rc::from(name), sym: Symbol::intern(name) })
            .collect();
        let mut ids: Vec<u32> = fields.iter().map(|f| f.sym.id()).collect();
        ids.push(u32::MAX); // sentinel slot
        Rc::new(Type {
            name: Rc::from(name),
            flags,
            fields,
            ids: RefCell::new(ids),
            methods: RefCell::new(MethodTable::Small(Vec::new())),
        })
    }

    pub fn is_plain(&self) -> bool {
        self.flags.contains(TypeFlags::PLAIN)
    }

    pub fn is_tuple(&self) -> bool {
        self.flags.contains(TypeFlags::TUPLE)
    }

    pub fn is_record(&self) -> bool {
        self.flags.contains(TypeFlags::RECORD)
    }

    pub fn is_variant(&self) -> bool {
        self.flags.contains(TypeFlags::VARIANT)
    }

    pub fn nfields(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Position of the field with the given symbol id, or `nfields()` if
    /// absent. The query is written into the sentinel slot so the scan needs
    /// no bounds check.
    pub fn field_index(&self, sym: Symbol) -> usize {
        let mut ids = self.ids.borrow_mut();
        let n = self.fields.len();
        ids[n] = sym.id();
        let mut i = 0;
        while ids[i] != sym.id() {
            i += 1;
        }
        i
    }

    pub fn field_by_name(&self, name: &str) -> Option<usize> {
        let i = self.field_index(Symbol::intern(name));
        (i < self.fields.len()).then_some(i)
    }

    /// Register a method. Duplicates are rejected with a warning.
    pub fn add_method(&self, sym: Symbol, value: Value) -> bool {
        let mut table = self.methods.borrow_mut();
        match &mut *table {
            MethodTable::Small(vec) => {
                if vec.iter().any(|(s, _)| *s == sym) {
                    eth_warning!("method '{}' already defined for type '{}'", sym, self.name);
                    return false;
                }
                let at = vec.partition_point(|(s, _)| s.id() < sym.id());
                vec.insert(at, (sym, value));
                if vec.len() > METHOD_PROMOTE_THRESHOLD {
                    eth_debug!("promoting method table of '{}' to a hash map", self.name);
                    let map = vec.drain(..).map(|(s, v)| (s.id(), v)).collect();
                    *table = MethodTable::Large(map);
                }
                true
            }
            MethodTable::Large(map) => {
                if map.contains_key(&sym.id()) {
                    eth_warning!("method '{}' already defined for type '{}'", sym, self.name);
                    return false;
                }
                map.insert(sym.id(), value);
                true
            }
        }
    }

    pub fn get_method(&self, sym: Symbol) -> Option<Value> {
        match &*self.methods.borrow() {
            MethodTable::Small(vec) => vec
                .binary_search_by_key(&sym.id(), |(s, _)| s.id())
                .ok()
                .map(|i| vec[i].1.clone()),
            MethodTable::Large(map) => map.get(&sym.id()).cloned(),
        }
    }
}

/// Process-wide interning tables. Append-only: entries are never collected.
#[derive(Default)]
struct TypeRegistry {
    primitives: HashMap<&'static str, Rc<Type>>,
    tuples: HashMap<usize, Rc<Type>>,
    records: HashMap<Vec<u32>, Rc<Type>>,
    variants: HashMap<u32, Rc<Type>>,
}

thread_local! {
    static REGISTRY: RefCell<TypeRegistry> = RefCell::new(TypeRegistry::default());
}

fn primitive(name: &'static str, flags: TypeFlags, fields: &[&str]) -> Rc<Type> {
    REGISTRY.with(|reg| {
        let mut reg = reg.borrow_mut();
        reg.primitives
            .entry(name)
            .or_insert_with(|| Type::new(name, flags, fields))
            .clone()
    })
}

pub fn number_type() -> Rc<Type> {
    primitive("number", TypeFlags::empty(), &[])
}

pub fn boolean_type() -> Rc<Type> {
    primitive("boolean", TypeFlags::empty(), &[])
}

pub fn nil_type() -> Rc<Type> {
    primitive("nil", TypeFlags::empty(), &[])
}

pub fn symbol_type() -> Rc<Type> {
    primitive("symbol", TypeFlags::empty(), &[])
}

pub fn string_type() -> Rc<Type> {
    primitive("string", TypeFlags::empty(), &[])
}

pub fn pair_type() -> Rc<Type> {
    primitive("pair", TypeFlags::PLAIN, &["car", "cdr"])
}

pub fn function_type() -> Rc<Type> {
    primitive("function", TypeFlags::empty(), &[])
}

pub fn exception_type() -> Rc<Type> {
    primitive("exception", TypeFlags::PLAIN, &["what"])
}

pub fn exit_type() -> Rc<Type> {
    primitive("exit", TypeFlags::empty(), &[])
}

pub fn file_type() -> Rc<Type> {
    primitive("file", TypeFlags::empty(), &[])
}

pub fn regexp_type() -> Rc<Type> {
    primitive("regexp", TypeFlags::empty(), &[])
}

pub fn strong_ref_type() -> Rc<Type> {
    primitive("ref", TypeFlags::empty(), &[])
}

pub fn vector_type() -> Rc<Type> {
    primitive("vector", TypeFlags::empty(), &[])
}

/// Tuple type of the given arity, fields `_1`.. `_n`. Cached per arity.
pub fn tuple_type(arity: usize) -> Rc<Type> {
    REGISTRY.with(|reg| {
        if let Some(ty) = reg.borrow().tuples.get(&arity) {
            return ty.clone();
        }
        let names: Vec<String> = (1..=arity).map(|i| format!("_{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let ty = Type::new("tuple", TypeFlags::PLAIN | TypeFlags::TUPLE, &refs);
        reg.borrow_mut().tuples.insert(arity, ty.clone());
        ty
    })
}

/// Record type keyed by its field-name set. Fields are stored sorted by
/// symbol id, so two spellings of the same set share one descriptor.
pub fn record_type(field_names: &[&str]) -> Rc<Type> {
    let mut syms: Vec<(u32, &str)> = field_names
        .iter()
        .map(|&name| (Symbol::intern(name).id(), name))
        .collect();
    syms.sort_unstable_by_key(|&(id, _)| id);
    let key: Vec<u32> = syms.iter().map(|&(id, _)| id).collect();
    REGISTRY.with(|reg| {
        if let Some(ty) = reg.borrow().records.get(&key) {
            return ty.clone();
        }
        let sorted: Vec<&str> = syms.iter().map(|&(_, name)| name).collect();
        let ty = Type::new("record", TypeFlags::PLAIN | TypeFlags::RECORD, &sorted);
        reg.borrow_mut().records.insert(key, ty.clone());
        ty
    })
}

/// Variant type keyed by tag; payload is the single field `_1`.
pub fn variant_type(tag: &str) -> Rc<Type> {
    let sym = Symbol::intern(tag);
    REGISTRY.with(|reg| {
        if let Some(ty) = reg.borrow().variants.get(&sym.id()) {
            return ty.clone();
        }
        let ty = Type::new(tag, TypeFlags::PLAIN | TypeFlags::VARIANT, &["_1"]);
        reg.borrow_mut().variants.insert(sym.id(), ty.clone());
        ty
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_types_are_interned() {
        let a = tuple_type(2);
        let b = tuple_type(2);
        let c = tuple_type(3);
        assert!(Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(a.nfields(), 2);
        assert_eq!(&*a.fields()[0].name, "_1");
    }

    #[test]
    fn test_record_types_share_by_field_set() {
        let a = record_type(&["x", "y"]);
        let b = record_type(&["y", "x"]);
        assert!(Rc::ptr_eq(&a, &b));
        let c = record_type(&["x", "z"]);
        assert!(!Rc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_field_probe() {
        let ty = record_type(&["alpha", "beta"]);
        let alpha = Symbol::intern("alpha");
        let gamma = Symbol::intern("gamma");
        assert!(ty.field_index(alpha) < ty.nfields());
        assert_eq!(ty.field_index(gamma), ty.nfields());
    }

    #[test]
    fn test_variant_interning() {
        let a = variant_type("some");
        let b = variant_type("some");
        assert!(Rc::ptr_eq(&a, &b));
        assert!(a.is_variant());
        assert_eq!(a.nfields(), 1);
    }

    #[test]
    fn test_methods_reject_duplicates() {
        let ty = Type::new("probe", TypeFlags::empty(), &[]);
        let m = Symbol::intern("show");
        assert!(ty.add_method(m, Value::Nil));
        assert!(!ty.add_method(m, Value::Nil));
        assert!(ty.get_method(m).is_some());
    }

    #[test]
    fn test_method_table_promotes_to_map() {
        let ty = Type::new("wide", TypeFlags::empty(), &[]);
        for i in 0..40 {
            let m = Symbol::intern(&format!("method-{}", i));
            assert!(ty.add_method(m, Value::Nil));
        }
        for i in 0..40 {
            let m = Symbol::intern(&format!("method-{}", i));
            assert!(ty.get_method(m).is_some(), "method-{} lost in promotion", i);
        }
    }
}
