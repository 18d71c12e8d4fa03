//! Interned symbols: identity by id, process-wide append-only table.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// An interned symbol. Two symbols with the same spelling share an id, so
/// equality and hashing are integer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(pub u32);

#[derive(Default)]
struct SymbolTable {
    names: Vec<Rc<str>>,
    lookup: HashMap<Rc<str>, u32>,
}

thread_local! {
    static SYMBOLS: RefCell<SymbolTable> = RefCell::new(SymbolTable::default());
}

impl Symbol {
    pub fn intern(name: &str) -> Symbol {
        SYMBOLS.with(|table| {
            let mut table = table.borrow_mut();
            if let Some(&id) = table.lookup.get(name) {
                return Symbol(id);
            }
            let id = table.names.len() as u32;
            let name: Rc<str> = Rc::from(name);
            table.names.push(name.clone());
            table.lookup.insert(name, id);
            Symbol(id)
        })
    }

    pub fn id(self) -> u32 {
        self.0
    }

    pub fn name(self) -> Rc<str> {
        SYMBOLS.with(|table| table.borrow().names[self.0 as usize].clone())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_stable() {
        let a = Symbol::intern("foo");
        let b = Symbol::intern("bar");
        let c = Symbol::intern("foo");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(&*a.name(), "foo");
        assert_eq!(&*b.name(), "bar");
    }

    #[test]
    fn test_ids_are_dense() {
        let a = Symbol::intern("dense-a");
        let b = Symbol::intern("dense-b");
        assert_eq!(b.id(), a.id() + 1);
    }
}
