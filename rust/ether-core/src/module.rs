//! Modules: named collections of bindings with attributes.
//!
//! The IR builder resolves free identifiers against a module's definitions
//! (always as constants); the loader fills modules from a script's public
//! bindings.

use crate::attr::Attr;
use crate::value::Value;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Def {
    pub ident: String,
    pub val: Value,
    pub attr: Attr,
}

#[derive(Debug, Default, Clone)]
pub struct Module {
    name: String,
    defs: Vec<Def>,
    index: HashMap<String, usize>,
}

impl Module {
    pub fn new(name: &str) -> Module {
        Module { name: name.to_string(), defs: Vec::new(), index: HashMap::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn define(&mut self, ident: &str, val: Value, attr: Attr) {
        match self.index.get(ident) {
            Some(&i) => self.defs[i] = Def { ident: ident.to_string(), val, attr },
            None => {
                self.index.insert(ident.to_string(), self.defs.len());
                self.defs.push(Def { ident: ident.to_string(), val, attr });
            }
        }
    }

    pub fn get(&self, ident: &str) -> Option<&Def> {
        self.index.get(ident).map(|&i| &self.defs[i])
    }

    pub fn defs(&self) -> &[Def] {
        &self.defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_lookup() {
        let mut m = Module::new("m");
        m.define("x", Value::num(1), Attr::default());
        assert!(m.get("x").unwrap().val.equal(&Value::num(1)));
        assert!(m.get("y").is_none());
    }

    #[test]
    fn test_redefinition_replaces() {
        let mut m = Module::new("m");
        m.define("x", Value::num(1), Attr::default());
        m.define("x", Value::num(2), Attr::default());
        assert!(m.get("x").unwrap().val.equal(&Value::num(2)));
        assert_eq!(m.defs().len(), 1);
    }
}
