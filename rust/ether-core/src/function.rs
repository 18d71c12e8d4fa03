//! Functions and the closure-scope protocol.
//!
//! A scope is the shared owner of a set of mutually recursive closures
//! produced by one `let rec`. Sibling captures inside members are *uncounted*
//! aliases; every other handle is counted. The scope tracks how many members
//! still have counted handles and, when that reaches zero, deactivates all
//! members (clearing captures and bytecode) before releasing them. This
//! breaks the reference cycle mutual recursion creates through captures.

use crate::bytecode::Chunk;
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Callback surface handed to native procedures so they can re-enter the
/// evaluator (currying, higher-order builtins).
pub trait Applier {
    fn apply(&mut self, f: Value, args: Vec<Value>) -> Value;
}

pub type ProcHandler = Rc<dyn Fn(&mut dyn Applier, Vec<Value>) -> Value>;

pub struct Proc {
    pub name: Rc<str>,
    pub arity: usize,
    pub handler: ProcHandler,
}

pub struct Lambda {
    pub arity: usize,
    pub bytecode: RefCell<Option<Rc<Chunk>>>,
    pub captures: RefCell<Vec<Value>>,
    pub scope: RefCell<Option<Rc<Scope>>>,
    /// Number of live counted handles to this closure.
    ext: Cell<usize>,
}

pub enum Func {
    Proc(Proc),
    Lambda(Lambda),
}

impl Func {
    pub fn arity(&self) -> usize {
        match self {
            Func::Proc(p) => p.arity,
            Func::Lambda(l) => l.arity,
        }
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Func::Proc(p) => write!(f, "<proc {}/{}>", p.name, p.arity),
            Func::Lambda(l) => write!(f, "<fn/{}>", l.arity),
        }
    }
}

impl Lambda {
    fn retain(&self) {
        let ext = self.ext.get() + 1;
        self.ext.set(ext);
        if ext == 1 {
            if let Some(scope) = self.scope.borrow().as_ref() {
                scope.member_revived();
            }
        }
    }

    fn release(&self) {
        let ext = self.ext.get() - 1;
        self.ext.set(ext);
        if ext == 0 {
            let scope = self.scope.borrow().clone();
            if let Some(scope) = scope {
                scope.member_dropped();
            }
        }
    }

    /// Release captures and bytecode, leaving a stub that can no longer run.
    fn deactivate(&self) {
        self.captures.borrow_mut().clear();
        self.bytecode.borrow_mut().take();
    }
}

/// A function handle. Clones are always counted; uncounted handles exist
/// only inside the capture vectors of scope members.
pub struct FunRef {
    inner: Rc<Func>,
    counted: bool,
}

impl FunRef {
    pub fn new(func: Func) -> FunRef {
        if let Func::Lambda(lam) = &func {
            lam.ext.set(1);
        }
        FunRef { inner: Rc::new(func), counted: true }
    }

    pub fn proc(name: &str, arity: usize, handler: ProcHandler) -> FunRef {
        FunRef::new(Func::Proc(Proc { name: Rc::from(name), arity, handler }))
    }

    pub fn closure(arity: usize, bytecode: Rc<Chunk>, captures: Vec<Value>) -> FunRef {
        FunRef::new(Func::Lambda(Lambda {
            arity,
            bytecode: RefCell::new(Some(bytecode)),
            captures: RefCell::new(captures),
            scope: RefCell::new(None),
            ext: Cell::new(0),
        }))
    }

    /// Placeholder closure for forward references inside a `let rec`; filled
    /// in by `finalize` once all siblings exist.
    pub fn unfinished(arity: usize) -> FunRef {
        FunRef::new(Func::Lambda(Lambda {
            arity,
            bytecode: RefCell::new(None),
            captures: RefCell::new(Vec::new()),
            scope: RefCell::new(None),
            ext: Cell::new(0),
        }))
    }

    pub fn finalize(&self, bytecode: Rc<Chunk>, captures: Vec<Value>) {
        if let Func::Lambda(lam) = &*self.inner {
            *lam.bytecode.borrow_mut() = Some(bytecode);
            *lam.captures.borrow_mut() = captures;
        }
    }

    pub fn get(&self) -> &Func {
        &self.inner
    }

    pub fn arity(&self) -> usize {
        self.inner.arity()
    }

    pub fn as_lambda(&self) -> Option<&Lambda> {
        match &*self.inner {
            Func::Lambda(l) => Some(l),
            Func::Proc(_) => None,
        }
    }

    pub fn ptr_eq(&self, other: &FunRef) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn weak(&self) -> std::rc::Weak<Func> {
        Rc::downgrade(&self.inner)
    }
}

impl Clone for FunRef {
    fn clone(&self) -> FunRef {
        if let Func::Lambda(lam) = &*self.inner {
            lam.retain();
        }
        FunRef { inner: self.inner.clone(), counted: true }
    }
}

impl Drop for FunRef {
    fn drop(&mut self) {
        if self.counted {
            if let Func::Lambda(lam) = &*self.inner {
                lam.release();
            }
        }
    }
}

impl fmt::Debug for FunRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

pub struct Scope {
    members: RefCell<Vec<Rc<Func>>>,
    /// Members that currently have at least one counted handle.
    nlive: Cell<usize>,
    tearing: Cell<bool>,
}

impl Scope {
    /// Wire a set of sibling closures into one scope. Counted handles the
    /// members hold on each other through their captures are demoted to
    /// uncounted aliases first, so only outside handles keep the scope alive.
    pub fn create(member_refs: &[FunRef]) {
        let members: Vec<Rc<Func>> = member_refs.iter().map(|f| f.inner.clone()).collect();
        let scope = Rc::new(Scope {
            members: RefCell::new(members.clone()),
            nlive: Cell::new(0),
            tearing: Cell::new(false),
        });

        for func in &members {
            let Func::Lambda(lam) = &**func else { continue };
            let mut captures = lam.captures.borrow_mut();
            for value in captures.iter_mut() {
                if let Value::Func(cap) = value {
                    let is_sibling = members.iter().any(|m| Rc::ptr_eq(m, &cap.inner));
                    if cap.counted && is_sibling {
                        cap.counted = false;
                        if let Func::Lambda(target) = &*cap.inner {
                            target.ext.set(target.ext.get() - 1);
                        }
                    }
                }
            }
        }

        let mut nlive = 0;
        for func in &members {
            if let Func::Lambda(lam) = &**func {
                *lam.scope.borrow_mut() = Some(scope.clone());
                if lam.ext.get() > 0 {
                    nlive += 1;
                }
            }
        }
        scope.nlive.set(nlive);
        if nlive == 0 {
            scope.teardown();
        }
    }

    fn member_dropped(&self) {
        if self.tearing.get() {
            return;
        }
        let nlive = self.nlive.get() - 1;
        self.nlive.set(nlive);
        if nlive == 0 {
            self.teardown();
        }
    }

    fn member_revived(&self) {
        if !self.tearing.get() {
            self.nlive.set(self.nlive.get() + 1);
        }
    }

    /// Deactivate every member, then release them. Deactivation comes first
    /// so no member can reach a sibling mid-teardown through a stale capture.
    fn teardown(&self) {
        if self.tearing.replace(true) {
            return;
        }
        let members = std::mem::take(&mut *self.members.borrow_mut());
        for func in &members {
            if let Func::Lambda(lam) = &**func {
                lam.deactivate();
            }
        }
        drop(members);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<scope of {} ({} live)>", self.members.borrow().len(), self.nlive.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Chunk;

    fn dummy_chunk() -> Rc<Chunk> {
        Rc::new(Chunk { nreg: 0, entry: 0, code: Vec::new() })
    }

    #[test]
    fn test_plain_closure_is_freed_with_last_handle() {
        let f = FunRef::closure(1, dummy_chunk(), vec![Value::Nil]);
        let probe = f.weak();
        let g = f.clone();
        drop(f);
        assert!(probe.upgrade().is_some());
        drop(g);
        assert!(probe.upgrade().is_none());
    }

    #[test]
    fn test_mutual_recursion_is_reclaimed() {
        // even/odd pair: each captures the other
        let even = FunRef::unfinished(1);
        let odd = FunRef::unfinished(1);
        even.finalize(dummy_chunk(), vec![Value::Func(odd.clone())]);
        odd.finalize(dummy_chunk(), vec![Value::Func(even.clone())]);
        let probe_even = even.weak();
        let probe_odd = odd.weak();

        Scope::create(&[even.clone(), odd.clone()]);

        drop(even);
        assert!(probe_even.upgrade().is_some());
        assert!(probe_odd.upgrade().is_some());
        drop(odd);
        assert!(probe_even.upgrade().is_none(), "scope must free members");
        assert!(probe_odd.upgrade().is_none(), "scope must free members");
    }

    #[test]
    fn test_scope_survives_capture_escape() {
        // a sibling handle escapes into outside data; the scope must stay
        // alive until that handle dies too
        let f = FunRef::unfinished(1);
        let g = FunRef::unfinished(1);
        f.finalize(dummy_chunk(), vec![Value::Func(g.clone())]);
        g.finalize(dummy_chunk(), vec![Value::Func(f.clone())]);
        let probe = f.weak();
        Scope::create(&[f.clone(), g.clone()]);

        let escaped = Value::Func(f.clone());
        drop(f);
        drop(g);
        assert!(probe.upgrade().is_some(), "escaped handle keeps scope alive");
        drop(escaped);
        assert!(probe.upgrade().is_none());
    }

    #[test]
    fn test_three_way_cycle() {
        let a = FunRef::unfinished(0);
        let b = FunRef::unfinished(0);
        let c = FunRef::unfinished(0);
        a.finalize(dummy_chunk(), vec![Value::Func(b.clone()), Value::Func(c.clone())]);
        b.finalize(dummy_chunk(), vec![Value::Func(c.clone()), Value::Func(a.clone())]);
        c.finalize(dummy_chunk(), vec![Value::Func(a.clone()), Value::Func(b.clone())]);
        let probes = [a.weak(), b.weak(), c.weak()];
        Scope::create(&[a.clone(), b.clone(), c.clone()]);
        drop(a);
        drop(b);
        drop(c);
        for p in &probes {
            assert!(p.upgrade().is_none());
        }
    }
}
