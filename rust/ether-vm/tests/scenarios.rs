//! End-to-end behavior: source text in, evaluated value out.

use ether_core::attr::Attr;
use ether_core::function::{Applier, FunRef};
use ether_core::value::Value;
use ether_vm::{LoadError, Root};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

fn eval(src: &str) -> Value {
    let mut root = Root::new().unwrap();
    root.run_source(src, "<test>").unwrap().0
}

fn eval_err(src: &str) -> LoadError {
    let mut root = Root::new().unwrap();
    root.run_source(src, "<test>").unwrap_err()
}

#[test]
fn test_arithmetic() {
    assert!(eval("1 + 2 * 3").equal(&Value::num(7)));
    assert!(eval("(1 + 2) * 3").equal(&Value::num(9)));
    assert!(eval("13 / 5").equal(&Value::num(2.6)));
    assert!(eval("2 ^ 10").equal(&Value::num(1024)));
}

#[test]
fn test_division_by_zero_yields_inf() {
    // runtime division, not constant-folded
    let v = eval("let f = fn x -> 1 / x in f 0");
    match v {
        Value::Num(n) => assert!(n.as_f64().is_infinite()),
        other => panic!("expected Inf, got {}", other),
    }
}

#[test]
fn test_fibonacci() {
    let v = eval("let rec f x = if x < 2 then x else f (x - 1) + f (x - 2) in f 10");
    assert!(v.equal(&Value::num(55)), "got {}", v);
}

#[test]
fn test_factorial_stays_exact() {
    let v = eval("let rec fact n = if n = 0 then 1 else n * fact (n - 1) in fact 20");
    assert!(v.equal(&Value::num(2432902008176640000i64)), "got {}", v);
}

#[test]
fn test_tail_recursion_runs_in_constant_stack() {
    // a million iterations would blow any call stack without LOOP
    let v = eval(
        "let rec sum n a = if n = 0 then a else sum (n - 1) (a + n) in sum 1000000 0",
    );
    assert!(v.equal(&Value::num(500000500000i64)), "got {}", v);
}

#[test]
fn test_deep_non_tail_recursion_overflows_cleanly() {
    let err = eval_err("let rec f n = if n = 0 then 0 else 1 + f (n - 1) in f 100000");
    match err {
        LoadError::Uncaught { exn: Value::Exn(e) } => {
            assert!(e.what.is_identical(&Value::sym("stack_overflow")));
        }
        other => panic!("expected stack_overflow, got {:?}", other),
    }
}

#[test]
fn test_mutual_recursion() {
    let v = eval(
        "let rec even n = if n = 0 then true else odd (n - 1) \
         and odd n = if n = 0 then false else even (n - 1) \
         in even 10",
    );
    assert!(v.is_identical(&Value::Bool(true)), "got {}", v);
}

#[test]
fn test_record_update_shares_the_type() {
    let mut root = Root::new().unwrap();
    let a = root.run_source("{ x = 1, y = 2 }", "<a>").unwrap().0;
    let b = root
        .run_source("{ x = 1, y = 2 } with { y = 20 }", "<b>")
        .unwrap()
        .0;
    let (Value::Record(a), Value::Record(b)) = (&a, &b) else {
        panic!("expected records")
    };
    assert!(Rc::ptr_eq(&a.ty, &b.ty), "update must preserve the type pointer");
    let xi = a.ty.field_by_name("x").unwrap();
    let yi = a.ty.field_by_name("y").unwrap();
    assert!(b.vals[xi].equal(&Value::num(1)));
    assert!(b.vals[yi].equal(&Value::num(20)));
}

#[test]
fn test_update_non_record_raises() {
    let err = eval_err("let f = fn x -> x with { y = 1 } in f 3");
    match err {
        LoadError::Uncaught { exn: Value::Exn(e) } => {
            assert!(e.what.is_identical(&Value::sym("update_error")));
        }
        other => panic!("expected update_error, got {:?}", other),
    }
}

#[test]
fn test_try_catches_symbol() {
    let v = eval("try raise `foo with `foo -> 42");
    assert!(v.equal(&Value::num(42)), "got {}", v);
}

#[test]
fn test_try_rethrows_unmatched() {
    let err = eval_err("try raise `bar with `foo -> 42");
    match err {
        LoadError::Uncaught { exn: Value::Exn(e) } => {
            assert!(e.what.is_identical(&Value::sym("bar")));
        }
        other => panic!("expected uncaught `bar, got {:?}", other),
    }
}

#[test]
fn test_try_never_catches_exit() {
    let mut root = Root::new().unwrap();
    let dir = std::env::temp_dir().join(format!("ether-exit-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let script = dir.join("script.eth");
    std::fs::write(&script, "try raise (exit 3) with _ -> 42").unwrap();
    let status = root.run_script(&script).unwrap();
    assert_eq!(status, 3, "exit must pass through user handlers");
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_catch_binds_payload() {
    let v = eval("try raise (1, 2) with (a, b) -> a + b");
    assert!(v.equal(&Value::num(3)), "got {}", v);
}

#[test]
fn test_exception_carries_a_trace() {
    let err = eval_err("let f = fn x -> raise `oops in let g = fn x -> f x in g 1");
    match err {
        LoadError::Uncaught { exn: Value::Exn(e) } => {
            assert!(!e.trace.borrow().is_empty(), "raise sites must be traced");
        }
        other => panic!("expected exception, got {:?}", other),
    }
}

#[test]
fn test_pipe_map() {
    let v = eval("[1, 2, 3] |> map (fn x -> x * x)");
    let expected = Value::list(vec![Value::num(1), Value::num(4), Value::num(9)]);
    assert!(v.equal(&expected), "got {}", v);
}

#[test]
fn test_intermediate_list_is_reclaimed_promptly() {
    thread_local! {
        static PROBE: RefCell<Option<Weak<ether_core::value::Pair>>> =
            const { RefCell::new(None) };
    }

    let mut root = Root::new().unwrap();
    let probe = FunRef::proc(
        "probe",
        1,
        Rc::new(|_: &mut dyn Applier, args: Vec<Value>| {
            let arg = args.into_iter().next().expect("one argument");
            if let Value::Pair(p) = &arg {
                PROBE.with(|c| *c.borrow_mut() = Some(Rc::downgrade(p)));
            }
            arg
        }),
    );
    let check = FunRef::proc(
        "probe_dead",
        1,
        Rc::new(|_: &mut dyn Applier, _args: Vec<Value>| {
            let dead = PROBE.with(|c| {
                c.borrow()
                    .as_ref()
                    .map(|w| w.upgrade().is_none())
                    .unwrap_or(false)
            });
            Value::Bool(dead)
        }),
    );
    root.define("probe", Value::Func(probe), Attr::builtin());
    root.define("probe_dead", Value::Func(check), Attr::builtin());

    // the list is built at runtime (a constant list would live in the
    // bytecode); the probed input must be gone right after map consumed it
    let (v, _) = root
        .run_source(
            "let l = probe (range 1 4) in \
             let r = map (fn x -> x * x) l in \
             (probe_dead r, r)",
            "<probe>",
        )
        .unwrap();
    let Value::Record(tup) = &v else { panic!("expected a tuple") };
    assert!(
        tup.vals[0].is_identical(&Value::Bool(true)),
        "input list must be freed once map is done with it"
    );
    let expected = Value::list(vec![Value::num(1), Value::num(4), Value::num(9)]);
    assert!(tup.vals[1].equal(&expected));
}

#[test]
fn test_letrec_closures_are_reclaimed() {
    thread_local! {
        static HOOK: RefCell<Option<Weak<ether_core::function::Func>>> =
            const { RefCell::new(None) };
    }

    let mut root = Root::new().unwrap();
    let grab = FunRef::proc(
        "grab",
        1,
        Rc::new(|_: &mut dyn Applier, args: Vec<Value>| {
            let arg = args.into_iter().next().expect("one argument");
            if let Value::Func(f) = &arg {
                HOOK.with(|c| *c.borrow_mut() = Some(f.weak()));
            }
            arg
        }),
    );
    root.define("grab", Value::Func(grab), Attr::builtin());

    root.run_source(
        "let rec even n = if n = 0 then true else odd (n - 1) \
         and odd n = if n = 0 then false else even (n - 1) \
         in grab even 4",
        "<scope>",
    )
    .unwrap();

    let alive = HOOK.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()).is_some());
    assert!(!alive, "after the script, the recursive closures must be freed");
}

#[test]
fn test_partial_and_over_application() {
    let v = eval("let add = fn a b -> a + b in let inc = add 1 in inc 41");
    assert!(v.equal(&Value::num(42)), "got {}", v);
    // over-application: the first call yields a function consumed by the rest
    let v = eval("let pick = fn a -> fn b -> a in pick 1 2");
    assert!(v.equal(&Value::num(1)), "got {}", v);
}

#[test]
fn test_match_decision_tree() {
    let v = eval(
        "let f = fn a b -> match (a, b) with \
           ((x, y), _) -> x + y | (_, (p, q)) -> p * q | (_, _) -> 0 \
         in (f (1, 2) 9, f 9 (3, 4), f 9 9)",
    );
    let Value::Record(tup) = &v else { panic!("expected tuple, got {}", v) };
    assert!(tup.vals[0].equal(&Value::num(3)), "got {}", tup.vals[0]);
    assert!(tup.vals[1].equal(&Value::num(12)), "got {}", tup.vals[1]);
    assert!(tup.vals[2].equal(&Value::num(0)), "got {}", tup.vals[2]);
}

#[test]
fn test_variants() {
    let v = eval(
        "let f = fn x -> match x with `some v -> v | `none -> 0 in \
         (f (`some 41), f `none)",
    );
    let Value::Record(tup) = &v else { panic!("expected tuple, got {}", v) };
    assert!(tup.vals[0].equal(&Value::num(41)));
    assert!(tup.vals[1].equal(&Value::num(0)));
}

#[test]
fn test_operator_redefinition() {
    let v = eval("let (+) a b = a * b in 6 + 7");
    assert!(v.equal(&Value::num(42)), "got {}", v);
}

#[test]
fn test_short_circuit() {
    // the right side of && must not run when the left is false
    let v = eval("let mut hit = 0 in (false && (hit := 1; true)); hit");
    assert!(v.equal(&Value::num(0)), "got {}", v);
    let v = eval("true || raise `boom");
    assert!(v.is_identical(&Value::Bool(true)), "got {}", v);
}

#[test]
fn test_mutable_bindings() {
    let v = eval("let mut x = 1 in x := x + 41; x");
    assert!(v.equal(&Value::num(42)), "got {}", v);
}

#[test]
fn test_assert() {
    assert!(eval("assert 1 < 2").is_identical(&Value::Nil));
    let err = eval_err("let f = fn x -> assert x in f false");
    match err {
        LoadError::Uncaught { exn: Value::Exn(e) } => {
            assert!(e.what.is_identical(&Value::sym("assertion_failed")));
        }
        other => panic!("expected assertion_failed, got {:?}", other),
    }
}

#[test]
fn test_field_access_and_alias() {
    let v = eval("let f = fn r -> r.x + r.y in f { x = 40, y = 2 }");
    assert!(v.equal(&Value::num(42)), "got {}", v);
    let v = eval("let f = fn p -> match p with { x } as whole -> (x, whole.y) in f { x = 1, y = 2 }");
    let Value::Record(tup) = &v else { panic!("expected tuple, got {}", v) };
    assert!(tup.vals[0].equal(&Value::num(1)));
    assert!(tup.vals[1].equal(&Value::num(2)));
}

#[test]
fn test_missing_field_raises_access_error() {
    let err = eval_err("let f = fn r -> r.z in f { x = 1, y = 2 }");
    match err {
        LoadError::Uncaught { exn: Value::Exn(e) } => {
            assert!(e.what.is_identical(&Value::sym("access_error")));
        }
        other => panic!("expected access_error, got {:?}", other),
    }
}

#[test]
fn test_comparison_chains() {
    // a < b yields b, so chains compare transitively
    assert!(eval("1 < 2 < 3").is_false() == false);
    assert!(eval("1 < 5 < 3").is_false());
}

#[test]
fn test_defined() {
    assert!(eval("defined? map").is_identical(&Value::Bool(true)));
    assert!(eval("defined? no_such_thing").is_identical(&Value::Bool(false)));
}

#[test]
fn test_sequences_and_strings() {
    let v = eval(r#""foo" ++ "bar""#);
    assert!(v.equal(&Value::str("foobar")));
    let v = eval(r#"strlen ("abc" ++ "de")"#);
    assert!(v.equal(&Value::num(5)));
}

#[test]
fn test_prelude_fold_and_filter() {
    let v = eval("foldl (fn a b -> a + b) 0 (filter (fn x -> x mod 2 = 0) (range 1 11))");
    assert!(v.equal(&Value::num(30)), "got {}", v);
}
