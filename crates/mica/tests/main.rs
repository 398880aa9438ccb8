//! End-to-end script execution through the embedding surface.

use mica::{CollectStringPrint, Interp, Object, RunErrorKind, builtins};
use pretty_assertions::assert_eq;

/// Compiles and runs a script with the default natives, returning
/// everything it printed.
fn run_script(source: &str) -> String {
    let mut interp = Interp::new();
    builtins::install(&mut interp);
    let mut out = CollectStringPrint::new();
    interp.compile(source).expect("compile failed");
    interp.run_with(&mut out).expect("run failed");
    out.into_output()
}

fn run_error(source: &str) -> mica::RunError {
    let mut interp = Interp::new();
    builtins::install(&mut interp);
    let mut out = CollectStringPrint::new();
    interp.compile(source).expect("compile failed");
    interp.run_with(&mut out).expect_err("expected a runtime error")
}

#[test]
fn bindings_and_mutation() {
    let output = run_script("let x = 10 let mut y = 20 y = y + 1 print(x) print(y)");
    assert_eq!(output, "10\n21\n");
}

#[test]
fn function_call() {
    let output = run_script("fn add(a,b){return a+b} print(add(5,10))");
    assert_eq!(output, "15\n");
}

#[test]
fn counter_closure() {
    let output = run_script(
        "fn make(){ let mut c = 0 return || { c = c + 1 return c } }
         let f = make() print(f()) print(f()) print(f())",
    );
    assert_eq!(output, "1\n2\n3\n");
}

#[test]
fn sibling_closures_share_one_cell() {
    let output = run_script(
        "fn pair(){ let mut c = 0
           let inc = || { c = c + 1 }
           let get = || { return c }
           return [inc, get] }
         let p = pair() p[0]() p[0]() print(p[1]())",
    );
    assert_eq!(output, "2\n");
}

#[test]
fn for_in_sums_an_array() {
    let output = run_script("let a = [1,2,3] let mut s = 0 for x in a { s = s + x } print(s)");
    assert_eq!(output, "6\n");
}

#[test]
fn break_leaves_an_infinite_loop() {
    let output = run_script("let mut i = 0 loop { if i >= 3 { break } i = i + 1 } print(i)");
    assert_eq!(output, "3\n");
}

#[test]
fn for_in_visits_elements_in_order() {
    let output = run_script(
        "let a = [7, 8, 9] let mut i = 0
         for x in a { assert(x == a[i]) i = i + 1 }
         print(i)",
    );
    assert_eq!(output, "3\n");
}

#[test]
fn while_loop_counts() {
    let output = run_script("let mut i = 0 while i < 5 { i = i + 1 } print(i)");
    assert_eq!(output, "5\n");
}

#[test]
fn recursion_through_globals() {
    let output = run_script(
        "fn fib(n) { if n < 2 { return n } return fib(n-1) + fib(n-2) }
         print(fib(10))",
    );
    assert_eq!(output, "55\n");
}

#[test]
fn nested_blocks_shadow() {
    let output = run_script(
        "fn f() { let x = 1 { let x = 2 print(x) } print(x) }
         f()",
    );
    assert_eq!(output, "2\n1\n");
}

#[test]
fn expression_closure_body() {
    let output = run_script("let double = |x| x * 2 print(double(21))");
    assert_eq!(output, "42\n");
}

#[test]
fn closures_in_a_loop_share_the_loop_slot() {
    // The loop variable lives in one register slot for the whole loop, so
    // every closure captures the same cell and sees its final value.
    let output = run_script(
        "fn make() { let fs = [None, None] let mut i = 0
           for x in [10, 20] { fs[i] = || x i = i + 1 }
           return fs }
         let fs = make() print(fs[0]()) print(fs[1]())",
    );
    assert_eq!(output, "20\n20\n");
}

#[test]
fn arithmetic_promotion() {
    let output = run_script("print(1 + 2) print(1 + 2.5) print(7 / 2) print(7.0 / 2) print(7 % 3)");
    assert_eq!(output, "3\n3.5\n3\n3.5\n1\n");
}

#[test]
fn unary_negation() {
    let output = run_script("let x = 3 print(-x) print(-(1.5))");
    assert_eq!(output, "-3\n-1.5\n");
}

#[test]
fn comparison_and_equality() {
    let output = run_script(
        "print(1 < 2) print(2 <= 1) print(1 == 1.0) print(1 == \"1\") print(None == None) print(true != false)",
    );
    assert_eq!(output, "true\nfalse\ntrue\nfalse\ntrue\ntrue\n");
}

#[test]
fn string_equality_is_interned_identity() {
    let output = run_script("let a = \"hello\" let b = \"hello\" print(a == b) print(a == \"other\")");
    assert_eq!(output, "true\nfalse\n");
}

#[test]
fn array_identity_not_structure() {
    let output = run_script("let a = [1] let b = [1] print(a == b) print(a == a)");
    assert_eq!(output, "false\ntrue\n");
}

#[test]
fn truthiness_in_conditions() {
    let output = run_script(
        "if 0 { print(1) } else { print(2) }
         if 0.0 { print(3) } else { print(4) }
         if \"\" { print(5) } else { print(6) }
         if [] { print(7) } else { print(8) }
         if None { print(9) } else { print(10) }",
    );
    assert_eq!(output, "2\n4\n5\n7\n10\n");
}

#[test]
fn logical_operators_short_circuit() {
    let output = run_script(
        "fn boom() { assert(false) return true }
         print(false && boom())
         print(true || boom())
         print(true && 7)
         print(false || 0)",
    );
    assert_eq!(output, "false\ntrue\n7\n0\n");
}

#[test]
fn array_indexing_and_mutation() {
    let output = run_script("let a = [1, 2, 3] a[1] = 20 print(a[1]) print(len(a)) print(a)");
    assert_eq!(output, "20\n3\n[1, 20, 3]\n");
}

#[test]
fn iterating_a_non_array_is_empty() {
    let output = run_script("let mut n = 0 for x in 42 { n = n + 1 } print(n)");
    assert_eq!(output, "0\n");
}

#[test]
fn builtin_natives_work_from_scripts() {
    let output = run_script(
        "print(len(\"abcd\")) print(type_of(1.5)) print(type_of([])) print(str(12)) print(abs(-4)) \
         print(sqrt(9)) print(floor(2.75))",
    );
    assert_eq!(output, "4\nfloat\narray\n12\n4\n3.0\n2.0\n");
}

#[test]
fn pure_expression_matches_direct_evaluation() {
    let mut interp = Interp::new();
    builtins::install(&mut interp);
    interp.compile("let x = (3 + 4) * 2 - 1").expect("compile failed");
    interp.run().expect("run failed");
    assert_eq!(interp.get_global("x"), Object::Int(13));
}

#[test]
fn ordering_non_numbers_is_a_type_error() {
    let err = run_error("let a = \"x\" let b = \"y\" print(a < b)");
    assert_eq!(err.kind, RunErrorKind::Type);
    assert!(err.message.contains("cannot order"));
}

#[test]
fn calling_a_non_function_is_a_type_error() {
    let err = run_error("let x = 5 x()");
    assert_eq!(err.kind, RunErrorKind::Type);
    assert!(err.message.contains("is not a function"));
}

#[test]
fn undefined_variable_is_a_runtime_error() {
    let err = run_error("print(missing)");
    assert_eq!(err.kind, RunErrorKind::UndefinedVariable);
    assert!(err.message.contains("missing"));
}

#[test]
fn index_out_of_bounds_is_a_runtime_error() {
    let err = run_error("let a = [1] print(a[1])");
    assert_eq!(err.kind, RunErrorKind::Index);
    let err = run_error("let a = [1] print(a[-1])");
    assert_eq!(err.kind, RunErrorKind::Index);
}

#[test]
fn integer_division_by_zero_is_a_runtime_error() {
    let err = run_error("print(1 / 0)");
    assert_eq!(err.kind, RunErrorKind::DivisionByZero);
    let err = run_error("print(1 % 0)");
    assert_eq!(err.kind, RunErrorKind::DivisionByZero);
}

#[test]
fn failed_assertion_reports_the_native() {
    let err = run_error("assert(1 == 2)");
    assert_eq!(err.kind, RunErrorKind::Native);
    assert!(err.message.contains("assert"));
    assert!(err.message.contains("assertion failed"));
}

#[test]
fn heap_returns_to_baseline_after_transient_allocations() {
    let mut interp = Interp::new();
    builtins::install(&mut interp);
    interp
        .compile("let mut i = 0 while i < 50 { let a = [i, i, i] i = i + 1 }")
        .expect("compile failed");
    let mut out = CollectStringPrint::new();
    interp.run_with(&mut out).expect("run failed");
    // Every transient array has been released; only interned strings
    // (names and literals the program referenced) remain live.
    let stats = interp.heap_stats();
    assert_eq!(stats.live_objects, stats.interned_strings);
}

#[test]
fn heap_slots_are_recycled_across_iterations() {
    let mut interp = Interp::new();
    builtins::install(&mut interp);
    interp
        .compile("let mut i = 0 while i < 1000 { let a = [i] i = i + 1 }")
        .expect("compile failed");
    interp.run().expect("run failed");
    // The free list keeps the arena from growing with iteration count.
    assert!(interp.heap_stats().total_slots < 50);
}

#[test]
fn globals_holding_heap_values_stay_live() {
    let mut interp = Interp::new();
    builtins::install(&mut interp);
    interp.compile("let a = [1, 2]").expect("compile failed");
    interp.run().expect("run failed");
    let stats = interp.heap_stats();
    // The array plus the interned global name.
    assert_eq!(stats.live_objects, stats.interned_strings + 1);
    assert_eq!(interp.get_global("a"), Object::Array(vec![Object::Int(1), Object::Int(2)]));
}
