//! Boundary behaviors: locals, upvalues, call depth.

use mica::{Interp, Object, RunErrorKind, builtins};

/// A function declaring `count` locals, each initialized to its index.
fn locals_source(count: usize) -> String {
    let mut source = String::from("fn f() {\n");
    for i in 0..count {
        source.push_str(&format!("let v{i} = {i}\n"));
    }
    source.push_str("return v0\n}\nlet r = f()");
    source
}

#[test]
fn exactly_256_locals_compile_and_run() {
    let mut interp = Interp::new();
    builtins::install(&mut interp);
    interp.compile(&locals_source(256)).expect("256 locals must compile");
    interp.run().expect("run failed");
    assert_eq!(interp.get_global("r"), Object::Int(0));
}

#[test]
fn locals_overflow_reports_an_error() {
    let mut interp = Interp::new();
    let errors = interp.compile(&locals_source(257)).expect_err("257 locals must fail");
    assert!(errors.iter().any(|e| e.message.contains("too many local variables")));
}

/// Builds nested closures whose innermost body references `outer` locals
/// of the grandparent and `mid` locals of the parent, producing
/// `outer + mid` upvalue descriptors in the innermost function.
fn upvalues_source(outer: usize, mid: usize) -> String {
    let mut source = String::from("fn f() {\n");
    for i in 0..outer {
        source.push_str(&format!("let a{i} = {i}\n"));
    }
    source.push_str("return || {\n");
    for i in 0..mid {
        source.push_str(&format!("let b{i} = {i}\n"));
    }
    source.push_str("return || {\n");
    for i in 0..outer {
        source.push_str(&format!("a{i}\n"));
    }
    for i in 0..mid {
        source.push_str(&format!("b{i}\n"));
    }
    source.push_str("return a0\n}\n}\n}\nlet r = f()()()");
    source
}

#[test]
fn exactly_256_upvalues_compile_and_run() {
    let mut interp = Interp::new();
    interp
        .compile(&upvalues_source(200, 56))
        .expect("256 upvalues must compile");
    interp.run().expect("run failed");
    assert_eq!(interp.get_global("r"), Object::Int(0));
}

#[test]
fn upvalue_overflow_reports_an_error() {
    let mut interp = Interp::new();
    let errors = interp
        .compile(&upvalues_source(200, 57))
        .expect_err("257 upvalues must fail");
    assert!(errors.iter().any(|e| e.message.contains("too many upvalues")));
}

#[test]
fn runaway_recursion_reports_stack_overflow() {
    let mut interp = Interp::new();
    interp.compile("fn f() { return f() } f()").expect("compile failed");
    let err = interp.run().expect_err("expected stack overflow");
    assert_eq!(err.kind, RunErrorKind::StackOverflow);
}

#[test]
fn recursion_below_the_cap_succeeds() {
    let mut interp = Interp::new();
    interp
        .compile("fn down(n) { if n == 0 { return 0 } return down(n - 1) } let r = down(50)")
        .expect("compile failed");
    interp.run().expect("run failed");
    assert_eq!(interp.get_global("r"), Object::Int(0));
}

#[test]
fn deep_expression_nesting_is_a_compile_error_not_a_crash() {
    // Scratch registers are limited to the 256-slot window; an absurdly
    // wide call fails cleanly at compile time.
    let args: Vec<String> = (0..300).map(|i| i.to_string()).collect();
    let source = format!("fn g() {{ return 0 }} g({})", args.join(", "));
    let mut interp = Interp::new();
    let errors = interp.compile(&source).expect_err("expected compile failure");
    assert!(
        errors
            .iter()
            .any(|e| e.message.contains("too many arguments") || e.message.contains("too many registers")),
        "got {errors:?}"
    );
}
