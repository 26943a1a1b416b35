// Integration tests for the Flax interpreter
//
// These run complete programs through the public library API and check
// what lands on the output sink, plus the classification and exit code of
// every failure mode the language has.

use flax::errors::{InterpretError, EX_DATAERR, EX_SOFTWARE};
use flax::vm::Vm;

fn run(source: &str) -> (String, Result<(), InterpretError>) {
    let mut vm = Vm::new(Vec::new());
    let result = vm.interpret(source);
    let output = String::from_utf8(vm.output().clone()).expect("non-utf8 output");
    (output, result)
}

fn run_ok(source: &str) -> String {
    let (output, result) = run(source);
    if let Err(error) = result {
        panic!("unexpected error:\n{}", error);
    }
    output
}

fn run_err(source: &str) -> InterpretError {
    let (_, result) = run(source);
    result.expect_err("expected an error")
}

#[test]
fn test_addition_prints_sum() {
    assert_eq!(run_ok("print 1 + 2;"), "3\n");
}

#[test]
fn test_equal_strings_are_identical() {
    assert_eq!(run_ok("var a = \"hi\"; var b = \"hi\"; print a == b;"), "true\n");
}

#[test]
fn test_closure_counter() {
    let source = r#"
        fun make() {
            var x = 0;
            fun inc() { x = x + 1; return x; }
            return inc;
        }
        var c = make();
        print c();
        print c();
        print c();
    "#;
    assert_eq!(run_ok(source), "1\n2\n3\n");
}

#[test]
fn test_inherited_method_dispatch() {
    let source = r#"
        class A { greet() { print "a"; } }
        class B < A {}
        B().greet();
    "#;
    assert_eq!(run_ok(source), "a\n");
}

#[test]
fn test_for_loop_counts() {
    assert_eq!(run_ok("for (var i = 0; i < 3; i = i + 1) print i;"), "0\n1\n2\n");
}

#[test]
fn test_string_concatenation() {
    assert_eq!(run_ok("print \"a\" + \"b\" + \"c\";"), "abc\n");
}

#[test]
fn test_method_with_initializer() {
    let source = r#"
        class Greeter {
            init(name) { this.name = name; }
            greet() { print "hello " + this.name; }
        }
        Greeter("flax").greet();
    "#;
    assert_eq!(run_ok(source), "hello flax\n");
}

#[test]
fn test_super_invocation() {
    let source = r#"
        class A { m() { print "base"; } }
        class B < A { m() { super.m(); print "derived"; } }
        B().m();
    "#;
    assert_eq!(run_ok(source), "base\nderived\n");
}

#[test]
fn test_undefined_variable_is_runtime_error() {
    let error = run_err("print a;");
    assert!(error.to_string().contains("undefined variable"));
    assert_eq!(error.exit_code(), EX_SOFTWARE);
}

#[test]
fn test_mixed_addition_is_runtime_error() {
    let error = run_err("1 + \"x\";");
    assert!(error.to_string().contains("operands must be two numbers or two strings"));
    assert_eq!(error.exit_code(), EX_SOFTWARE);
}

#[test]
fn test_self_initializer_read_is_compile_error() {
    let error = run_err("{ var a = a; }");
    assert!(error
        .to_string()
        .contains("can't read local variable in its own initializer"));
    assert_eq!(error.exit_code(), EX_DATAERR);
}

#[test]
fn test_compile_error_reports_line() {
    let error = run_err("print 1 +;");
    let rendered = error.to_string();
    assert!(rendered.contains("[line 1] error"), "got: {}", rendered);
    assert!(rendered.contains("expected expression"));
}

#[test]
fn test_runtime_error_reports_line_and_kind() {
    let error = run_err("\n\nprint -\"s\";");
    let rendered = error.to_string();
    assert!(rendered.contains("[line 3]"), "got: {}", rendered);
    assert!(rendered.contains("RuntimeError"));
}

#[test]
fn test_session_keeps_state_between_runs() {
    let mut vm = Vm::new(Vec::new());
    vm.interpret("fun double(n) { return n * 2; }").expect("definition failed");
    vm.interpret("print double(21);").expect("call failed");
    assert_eq!(String::from_utf8(vm.output().clone()).unwrap(), "42\n");
}
