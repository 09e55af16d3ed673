//! End-to-end interpreter tests: source text in, result value out.

use lox_core::chunk::{Chunk, OpCode};
use lox_core::{Roots, Value};
use lox_runtime::Vm;

fn interpret(source: &str) -> Value {
    let mut vm = Vm::new();
    vm.interpret(source)
}

#[test]
fn test_arithmetic_and_precedence() {
    assert_eq!(interpret("return 1 + 2 * 3;"), Value::number(7.0));
    assert_eq!(interpret("return (1 + 2) * 3;"), Value::number(9.0));
    assert_eq!(interpret("return -((1.2 + 3.4) / 2);"), Value::number(-((1.2 + 3.4) / 2.0)));
    assert_eq!(interpret("return 10 / 4;"), Value::number(2.5));
}

#[test]
fn test_comparison_and_logic() {
    assert_eq!(interpret("return !(5 - 4 > 3 * 2 == !nil);"), Value::TRUE);
    assert_eq!(interpret("return 1 < 2;"), Value::TRUE);
    assert_eq!(interpret("return 2 <= 1;"), Value::FALSE);
    assert_eq!(interpret("return nil == false;"), Value::FALSE);
    assert_eq!(interpret("return \"a\" == \"a\";"), Value::TRUE);
}

#[test]
fn test_short_circuit() {
    assert_eq!(interpret("return false and missing();"), Value::FALSE);
    assert_eq!(interpret("return true or missing();"), Value::TRUE);
    assert_eq!(interpret("return nil or \"fallback\";").is_string(), true);
    assert_eq!(interpret("return 1 and 2;"), Value::number(2.0));
}

#[test]
fn test_assignment_is_an_expression() {
    assert_eq!(interpret("var x = 1; return x = 3 + 4;"), Value::number(7.0));
}

#[test]
fn test_invalid_assignment_is_a_compile_error() {
    assert_eq!(interpret("var x = 1; return 2 * x = 3 + 4;"), Value::COMPILE_ERROR);
}

#[test]
fn test_duplicate_local_is_a_compile_error() {
    assert_eq!(interpret("{ var x = 5; var x = 6; }"), Value::COMPILE_ERROR);
}

#[test]
fn test_implicit_script_result_is_nil() {
    assert_eq!(interpret("var x = 1;"), Value::NIL);
    assert_eq!(interpret("print 1;"), Value::NIL);
    assert_eq!(interpret(""), Value::NIL);
}

#[test]
fn test_global_self_shadow_reads_previous() {
    assert_eq!(interpret("var x = 1; var x = x + 1; return x;"), Value::number(2.0));
}

#[test]
fn test_control_flow() {
    assert_eq!(interpret("if (1 < 2) return \"then\"; else return \"else\";").is_string(), true);
    assert_eq!(
        interpret("var n = 0; while (n < 5) { n = n + 1; } return n;"),
        Value::number(5.0)
    );
    assert_eq!(
        interpret("{ var k=0; for(var i=0;i<4;i=i+1){ k=k+i; } return k; }"),
        Value::number(6.0)
    );
    // All four for-clauses are optional.
    assert_eq!(
        interpret("var i = 0; for (;;) { i = i + 1; if (i == 3) return i; }"),
        Value::number(3.0)
    );
}

#[test]
fn test_functions_and_returns() {
    assert_eq!(interpret("fun add(a, b) { return a + b; } return add(1, 2);"), Value::number(3.0));
    assert_eq!(interpret("fun noop() {} return noop();"), Value::NIL);
    assert_eq!(
        interpret("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } return fib(10);"),
        Value::number(55.0)
    );
}

#[test]
fn test_runtime_errors() {
    assert_eq!(interpret("return 1 + nil;"), Value::RUNTIME_ERROR);
    assert_eq!(interpret("return -\"minus\";"), Value::RUNTIME_ERROR);
    assert_eq!(interpret("return missing;"), Value::RUNTIME_ERROR);
    assert_eq!(interpret("missing = 1;"), Value::RUNTIME_ERROR);
    assert_eq!(interpret("var x = 1; return x(1);"), Value::RUNTIME_ERROR);
    assert_eq!(interpret("fun f(a) {} f();"), Value::RUNTIME_ERROR);
    assert_eq!(interpret("return \"a\" + 1;"), Value::RUNTIME_ERROR);
}

#[test]
fn test_deep_recursion_overflows() {
    assert_eq!(interpret("fun f() { f(); } f();"), Value::RUNTIME_ERROR);
}

#[test]
fn test_string_concatenation_interns() {
    let mut vm = Vm::new();
    let value = vm.interpret("fun double(s){return s+s;} return double(\"hi\");");
    // Root the result before touching the heap again, then check that
    // equal content re-interned is the very same object.
    vm.heap.protect.push(value);
    let expected = Value::object(vm.heap.intern(b"hihi", Roots::default()));
    vm.heap.protect.pop();
    assert_eq!(value, expected);
}

#[test]
fn test_clock_native() {
    assert_eq!(interpret("return clock() > 0;"), Value::TRUE);
    assert_eq!(interpret("var a = clock(); var b = clock(); return b >= a;"), Value::TRUE);
}

#[test]
fn test_globals_persist_across_interprets() {
    let mut vm = Vm::new();
    assert_eq!(vm.interpret("var counter = 10;"), Value::NIL);
    assert_eq!(vm.interpret("counter = counter + 5;"), Value::NIL);
    assert_eq!(vm.interpret("return counter;"), Value::number(15.0));
}

#[test]
fn test_interpret_chunk() {
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();
    let a = chunk.add_constant(Value::number(1.2)).unwrap();
    chunk.write_op(OpCode::Constant, 1);
    chunk.write(a, 1);
    let b = chunk.add_constant(Value::number(3.4)).unwrap();
    chunk.write_op(OpCode::Constant, 1);
    chunk.write(b, 1);
    chunk.write_op(OpCode::Add, 1);
    chunk.write_op(OpCode::Return, 1);

    assert_eq!(vm.interpret_chunk(chunk), Value::number(1.2 + 3.4));
}

#[test]
fn test_unrecognized_opcode_is_a_runtime_error() {
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();
    chunk.write(0xfe, 1);
    assert_eq!(vm.interpret_chunk(chunk), Value::RUNTIME_ERROR);
}
