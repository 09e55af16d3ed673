//! Built-in test battery
//!
//! Self-contained checks runnable from a release binary (`lox test`): two
//! hand-built chunks driven through `interpret_chunk`, then a list of
//! source-level scenarios. Each prints SUCCESS or an expected-vs-got line;
//! the process exit code reports whether everything passed.

use lox_core::chunk::{Chunk, OpCode};
use lox_core::disasm;
use lox_core::{Roots, Value};
use lox_runtime::Vm;

pub fn run_all() -> i32 {
    let mut ok = true;
    ok &= chunk_arithmetic();
    ok &= chunk_intern_and_concat();
    ok &= scenarios();
    if ok {
        println!("\nAll tests passed.");
        0
    } else {
        println!("\nSome tests FAILED.");
        1
    }
}

fn emit_constant(chunk: &mut Chunk, value: Value, line: u32) {
    let index = chunk.add_constant(value).expect("battery chunk stays under the constant limit");
    chunk.write_op(OpCode::Constant, line);
    chunk.write(index, line);
}

fn report(ok: bool, expected: Value, got: Value) -> bool {
    if ok {
        println!("SUCCESS");
    } else {
        println!("ERROR: expected {} but got {}", expected, got);
    }
    ok
}

fn chunk_arithmetic() -> bool {
    println!("\n=> TEST -((1.2 + 3.4) / 2)");
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();

    emit_constant(&mut chunk, Value::number(1.2), 123);
    emit_constant(&mut chunk, Value::number(3.4), 123);
    chunk.write_op(OpCode::Add, 123);
    emit_constant(&mut chunk, Value::number(2.0), 123);
    chunk.write_op(OpCode::Divide, 123);
    chunk.write_op(OpCode::Negate, 123);
    chunk.write_op(OpCode::Return, 123);

    println!("=> bytecode");
    print!("{}", disasm::disassemble_chunk(&chunk, "arithmetic"));

    println!("=> interpret_chunk");
    let value = vm.interpret_chunk(chunk);
    let expected = Value::number(-((1.2 + 3.4) / 2.0));
    report(value == expected, expected, value)
}

fn chunk_intern_and_concat() -> bool {
    println!("\n=> TEST intern & concat 2 identical strings");
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();

    // Both literals intern to the same object; the constant slots are still
    // duplicated, which is the expected (wasteful but harmless) layout.
    let hi_a = vm.heap.intern(b"hi", Roots::default());
    vm.heap.protect.push(Value::object(hi_a));
    let hi_b = vm.heap.intern(b"hi", Roots::default());
    vm.heap.protect.push(Value::object(hi_b));

    emit_constant(&mut chunk, Value::object(hi_a), 123);
    emit_constant(&mut chunk, Value::object(hi_b), 123);
    chunk.write_op(OpCode::Add, 123);
    chunk.write_op(OpCode::Return, 123);

    println!("=> bytecode");
    print!("{}", disasm::disassemble_chunk(&chunk, "intern & concat"));

    println!("=> interpret_chunk");
    let value = vm.interpret_chunk(chunk);
    vm.heap.protect.pop();
    vm.heap.protect.pop();

    let expected = Value::object(vm.heap.intern(b"hihi", Roots::default()));
    report(value == expected, expected, value)
}

enum Expected {
    Number(f64),
    Bool(bool),
    Str(&'static str),
    CompileError,
    RuntimeError,
}

struct Case {
    title: &'static str,
    source: &'static str,
    expected: Expected,
}

const CASES: &[Case] = &[
    Case {
        title: "precedence and logic",
        source: "return !(5 - 4 > 3 * 2 == !nil);",
        expected: Expected::Bool(true),
    },
    Case {
        title: "assignment is an expression",
        source: "var x = 1; return x = 3 + 4;",
        expected: Expected::Number(7.0),
    },
    Case {
        title: "invalid assignment target",
        source: "var x = 1; return 2 * x = 3 + 4;",
        expected: Expected::CompileError,
    },
    Case {
        title: "duplicate local declaration",
        source: "{ var x = 5; var x = 6; }",
        expected: Expected::CompileError,
    },
    Case {
        title: "string concatenation interns",
        source: "fun double(s){return s+s;} return double(\"hi\");",
        expected: Expected::Str("hihi"),
    },
    Case {
        title: "closure captures enclosing local",
        source: "fun outer(){var x=\"outside\"; fun inner(){return x;} return inner();} return outer();",
        expected: Expected::Str("outside"),
    },
    Case {
        title: "fields and this",
        source: "class T{ f(){ return this.n; } } var t=T(); t.n=101; return t.f();",
        expected: Expected::Number(101.0),
    },
    Case {
        title: "initializer binds fields",
        source: "class P{ init(c){ this.c=c; } brew(){ return this.c; } } return P(899).brew();",
        expected: Expected::Number(899.0),
    },
    Case {
        title: "super dispatch",
        source: "class A{ m(){return 1;} m2(){return 2;} } class B<A{ m(){return super.m()+this.m2();} } return B().m();",
        expected: Expected::Number(3.0),
    },
    Case {
        title: "for loop accumulates",
        source: "{ var k=0; for(var i=0;i<4;i=i+1){ k=k+i; } return k; }",
        expected: Expected::Number(6.0),
    },
    Case {
        title: "global may shadow itself",
        source: "var x = 1; var x = x + 1; return x;",
        expected: Expected::Number(2.0),
    },
    Case {
        title: "undefined variable is a runtime error",
        source: "return missing;",
        expected: Expected::RuntimeError,
    },
    Case {
        title: "only numbers add to numbers",
        source: "return 1 + nil;",
        expected: Expected::RuntimeError,
    },
];

fn scenarios() -> bool {
    let mut ok = true;
    for case in CASES {
        println!("\n=> {}", case.title);
        let mut vm = Vm::new();
        let value = vm.interpret(case.source);
        // The result is unrooted once the run finishes; pin it while the
        // expected value is built (which may intern, and so may collect).
        vm.heap.protect.push(value);
        let expected = match case.expected {
            Expected::Number(n) => Value::number(n),
            Expected::Bool(b) => Value::bool(b),
            // Interned after the run: equal content must be the same object.
            Expected::Str(s) => Value::object(vm.heap.intern(s.as_bytes(), Roots::default())),
            Expected::CompileError => Value::COMPILE_ERROR,
            Expected::RuntimeError => Value::RUNTIME_ERROR,
        };
        vm.heap.protect.pop();
        ok &= report(value == expected, expected, value);
    }
    ok
}
