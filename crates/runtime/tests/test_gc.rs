//! Collector behavior observable from outside: interning identity, weak
//! intern-table entries, and liveness across collections.

use lox_core::gc;
use lox_core::table::hash_bytes;
use lox_core::{Roots, Value};
use lox_runtime::Vm;

#[test]
fn test_equal_strings_are_one_object() {
    let mut vm = Vm::new();
    let a = vm.heap.intern(b"same", Roots::default());
    let b = vm.heap.intern(b"same", Roots::default());
    assert_eq!(a, b);
    assert_eq!(Value::object(a), Value::object(b));
}

#[test]
fn test_runtime_strings_join_the_intern_table() {
    let mut vm = Vm::new();
    let value = vm.interpret("return \"con\" + \"cat\";");
    vm.heap.protect.push(value);
    let interned = vm.heap.intern(b"concat", Roots::default());
    vm.heap.protect.pop();
    assert_eq!(value, Value::object(interned));
}

#[test]
fn test_interned_strings_are_weak() {
    let mut vm = Vm::new();
    vm.interpret("var s = \"tran\" + \"sient\"; s = nil;");

    let hash = hash_bytes(b"transient");
    assert!(vm.heap.strings.find_string(hash, b"transient", b"").is_some());
    let interned_before = vm.heap.strings.len();

    // Nothing roots the concatenation any more; a collection must drop it
    // from the intern table as well as the heap.
    gc::collect(&mut vm.heap, Roots::default());
    assert!(vm.heap.strings.find_string(hash, b"transient", b"").is_none());
    assert!(vm.heap.strings.len() < interned_before);
}

#[test]
fn test_globals_survive_collections() {
    let mut vm = Vm::new();
    vm.interpret("var keep = \"ke\" + \"pt\";");
    gc::collect(&mut vm.heap, Roots::default());
    gc::collect(&mut vm.heap, Roots::default());
    let value = vm.interpret("return keep;");
    assert_eq!(value, Value::object(vm.heap.intern(b"kept", Roots::default())));
}

#[test]
fn test_collection_during_execution_frees_garbage() {
    let mut vm = Vm::new();
    // Each iteration replaces the global with a strictly longer string;
    // cumulative churn is a few megabytes, far past the first-collection
    // threshold, so collections must run mid-program for the final live
    // size to stay small.
    let value = vm.interpret(
        "var s = \"\";
         var i = 0;
         while (i < 300) {
           s = s + \"0123456789012345678901234567890123456789\";
           i = i + 1;
         }
         return i;",
    );
    assert_eq!(value, Value::number(300.0));
    assert!(vm.heap.bytes_allocated() < 1_500_000);
}

#[test]
fn test_collected_program_behaves_identically() {
    // Same program, one VM collected aggressively between runs: results
    // must agree (liveness property).
    let source = "fun greet(name) { return \"hello \" + name; } return greet(\"gc\");";
    let mut reference = Vm::new();
    let expected = reference.interpret(source);

    let mut vm = Vm::new();
    gc::collect(&mut vm.heap, Roots::default());
    let first = vm.interpret(source);
    gc::collect(&mut vm.heap, Roots::default());
    let second = vm.interpret(source);

    assert!(expected.is_string());
    assert_eq!(first.to_string(), expected.to_string());
    assert_eq!(second.to_string(), expected.to_string());
}

#[test]
fn test_object_count_shrinks_after_collection() {
    let mut vm = Vm::new();
    vm.interpret("var a = \"x\" + \"1\"; var b = \"x\" + \"2\"; a = nil; b = nil;");
    let before = vm.heap.object_count();
    gc::collect(&mut vm.heap, Roots::default());
    assert!(vm.heap.object_count() < before);
}
