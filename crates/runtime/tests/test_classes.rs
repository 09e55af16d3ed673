//! Classes: fields, methods, initializers, binding, inheritance.

use lox_core::Value;
use lox_runtime::Vm;

fn interpret(source: &str) -> Value {
    let mut vm = Vm::new();
    vm.interpret(source)
}

#[test]
fn test_fields_and_this() {
    assert_eq!(
        interpret("class T{ f(){ return this.n; } } var t=T(); t.n=101; return t.f();"),
        Value::number(101.0)
    );
}

#[test]
fn test_set_expression_leaves_value() {
    assert_eq!(
        interpret("class T{} var t = T(); return t.x = 5;"),
        Value::number(5.0)
    );
}

#[test]
fn test_new_fields_may_be_added_any_time() {
    assert_eq!(
        interpret("class T{} var t = T(); t.a = 1; t.b = 2; return t.a + t.b;"),
        Value::number(3.0)
    );
}

#[test]
fn test_initializer() {
    assert_eq!(
        interpret("class P{ init(c){ this.c=c; } brew(){ return this.c; } } return P(899).brew();"),
        Value::number(899.0)
    );
    // A class call yields the instance even when init returns bare.
    assert_eq!(
        interpret("class P{ init(){ this.v = 1; return; } } return P().v;"),
        Value::number(1.0)
    );
}

#[test]
fn test_initializer_arity_is_enforced() {
    assert_eq!(interpret("class P{ init(c){ this.c=c; } } P();"), Value::RUNTIME_ERROR);
    assert_eq!(interpret("class Q{} Q(1);"), Value::RUNTIME_ERROR);
}

#[test]
fn test_bound_method_remembers_receiver() {
    assert_eq!(
        interpret(
            "class C { init() { this.v = 10; } get() { return this.v; } }
             var c = C();
             var m = c.get;
             return m();"
        ),
        Value::number(10.0)
    );
}

#[test]
fn test_callable_field_shadows_method() {
    assert_eq!(
        interpret(
            "class C { m() { return \"method\"; } }
             fun field() { return \"field\"; }
             var c = C();
             c.m = field;
             return c.m() == \"field\";"
        ),
        Value::TRUE
    );
}

#[test]
fn test_inheritance_copies_methods_down() {
    assert_eq!(
        interpret(
            "class A { m() { return \"A\"; } }
             class B < A {}
             return B().m() == \"A\";"
        ),
        Value::TRUE
    );
}

#[test]
fn test_override_and_super() {
    assert_eq!(
        interpret(
            "class A{ m(){return 1;} m2(){return 2;} } class B<A{ m(){return super.m()+this.m2();} } return B().m();"
        ),
        Value::number(3.0)
    );
}

#[test]
fn test_super_method_as_value() {
    assert_eq!(
        interpret(
            "class A { m() { return 5; } }
             class B < A { m() { var f = super.m; return f(); } }
             return B().m();"
        ),
        Value::number(5.0)
    );
}

#[test]
fn test_subclass_method_changes_do_not_leak_up() {
    assert_eq!(
        interpret(
            "class A { m() { return \"A\"; } }
             class B < A { m() { return \"B\"; } }
             return A().m() == \"A\" and B().m() == \"B\";"
        ),
        Value::TRUE
    );
}

#[test]
fn test_property_errors() {
    assert_eq!(interpret("var x = 1; return x.field;"), Value::RUNTIME_ERROR);
    assert_eq!(interpret("var x = 1; x.field = 2;"), Value::RUNTIME_ERROR);
    assert_eq!(interpret("class T{} return T().missing;"), Value::RUNTIME_ERROR);
    assert_eq!(interpret("class T{} T().missing();"), Value::RUNTIME_ERROR);
    assert_eq!(interpret("var s = \"str\"; s.m();"), Value::RUNTIME_ERROR);
}

#[test]
fn test_superclass_must_be_a_class() {
    assert_eq!(interpret("var NotAClass = 1; class B < NotAClass {}"), Value::RUNTIME_ERROR);
}

#[test]
fn test_class_compile_errors() {
    assert_eq!(interpret("class A < A {}"), Value::COMPILE_ERROR);
    assert_eq!(interpret("print this;"), Value::COMPILE_ERROR);
    assert_eq!(interpret("class A { m() { return super.m(); } }"), Value::COMPILE_ERROR);
    assert_eq!(interpret("class A { init() { return 1; } }"), Value::COMPILE_ERROR);
}

#[test]
fn test_instance_printing() {
    let mut vm = Vm::new();
    let value = vm.interpret("class Coffee {} return Coffee();");
    assert_eq!(value.to_string(), "Coffee instance");
    let class = vm.interpret("class Tea {} return Tea;");
    assert_eq!(class.to_string(), "Tea");
}
