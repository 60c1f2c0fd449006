use std::fmt::Write as _;
use std::io::Write;
use std::sync::{Arc, Mutex};

use cinder::{InterpretError, Vm};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(src: &str) -> (Result<(), InterpretError>, String) {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(Box::new(buf.clone()));
    let result = vm.interpret(src);
    let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    (result, out)
}

fn run_ok(src: &str) -> String {
    let (result, out) = run(src);
    if let Err(e) = result {
        panic!("unexpected error:\n{}", e);
    }
    out
}

fn runtime_error(src: &str) -> String {
    match run(src).0 {
        Err(InterpretError::Runtime(e)) => e.message,
        Err(InterpretError::Compile(diags)) => panic!("compile error: {:?}", diags),
        Ok(()) => panic!("expected runtime error"),
    }
}

fn compile_error(src: &str) -> Vec<String> {
    match run(src).0 {
        Err(InterpretError::Compile(diags)) => diags,
        _ => panic!("expected compile error"),
    }
}

// -- Scenarios --

#[test]
fn arithmetic_precedence() {
    assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn closures_capture_by_reference() {
    let out = run_ok(
        "fun makeAdder(x){ fun add(y){ return x+y; } return add; }\n\
         var a = makeAdder(3);\n\
         print a(4);\n\
         print a(10);",
    );
    assert_eq!(out, "7\n13\n");
}

#[test]
fn super_calls_reach_the_superclass_method() {
    let out = run_ok(
        "class A { greet(){ print \"hi\"; } }\n\
         class B < A { greet(){ super.greet(); print \"there\"; } }\n\
         B().greet();",
    );
    assert_eq!(out, "hi\nthere\n");
}

#[test]
fn for_loop_concatenation() {
    let out = run_ok(
        "var s = \"\"; for (var i = 0; i < 3; i = i + 1) s = s + i; print s;",
    );
    assert_eq!(out, "012\n");
}

#[test]
fn arrays_index_assign_and_size() {
    let out = run_ok(
        "var a = [10, 20, 30]; a[1] = 99; print a[0] + a[1] + a[2]; print size(a);",
    );
    assert_eq!(out, "139\n3\n");
}

#[test]
fn adding_number_and_string_concatenates() {
    // A string on either side coerces the other operand.
    assert_eq!(run_ok("print 1 + \"x\";"), "1x\n");
    assert_eq!(run_ok("print \"x\" + 1;"), "x1\n");
    assert_eq!(
        runtime_error("print 1 + nil;"),
        "Operands must be two numbers or two strings."
    );
}

// -- Expressions and operators --

#[test]
fn comparison_and_equality() {
    assert_eq!(run_ok("print 1 < 2;"), "true\n");
    assert_eq!(run_ok("print 2 <= 2;"), "true\n");
    assert_eq!(run_ok("print 1 > 2;"), "false\n");
    assert_eq!(run_ok("print 1 != 2;"), "true\n");
    assert_eq!(run_ok("print nil == nil;"), "true\n");
    assert_eq!(run_ok("print nil == false;"), "false\n");
}

#[test]
fn bitwise_operators_truncate_to_integers() {
    assert_eq!(run_ok("print 6 & 3;"), "2\n");
    assert_eq!(run_ok("print 6 | 3;"), "7\n");
    assert_eq!(run_ok("print 6 ^ 3;"), "5\n");
    assert_eq!(run_ok("print 1 << 4;"), "16\n");
    assert_eq!(run_ok("print 32 >> 2;"), "8\n");
    assert_eq!(run_ok("print ~5;"), "-6\n");
}

#[test]
fn bitwise_precedence_sits_between_equality_and_comparison() {
    // a == b | c parses as a == (b | c).
    assert_eq!(run_ok("print 7 == 6 | 1;"), "true\n");
    // Shift binds tighter than comparison: 1 << 3 < 16 is (1 << 3) < 16.
    assert_eq!(run_ok("print 1 << 3 < 16;"), "true\n");
}

#[test]
fn short_circuit_keeps_the_deciding_operand() {
    assert_eq!(run_ok("print false and missing;"), "false\n");
    assert_eq!(run_ok("print true or missing;"), "true\n");
    assert_eq!(run_ok("print 1 and 2;"), "2\n");
    assert_eq!(run_ok("print 0 or 3;"), "3\n");
}

#[test]
fn unary_operators() {
    assert_eq!(run_ok("print -(3);"), "-3\n");
    assert_eq!(run_ok("print !true;"), "false\n");
    assert_eq!(run_ok("print !0;"), "true\n");
    assert_eq!(runtime_error("print -\"x\";"), "Operand must be a number.");
}

#[test]
fn division_produces_doubles() {
    assert_eq!(run_ok("print 7 / 2;"), "3.5\n");
}

// -- Statements, scopes, control flow --

#[test]
fn block_scoping_shadows_and_restores() {
    let out = run_ok(
        "var a = \"outer\";\n\
         { var a = \"inner\"; print a; }\n\
         print a;",
    );
    assert_eq!(out, "inner\nouter\n");
}

#[test]
fn while_loop_with_break_and_continue() {
    let out = run_ok(
        "var i = 0;\n\
         while (true) {\n\
           i = i + 1;\n\
           if (i == 2) continue;\n\
           if (i > 4) break;\n\
           print i;\n\
         }",
    );
    assert_eq!(out, "1\n3\n4\n");
}

#[test]
fn several_breaks_in_one_loop() {
    let out = run_ok(
        "var i = 0;\n\
         while (true) {\n\
           if (i == 3) break;\n\
           if (i > 10) break;\n\
           i = i + 1;\n\
         }\n\
         print i;",
    );
    assert_eq!(out, "3\n");
}

#[test]
fn break_discards_loop_locals() {
    let out = run_ok(
        "var r = \"\";\n\
         for (var i = 0; i < 5; i = i + 1) {\n\
           var tag = \"x\" + i;\n\
           if (i == 2) break;\n\
           r = r + tag;\n\
         }\n\
         print r;",
    );
    assert_eq!(out, "x0x1\n");
}

#[test]
fn if_without_else() {
    assert_eq!(run_ok("if (1 < 2) print \"yes\";"), "yes\n");
    assert_eq!(run_ok("if (2 < 1) print \"yes\";"), "");
}

// -- Functions and closures --

#[test]
fn plain_function_calls() {
    let out = run_ok("fun square(n) { return n * n; } print square(9);");
    assert_eq!(out, "81\n");
}

#[test]
fn functions_without_return_produce_nil() {
    assert_eq!(run_ok("fun f() {} print f();"), "nil\n");
}

#[test]
fn lambda_called_immediately() {
    assert_eq!(run_ok("print fun (a, b) { return a + b; }(2, 3);"), "5\n");
}

#[test]
fn lambda_stored_in_a_variable() {
    assert_eq!(run_ok("var twice = fun (n) { return 2 * n; }; print twice(21);"), "42\n");
}

#[test]
fn closures_see_later_writes_through_closed_upvalues() {
    let out = run_ok(
        "var f;\n\
         {\n\
           var x = 1;\n\
           fun g() { return x; }\n\
           x = 2;\n\
           f = g;\n\
         }\n\
         print f();",
    );
    assert_eq!(out, "2\n");
}

#[test]
fn recursion() {
    let out = run_ok(
        "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\n\
         print fib(10);",
    );
    assert_eq!(out, "55\n");
}

#[test]
fn calling_a_non_callable_fails() {
    assert_eq!(runtime_error("var x = 3; x();"), "Can only call functions and classes.");
}

// -- Classes --

#[test]
fn fields_round_trip() {
    let out = run_ok("class P {} var a = P(); a.x = 3; print a.x;");
    assert_eq!(out, "3\n");
}

#[test]
fn methods_bind_this() {
    let out = run_ok(
        "class Greeter {\n\
           init(name) { this.name = name; }\n\
           greet() { return \"hello \" + this.name; }\n\
         }\n\
         print Greeter(\"world\").greet();",
    );
    assert_eq!(out, "hello world\n");
}

#[test]
fn bound_methods_remember_their_receiver() {
    let out = run_ok(
        "class C { init() { this.v = 7; } get() { return this.v; } }\n\
         var m = C().get;\n\
         print m();",
    );
    assert_eq!(out, "7\n");
}

#[test]
fn initializer_returns_the_instance() {
    let out = run_ok(
        "class C { init() { this.v = 1; } }\n\
         var c = C();\n\
         print c.v;",
    );
    assert_eq!(out, "1\n");
}

#[test]
fn constructor_arity_is_checked() {
    assert_eq!(
        runtime_error("class C {} C(1);"),
        "Expected 0 arguments to constructor but got 1."
    );
    assert_eq!(
        runtime_error("class C { init(a) {} } C();"),
        "Expected 1 arguments but got 0"
    );
}

#[test]
fn subclass_inherits_methods_by_copy() {
    let out = run_ok(
        "class A { m() { return \"A\"; } }\n\
         class B < A {}\n\
         print B().m();",
    );
    assert_eq!(out, "A\n");
}

#[test]
fn subclass_overrides_inherited_methods() {
    let out = run_ok(
        "class A { m() { return \"A\"; } }\n\
         class B < A { m() { return \"B\"; } }\n\
         print B().m();\n\
         print A().m();",
    );
    assert_eq!(out, "B\nA\n");
}

#[test]
fn subclass_overrides_init() {
    let out = run_ok(
        "class A { init() { this.v = \"A\"; } }\n\
         class B < A { init() { this.v = \"B\"; } }\n\
         print B().v;",
    );
    assert_eq!(out, "B\n");
}

#[test]
fn fields_shadow_methods_in_invocations() {
    let out = run_ok(
        "class C { m() { return \"method\"; } }\n\
         var c = C();\n\
         c.m = fun () { return \"field\"; };\n\
         print c.m();",
    );
    assert_eq!(out, "field\n");
}

#[test]
fn inheriting_from_a_non_class_fails() {
    assert_eq!(runtime_error("var NotAClass = 3; class B < NotAClass {}"), "Superclass must be a class.");
}

#[test]
fn unknown_property_reports_both_names() {
    // The instance rendering embeds its heap handle, so match around it.
    let msg = runtime_error("class C {} C().missing;");
    assert!(msg.starts_with("Undefined property 'missing' of '<C instance at 0x"), "{}", msg);
    let msg = runtime_error("class C { m() {} } C().absent();");
    assert!(msg.starts_with("Undefined property 'absent' of '<C instance at 0x"), "{}", msg);
}

#[test]
fn property_access_on_non_instances_fails() {
    assert_eq!(runtime_error("print 4.x;"), "Only instances have properties.");
    assert_eq!(runtime_error("var s = \"s\"; s.x = 1;"), "Only instances have fields.");
    assert_eq!(runtime_error("true.m();"), "Only instances have methods.");
}

// -- Arrays and subscripts --

#[test]
fn array_out_of_range_is_a_runtime_error() {
    assert_eq!(runtime_error("var a = [1, 2]; print a[2];"), "Array index out of range.");
    assert_eq!(runtime_error("var a = [1, 2]; a[5] = 1;"), "Array index out of range.");
    assert_eq!(runtime_error("var a = [1]; print a[0 - 1];"), "Array index out of range.");
}

#[test]
fn string_subscripts_yield_single_characters() {
    assert_eq!(run_ok("var s = \"abc\"; print s[1];"), "b\n");
    assert_eq!(runtime_error("var s = \"abc\"; print s[3];"), "String index out of range.");
}

#[test]
fn subscript_assignment_is_an_expression() {
    assert_eq!(run_ok("var a = [1]; print a[0] = 5;"), "5\n");
}

#[test]
fn multi_index_subscripts_are_rejected_at_runtime() {
    assert_eq!(runtime_error("var a = [[1]]; print a[0, 0];"), "Subscripts take a single index.");
}

#[test]
fn subscripting_non_collections_fails() {
    assert_eq!(
        runtime_error("var n = 4; print n[0];"),
        "Only arrays and strings can be subscripted."
    );
    assert_eq!(
        runtime_error("var s = \"abc\"; s[0] = \"x\";"),
        "Only arrays support subscript assignment."
    );
}

#[test]
fn nested_array_literals() {
    assert_eq!(run_ok("var m = [[1, 2], [3, 4]]; print m[1][0];"), "3\n");
}

// -- Natives --

#[test]
fn to_string_and_get_type_name() {
    assert_eq!(run_ok("print toString(12);"), "12\n");
    assert_eq!(run_ok("print toString(true);"), "true\n");
    assert_eq!(run_ok("print toString(nil);"), "nil\n");
    assert_eq!(run_ok("print getTypeName(1);"), "number\n");
    assert_eq!(run_ok("print getTypeName(false);"), "boolean\n");
    assert_eq!(run_ok("print getTypeName(nil);"), "nil\n");
    assert_eq!(run_ok("print getTypeName(\"s\");"), "string\n");
    assert_eq!(run_ok("print getTypeName([1]);"), "array\n");
    assert_eq!(run_ok("fun f() {} print getTypeName(f);"), "closure\n");
    assert_eq!(run_ok("print getTypeName(clock);"), "native\n");
}

#[test]
fn get_type_name_of_an_instance_is_its_class() {
    assert_eq!(run_ok("class Widget {} print getTypeName(Widget());"), "Widget\n");
}

#[test]
fn to_string_of_get_type_name_is_idempotent() {
    assert_eq!(run_ok("print toString(getTypeName(1)) == getTypeName(1);"), "true\n");
}

#[test]
fn has_get_set_on_instances() {
    let out = run_ok(
        "class C {}\n\
         var c = C();\n\
         print has(c, \"x\");\n\
         set(c, \"x\", 9);\n\
         print has(c, \"x\");\n\
         print get(c, \"x\");\n\
         print c.x;",
    );
    assert_eq!(out, "false\ntrue\n9\n9\n");
}

#[test]
fn has_is_silently_false_for_odd_inputs() {
    assert_eq!(run_ok("print has(3, \"x\");"), "false\n");
    assert_eq!(run_ok("class C {} print has(C(), 7);"), "false\n");
}

#[test]
fn set_requires_an_instance() {
    assert_eq!(runtime_error("set(3, \"x\", 1);"), "Only instances have fields.");
}

#[test]
fn size_of_strings_and_arrays() {
    assert_eq!(run_ok("print size(\"hello\");"), "5\n");
    assert_eq!(run_ok("print size([]);"), "0\n");
    assert_eq!(runtime_error("print size(3);"), "Expected a string or array.");
}

#[test]
fn clock_is_a_non_negative_number() {
    assert_eq!(run_ok("print clock() >= 0;"), "true\n");
}

#[test]
fn native_arity_is_checked() {
    assert_eq!(runtime_error("size();"), "Expected 1 arguments but got 0");
}

// -- Stringification --

#[test]
fn value_representations() {
    assert_eq!(run_ok("fun f() {} print f;"), "<fun f>\n");
    assert_eq!(run_ok("class C {} print C;"), "<class C>\n");
    assert_eq!(run_ok("print clock;"), "<native fun>\n");
    assert_eq!(run_ok("print [1, 2];"), "<array of length 2>\n");
}

// -- Compile diagnostics --

#[test]
fn compile_error_format() {
    let diags = compile_error("print 1");
    assert_eq!(diags, vec!["[line 1] Error at end: Expect ';' after value."]);
}

#[test]
fn lexical_errors_become_compile_errors() {
    let diags = compile_error("var s = \"unterminated");
    assert_eq!(diags, vec!["[line 1] Error: Unterminated string."]);
    let diags = compile_error("var a = 1 # 2;");
    assert_eq!(diags, vec!["[line 1] Error: Unexpected character."]);
}

#[test]
fn multiple_errors_surface_after_synchronization() {
    let diags = compile_error("var 1 = 2;\nvar 3 = 4;\n");
    assert_eq!(diags.len(), 2);
    assert!(diags[0].starts_with("[line 1]"));
    assert!(diags[1].starts_with("[line 2]"));
}

// -- Boundaries --

#[test]
fn deep_but_bounded_recursion_is_fine() {
    let out = run_ok(
        "fun down(n) { if (n == 0) return 0; return down(n - 1); }\n\
         print down(200);",
    );
    assert_eq!(out, "0\n");
}

#[test]
fn many_globals_use_long_constant_forms() {
    let mut src = String::new();
    for i in 0..300 {
        writeln!(src, "var g{} = {};", i, i).unwrap();
    }
    let mut total = String::from("var total = 0;\n");
    for i in 0..300 {
        writeln!(total, "total = total + g{};", i).unwrap();
    }
    src.push_str(&total);
    src.push_str("print total;");
    assert_eq!(run_ok(&src), format!("{}\n", (0..300).sum::<i32>()));
}

#[test]
fn long_string_constants_round_trip() {
    // Push past 256 pool entries so string loads use the long form too.
    let mut src = String::new();
    for i in 0..260 {
        writeln!(src, "var s{} = \"str-{}\";", i, i).unwrap();
    }
    src.push_str("print s259;");
    assert_eq!(run_ok(&src), "str-259\n");
}
