// Integration tests driving the whole pipeline — lex, compile, execute —
// against the public library API, following the teacher's
// `tests/interpreter_tests.rs` pattern of a small `run_code` helper plus
// one `#[test]` per scenario asserting on captured output.

use loxvm::errors::LoxError;
use loxvm::vm::VM;

fn run(source: &str) -> String {
    let mut vm = VM::new();
    let mut out = Vec::new();
    vm.interpret(source, &mut out).expect("program should run without error");
    String::from_utf8(out).expect("program output should be valid UTF-8")
}

fn run_err(source: &str) -> LoxError {
    let mut vm = VM::new();
    let mut out = Vec::new();
    vm.interpret(source, &mut out).expect_err("program should fail")
}

// ---- §8 end-to-end scenarios ---------------------------------------

#[test]
fn scenario_1_arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn scenario_2_string_interning_equality() {
    assert_eq!(run("var a = \"foo\"; var b = \"foo\"; print a == b;"), "true\n");
}

#[test]
fn scenario_3_recursive_factorial() {
    let source = "fun fact(n){ if (n<=1) return 1; return n*fact(n-1); } print fact(5);";
    assert_eq!(run(source), "120\n");
}

#[test]
fn scenario_4_closure_capture() {
    let source = "
        fun makeCounter(){ var i=0; fun c(){ i=i+1; return i;} return c;}
        var c = makeCounter(); print c(); print c(); print c();
    ";
    assert_eq!(run(source), "1\n2\n3\n");
}

#[test]
fn scenario_5_upvalue_closes_after_enclosing_return() {
    let source = "
        fun outer(){ var x=10; fun inner(){ return x; } return inner; }
        print outer()();
    ";
    assert_eq!(run(source), "10\n");
}

#[test]
fn scenario_6_short_circuit_avoids_runtime_error() {
    assert_eq!(run("print false and (1/0); print true or (1/0);"), "false\ntrue\n");
}

#[test]
fn scenario_7_negate_non_number_is_runtime_error() {
    match run_err("-\"a\";") {
        LoxError::Runtime { message, .. } => assert_eq!(message, "Operand must be a number."),
        LoxError::Compile(_) => panic!("expected a runtime error, not a compile error"),
    }
}

// ---- boundary behaviors ---------------------------------------------

#[test]
fn uninitialized_var_is_nil() {
    assert_eq!(run("var x; print x;"), "nil\n");
}

#[test]
fn string_concatenation_interns_the_result() {
    assert_eq!(run("print \"a\" + \"b\" + \"c\" == \"abc\";"), "true\n");
}

#[test]
fn recursion_up_to_the_frame_capacity_is_permitted() {
    // The implicit script frame occupies slot 0, leaving 63 nested calls
    // (frames 1..=63) before the 64-frame capacity is exhausted.
    let source = "
        fun rec(n) { if (n == 0) return 0; return rec(n - 1); }
        print rec(62);
    ";
    assert_eq!(run(source), "0\n");
}

#[test]
fn recursion_past_the_frame_capacity_overflows() {
    let source = "
        fun rec(n) { if (n == 0) return 0; return rec(n - 1); }
        print rec(63);
    ";
    match run_err(source) {
        LoxError::Runtime { message, .. } => assert_eq!(message, "Stack overflow."),
        LoxError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn too_many_constants_in_one_chunk_is_a_compile_error() {
    let mut source = String::new();
    for i in 0..257 {
        source.push_str(&format!("print {i};\n"));
    }
    match run_err(&source) {
        LoxError::Compile(diagnostics) => {
            assert!(diagnostics.iter().any(|d| d.message.contains("Too many constants")));
        }
        LoxError::Runtime { .. } => panic!("expected a compile error"),
    }
}

// ---- invariants / error classes --------------------------------------

#[test]
fn undefined_global_read_is_a_runtime_error() {
    match run_err("print nope;") {
        LoxError::Runtime { message, .. } => assert!(message.contains("Undefined variable 'nope'")),
        LoxError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn assigning_to_an_undefined_global_is_a_runtime_error_and_leaves_it_undefined() {
    let mut vm = VM::new();
    let mut out = Vec::new();
    let err = vm.interpret("x = 1;", &mut out).unwrap_err();
    match err {
        LoxError::Runtime { message, .. } => assert!(message.contains("Undefined variable 'x'")),
        LoxError::Compile(_) => panic!("expected a runtime error"),
    }
    // a later read must still see it as undefined, not as 1
    let mut out2 = Vec::new();
    let err2 = vm.interpret("print x;", &mut out2).unwrap_err();
    assert!(matches!(err2, LoxError::Runtime { .. }));
}

#[test]
fn calling_a_non_function_is_a_runtime_error() {
    match run_err("var x = 1; x();") {
        LoxError::Runtime { message, .. } => assert!(message.contains("Can only call functions")),
        LoxError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn wrong_arity_is_a_runtime_error() {
    match run_err("fun f(a, b) { return a + b; } f(1);") {
        LoxError::Runtime { message, .. } => assert!(message.contains("Expected 2 arguments but got 1")),
        LoxError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn adding_number_and_string_is_a_runtime_error() {
    match run_err("print 1 + \"a\";") {
        LoxError::Runtime { message, .. } => assert_eq!(message, "Operands must be two numbers or two strings."),
        LoxError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn runtime_error_trace_names_the_failing_function() {
    let source = "fun boom() { return 1 + \"a\"; } boom();";
    match run_err(source) {
        LoxError::Runtime { trace, .. } => {
            assert!(trace.iter().any(|line| line.contains("in boom")));
        }
        LoxError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn return_from_top_level_is_a_compile_error() {
    match run_err("return 1;") {
        LoxError::Compile(diagnostics) => {
            assert!(diagnostics.iter().any(|d| d.message.contains("Can't return from top-level code")));
        }
        LoxError::Runtime { .. } => panic!("expected a compile error"),
    }
}

#[test]
fn invalid_assignment_target_is_a_compile_error() {
    match run_err("1 + 2 = 3;") {
        LoxError::Compile(diagnostics) => {
            assert!(diagnostics.iter().any(|d| d.message.contains("Invalid assignment target")));
        }
        LoxError::Runtime { .. } => panic!("expected a compile error"),
    }
}

// ---- while / for loops -----------------------------------------------

#[test]
fn while_loop_counts_up() {
    let source = "var i = 0; while (i < 3) { print i; i = i + 1; }";
    assert_eq!(run(source), "0\n1\n2\n");
}

#[test]
fn for_loop_with_all_three_clauses() {
    let source = "for (var i = 0; i < 3; i = i + 1) { print i; }";
    assert_eq!(run(source), "0\n1\n2\n");
}

#[test]
fn for_loop_without_initializer_or_increment() {
    let source = "var i = 0; for (; i < 2; ) { print i; i = i + 1; }";
    assert_eq!(run(source), "0\n1\n");
}

// ---- closures / upvalues shared between two closures -----------------

#[test]
fn two_closures_share_the_same_open_upvalue() {
    let source = "
        fun pair() {
            var shared = 0;
            fun get() { return shared; }
            fun inc() { shared = shared + 1; return get(); }
            return inc;
        }
        var inc = pair();
        print inc();
        print inc();
    ";
    assert_eq!(run(source), "1\n2\n");
}

// ---- native function registration -------------------------------------

#[test]
fn clock_native_is_callable_with_zero_arguments() {
    assert_eq!(run("print clock() >= 0;"), "true\n");
}

#[test]
fn clock_native_rejects_arguments() {
    match run_err("clock(1);") {
        LoxError::Runtime { message, .. } => assert!(message.contains("Expected 0 arguments but got 1")),
        LoxError::Compile(_) => panic!("expected a runtime error"),
    }
}

// ---- VM state persists across interpret() calls on one instance -------

#[test]
fn globals_persist_across_successive_interpret_calls() {
    let mut vm = VM::new();
    let mut out = Vec::new();
    vm.interpret("var counter = 0; fun bump() { counter = counter + 1; }", &mut out).unwrap();
    vm.interpret("bump(); bump();", &mut out).unwrap();
    vm.interpret("print counter;", &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "2\n");
}
