// File: src/vm.rs
//
// Fetch-decode-execute loop over call frames. Grounded on the teacher's
// `src/vm.rs` for overall struct shape (value stack, call frames, globals,
// a dispatch loop driven by a growing match) but rebuilt around the
// byte-packed `Chunk`/`OpCode` this crate's compiler actually emits,
// since the teacher dispatches over a high-level `OpCode` enum tied to a
// tree-walking `Interpreter` this crate has no equivalent of. None of the
// teacher's JIT threshold, inline caches, or async machinery survives;
// the fetch-decode-execute contract instead follows
// `examples/original_source/clox/vm.c` / `examples/original_source/vm.c`.

use crate::chunk::OpCode;
use crate::compiler;
use crate::errors::LoxError;
use crate::gc;
use crate::table::Table;
use crate::value::{fnv1a_hash, Heap, NativeFn, Obj, ObjClosure, ObjHandle, ObjNative, ObjString, ObjUpvalue, Value};
use std::io::Write;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Per-invocation record: which closure is running, where in its chunk,
/// and where on the value stack its locals (slot 0 = the callee) begin.
struct CallFrame {
    closure: ObjHandle,
    ip: usize,
    slot_base: usize,
}

/// Owns every mutable piece of interpreter state: the value stack, call
/// frames, the open-upvalue list, the globals table, the string intern
/// table, and the heap they all point into. Not a process-global — the
/// caller (`main.rs`/`repl.rs`) owns an instance and threads it through
/// successive `interpret` calls so a REPL session keeps its globals.
pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Sorted strictly by descending stack slot; see `capture_upvalue`.
    open_upvalues: Vec<ObjHandle>,
    pub globals: Table,
    pub strings: Table,
    pub heap: Heap,
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl VM {
    pub fn new() -> Self {
        let mut vm = VM {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            globals: Table::new(),
            strings: Table::new(),
            heap: Heap::new(),
        };
        vm.define_native("clock", native_clock, Some(0));
        vm
    }

    /// Interns `name` and installs an `ObjNative` in `globals`, per the
    /// registration contract the spec's Design Notes leave implied.
    pub fn define_native(&mut self, name: &str, function: NativeFn, arity: Option<u8>) {
        let name_handle = self.intern_string(name);
        let native_handle = self.heap.alloc(Obj::Native(ObjNative { name: name_handle, arity, function }));
        self.globals.set(name_handle, Value::Obj(native_handle), &self.heap);
    }

    /// Compile `source`, then run it. Compile errors never reach `run` —
    /// a failed compilation hands back no function to execute.
    pub fn interpret(&mut self, source: &str, out: &mut dyn Write) -> Result<(), LoxError> {
        let function = compiler::compile(source, &mut self.heap, &mut self.strings).map_err(LoxError::Compile)?;
        let function_handle = self.heap.alloc(Obj::Function(function));
        self.push(Value::Obj(function_handle));
        let closure_handle = self.heap.alloc(Obj::Closure(ObjClosure { function: function_handle, upvalues: Vec::new() }));
        self.pop();
        self.push(Value::Obj(closure_handle));
        if let Err(message) = self.call(closure_handle, 0) {
            return Err(self.runtime_error(message));
        }
        self.run(out)
    }

    fn run(&mut self, out: &mut dyn Write) -> Result<(), LoxError> {
        loop {
            let instruction = self.read_byte();
            match OpCode::from_byte(instruction) {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_constant().as_obj().expect("global name must be a string constant");
                    match self.globals.get(name, &self.heap) {
                        Some(value) => self.push(value),
                        None => {
                            let message = format!("Undefined variable '{}'.", self.heap.as_str(name));
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_constant().as_obj().expect("global name must be a string constant");
                    let value = self.peek(0);
                    self.globals.set(name, value, &self.heap);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_constant().as_obj().expect("global name must be a string constant");
                    let value = self.peek(0);
                    if self.globals.set(name, value, &self.heap) {
                        // `set` returning true means this created a new
                        // entry, i.e. the global did not already exist —
                        // undo the insert so the absent state is preserved.
                        self.globals.delete(name, &self.heap);
                        let message = format!("Undefined variable '{}'.", self.heap.as_str(name));
                        return Err(self.runtime_error(message));
                    }
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.current_upvalue(index);
                    self.push(self.read_upvalue(upvalue));
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.current_upvalue(index);
                    let value = self.peek(0);
                    self.write_upvalue(upvalue, value);
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(Value::values_equal(a, b)));
                }
                OpCode::Greater => self.binary_numeric(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_numeric(|a, b| Value::Bool(a < b))?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_numeric(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_numeric(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_numeric(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                },
                OpCode::Print => {
                    let value = self.pop();
                    let rendered = self.format_value(value);
                    let _ = writeln!(out, "{rendered}");
                }
                OpCode::Jump => {
                    let offset = self.read_short();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    if let Err(message) = self.call_value(callee, argc) {
                        return Err(self.runtime_error(message));
                    }
                }
                OpCode::Closure => {
                    let function_handle = self.read_constant().as_obj().expect("closure operand must be a function constant");
                    let upvalue_count = match self.heap.get(function_handle) {
                        Obj::Function(f) => f.upvalue_count,
                        _ => unreachable!("closure operand did not name a function"),
                    };
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.frames.last().unwrap().slot_base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            upvalues.push(self.current_upvalue(index));
                        }
                    }
                    self.maybe_collect();
                    let closure_handle = self.heap.alloc(Obj::Closure(ObjClosure { function: function_handle, upvalues }));
                    self.push(Value::Obj(closure_handle));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slot_base = self.frames.last().unwrap().slot_base;
                    self.close_upvalues(slot_base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(slot_base);
                    self.push(result);
                }
            }
        }
    }

    // ---- fetch helpers --------------------------------------------------

    fn current_chunk_byte(&self, ip: usize) -> u8 {
        let closure = self.frames.last().unwrap().closure;
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("call frame closure handle did not name a closure"),
        };
        match self.heap.get(function) {
            Obj::Function(f) => f.chunk.code[ip],
            _ => unreachable!("closure function handle did not name a function"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let ip = frame.ip;
        frame.ip += 1;
        self.current_chunk_byte(ip)
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        ((hi as u16) << 8) | lo as u16
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte();
        let closure = self.frames.last().unwrap().closure;
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("call frame closure handle did not name a closure"),
        };
        match self.heap.get(function) {
            Obj::Function(f) => f.chunk.constants[index as usize],
            _ => unreachable!("closure function handle did not name a function"),
        }
    }

    fn current_upvalue(&self, index: usize) -> ObjHandle {
        let closure = self.frames.last().unwrap().closure;
        match self.heap.get(closure) {
            Obj::Closure(c) => c.upvalues[index],
            _ => unreachable!("call frame closure handle did not name a closure"),
        }
    }

    fn read_upvalue(&self, handle: ObjHandle) -> Value {
        match self.heap.get(handle) {
            Obj::Upvalue(u) => match u.slot {
                Some(slot) => self.stack[slot],
                None => u.closed,
            },
            _ => unreachable!("upvalue handle did not name an upvalue"),
        }
    }

    fn write_upvalue(&mut self, handle: ObjHandle, value: Value) {
        let slot = match self.heap.get(handle) {
            Obj::Upvalue(u) => u.slot,
            _ => unreachable!("upvalue handle did not name an upvalue"),
        };
        match slot {
            Some(slot) => self.stack[slot] = value,
            None => match self.heap.get_mut(handle) {
                Obj::Upvalue(u) => u.closed = value,
                _ => unreachable!(),
            },
        }
    }

    // ---- stack ------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: VM popped past the bottom of the value stack")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- arithmetic / equality ----------------------------------------

    fn binary_numeric(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<(), LoxError> {
        let (a, b) = match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => (a, b),
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        self.pop();
        self.pop();
        self.push(op(a, b));
        Ok(())
    }

    fn add(&mut self) -> Result<(), LoxError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                Ok(())
            }
            (Value::Obj(ha), Value::Obj(hb)) if self.is_string(ha) && self.is_string(hb) => {
                let mut concatenated = self.heap.as_str(ha).to_string();
                concatenated.push_str(self.heap.as_str(hb));
                self.pop();
                self.pop();
                let handle = self.intern_string(&concatenated);
                self.push(Value::Obj(handle));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    fn is_string(&self, handle: ObjHandle) -> bool {
        matches!(self.heap.get(handle), Obj::String(_))
    }

    // ---- calls ----------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), String> {
        match callee {
            Value::Obj(handle) => match self.heap.get(handle) {
                Obj::Closure(_) => self.call(handle, argc),
                Obj::Native(_) => self.call_native(handle, argc),
                _ => Err("Can only call functions.".to_string()),
            },
            _ => Err("Can only call functions.".to_string()),
        }
    }

    fn call(&mut self, closure_handle: ObjHandle, argc: u8) -> Result<(), String> {
        let function_handle = match self.heap.get(closure_handle) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("call target handle did not name a closure"),
        };
        let arity = match self.heap.get(function_handle) {
            Obj::Function(f) => f.arity,
            _ => unreachable!("closure function handle did not name a function"),
        };
        if argc != arity {
            return Err(format!("Expected {arity} arguments but got {argc}."));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        let slot_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure: closure_handle, ip: 0, slot_base });
        Ok(())
    }

    fn call_native(&mut self, native_handle: ObjHandle, argc: u8) -> Result<(), String> {
        let (arity, function) = match self.heap.get(native_handle) {
            Obj::Native(n) => (n.arity, n.function),
            _ => unreachable!("native call target handle did not name a native"),
        };
        if let Some(expected) = arity {
            if argc != expected {
                return Err(format!("Expected {expected} arguments but got {argc}."));
            }
        }
        let args_start = self.stack.len() - argc as usize;
        let args: Vec<Value> = self.stack[args_start..].to_vec();
        let result = function(&args)?;
        self.stack.truncate(args_start - 1);
        self.push(result);
        Ok(())
    }

    // ---- upvalues ---------------------------------------------------

    /// Walk the descending open-upvalue list for a node at `slot`,
    /// returning it if already open (shared capture across closures), or
    /// splicing in a fresh one at the position that keeps the list
    /// sorted.
    fn capture_upvalue(&mut self, slot: usize) -> ObjHandle {
        let mut insert_at = self.open_upvalues.len();
        for (i, &handle) in self.open_upvalues.iter().enumerate() {
            let existing_slot = match self.heap.get(handle) {
                Obj::Upvalue(u) => u.slot.expect("open_upvalues must only hold open upvalues"),
                _ => unreachable!(),
            };
            if existing_slot == slot {
                return handle;
            }
            if existing_slot < slot {
                insert_at = i;
                break;
            }
        }
        let handle = self.heap.alloc(Obj::Upvalue(ObjUpvalue::new_open(slot)));
        self.open_upvalues.insert(insert_at, handle);
        handle
    }

    /// Close every open upvalue at or above `from_slot`: copy the live
    /// stack value into the upvalue's own storage and unlink it, since
    /// the stack slot it named is about to go away (scope end or return).
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&handle) = self.open_upvalues.first() {
            let slot = match self.heap.get(handle) {
                Obj::Upvalue(u) => u.slot.expect("open_upvalues must only hold open upvalues"),
                _ => unreachable!(),
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            match self.heap.get_mut(handle) {
                Obj::Upvalue(u) => {
                    u.closed = value;
                    u.slot = None;
                }
                _ => unreachable!(),
            }
            self.open_upvalues.remove(0);
        }
    }

    // ---- strings / gc -------------------------------------------------

    fn intern_string(&mut self, s: &str) -> ObjHandle {
        let hash = fnv1a_hash(s.as_bytes());
        if let Some(existing) = self.strings.find_string(s, hash, &self.heap) {
            return existing;
        }
        self.maybe_collect();
        let handle = self.heap.alloc(Obj::String(ObjString::new(s.to_string())));
        self.strings.set(handle, Value::Nil, &self.heap);
        handle
    }

    /// Roots the stack, every frame's closure, every open upvalue, and
    /// every globals entry, per the spec's root contribution list.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let mut roots = gc::Roots::new();
        for &value in &self.stack {
            roots.push_value(value);
        }
        for frame in &self.frames {
            roots.push_handle(frame.closure);
        }
        for &handle in &self.open_upvalues {
            roots.push_handle(handle);
        }
        for (key, value) in self.globals.iter() {
            roots.push_handle(key);
            roots.push_value(value);
        }
        gc::collect_garbage(&mut self.heap, &mut self.strings, roots);
    }

    // ---- diagnostics --------------------------------------------------

    fn format_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Obj(handle) => match self.heap.get(handle) {
                Obj::String(s) => s.chars.to_string(),
                Obj::Native(_) => "<native fn>".to_string(),
                Obj::Function(f) => self.format_function_name(f.name),
                Obj::Closure(c) => {
                    let name = match self.heap.get(c.function) {
                        Obj::Function(f) => f.name,
                        _ => unreachable!(),
                    };
                    self.format_function_name(name)
                }
                Obj::Upvalue(_) => "<upvalue>".to_string(),
            },
        }
    }

    fn format_function_name(&self, name: Option<ObjHandle>) -> String {
        match name {
            Some(handle) => format!("<fn {}>", self.heap.as_str(handle)),
            None => "<script>".to_string(),
        }
    }

    /// Unwinds every live frame into a `[line L] in <name>` trace (clox's
    /// `runtimeError`), then resets the stack — a runtime error aborts
    /// the whole `interpret` call, so no partial state should carry over.
    fn runtime_error(&mut self, message: impl Into<String>) -> LoxError {
        let message = message.into();
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function_handle = match self.heap.get(frame.closure) {
                Obj::Closure(c) => c.function,
                _ => unreachable!(),
            };
            let (name, line) = match self.heap.get(function_handle) {
                Obj::Function(f) => {
                    let line = f.chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(0);
                    let name = f.name.map(|h| self.heap.as_str(h).to_string()).unwrap_or_else(|| "script".to_string());
                    (name, line)
                }
                _ => unreachable!(),
            };
            trace.push(format!("[line {line}] in {name}"));
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        LoxError::runtime(message, trace)
    }
}

fn native_clock(_args: &[Value]) -> Result<Value, String> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    Ok(Value::Number(elapsed.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> String {
        let mut vm = VM::new();
        let mut out = Vec::new();
        vm.interpret(source, &mut out).expect("program should run without error");
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run("print 1 + 2 * 3;"), "7\n");
    }

    #[test]
    fn string_interning_equality() {
        assert_eq!(run("var a = \"foo\"; var b = \"foo\"; print a == b;"), "true\n");
    }

    #[test]
    fn recursive_function_call() {
        let source = "fun fact(n) { if (n <= 1) return 1; return n * fact(n - 1); } print fact(5);";
        assert_eq!(run(source), "120\n");
    }

    #[test]
    fn closure_capture_across_calls() {
        let source = "fun makeCounter() { var i = 0; fun c() { i = i + 1; return i; } return c; } \
                       var c = makeCounter(); print c(); print c(); print c();";
        assert_eq!(run(source), "1\n2\n3\n");
    }

    #[test]
    fn upvalue_survives_enclosing_return() {
        let source = "fun outer() { var x = 10; fun inner() { return x; } return inner; } print outer()();";
        assert_eq!(run(source), "10\n");
    }

    #[test]
    fn and_or_short_circuit_without_runtime_error() {
        assert_eq!(run("print false and (1/0); print true or (1/0);"), "false\ntrue\n");
    }

    #[test]
    fn negating_a_string_is_a_runtime_error() {
        let mut vm = VM::new();
        let mut out = Vec::new();
        let err = vm.interpret("-\"a\";", &mut out).unwrap_err();
        match err {
            LoxError::Runtime { message, .. } => assert_eq!(message, "Operand must be a number."),
            LoxError::Compile(_) => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn uninitialized_global_prints_nil() {
        assert_eq!(run("var x; print x;"), "nil\n");
    }

    #[test]
    fn undefined_global_read_is_a_runtime_error() {
        let mut vm = VM::new();
        let mut out = Vec::new();
        let err = vm.interpret("print nope;", &mut out).unwrap_err();
        match err {
            LoxError::Runtime { message, .. } => assert!(message.contains("Undefined variable 'nope'")),
            LoxError::Compile(_) => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn stack_overflow_on_unbounded_recursion() {
        let mut vm = VM::new();
        let mut out = Vec::new();
        let err = vm.interpret("fun rec() { return rec(); } rec();", &mut out).unwrap_err();
        match err {
            LoxError::Runtime { message, .. } => assert_eq!(message, "Stack overflow."),
            LoxError::Compile(_) => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn globals_persist_across_interpret_calls_on_the_same_vm() {
        let mut vm = VM::new();
        let mut out = Vec::new();
        vm.interpret("var x = 1;", &mut out).unwrap();
        vm.interpret("print x;", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1\n");
    }
}
