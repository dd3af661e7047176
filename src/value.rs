// File: src/value.rs
//
// Runtime value representation and heap object model for the Lox VM.
// Values are a small tagged union; anything heap-allocated (strings,
// functions, closures, upvalues, natives) lives in the `Heap` arena and is
// referred to everywhere else by a plain `ObjHandle` index rather than a
// pointer, so the collector can move nothing and free safely.

use crate::chunk::Chunk;
use std::fmt;

/// Index into `Heap::slots`. Stable for the lifetime of the object it
/// names: a handle is only ever read after its referent has been freed if
/// nothing still roots it, and anything that still roots it kept it
/// marked through the last collection.
pub type ObjHandle = usize;

/// A Lox value. Copy because every variant is either a primitive or a
/// handle into the heap, never owned heap data itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(ObjHandle),
}

impl Value {
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<ObjHandle> {
        match self {
            Value::Obj(h) => Some(*h),
            _ => None,
        }
    }

    /// Equality per the spec: same tag, primitives compare by `==`,
    /// objects compare by heap identity (which equals content equality
    /// for strings, guaranteed by interning).
    pub fn values_equal(a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Obj(x), Value::Obj(y)) => x == y,
            _ => false,
        }
    }
}

/// Common heap object kinds. No `class`/`instance` variant: methods,
/// inheritance, and `super` are out of scope.
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native function",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
        }
    }
}

/// Immutable byte sequence plus a cached FNV-1a hash. Interning guarantees
/// no two live `ObjString`s ever hold equal contents.
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

impl ObjString {
    pub fn new(chars: String) -> Self {
        let hash = fnv1a_hash(chars.as_bytes());
        ObjString { chars: chars.into_boxed_str(), hash }
    }
}

/// Compiled code for a function. Not callable directly — the VM always
/// wraps it in an `ObjClosure` at runtime via `OP_CLOSURE`.
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` for the implicit top-level script function.
    pub name: Option<ObjHandle>,
}

impl ObjFunction {
    pub fn new() -> Self {
        ObjFunction { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name: None }
    }
}

pub type NativeFn = fn(args: &[Value]) -> Result<Value, String>;

/// A native (built-in) function: no upvalues, no chunk, called directly
/// by the VM's `callValue`.
pub struct ObjNative {
    pub name: ObjHandle,
    pub arity: Option<u8>,
    pub function: NativeFn,
}

/// A function paired with its captured upvalues. Created at runtime by
/// `OP_CLOSURE`; `upvalues.len() == function.upvalue_count`.
pub struct ObjClosure {
    pub function: ObjHandle,
    pub upvalues: Vec<ObjHandle>,
}

/// A captured variable. Open while the owning stack slot is still live;
/// closed once that slot goes out of scope, at which point the value is
/// copied into `closed` and reads/writes redirect there.
pub struct ObjUpvalue {
    /// `Some(index)` into the VM's value stack while open.
    pub slot: Option<usize>,
    pub closed: Value,
}

impl ObjUpvalue {
    pub fn new_open(slot: usize) -> Self {
        ObjUpvalue { slot: Some(slot), closed: Value::Nil }
    }

    pub fn is_open(&self) -> bool {
        self.slot.is_some()
    }
}

struct Slot {
    object: Obj,
    marked: bool,
}

/// Non-moving arena that owns every heap object. A freed slot's index is
/// recycled, which is safe precisely because the mark-sweep invariant
/// guarantees no live handle ever points at something collected: whatever
/// still references a handle kept it marked through the last sweep.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    /// Approximate bytes live on the heap, used to drive GC triggering.
    pub bytes_allocated: usize,
    pub next_gc: usize,
}

const DEFAULT_NEXT_GC: usize = 1024 * 1024;

/// Rough per-object heap cost, used only to drive the GC growth trigger.
/// Does not need to be exact — clox's own byte accounting is likewise an
/// approximation of true allocator overhead.
fn approx_size(obj: &Obj) -> usize {
    use std::mem::size_of;
    match obj {
        Obj::String(s) => size_of::<ObjString>() + s.chars.len(),
        Obj::Function(f) => size_of::<ObjFunction>() + f.chunk.code.len() + f.chunk.constants.len() * size_of::<Value>(),
        Obj::Native(_) => size_of::<ObjNative>(),
        Obj::Closure(c) => size_of::<ObjClosure>() + c.upvalues.len() * size_of::<ObjHandle>(),
        Obj::Upvalue(_) => size_of::<ObjUpvalue>(),
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: DEFAULT_NEXT_GC,
        }
    }

    /// Allocate `obj` and return its handle. Only updates bookkeeping;
    /// callers that might subsequently trigger a collection (table
    /// growth, nested allocation) must protect the new handle by pushing
    /// it onto the VM stack (or a chunk's constant pool) before anything
    /// else can allocate.
    pub fn alloc(&mut self, obj: Obj) -> ObjHandle {
        self.bytes_allocated += approx_size(&obj);
        let slot = Slot { object: obj, marked: false };
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(slot);
            index
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    pub fn get(&self, handle: ObjHandle) -> &Obj {
        self.slots[handle].as_ref().map(|s| &s.object).expect("dangling ObjHandle")
    }

    pub fn get_mut(&mut self, handle: ObjHandle) -> &mut Obj {
        self.slots[handle].as_mut().map(|s| &mut s.object).expect("dangling ObjHandle")
    }

    pub fn as_str(&self, handle: ObjHandle) -> &str {
        match self.get(handle) {
            Obj::String(s) => &s.chars,
            other => panic!("ObjHandle does not name a string: {}", other.type_name()),
        }
    }

    /// True iff newly marked (wasn't already black/gray) — callers use
    /// this to decide whether to push the handle onto the gray worklist.
    pub fn mark(&mut self, handle: ObjHandle) -> bool {
        let slot = self.slots[handle].as_mut().expect("dangling ObjHandle");
        if slot.marked {
            false
        } else {
            slot.marked = true;
            true
        }
    }

    pub fn is_marked(&self, handle: ObjHandle) -> bool {
        self.slots[handle].as_ref().map(|s| s.marked).unwrap_or(false)
    }

    pub fn unmark(&mut self, handle: ObjHandle) {
        if let Some(slot) = self.slots[handle].as_mut() {
            slot.marked = false;
        }
    }

    pub fn free(&mut self, handle: ObjHandle) {
        if let Some(slot) = self.slots[handle].take() {
            self.bytes_allocated -= approx_size(&slot.object);
            self.free.push(handle);
        }
    }

    /// All live handles, for the sweep pass to walk.
    pub fn live_handles(&self) -> Vec<ObjHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Heap {{ objects: {}, bytes_allocated: {} }}", self.slots.len() - self.free.len(), self.bytes_allocated)
    }
}
