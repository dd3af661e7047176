// File: src/gc.rs
//
// Tricolor mark-sweep garbage collector over the `Heap` arena. No teacher
// or pack Rust analogue — the teacher leaks on purpose via `ManuallyDrop`
// (`src/interpreter/value.rs`) rather than collecting — so this is built
// directly from `examples/original_source/clox/memory.c`'s
// `collectGarbage`/`reallocate` trigger and `kevlox/memory.c`'s sweep.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::{Heap, Obj, ObjHandle, Value};

pub const HEAP_GROW_FACTOR: usize = 2;

/// Everything the caller wants alive across a collection: loose `Value`s
/// (stack slots, global values) and loose `ObjHandle`s (closures,
/// upvalues, global keys, and — critically — the constant pools of every
/// function presently under construction by the compiler, since those
/// constants are not yet reachable through any stack or globals entry).
#[derive(Default)]
pub struct Roots {
    pub values: Vec<Value>,
    pub handles: Vec<ObjHandle>,
}

impl Roots {
    pub fn new() -> Self {
        Roots::default()
    }

    pub fn push_value(&mut self, v: Value) {
        self.values.push(v);
    }

    pub fn push_handle(&mut self, h: ObjHandle) {
        self.handles.push(h);
    }

    /// Root every constant a chunk (and any nested function constants it
    /// holds transitively via `mark_value`) could reach. Used to protect
    /// a function still being built by the compiler, which sits outside
    /// the heap entirely until `OP_CLOSURE` wraps it into a constant of
    /// its *own* enclosing chunk.
    pub fn push_chunk_constants(&mut self, chunk: &Chunk) {
        for &c in &chunk.constants {
            self.values.push(c);
        }
    }
}

/// Run one full collection: mark every root (and everything reachable
/// from it), drop now-unreachable entries from the (weak) string intern
/// table, then sweep the heap. Called only on allocation growth, never
/// on free, per the spec's safety invariant.
pub fn collect_garbage(heap: &mut Heap, strings: &mut Table, roots: Roots) {
    let mut gray: Vec<ObjHandle> = Vec::new();

    for v in roots.values {
        mark_value(heap, v, &mut gray);
    }
    for h in roots.handles {
        mark_handle(heap, h, &mut gray);
    }

    while let Some(handle) = gray.pop() {
        blacken(heap, handle, &mut gray);
    }

    strings.remove_white(heap);
    sweep(heap);
}

fn mark_value(heap: &mut Heap, value: Value, gray: &mut Vec<ObjHandle>) {
    if let Value::Obj(handle) = value {
        mark_handle(heap, handle, gray);
    }
}

fn mark_handle(heap: &mut Heap, handle: ObjHandle, gray: &mut Vec<ObjHandle>) {
    if heap.mark(handle) {
        gray.push(handle);
    }
}

/// Visit a gray object's outgoing references, marking each and pushing
/// newly-marked ones back onto the gray worklist.
fn blacken(heap: &mut Heap, handle: ObjHandle, gray: &mut Vec<ObjHandle>) {
    // Obj::Function/Closure hold nested handles/values we need to read
    // before recursing; clone the small amount we need rather than fight
    // the borrow checker over `heap`.
    match heap.get(handle) {
        Obj::String(_) => {}
        Obj::Native(n) => {
            let name = n.name;
            mark_handle(heap, name, gray);
        }
        Obj::Function(f) => {
            let name = f.name;
            let constants: Vec<Value> = f.chunk.constants.clone();
            if let Some(n) = name {
                mark_handle(heap, n, gray);
            }
            for c in constants {
                mark_value(heap, c, gray);
            }
        }
        Obj::Closure(c) => {
            let function = c.function;
            let upvalues = c.upvalues.clone();
            mark_handle(heap, function, gray);
            for u in upvalues {
                mark_handle(heap, u, gray);
            }
        }
        Obj::Upvalue(u) => {
            // If still open, the slot it names is already a root via the
            // VM's stack contribution; marking `closed` is a no-op until
            // the upvalue actually closes, at which point it is the only
            // reference left.
            let closed = u.closed;
            mark_value(heap, closed, gray);
        }
    }
}

fn sweep(heap: &mut Heap) {
    for handle in heap.live_handles() {
        if heap.is_marked(handle) {
            heap.unmark(handle);
        } else {
            heap.free(handle);
        }
    }
    heap.next_gc = heap.bytes_allocated * HEAP_GROW_FACTOR;
}
