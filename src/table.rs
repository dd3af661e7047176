// File: src/table.rs
//
// Open-addressed hash table with tombstone deletion, shared by the
// string intern table and the VM's globals table. Grounded directly on
// `examples/original_source/clox/table.c`'s probe/resize algorithm — the
// teacher repo has no Rust analogue of its own (it reaches for
// `std::HashMap` throughout), so this module is built straight from the
// original C.

use crate::value::{Heap, ObjHandle, Value};

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjHandle>,
    value: Value,
}

const MAX_LOAD: f64 = 0.75;

/// Maps interned-string keys to values. Used both as the string intern
/// set (value unused, always `Value::Nil`) and as the VM's globals table
/// (value is the binding).
pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe starting at `hash mod capacity`, following clox's find-slot
    /// rules: an empty non-tombstone slot ends the search (returning the
    /// first tombstone seen, if any); a tombstone is remembered and
    /// skipped; a key-identity match returns immediately.
    fn find_entry(entries: &[Entry], capacity: usize, key: ObjHandle, hash: u32) -> usize {
        let mut index = (hash as usize) % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return tombstone.unwrap_or(index);
                    } else if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn adjust_capacity(&mut self, new_capacity: usize, heap: &Heap) {
        let mut new_entries = vec![Entry { key: None, value: Value::Nil }; new_capacity];
        let mut new_count = 0;
        for entry in self.entries.iter() {
            if let Some(key) = entry.key {
                let hash = Self::hash_of(heap, key);
                let dest = Self::find_entry(&new_entries, new_capacity, key, hash);
                new_entries[dest] = Entry { key: Some(key), value: entry.value };
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    fn hash_of(heap: &Heap, key: ObjHandle) -> u32 {
        match heap.get(key) {
            crate::value::Obj::String(s) => s.hash,
            _ => panic!("table key is not a string"),
        }
    }

    /// Insert or overwrite `key => value`. Returns true if this created a
    /// new entry (as opposed to overwriting an existing one).
    pub fn set(&mut self, key: ObjHandle, value: Value, heap: &Heap) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            let new_capacity = if self.capacity() < 8 { 8 } else { self.capacity() * 2 };
            self.adjust_capacity(new_capacity, heap);
        }
        let hash = Self::hash_of(heap, key);
        let index = Self::find_entry(&self.entries, self.capacity(), key, hash);
        let is_new = self.entries[index].key.is_none();
        if is_new && matches!(self.entries[index].value, Value::Nil) {
            self.count += 1;
        }
        self.entries[index] = Entry { key: Some(key), value };
        is_new
    }

    pub fn get(&self, key: ObjHandle, heap: &Heap) -> Option<Value> {
        if self.capacity() == 0 {
            return None;
        }
        let hash = Self::hash_of(heap, key);
        let index = Self::find_entry(&self.entries, self.capacity(), key, hash);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    /// Delete `key`, leaving a tombstone (`key = None, value = Bool(true)`)
    /// so later probes still skip past this slot.
    pub fn delete(&mut self, key: ObjHandle, heap: &Heap) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let hash = Self::hash_of(heap, key);
        let index = Self::find_entry(&self.entries, self.capacity(), key, hash);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry { key: None, value: Value::Bool(true) };
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjHandle, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Specialized lookup for interning: compares by content (length,
    /// hash, bytes), not identity, since at this point no `ObjString` for
    /// these bytes may exist yet.
    pub fn find_string(&self, bytes: &str, hash: u32, heap: &Heap) -> Option<ObjHandle> {
        if self.capacity() == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if matches!(entry.value, Value::Nil) => return None,
                Some(k) => {
                    if let crate::value::Obj::String(s) = heap.get(k) {
                        if s.hash == hash && &*s.chars == bytes {
                            return Some(k);
                        }
                    }
                }
                _ => {}
            }
            index = (index + 1) % capacity;
        }
    }

    /// Remove entries whose string key is still white (unmarked) —
    /// called before the general sweep so dead interned strings stop
    /// being reachable through the weak intern table.
    pub fn remove_white(&mut self, heap: &Heap) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                if !heap.is_marked(key) {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }
}
