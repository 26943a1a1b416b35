// File: src/table.rs
//
// Open-addressed hash table keyed by interned strings.
// Used for globals, class method tables, instance fields, and the string
// interner itself. Linear probing with tombstones; capacity doubles once
// the load factor passes 0.75.

use crate::object::ObjRef;
use crate::value::Value;

const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 4;

/// One bucket. A missing key with a `nil` value is truly empty; a missing
/// key with a `true` value is a tombstone left by a deletion and must be
/// probed past. The key's hash is cached here so the table can rehash and
/// copy itself without consulting the heap.
#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

const EMPTY: Entry = Entry { key: None, hash: 0, value: Value::Nil };

/// String-keyed hash table. Keys are interned string handles, so key
/// equality is handle equality; callers pass the key's cached hash
/// alongside the handle.
#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table { count: 0, entries: Vec::new() }
    }

    /// Number of buckets currently allocated.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.value == Value::Nil {
                        // Truly empty. Reuse an earlier tombstone if the
                        // probe passed one.
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![EMPTY; capacity];

        // Tombstones are discarded on rehash, so recount live entries.
        self.count = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let dest = Self::find_entry(&entries, key, entry.hash);
                entries[dest] = *entry;
                self.count += 1;
            }
        }

        self.entries = entries;
    }

    /// Inserts or updates a binding. Returns true if the key was not
    /// present before.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) * TABLE_MAX_LOAD_DEN > self.capacity() * TABLE_MAX_LOAD_NUM {
            let capacity = if self.capacity() < 8 { 8 } else { self.capacity() * 2 };
            self.adjust_capacity(capacity);
        }

        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();

        // A reused tombstone was already counted when it was live.
        if is_new && entry.value == Value::Nil {
            self.count += 1;
        }

        *entry = Entry { key: Some(key), hash, value };
        is_new
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Removes a binding, leaving a tombstone so probe chains stay intact.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry { key: None, hash: 0, value: Value::Bool(true) };
        true
    }

    /// Content-addressed lookup for the string interner. `contents` maps a
    /// key handle to its (chars, hash) so the probe can compare without the
    /// table knowing about the heap.
    pub fn find_string<'h>(
        &self,
        chars: &str,
        hash: u32,
        contents: impl Fn(ObjRef) -> (&'h str, u32),
    ) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;

        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.value == Value::Nil {
                        return None;
                    }
                    // Tombstone: keep probing.
                }
                Some(key) => {
                    let (key_chars, key_hash) = contents(key);
                    if key_hash == hash && key_chars == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Tombstones every entry whose key fails the predicate. The GC uses
    /// this to drop interner entries for strings about to be swept.
    pub fn remove_unmarked(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !is_marked(key) {
                    *entry = Entry { key: None, hash: 0, value: Value::Bool(true) };
                }
            }
        }
    }

    /// Iterates live `(key, hash, value)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, u32, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.hash, e.value)))
    }

    /// Live `(key, value)` pair at bucket `index`, if any. Lets the GC walk
    /// a table without borrowing it for the whole traversal.
    pub fn entry_at(&self, index: usize) -> Option<(ObjRef, Value)> {
        let entry = &self.entries[index];
        entry.key.map(|k| (k, entry.value))
    }
}
