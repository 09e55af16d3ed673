//! Open-addressed hash table
//!
//! The sole map primitive in the runtime: globals, interned strings, class
//! method tables, and instance fields all use it. Keys are interned strings,
//! so key comparison is pointer equality. Linear probing with tombstones;
//! capacity is always a power of two so probing is a bitmask. `count`
//! includes tombstones, which keeps the growth policy from starving on
//! delete-heavy workloads.

use crate::Value;
use crate::object::ObjRef;

/// Grow when live + tombstone occupancy would exceed 3/4 of capacity.
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

const INITIAL_CAPACITY: usize = 8;

/// FNV-1a, the hash every interned string precomputes.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

const EMPTY: Entry = Entry { key: None, value: Value::NIL };

// A tombstone is a deleted slot: no key, value true. Lookups probe past it;
// inserts may reuse it.
const TOMBSTONE: Entry = Entry { key: None, value: Value::TRUE };

#[derive(Default)]
pub struct Table {
    count: usize,
    entries: Box<[Entry]>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[self.find_slot(key)];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or updates. Returns true when the key was not present.
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            self.grow();
        }
        let slot = self.find_slot(key);
        let entry = &mut self.entries[slot];
        let is_new = entry.key.is_none();
        // Reusing a tombstone does not raise occupancy.
        if is_new && entry.value.is_nil() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    /// Removes the key, leaving a tombstone. Returns whether it was present.
    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.count == 0 {
            return false;
        }
        let slot = self.find_slot(key);
        if self.entries[slot].key.is_none() {
            return false;
        }
        self.entries[slot] = TOMBSTONE;
        true
    }

    /// Copies every live entry of `other` into `self`. Existing keys are
    /// overwritten, which is exactly what copy-down inheritance wants.
    pub fn add_all(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    /// Interning lookup: matches hash, total length, and the concatenation
    /// of two byte fragments without building the combined buffer.
    pub fn find_string(&self, hash: u32, first: &[u8], second: &[u8]) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.value.is_nil() {
                        return None;
                    }
                }
                Some(key) => {
                    let string = key.as_string();
                    if string.hash == hash
                        && string.bytes.len() == first.len() + second.len()
                        && &string.bytes[..first.len()] == first
                        && &string.bytes[first.len()..] == second
                    {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Deletes every entry whose key fails the predicate. The collector uses
    /// this to drop interned strings that survived only in this table.
    pub fn retain_keys(&mut self, keep: impl Fn(ObjRef) -> bool) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key
                && !keep(key)
            {
                *entry = TOMBSTONE;
            }
        }
    }

    /// Probe for the key's slot: its entry if present, otherwise the first
    /// reusable slot (earliest tombstone seen, else the terminating empty).
    fn find_slot(&self, key: ObjRef) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = key.as_string().hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.value.is_nil() {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(existing) => {
                    if existing == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    // Reinserting by hand drops tombstones, so count ends up live-only.
    fn grow(&mut self) {
        let capacity = if self.entries.len() < INITIAL_CAPACITY {
            INITIAL_CAPACITY
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![EMPTY; capacity].into_boxed_slice());
        self.count = 0;
        for entry in old.iter() {
            if let Some(key) = entry.key {
                let slot = self.find_slot(key);
                self.entries[slot] = *entry;
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn test_set_get_overwrite() {
        let mut heap = Heap::new();
        let key = heap.intern(b"answer", crate::Roots::default());
        let mut table = Table::new();

        assert!(table.get(key).is_none());
        assert!(table.set(key, Value::number(41.0)));
        assert!(!table.set(key, Value::number(42.0)));
        assert_eq!(table.get(key), Some(Value::number(42.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_leaves_reusable_tombstone() {
        let mut heap = Heap::new();
        let a = heap.intern(b"a", crate::Roots::default());
        heap.protect.push(Value::object(a));
        let b = heap.intern(b"b", crate::Roots::default());
        heap.protect.push(Value::object(b));
        let mut table = Table::new();

        table.set(a, Value::number(1.0));
        table.set(b, Value::number(2.0));
        assert!(table.delete(a));
        assert!(!table.delete(a));
        assert!(table.get(a).is_none());
        // b must still be reachable even if it probed past a's slot.
        assert_eq!(table.get(b), Some(Value::number(2.0)));

        // Reinsert reuses the tombstone rather than growing occupancy.
        assert!(table.set(a, Value::number(3.0)));
        assert_eq!(table.get(a), Some(Value::number(3.0)));
        heap.protect.pop();
        heap.protect.pop();
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        // Local tables are not GC roots, so every key is pinned on the
        // protect stack for the duration of the test.
        let keys: Vec<_> = (0..64)
            .map(|i| {
                let key = heap.intern(format!("key{}", i).as_bytes(), crate::Roots::default());
                heap.protect.push(Value::object(key));
                key
            })
            .collect();
        for (i, &key) in keys.iter().enumerate() {
            table.set(key, Value::number(i as f64));
        }
        for (i, &key) in keys.iter().enumerate() {
            assert_eq!(table.get(key), Some(Value::number(i as f64)));
        }
        assert_eq!(table.len(), 64);
        heap.protect.truncate(0);
    }

    #[test]
    fn test_add_all_overwrites() {
        let mut heap = Heap::new();
        let k1 = heap.intern(b"one", crate::Roots::default());
        heap.protect.push(Value::object(k1));
        let k2 = heap.intern(b"two", crate::Roots::default());
        heap.protect.push(Value::object(k2));
        let mut src = Table::new();
        let mut dst = Table::new();
        src.set(k1, Value::number(1.0));
        src.set(k2, Value::number(2.0));
        dst.set(k1, Value::number(10.0));

        dst.add_all(&src);
        assert_eq!(dst.get(k1), Some(Value::number(1.0)));
        assert_eq!(dst.get(k2), Some(Value::number(2.0)));
        heap.protect.truncate(0);
    }

    #[test]
    fn test_find_string_matches_split_fragments() {
        let mut heap = Heap::new();
        let key = heap.intern(b"hihi", crate::Roots::default());
        let hash = hash_bytes(b"hihi");
        // The interned-strings table lives in the heap.
        assert_eq!(heap.strings.find_string(hash, b"hi", b"hi"), Some(key));
        assert_eq!(heap.strings.find_string(hash, b"hihi", b""), Some(key));
        let miss = hash_bytes(b"hiho");
        assert!(heap.strings.find_string(miss, b"hi", b"ho").is_none());
    }
}
