//! Open-addressing dictionaries and lexical environments.
//!
//! The dictionary is keyed by interned handles and probes quadratically with
//! an incrementing step. Capacity is always a power of two, the hash is
//! `(handle >> 3) & (size - 1)`, and the empty-slot sentinel is the `NA`
//! handle. Slot storage lives on the managed heap so the collector can mark
//! it by address.

use crate::heap::Heap;
use crate::intern::{strings, Symbol};
use crate::value::Value;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct DictSlot {
    pub name: Symbol,
    pub value: Value,
}

const MIN_CAPACITY: u64 = 8;

#[repr(C)]
pub struct Dictionary {
    d: *mut DictSlot,
    size: u64,
    load: u64,
}

impl Dictionary {
    /// A table with room for about `hint` entries before the first rehash.
    pub fn with_capacity(heap: &Heap, hint: usize) -> Dictionary {
        let size = ((hint as u64 * 2).max(MIN_CAPACITY)).next_power_of_two();
        Dictionary {
            d: Self::alloc_buffer(heap, size),
            size,
            load: 0,
        }
    }

    fn alloc_buffer(heap: &Heap, size: u64) -> *mut DictSlot {
        let buf = heap.alloc(size as usize * std::mem::size_of::<DictSlot>()) as *mut DictSlot;
        let na = strings().na;
        for i in 0..size as usize {
            // SAFETY: buf spans `size` slots, just allocated.
            unsafe {
                buf.add(i).write(DictSlot {
                    name: na,
                    value: Value::nil(),
                });
            }
        }
        buf
    }

    /// Index of `name`'s slot, or of the empty slot where it would go.
    fn find(&self, name: Symbol) -> usize {
        let na = strings().na;
        let ksize = self.size - 1;
        let mut i = (name.addr() >> 3) & ksize;
        let mut j = 0u64;
        loop {
            // SAFETY: i is masked into the table.
            let slot = unsafe { &*self.d.add(i as usize) };
            if slot.name == name || slot.name == na {
                return i as usize;
            }
            j += 1;
            i = (i + j) & ksize;
        }
    }

    pub fn has(&self, name: Symbol) -> bool {
        // SAFETY: find returns an in-table index.
        unsafe { (*self.d.add(self.find(name))).name == name }
    }

    /// The stored value, or `Nil` when absent.
    pub fn get(&self, name: Symbol) -> Value {
        let i = self.find(name);
        // SAFETY: find returns an in-table index.
        let slot = unsafe { &*self.d.add(i) };
        if slot.name == name {
            slot.value
        } else {
            Value::nil()
        }
    }

    /// A mutable slot for `name`, created (and the table rehashed) if needed.
    pub fn insert(&mut self, heap: &Heap, name: Symbol) -> &mut Value {
        let i = self.find(name);
        // SAFETY: find returns an in-table index.
        unsafe {
            if (*self.d.add(i)).name == name {
                return &mut (*self.d.add(i)).value;
            }
        }
        if (self.load + 1) * 2 > self.size {
            self.rehash(heap, self.size * 2);
        }
        let i = self.find(name);
        self.load += 1;
        // SAFETY: find returned an empty slot after the capacity check.
        unsafe {
            let slot = &mut *self.d.add(i);
            slot.name = name;
            slot.value = Value::nil();
            &mut slot.value
        }
    }

    /// Lazily empty the slot.
    ///
    /// The hole can terminate a later probe chain early and hide keys that
    /// probed past it until the next rehash; callers must not remove during
    /// lookup-sensitive phases. The interpreter core never does.
    pub fn remove(&mut self, name: Symbol) -> bool {
        let i = self.find(name);
        // SAFETY: find returns an in-table index.
        unsafe {
            let slot = &mut *self.d.add(i);
            if slot.name == name {
                slot.name = strings().na;
                slot.value = Value::nil();
                self.load -= 1;
                true
            } else {
                false
            }
        }
    }

    fn rehash(&mut self, heap: &Heap, new_size: u64) {
        let old = self.d;
        let old_size = self.size;
        self.d = Self::alloc_buffer(heap, new_size);
        self.size = new_size;
        let na = strings().na;
        for i in 0..old_size as usize {
            // SAFETY: old spans old_size slots.
            let slot = unsafe { *old.add(i) };
            if slot.name != na {
                let j = self.find(slot.name);
                // SAFETY: find returns an in-table index of an empty slot.
                unsafe { self.d.add(j).write(slot) };
            }
        }
        // The old buffer is unreferenced now; the next sweep reclaims it.
    }

    /// A copy with room for `extra` more entries.
    pub fn clone_with(&self, heap: &Heap, extra: usize) -> Dictionary {
        let mut out = Dictionary::with_capacity(heap, self.load as usize + extra);
        let na = strings().na;
        for i in 0..self.size as usize {
            // SAFETY: the source table spans size slots.
            let slot = unsafe { *self.d.add(i) };
            if slot.name != na {
                *out.insert(heap, slot.name) = slot.value;
            }
        }
        out
    }

    pub fn load(&self) -> usize {
        self.load as usize
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Visit occupied slots in bucket order.
    pub fn for_each(&self, mut f: impl FnMut(Symbol, Value)) {
        let na = strings().na;
        for i in 0..self.size as usize {
            // SAFETY: the table spans size slots.
            let slot = unsafe { &*self.d.add(i) };
            if slot.name != na {
                f(slot.name, slot.value);
            }
        }
    }

    pub(crate) fn buffer_ptr(&self) -> *mut u8 {
        self.d as *mut u8
    }

    pub(crate) fn raw_slots(&self) -> &[DictSlot] {
        // SAFETY: the table spans size slots.
        unsafe { std::slice::from_raw_parts(self.d, self.size as usize) }
    }

    #[cfg(test)]
    fn find_probes(&self, name: Symbol) -> usize {
        let na = strings().na;
        let ksize = self.size - 1;
        let mut i = (name.addr() >> 3) & ksize;
        let mut j = 0u64;
        let mut visited = 1;
        loop {
            let slot = unsafe { &*self.d.add(i as usize) };
            if slot.name == name || slot.name == na {
                return visited;
            }
            j += 1;
            i = (i + j) & ksize;
            visited += 1;
        }
    }
}

/// A lexical scope: a dictionary, the enclosing environment, and an optional
/// attributes dictionary. Environments are heap objects referenced by raw
/// pointer; the collector owns their lifetime.
#[repr(C)]
pub struct Environment {
    dict: Dictionary,
    enclosure: *mut Environment,
    attributes: *mut Environment,
}

impl Environment {
    pub fn alloc(heap: &Heap, enclosure: *mut Environment, hint: usize) -> *mut Environment {
        let env = heap.alloc(std::mem::size_of::<Environment>()) as *mut Environment;
        // SAFETY: just allocated, correctly sized.
        unsafe {
            env.write(Environment {
                dict: Dictionary::with_capacity(heap, hint),
                enclosure,
                attributes: std::ptr::null_mut(),
            });
        }
        env
    }

    pub fn has(&self, name: Symbol) -> bool {
        self.dict.has(name)
    }

    pub fn get(&self, name: Symbol) -> Value {
        self.dict.get(name)
    }

    pub fn insert(&mut self, heap: &Heap, name: Symbol) -> &mut Value {
        self.dict.insert(heap, name)
    }

    pub fn remove(&mut self, name: Symbol) -> bool {
        self.dict.remove(name)
    }

    pub fn enclosure(&self) -> *mut Environment {
        self.enclosure
    }

    pub(crate) fn attributes_ptr(&self) -> *mut Environment {
        self.attributes
    }

    pub fn dict(&self) -> &Dictionary {
        &self.dict
    }

    /// Find `name` along the scope chain. Returns the bound value and the
    /// environment that binds it.
    pub fn get_recursive(&self, name: Symbol) -> Option<(Value, *mut Environment)> {
        let mut e = self as *const Environment as *mut Environment;
        while !e.is_null() {
            // SAFETY: scope chains only link live environments.
            let env = unsafe { &*e };
            if env.has(name) {
                return Some((env.get(name), e));
            }
            e = env.enclosure;
        }
        None
    }

    /// `<<-`-style slot lookup: the innermost ancestor (starting from self)
    /// already binding `name`, or a fresh slot in the outermost visited
    /// environment when none binds it.
    pub fn insert_recursive(&mut self, heap: &Heap, name: Symbol) -> &mut Value {
        let mut e = self as *mut Environment;
        loop {
            // SAFETY: scope chains only link live environments.
            unsafe {
                if (*e).has(name) {
                    return (*e).insert(heap, name);
                }
                if (*e).enclosure.is_null() {
                    return (*e).insert(heap, name);
                }
                e = (*e).enclosure;
            }
        }
    }

    /// A copy with the same enclosure and bindings.
    pub fn clone_env(&self, heap: &Heap) -> *mut Environment {
        let env = heap.alloc(std::mem::size_of::<Environment>()) as *mut Environment;
        // SAFETY: just allocated, correctly sized.
        unsafe {
            env.write(Environment {
                dict: self.dict.clone_with(heap, 0),
                enclosure: self.enclosure,
                attributes: self.attributes,
            });
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::intern;

    fn sym(s: &str) -> Symbol {
        intern(s)
    }

    #[test]
    fn insert_get_has_round_trip() {
        let heap = Heap::new();
        let mut d = Dictionary::with_capacity(&heap, 4);
        assert!(d.get(sym("x")).is_nil());
        *d.insert(&heap, sym("x")) = Value::integer(1);
        *d.insert(&heap, sym("y")) = Value::integer(2);
        assert!(d.has(sym("x")));
        assert_eq!(d.get(sym("x")).scalar_integer(), 1);
        assert_eq!(d.get(sym("y")).scalar_integer(), 2);
        assert!(!d.has(sym("z")));

        // Overwrite through the same slot.
        *d.insert(&heap, sym("x")) = Value::integer(10);
        assert_eq!(d.get(sym("x")).scalar_integer(), 10);
        assert_eq!(d.load(), 2);
    }

    #[test]
    fn rehash_preserves_every_binding() {
        let heap = Heap::new();
        let mut d = Dictionary::with_capacity(&heap, 2);
        let names: Vec<Symbol> = (0..100).map(|i| intern(&format!("k{}", i))).collect();
        for (i, &n) in names.iter().enumerate() {
            *d.insert(&heap, n) = Value::integer(i as i64);
        }
        assert_eq!(d.load(), 100);
        assert!(d.size().is_power_of_two());
        assert!(d.size() >= 2 * d.load());
        for (i, &n) in names.iter().enumerate() {
            assert_eq!(d.get(n).scalar_integer(), i as i64, "{}", n.as_str());
        }
    }

    #[test]
    fn probe_chains_stay_short() {
        let heap = Heap::new();
        let mut d = Dictionary::with_capacity(&heap, 4);
        let names: Vec<Symbol> = (0..64).map(|i| intern(&format!("p{}", i))).collect();
        for &n in &names {
            *d.insert(&heap, n) = Value::logical_from(true);
        }
        for &n in &names {
            assert!(d.find_probes(n) <= d.load() + 1);
        }
        assert!(d.find_probes(sym("absent")) <= d.load() + 1);
    }

    #[test]
    fn remove_empties_the_slot() {
        let heap = Heap::new();
        let mut d = Dictionary::with_capacity(&heap, 4);
        *d.insert(&heap, sym("a")) = Value::integer(1);
        assert!(d.remove(sym("a")));
        assert!(!d.has(sym("a")));
        assert!(d.get(sym("a")).is_nil());
        assert!(!d.remove(sym("a")));
        assert_eq!(d.load(), 0);
    }

    #[test]
    fn iteration_visits_by_bucket() {
        let heap = Heap::new();
        let mut d = Dictionary::with_capacity(&heap, 8);
        *d.insert(&heap, sym("a")) = Value::integer(1);
        *d.insert(&heap, sym("b")) = Value::integer(2);
        *d.insert(&heap, sym("c")) = Value::integer(3);
        let mut seen = Vec::new();
        let mut buckets = Vec::new();
        d.for_each(|n, v| {
            seen.push((n, v.scalar_integer()));
        });
        for (i, slot) in d.raw_slots().iter().enumerate() {
            if slot.name != strings().na {
                buckets.push(i);
            }
        }
        assert_eq!(seen.len(), 3);
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn clone_with_copies_and_leaves_the_source_alone() {
        let heap = Heap::new();
        let mut d = Dictionary::with_capacity(&heap, 4);
        *d.insert(&heap, sym("a")) = Value::integer(1);
        let mut c = d.clone_with(&heap, 8);
        assert_eq!(c.get(sym("a")).scalar_integer(), 1);
        *c.insert(&heap, sym("b")) = Value::integer(2);
        assert!(!d.has(sym("b")));
    }

    #[test]
    fn recursive_insert_writes_the_binding_ancestor() {
        let heap = Heap::new();
        // e3 is outermost; e1 innermost.
        let e3 = Environment::alloc(&heap, std::ptr::null_mut(), 4);
        let e2 = Environment::alloc(&heap, e3, 4);
        let e1 = Environment::alloc(&heap, e2, 4);
        unsafe {
            *(*e2).insert(&heap, sym("x")) = Value::integer(5);
            *(*e1).insert_recursive(&heap, sym("x")) = Value::integer(9);
            assert!(!(*e1).has(sym("x")));
            assert_eq!((*e2).get(sym("x")).scalar_integer(), 9);
            assert!(!(*e3).has(sym("x")));
        }
    }

    #[test]
    fn recursive_insert_falls_back_to_the_outermost() {
        let heap = Heap::new();
        let e3 = Environment::alloc(&heap, std::ptr::null_mut(), 4);
        let e2 = Environment::alloc(&heap, e3, 4);
        let e1 = Environment::alloc(&heap, e2, 4);
        unsafe {
            *(*e1).insert_recursive(&heap, sym("fresh")) = Value::integer(1);
            assert!((*e3).has(sym("fresh")));
            assert!(!(*e1).has(sym("fresh")));
            assert!(!(*e2).has(sym("fresh")));
        }
    }

    #[test]
    fn recursive_get_reports_the_defining_environment() {
        let heap = Heap::new();
        let outer = Environment::alloc(&heap, std::ptr::null_mut(), 4);
        let inner = Environment::alloc(&heap, outer, 4);
        unsafe {
            *(*outer).insert(&heap, sym("v")) = Value::double(1.5);
            let (v, found_in) = (*inner).get_recursive(sym("v")).unwrap();
            assert_eq!(v.scalar_double(), 1.5);
            assert_eq!(found_in, outer);
            assert!((*inner).get_recursive(sym("missing")).is_none());
        }
    }
}
