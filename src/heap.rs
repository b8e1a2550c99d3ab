//! Region-based mark-sweep heap.
//!
//! Small objects are bump-allocated out of 64 KiB regions that are aligned to
//! their own size, so the header owning any object is recovered by masking
//! the object's address. Mark state is one bit per 64-byte slot in the region
//! header. Oversize objects get an individually aligned block with the same
//! header shape; those blocks also carry the (nullable) finalizer.
//!
//! Collection is not concurrent: it runs at explicit interpreter safe points
//! on the thread that observed the threshold, while the other workers are
//! parked in the steal loop or blocked at a `doall` barrier.

use std::alloc::{alloc, dealloc, Layout};

use parking_lot::Mutex;

use crate::code::Prototype;
use crate::dict::Environment;
use crate::state::Global;
use crate::value::{Packing, Type, Value};

pub const REGION_SIZE: usize = 64 * 1024;
const SLOT_SIZE: usize = 64;
const MARK_WORDS: usize = REGION_SIZE / SLOT_SIZE / 64;
const REGION_BATCH: usize = 256;
const INITIAL_LIMIT: usize = 32 * 1024 * 1024;

/// Called exactly once, before the memory is reused, with a pointer to the
/// dead object. Finalizers must not allocate.
pub type Finalizer = unsafe fn(*mut u8);

/// Header at the base of every region and every oversize block.
#[repr(C, align(64))]
struct GcObject {
    next: *mut GcObject,
    size: usize,
    finalizer: Option<Finalizer>,
    marks: [u64; MARK_WORDS],
}

const HEADER_BYTES: usize = std::mem::size_of::<GcObject>();
const MAX_REGION_ALLOC: usize = REGION_SIZE - HEADER_BYTES;

const _: () = assert!(HEADER_BYTES == 192);
const _: () = assert!(HEADER_BYTES % SLOT_SIZE == 0);

struct HeapInner {
    bump: usize,
    end: usize,
    current: *mut GcObject,
    root: *mut GcObject,
    free: Vec<*mut GcObject>,
    total: usize,
}

// SAFETY: the raw region pointers are only touched under the heap lock or
// during a collection, when the mutators are quiescent.
unsafe impl Send for HeapInner {}

pub struct Heap {
    inner: Mutex<HeapInner>,
    limit: std::sync::atomic::AtomicUsize,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            inner: Mutex::new(HeapInner {
                bump: 0,
                end: 0,
                current: std::ptr::null_mut(),
                root: std::ptr::null_mut(),
                free: Vec::new(),
                total: 0,
            }),
            limit: std::sync::atomic::AtomicUsize::new(INITIAL_LIMIT),
        }
    }

    /// Allocate `bytes` of zero-fill-free storage, 64-byte aligned.
    pub fn alloc(&self, bytes: usize) -> *mut u8 {
        let bytes = (bytes + SLOT_SIZE - 1) & !(SLOT_SIZE - 1);
        let mut inner = self.inner.lock();
        if bytes > MAX_REGION_ALLOC {
            return Self::alloc_large(&mut inner, bytes, None);
        }
        if inner.bump == 0 || inner.bump + bytes > inner.end {
            Self::pop_region(&mut inner);
        }
        let p = inner.bump;
        inner.bump += bytes;
        p as *mut u8
    }

    /// Allocate storage that carries a finalizer.
    ///
    /// Finalized objects always live in their own block so sweep can honor
    /// the run-exactly-once contract without per-object bookkeeping inside
    /// regions.
    pub fn alloc_with_finalizer(&self, bytes: usize, finalizer: Finalizer) -> *mut u8 {
        let bytes = (bytes + SLOT_SIZE - 1) & !(SLOT_SIZE - 1);
        let mut inner = self.inner.lock();
        Self::alloc_large(&mut inner, bytes, Some(finalizer))
    }

    fn alloc_large(inner: &mut HeapInner, bytes: usize, finalizer: Option<Finalizer>) -> *mut u8 {
        let size = HEADER_BYTES + bytes;
        // SAFETY: size is nonzero and REGION_SIZE is a power of two.
        let layout = unsafe { Layout::from_size_align_unchecked(size, REGION_SIZE) };
        unsafe {
            let obj = alloc(layout) as *mut GcObject;
            assert!(!obj.is_null(), "heap exhausted");
            (*obj).next = inner.root;
            (*obj).size = size;
            (*obj).finalizer = finalizer;
            (*obj).marks = [0; MARK_WORDS];
            inner.root = obj;
            inner.total += size;
            (obj as *mut u8).add(HEADER_BYTES)
        }
    }

    fn pop_region(inner: &mut HeapInner) {
        if inner.free.is_empty() {
            Self::make_regions(inner, REGION_BATCH);
        }
        let region = inner.free.pop().expect("free region pool");
        unsafe {
            (*region).next = inner.root;
            (*region).finalizer = None;
            (*region).marks = [0; MARK_WORDS];
        }
        inner.root = region;
        inner.current = region;
        inner.total += REGION_SIZE;
        inner.bump = region as usize + HEADER_BYTES;
        inner.end = region as usize + REGION_SIZE;
    }

    fn make_regions(inner: &mut HeapInner, count: usize) {
        // SAFETY: REGION_SIZE is a nonzero power of two.
        let layout = unsafe { Layout::from_size_align_unchecked(REGION_SIZE, REGION_SIZE) };
        for _ in 0..count {
            unsafe {
                let region = alloc(layout) as *mut GcObject;
                assert!(!region.is_null(), "heap exhausted");
                (*region).next = std::ptr::null_mut();
                (*region).size = REGION_SIZE;
                (*region).finalizer = None;
                (*region).marks = [0; MARK_WORDS];
                inner.free.push(region);
            }
        }
    }

    pub fn total(&self) -> usize {
        self.inner.lock().total
    }

    pub fn should_collect(&self) -> bool {
        self.total() > self.limit.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Mark from every registered root, then sweep.
    ///
    /// The caller guarantees the quiescence contract described at the top of
    /// this module.
    pub fn collect(&self, global: &Global) {
        let mut inner = self.inner.lock();
        let before = inner.total;
        // SAFETY: marking only sets header bits; the root walk does not
        // allocate, so the lock is never re-entered.
        unsafe {
            global.visit_roots();
            Self::sweep(&mut inner);
        }
        let total = inner.total;
        self.limit.store(
            INITIAL_LIMIT.max(total * 2),
            std::sync::atomic::Ordering::Relaxed,
        );
        log::debug!("gc: swept {} -> {} bytes", before, total);
    }

    unsafe fn sweep(inner: &mut HeapInner) {
        let current = inner.current;
        let mut total = 0usize;
        let mut pooled: Vec<*mut GcObject> = Vec::new();
        let mut link: *mut *mut GcObject = &mut inner.root;
        while !(*link).is_null() {
            let h = *link;
            if h == current || marked_any(h) {
                (*h).marks = [0; MARK_WORDS];
                total += (*h).size;
                link = &mut (*h).next;
            } else {
                *link = (*h).next;
                if let Some(f) = (*h).finalizer {
                    f((h as *mut u8).add(HEADER_BYTES));
                }
                if (*h).size == REGION_SIZE {
                    pooled.push(h);
                } else {
                    let layout = Layout::from_size_align_unchecked((*h).size, REGION_SIZE);
                    dealloc(h as *mut u8, layout);
                }
            }
        }
        inner.free.extend(pooled);
        inner.total = total;
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        unsafe {
            let mut h = inner.root;
            while !h.is_null() {
                let next = (*h).next;
                if let Some(f) = (*h).finalizer {
                    f((h as *mut u8).add(HEADER_BYTES));
                }
                let layout = Layout::from_size_align_unchecked((*h).size, REGION_SIZE);
                dealloc(h as *mut u8, layout);
                h = next;
            }
            let layout = Layout::from_size_align_unchecked(REGION_SIZE, REGION_SIZE);
            for region in inner.free.drain(..) {
                dealloc(region as *mut u8, layout);
            }
        }
    }
}

// ── Marking ───────────────────────────────────────────────────────────

#[inline(always)]
unsafe fn owner(p: *const u8) -> *mut GcObject {
    ((p as usize) & !(REGION_SIZE - 1)) as *mut GcObject
}

/// Set the mark bit for the object starting at `p`. Returns true when the
/// bit was newly set.
///
/// # Safety
///
/// `p` must be a 64-byte-aligned pointer produced by this heap.
#[inline]
unsafe fn mark_raw(p: *const u8) -> bool {
    debug_assert_eq!(p as usize % SLOT_SIZE, 0);
    let obj = owner(p);
    let slot = ((p as usize) & (REGION_SIZE - 1)) >> 6;
    debug_assert!(slot >= HEADER_BYTES / SLOT_SIZE);
    let word = &mut (*obj).marks[slot >> 6];
    let bit = 1u64 << (slot & 63);
    let newly = *word & bit == 0;
    *word |= bit;
    newly
}

unsafe fn marked_any(h: *const GcObject) -> bool {
    (*h).marks.iter().any(|&w| w != 0)
}

/// Trace the edges of one value, marking reachable heap storage.
///
/// # Safety
///
/// Every payload pointer in `v` must point at live heap storage; the caller
/// is the mark phase, whose roots guarantee that.
pub(crate) unsafe fn traverse(v: Value) {
    match v.tag() {
        Type::Nil | Type::Null | Type::ScalarString | Type::Future => {}
        Type::Environment => visit_environment(v.environment_ptr()),
        Type::Closure => {
            if mark_raw(v.payload_ptr()) {
                let c = v.closure_inner();
                visit_prototype(c.prototype);
                visit_environment(c.environment);
            }
        }
        Type::Promise => {
            if mark_raw(v.payload_ptr()) {
                let p = v.promise_inner();
                visit_prototype(p.code);
                visit_environment(p.environment);
            }
        }
        Type::Externalptr => {
            if mark_raw(v.payload_ptr()) {
                let e = v.externalptr_inner();
                traverse(e.tag);
                traverse(e.prot);
            }
        }
        Type::Pairlist => {
            if mark_raw(v.payload_ptr()) {
                let p = v.pairlist_inner();
                traverse(p.car);
                traverse(p.cdr);
                traverse(p.tag);
            }
        }
        Type::List => {
            if v.packing() == Packing::Ptr && mark_raw(v.payload_ptr()) {
                visit_environment(v.attributes());
                for el in v.list_slice() {
                    traverse(*el);
                }
            }
        }
        Type::Raw
        | Type::Logical
        | Type::Integer
        | Type::Double
        | Type::Character
        | Type::Integer32
        | Type::Logical32 => {
            // Interned handles inside character data are never collected, so
            // only the buffer and its attributes need marking.
            if v.packing() == Packing::Ptr && mark_raw(v.payload_ptr()) {
                visit_environment(v.attributes());
            }
        }
    }
}

/// # Safety
///
/// `e` must be null or a live environment allocated on this heap.
pub(crate) unsafe fn visit_environment(e: *mut Environment) {
    if e.is_null() || !mark_raw(e as *const u8) {
        return;
    }
    let env = &*e;
    let dict = env.dict();
    mark_raw(dict.buffer_ptr());
    for slot in dict.raw_slots() {
        if slot.name != crate::intern::strings().na {
            traverse(slot.value);
        }
    }
    visit_environment(env.enclosure());
    visit_environment(env.attributes_ptr());
}

/// # Safety
///
/// `p` must be null or a live prototype allocated on this heap.
pub(crate) unsafe fn visit_prototype(p: *const Prototype) {
    if p.is_null() || !mark_raw(p as *const u8) {
        return;
    }
    let proto = &*p;
    traverse(proto.expression);
    traverse(proto.parameters);
    traverse(proto.defaults);
    for c in &proto.constants {
        traverse(*c);
    }
    for call in &proto.calls {
        traverse(call.call);
        traverse(call.arguments);
        traverse(call.names);
        traverse(call.extra_args);
        traverse(call.extra_names);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Global, State};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn allocations_are_slot_aligned() {
        let heap = Heap::new();
        let a = heap.alloc(1) as usize;
        let b = heap.alloc(24) as usize;
        assert_eq!(a % 64, 0);
        assert_eq!(b % 64, 0);
        assert_eq!(b - a, 64);
    }

    #[test]
    fn oversize_blocks_get_their_own_header() {
        let heap = Heap::new();
        let p = heap.alloc(REGION_SIZE) as usize;
        assert_eq!(p % 64, 0);
        assert_eq!(p & (REGION_SIZE - 1), HEADER_BYTES);
    }

    #[test]
    fn collection_reclaims_unrooted_storage() {
        let global = Global::new(1, &[]);
        for _ in 0..1000 {
            Value::alloc_vector(&global.heap, Type::Double, 512);
        }
        let before = global.heap.total();
        global.collect();
        let after = global.heap.total();
        assert!(after < before, "{} should shrink below {}", after, before);
        // The region being allocated into always survives.
        assert!(after >= REGION_SIZE);
        global.shutdown();
    }

    #[test]
    fn rooted_values_survive_collection() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());
        let mut v = Value::alloc_vector(&global.heap, Type::Integer, 8);
        v.integer_slice_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        state.protect(v);
        for _ in 0..1000 {
            Value::alloc_vector(&global.heap, Type::Double, 512);
        }
        global.collect();
        assert_eq!(v.integer_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        state.unprotect(1);
        drop(state);
        global.shutdown();
    }

    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn count_finalizer(_obj: *mut u8) {
        FINALIZED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn finalizers_run_exactly_once_and_only_for_the_dead() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());

        FINALIZED.store(0, Ordering::SeqCst);
        let live = Value::externalptr(
            &global.heap,
            std::ptr::null_mut(),
            Value::nil(),
            Value::nil(),
            Some(count_finalizer),
        );
        state.protect(live);
        let _dead = Value::externalptr(
            &global.heap,
            std::ptr::null_mut(),
            Value::nil(),
            Value::nil(),
            Some(count_finalizer),
        );

        global.collect();
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
        global.collect();
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);

        state.unprotect(1);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn swept_regions_return_to_the_pool() {
        let global = Global::new(1, &[]);
        for _ in 0..2000 {
            Value::alloc_vector(&global.heap, Type::Double, 1024);
        }
        global.collect();
        let low = global.heap.total();
        // Reallocating the same volume should reuse pooled regions without
        // growing past the previous high-water mark.
        for _ in 0..2000 {
            Value::alloc_vector(&global.heap, Type::Double, 1024);
        }
        global.collect();
        assert!(global.heap.total() <= low + REGION_SIZE);
        global.shutdown();
    }
}
