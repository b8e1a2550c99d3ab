//! Process-wide string interning.
//!
//! Names are canonicalized once and live for the lifetime of the process, so
//! a [`Symbol`] is a thin, stable handle with pointer-equality semantics. The
//! handle fits in a single payload word, which is what lets character data
//! ride inline in values and lets the dictionary hash on the handle address.

use std::alloc::{alloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::OnceLock;

use parking_lot::Mutex;

/// Length-prefixed interned bytes. The byte payload follows the header
/// inline; allocations are never freed.
#[repr(C)]
struct SymbolData {
    len: usize,
    // bytes follow
}

/// A canonical handle for an interned string.
///
/// Two symbols are equal iff their underlying byte sequences are equal, and
/// that comparison is a pointer comparison. Symbols are 8-byte aligned so the
/// low address bits are free for hashing tricks.
#[derive(Clone, Copy)]
pub struct Symbol(NonNull<SymbolData>);

// SAFETY: the pointed-to data is immutable and never freed.
unsafe impl Send for Symbol {}
// SAFETY: the pointed-to data is immutable and never freed.
unsafe impl Sync for Symbol {}

impl Symbol {
    pub fn as_str(&self) -> &'static str {
        unsafe {
            let data = self.0.as_ref();
            let bytes = std::slice::from_raw_parts(
                (self.0.as_ptr() as *const u8).add(std::mem::size_of::<usize>()),
                data.len,
            );
            std::str::from_utf8_unchecked(bytes)
        }
    }

    #[inline(always)]
    pub fn addr(self) -> u64 {
        self.0.as_ptr() as u64
    }

    /// Rebuild a symbol from a payload word.
    ///
    /// # Safety
    ///
    /// `addr` must have been produced by [`Symbol::addr`].
    #[inline(always)]
    pub unsafe fn from_addr(addr: u64) -> Symbol {
        Symbol(NonNull::new_unchecked(addr as *mut SymbolData))
    }
}

impl PartialEq for Symbol {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Symbol {}

impl std::hash::Hash for Symbol {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.addr());
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Symbol({:?})", self.as_str())
    }
}

struct StringTable {
    map: Mutex<HashMap<&'static str, Symbol, ahash::RandomState>>,
}

impl StringTable {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::default()),
        }
    }

    fn intern(&self, s: &str) -> Symbol {
        let mut map = self.map.lock();
        if let Some(&sym) = map.get(s) {
            return sym;
        }
        let sym = Self::leak(s);
        map.insert(sym.as_str(), sym);
        sym
    }

    fn leak(s: &str) -> Symbol {
        let size = std::mem::size_of::<usize>() + s.len();
        let layout = Layout::from_size_align(size.max(std::mem::size_of::<usize>() + 1), 8)
            .expect("symbol layout");
        unsafe {
            let ptr = alloc(layout) as *mut SymbolData;
            assert!(!ptr.is_null(), "out of memory interning string");
            (*ptr).len = s.len();
            let bytes = (ptr as *mut u8).add(std::mem::size_of::<usize>());
            std::ptr::copy_nonoverlapping(s.as_ptr(), bytes, s.len());
            Symbol(NonNull::new_unchecked(ptr))
        }
    }
}

static TABLE: OnceLock<StringTable> = OnceLock::new();

/// Intern `s`, returning its canonical handle.
pub fn intern(s: &str) -> Symbol {
    TABLE.get_or_init(StringTable::new).intern(s)
}

/// The well-known names the runtime reaches for constantly: the dictionary
/// sentinel, the reserved call bookkeeping bindings, and operator names.
pub struct Strings {
    pub na: Symbol,
    pub empty: Symbol,
    pub dots: Symbol,
    pub names: Symbol,
    pub parent: Symbol,
    pub call: Symbol,
    pub function: Symbol,
    pub nargs: Symbol,
    pub stop: Symbol,
    pub quote: Symbol,
    pub add: Symbol,
    pub sub: Symbol,
    pub mul: Symbol,
    pub div: Symbol,
    pub modulo: Symbol,
    pub pow: Symbol,
    pub eq: Symbol,
    pub neq: Symbol,
    pub lt: Symbol,
    pub le: Symbol,
    pub gt: Symbol,
    pub ge: Symbol,
    pub neg: Symbol,
    pub not: Symbol,
    pub bb: Symbol,
    pub ifelse: Symbol,
}

impl Strings {
    fn build() -> Self {
        Strings {
            na: intern("NA"),
            empty: intern(""),
            dots: intern("..."),
            names: intern("__names__"),
            parent: intern("__parent__"),
            call: intern("__call__"),
            function: intern("__function__"),
            nargs: intern("__nargs__"),
            stop: intern("__stop__"),
            quote: intern("quote"),
            add: intern("+"),
            sub: intern("-"),
            mul: intern("*"),
            div: intern("/"),
            modulo: intern("%%"),
            pow: intern("^"),
            eq: intern("=="),
            neq: intern("!="),
            lt: intern("<"),
            le: intern("<="),
            gt: intern(">"),
            ge: intern(">="),
            neg: intern("-"),
            not: intern("!"),
            bb: intern("[["),
            ifelse: intern("ifelse"),
        }
    }
}

static STRINGS: OnceLock<Strings> = OnceLock::new();

pub fn strings() -> &'static Strings {
    STRINGS.get_or_init(Strings::build)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn interning_is_idempotent() {
        let a = intern("alpha");
        let b = intern("alpha");
        let c = intern("beta");
        assert_eq!(a, b);
        assert_eq!(a.addr(), b.addr());
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "alpha");
        assert_eq!(c.as_str(), "beta");
    }

    #[test]
    fn equality_matches_byte_equality() {
        let s1 = String::from("long") + "name";
        let s2 = String::from("longname");
        assert_eq!(intern(&s1), intern(&s2));
        assert_ne!(intern("longname"), intern("longnamE"));
    }

    #[test]
    fn empty_string_interns() {
        let e = intern("");
        assert_eq!(e.as_str(), "");
        assert_eq!(e, strings().empty);
    }

    #[test]
    fn concurrent_interning_yields_one_handle() {
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(|| intern("shared-name").addr()))
            .collect();
        let addrs: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn handles_are_word_aligned() {
        assert_eq!(intern("x").addr() & 0x7, 0);
        assert_eq!(intern("a-much-longer-name").addr() & 0x7, 0);
    }
}
