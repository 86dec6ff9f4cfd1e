/// Interned strings with stable, NUL-terminated storage.
///
/// Every string is interned and lives as long as the interner. Each entry is
/// a separate heap allocation that is never moved or freed before the
/// interner drops, so `as_c_ptr` may be stored in native memory (bound
/// `char *` fields keep pointing at the interned bytes, no copy is made).
use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::fmt;

/// An opaque handle to a string in the interner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StringId(pub u32);

/// A string with precomputed hash. The buffer always carries one trailing NUL
/// that is not part of the contents.
pub struct TString {
    data: Box<[u8]>,
    hash: u32,
}

impl TString {
    fn new(bytes: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(bytes.len() + 1);
        buf.extend_from_slice(bytes);
        buf.push(0);
        TString {
            data: buf.into_boxed_slice(),
            hash: lua_hash(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.data.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.data.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pointer to the NUL-terminated contents.
    pub fn as_c_ptr(&self) -> *const c_char {
        self.data.as_ptr().cast()
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

impl fmt::Debug for TString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "\"{s}\""),
            Err(_) => write!(f, "<binary string len={}>", self.len()),
        }
    }
}

/// PUC Lua 5.4 compatible string hash (luaS_hash).
pub fn lua_hash(bytes: &[u8]) -> u32 {
    let len = bytes.len();
    let mut h = len as u32;
    let step = (len >> 5) + 1;
    let mut i = len;
    while i >= step {
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(bytes[i - 1] as u32);
        i -= step;
    }
    h
}

/// Owns every string of a runtime state and deduplicates them.
#[derive(Default)]
pub struct StringInterner {
    strings: Vec<TString>,
    lookup: HashMap<u32, Vec<u32>>,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, returning the existing id if it is already present.
    pub fn intern(&mut self, bytes: &[u8]) -> StringId {
        if let Some(id) = self.find(bytes) {
            return id;
        }
        let id = self.strings.len() as u32;
        let s = TString::new(bytes);
        self.lookup.entry(s.hash).or_default().push(id);
        self.strings.push(s);
        StringId(id)
    }

    /// Look up a string without inserting it.
    pub fn find(&self, bytes: &[u8]) -> Option<StringId> {
        let ids = self.lookup.get(&lua_hash(bytes))?;
        ids.iter()
            .copied()
            .find(|&id| self.strings[id as usize].as_bytes() == bytes)
            .map(StringId)
    }

    /// Intern the contents of a NUL-terminated C string.
    ///
    /// # Safety
    /// `ptr` must be non-null and point to a valid NUL-terminated string.
    pub unsafe fn intern_c_str(&mut self, ptr: *const c_char) -> StringId {
        self.intern(CStr::from_ptr(ptr).to_bytes())
    }

    pub fn get(&self, id: StringId) -> &TString {
        &self.strings[id.0 as usize]
    }

    pub fn get_bytes(&self, id: StringId) -> &[u8] {
        self.strings[id.0 as usize].as_bytes()
    }

    /// Stable pointer to the NUL-terminated contents of an interned string.
    pub fn as_c_ptr(&self, id: StringId) -> *const c_char {
        self.strings[id.0 as usize].as_c_ptr()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl fmt::Debug for StringInterner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringInterner")
            .field("len", &self.strings.len())
            .finish()
    }
}
