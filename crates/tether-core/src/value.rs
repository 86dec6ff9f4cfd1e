//! The 8-byte value every stack slot, table entry and upvalue holds.
//!
//! Doubles are stored as themselves. Everything else lives in the quiet-NaN
//! space: the 3 bits above the 47-bit payload say what the payload is.
//!
//! | bits 49..47 | payload |
//! |---|---|
//! | `000` | none: the one canonical NaN |
//! | `001` | nil |
//! | `010` | bool in bit 0 |
//! | `011` | signed 47-bit integer |
//! | `100` | heap object: 3-bit sub-tag, then arena slot |
//! | `101` | light handle: a raw address below 2^47 |
//!
//! Integers outside 47 bits are boxed on the heap (`GC_SUB_BOXED_INT`), so a
//! host `i64` always survives a trip through the stack.
use crate::gc::*;
use crate::string::StringId;
use crate::table::Table;
use std::fmt;
use std::marker::PhantomData;

const QNAN: u64 = 0x7FF8_0000_0000_0000;
const TAG_MASK: u64 = 0x0007_0000_0000_0000;
const PAYLOAD_MASK: u64 = 0x0000_7FFF_FFFF_FFFF;

const TAG_NIL: u64 = 0x0001_0000_0000_0000;
const TAG_BOOL: u64 = 0x0002_0000_0000_0000;
const TAG_INT: u64 = 0x0003_0000_0000_0000;
const TAG_GC: u64 = 0x0004_0000_0000_0000;
const TAG_LIGHT: u64 = 0x0005_0000_0000_0000;

/// Largest integer stored without boxing.
pub const SMALL_INT_MAX: i64 = (1i64 << 46) - 1;
/// Smallest integer stored without boxing.
pub const SMALL_INT_MIN: i64 = -(1i64 << 46);

/// What the bits of a [`TValue`] encode.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Float,
    Nil,
    Bool,
    Int,
    Gc(u64),
    Light,
}

#[derive(Clone, Copy)]
pub struct TValue(u64);

impl TValue {
    #[inline]
    fn kind(&self) -> Kind {
        if self.0 & QNAN != QNAN {
            return Kind::Float;
        }
        match self.0 & TAG_MASK {
            0 => Kind::Float,
            TAG_NIL => Kind::Nil,
            TAG_BOOL => Kind::Bool,
            TAG_INT => Kind::Int,
            TAG_GC => Kind::Gc(((self.0 & PAYLOAD_MASK) >> GC_SUB_SHIFT) & GC_SUB_MASK),
            _ => Kind::Light,
        }
    }

    #[inline]
    fn payload(&self) -> u64 {
        self.0 & PAYLOAD_MASK
    }

    #[inline]
    pub fn nil() -> Self {
        TValue(QNAN | TAG_NIL)
    }

    #[inline]
    pub fn from_bool(b: bool) -> Self {
        TValue(QNAN | TAG_BOOL | b as u64)
    }

    /// Every NaN collapses to the canonical one.
    #[inline]
    pub fn from_float(f: f64) -> Self {
        TValue(if f.is_nan() { QNAN } else { f.to_bits() })
    }

    /// # Panics
    ///
    /// If `i` needs more than 47 bits. Host integers go through
    /// [`TValue::from_full_integer`].
    #[inline]
    pub fn from_integer(i: i64) -> Self {
        assert!(
            (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&i),
            "integer {i} outside 47-bit range [{SMALL_INT_MIN}, {SMALL_INT_MAX}]"
        );
        TValue(QNAN | TAG_INT | (i as u64 & PAYLOAD_MASK))
    }

    /// `None` when the address does not fit the payload.
    #[inline]
    pub fn from_light(addr: usize) -> Option<Self> {
        let addr = addr as u64;
        (addr & !PAYLOAD_MASK == 0).then_some(TValue(QNAN | TAG_LIGHT | addr))
    }

    #[inline]
    fn from_gc(sub: u64, slot: u32) -> Self {
        let payload = (sub << GC_SUB_SHIFT) | slot as u64;
        debug_assert_eq!(payload & !PAYLOAD_MASK, 0);
        TValue(QNAN | TAG_GC | payload)
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.kind() == Kind::Nil
    }

    #[inline]
    pub fn is_bool(&self) -> bool {
        self.kind() == Kind::Bool
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        self.kind() == Kind::Float
    }

    /// Unboxed integers only.
    #[inline]
    pub fn is_integer(&self) -> bool {
        self.kind() == Kind::Int
    }

    #[inline]
    pub fn is_gc(&self) -> bool {
        matches!(self.kind(), Kind::Gc(_))
    }

    #[inline]
    pub fn is_light(&self) -> bool {
        self.kind() == Kind::Light
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self.kind(), Kind::Float | Kind::Int | Kind::Gc(GC_SUB_BOXED_INT))
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        (self.kind() == Kind::Float).then(|| f64::from_bits(self.0))
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        self.is_bool().then(|| self.0 & 1 == 1)
    }

    #[inline]
    pub fn as_integer(&self) -> Option<i64> {
        // Shift the 47-bit payload to the top so the sign bit extends.
        self.is_integer().then(|| ((self.payload() << 17) as i64) >> 17)
    }

    #[inline]
    pub fn as_light(&self) -> Option<usize> {
        self.is_light().then(|| self.payload() as usize)
    }

    #[inline]
    pub fn gc_sub_tag(&self) -> Option<u64> {
        match self.kind() {
            Kind::Gc(sub) => Some(sub),
            _ => None,
        }
    }

    /// Arena slot of a heap object.
    #[inline]
    pub fn gc_index(&self) -> Option<u32> {
        self.is_gc().then(|| (self.payload() & GC_INDEX_MASK) as u32)
    }

    #[inline]
    fn slot_of(&self, sub: u64) -> Option<u32> {
        if self.gc_sub_tag() == Some(sub) {
            self.gc_index()
        } else {
            None
        }
    }

    #[inline]
    pub fn from_string_id(id: StringId) -> Self {
        Self::from_gc(GC_SUB_STRING, id.0)
    }

    #[inline]
    pub fn as_string_id(&self) -> Option<StringId> {
        self.slot_of(GC_SUB_STRING).map(StringId)
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        self.gc_sub_tag() == Some(GC_SUB_STRING)
    }

    #[inline]
    pub fn from_table(idx: GcIdx<Table>) -> Self {
        Self::from_gc(GC_SUB_TABLE, idx.0)
    }

    #[inline]
    pub fn as_table_idx(&self) -> Option<GcIdx<Table>> {
        self.slot_of(GC_SUB_TABLE).map(|i| GcIdx(i, PhantomData))
    }

    #[inline]
    pub fn is_table(&self) -> bool {
        self.gc_sub_tag() == Some(GC_SUB_TABLE)
    }

    /// The runtime owns the native-function payload type, so the slot is
    /// untyped at this level.
    #[inline]
    pub fn from_native(slot: u32) -> Self {
        Self::from_gc(GC_SUB_NATIVE, slot)
    }

    #[inline]
    pub fn as_native_idx(&self) -> Option<u32> {
        self.slot_of(GC_SUB_NATIVE)
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        self.gc_sub_tag() == Some(GC_SUB_NATIVE)
    }

    #[inline]
    pub fn from_userdata(idx: GcIdx<Userdata>) -> Self {
        Self::from_gc(GC_SUB_USERDATA, idx.0)
    }

    #[inline]
    pub fn as_userdata_idx(&self) -> Option<GcIdx<Userdata>> {
        self.slot_of(GC_SUB_USERDATA).map(|i| GcIdx(i, PhantomData))
    }

    #[inline]
    pub fn is_userdata(&self) -> bool {
        self.gc_sub_tag() == Some(GC_SUB_USERDATA)
    }

    /// Stores `i` inline when it fits, otherwise boxes it in `gc`.
    pub fn from_full_integer<F>(i: i64, gc: &mut GcHeap<F>) -> Self {
        if (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&i) {
            Self::from_integer(i)
        } else {
            Self::from_gc(GC_SUB_BOXED_INT, gc.alloc_boxed_int(i).0)
        }
    }

    pub fn as_full_integer<F>(&self, gc: &GcHeap<F>) -> Option<i64> {
        self.as_integer().or_else(|| {
            self.slot_of(GC_SUB_BOXED_INT)
                .map(|i| gc.get_boxed_int(GcIdx(i, PhantomData)))
        })
    }

    pub fn as_number<F>(&self, gc: &GcHeap<F>) -> Option<f64> {
        self.as_float()
            .or_else(|| self.as_full_integer(gc).map(|i| i as f64))
    }

    /// Nil and false.
    #[inline]
    pub fn is_falsy(&self) -> bool {
        matches!(self.kind(), Kind::Nil) || self.as_bool() == Some(false)
    }

    #[inline]
    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    /// Identity of the encoding; table keys and the handler cache use it.
    #[inline]
    pub fn raw_bits(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw_bits(bits: u64) -> Self {
        TValue(bits)
    }
}

impl Default for TValue {
    fn default() -> Self {
        TValue::nil()
    }
}

impl fmt::Debug for TValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Kind::Nil => write!(f, "nil"),
            Kind::Bool => write!(f, "{}", self.0 & 1 == 1),
            Kind::Int => write!(f, "{}", ((self.payload() << 17) as i64) >> 17),
            Kind::Float => write!(f, "{}", f64::from_bits(self.0)),
            Kind::Light => write!(f, "light({:#x})", self.payload()),
            Kind::Gc(sub) => {
                let slot = self.payload() & GC_INDEX_MASK;
                let what = match sub {
                    GC_SUB_STRING => "string",
                    GC_SUB_TABLE => "table",
                    GC_SUB_NATIVE => "native",
                    GC_SUB_USERDATA => "userdata",
                    GC_SUB_BOXED_INT => "boxedint",
                    _ => "gc",
                };
                write!(f, "{what}(#{slot})")
            }
        }
    }
}

/// Raw equality. Floats compare as IEEE doubles, so NaN differs from
/// itself; everything else compares by encoding. Boxed integers are
/// compared by slot, not by value.
impl PartialEq for TValue {
    fn eq(&self, other: &Self) -> bool {
        match (self.as_float(), other.as_float()) {
            (Some(a), Some(b)) => a == b,
            _ => self.0 == other.0,
        }
    }
}
