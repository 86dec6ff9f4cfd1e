//! GC heap with arena-based allocation, typed indices and mark/sweep state.

use crate::string::StringId;
use crate::table::Table;
use crate::value::TValue;
use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// A typed index into an arena in the GcHeap.
#[derive(Debug)]
pub struct GcIdx<T>(pub u32, pub PhantomData<T>);

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> GcIdx<T> {
    pub fn new(index: u32) -> Self {
        GcIdx(index, PhantomData)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// Sub-tags for GC objects (stored in bits 44-46 of payload).
pub const GC_SUB_TABLE: u64 = 0;
pub const GC_SUB_NATIVE: u64 = 1;
pub const GC_SUB_USERDATA: u64 = 2;
pub const GC_SUB_BOXED_INT: u64 = 3;
pub const GC_SUB_STRING: u64 = 4;

/// Bits used for sub-tag within the 47-bit payload.
pub const GC_SUB_SHIFT: u64 = 44;
pub const GC_SUB_MASK: u64 = 0x7;
/// Mask for the index within the payload.
pub const GC_INDEX_MASK: u64 = (1u64 << 44) - 1;

/// Alignment of every userdata block.
pub const USERDATA_ALIGN: usize = 16;

/// Implemented by function payloads so the collector can reach the values
/// they capture.
pub trait Trace {
    fn trace(&self, out: &mut Vec<TValue>);
}

impl Trace for () {
    fn trace(&self, _out: &mut Vec<TValue>) {}
}

/// A full userdata: an owned, zeroed, 16-byte aligned memory block that
/// never moves for as long as the object lives.
pub struct Userdata {
    block: NonNull<u8>,
    layout: Layout,
    size: usize,
    pub metatable: Option<GcIdx<Table>>,
    pub user_value: TValue,
}

impl Userdata {
    fn new(size: usize) -> Self {
        // Zero-sized blocks still get a unique address.
        let layout = match Layout::from_size_align(size.max(1), USERDATA_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("userdata size {size} overflows the address space"),
        };
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let block = match NonNull::new(raw) {
            Some(block) => block,
            None => alloc::handle_alloc_error(layout),
        };
        Userdata {
            block,
            layout,
            size,
            metatable: None,
            user_value: TValue::nil(),
        }
    }

    /// Start of the memory block.
    pub fn as_ptr(&self) -> *mut u8 {
        self.block.as_ptr()
    }

    /// Requested size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Userdata {
    fn drop(&mut self) {
        // SAFETY: block was allocated in `new` with exactly this layout.
        unsafe { alloc::dealloc(self.block.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for Userdata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "userdata({:p}, {} bytes)", self.block, self.size)
    }
}

/// Mark bits, gray lists and the finalization queue of the collector.
#[derive(Debug, Default)]
pub struct GcState {
    pub table_marks: Vec<bool>,
    pub native_marks: Vec<bool>,
    pub userdata_marks: Vec<bool>,
    pub boxed_int_marks: Vec<bool>,
    /// Userdata whose finalizer already ran; survives across cycles.
    pub userdata_finalized: Vec<bool>,
    pub gray_tables: Vec<u32>,
    pub gray_natives: Vec<u32>,
    pub gray_userdata: Vec<u32>,
    /// Objects resurrected for finalization in the current cycle.
    pub finalization_queue: Vec<TValue>,
    /// Allocations since the last completed cycle.
    pub allocs_since_collect: usize,
    /// Run a cycle after this many allocations (`None` disables stepping).
    pub step_interval: Option<usize>,
}

/// Arena-based GC heap. `F` is the native function payload, supplied by
/// the runtime layer.
pub struct GcHeap<F> {
    pub tables: Vec<Option<Table>>,
    table_free: Vec<u32>,
    pub natives: Vec<Option<F>>,
    native_free: Vec<u32>,
    pub userdata: Vec<Option<Userdata>>,
    userdata_free: Vec<u32>,
    pub boxed_ints: Vec<Option<i64>>,
    boxed_int_free: Vec<u32>,
    pub gc_state: GcState,
}

fn alloc_slot<T>(arena: &mut Vec<Option<T>>, free: &mut Vec<u32>, value: T) -> u32 {
    if let Some(idx) = free.pop() {
        arena[idx as usize] = Some(value);
        idx
    } else {
        let idx = arena.len() as u32;
        arena.push(Some(value));
        idx
    }
}

fn sweep_arena<T>(arena: &mut [Option<T>], free: &mut Vec<u32>, marks: &[bool]) -> usize {
    let mut freed = 0;
    for (i, slot) in arena.iter_mut().enumerate() {
        if slot.is_some() && !marks.get(i).copied().unwrap_or(true) {
            *slot = None;
            free.push(i as u32);
            freed += 1;
        }
    }
    freed
}

fn mark(marks: &mut [bool], gray: Option<&mut Vec<u32>>, idx: u32) {
    if let Some(m) = marks.get_mut(idx as usize) {
        if !*m {
            *m = true;
            if let Some(gray) = gray {
                gray.push(idx);
            }
        }
    }
}

impl<F> GcHeap<F> {
    pub fn new() -> Self {
        GcHeap {
            tables: Vec::new(),
            table_free: Vec::new(),
            natives: Vec::new(),
            native_free: Vec::new(),
            userdata: Vec::new(),
            userdata_free: Vec::new(),
            boxed_ints: Vec::new(),
            boxed_int_free: Vec::new(),
            gc_state: GcState::default(),
        }
    }

    pub fn alloc_boxed_int(&mut self, val: i64) -> GcIdx<i64> {
        self.gc_state.allocs_since_collect += 1;
        GcIdx::new(alloc_slot(&mut self.boxed_ints, &mut self.boxed_int_free, val))
    }

    pub fn get_boxed_int(&self, idx: GcIdx<i64>) -> i64 {
        self.boxed_ints[idx.0 as usize].expect("boxed int was freed")
    }

    pub fn alloc_table(&mut self, array_hint: usize, hash_hint: usize) -> GcIdx<Table> {
        self.gc_state.allocs_since_collect += 1;
        let table = Table::new(array_hint, hash_hint);
        GcIdx::new(alloc_slot(&mut self.tables, &mut self.table_free, table))
    }

    pub fn get_table(&self, idx: GcIdx<Table>) -> &Table {
        self.tables[idx.0 as usize].as_ref().expect("table was freed")
    }

    pub fn get_table_mut(&mut self, idx: GcIdx<Table>) -> &mut Table {
        self.tables[idx.0 as usize].as_mut().expect("table was freed")
    }

    pub fn alloc_native(&mut self, native: F) -> u32 {
        self.gc_state.allocs_since_collect += 1;
        alloc_slot(&mut self.natives, &mut self.native_free, native)
    }

    pub fn get_native(&self, idx: u32) -> &F {
        self.natives[idx as usize].as_ref().expect("native fn was freed")
    }

    pub fn get_native_mut(&mut self, idx: u32) -> &mut F {
        self.natives[idx as usize].as_mut().expect("native fn was freed")
    }

    /// Allocate a zeroed userdata block of `size` bytes.
    pub fn alloc_userdata(&mut self, size: usize) -> GcIdx<Userdata> {
        self.gc_state.allocs_since_collect += 1;
        let idx = alloc_slot(&mut self.userdata, &mut self.userdata_free, Userdata::new(size));
        let finalized = &mut self.gc_state.userdata_finalized;
        if finalized.len() <= idx as usize {
            finalized.resize(idx as usize + 1, false);
        }
        finalized[idx as usize] = false;
        GcIdx::new(idx)
    }

    pub fn get_userdata(&self, idx: GcIdx<Userdata>) -> &Userdata {
        self.userdata[idx.0 as usize].as_ref().expect("userdata was freed")
    }

    pub fn get_userdata_mut(&mut self, idx: GcIdx<Userdata>) -> &mut Userdata {
        self.userdata[idx.0 as usize].as_mut().expect("userdata was freed")
    }

    /// Number of live objects across all arenas.
    pub fn live_objects(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
            + self.natives.iter().filter(|n| n.is_some()).count()
            + self.userdata.iter().filter(|u| u.is_some()).count()
            + self.boxed_ints.iter().filter(|b| b.is_some()).count()
    }

    /// True when enough allocations happened since the last cycle.
    pub fn gc_should_step(&self) -> bool {
        self.gc_state
            .step_interval
            .is_some_and(|n| self.gc_state.allocs_since_collect >= n)
    }

    /// Reset mark bits for a new cycle.
    pub fn gc_prepare_marks(&mut self) {
        let st = &mut self.gc_state;
        st.table_marks = vec![false; self.tables.len()];
        st.native_marks = vec![false; self.natives.len()];
        st.userdata_marks = vec![false; self.userdata.len()];
        st.boxed_int_marks = vec![false; self.boxed_ints.len()];
        st.gray_tables.clear();
        st.gray_natives.clear();
        st.gray_userdata.clear();
    }

    /// Mark a value reachable and queue it for traversal.
    pub fn gc_mark_value(&mut self, v: TValue) {
        let (Some(sub), Some(idx)) = (v.gc_sub_tag(), v.gc_index()) else {
            return;
        };
        let st = &mut self.gc_state;
        match sub {
            GC_SUB_TABLE => mark(&mut st.table_marks, Some(&mut st.gray_tables), idx),
            GC_SUB_NATIVE => mark(&mut st.native_marks, Some(&mut st.gray_natives), idx),
            GC_SUB_USERDATA => mark(&mut st.userdata_marks, Some(&mut st.gray_userdata), idx),
            GC_SUB_BOXED_INT => mark(&mut st.boxed_int_marks, None, idx),
            // Strings are permanent.
            _ => {}
        }
    }

    pub fn is_marked(&self, v: TValue) -> bool {
        let (Some(sub), Some(idx)) = (v.gc_sub_tag(), v.gc_index()) else {
            return true;
        };
        let st = &self.gc_state;
        let marks = match sub {
            GC_SUB_TABLE => &st.table_marks,
            GC_SUB_NATIVE => &st.native_marks,
            GC_SUB_USERDATA => &st.userdata_marks,
            GC_SUB_BOXED_INT => &st.boxed_int_marks,
            _ => return true,
        };
        marks.get(idx as usize).copied().unwrap_or(true)
    }

    /// Unreachable userdata that has not been finalized yet and whose
    /// metatable carries `gc_key`. Must run after propagation.
    pub fn unmarked_finalizable(&self, gc_key: StringId) -> Vec<GcIdx<Userdata>> {
        let st = &self.gc_state;
        self.userdata
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let ud = slot.as_ref()?;
                if st.userdata_marks.get(i).copied().unwrap_or(true)
                    || st.userdata_finalized.get(i).copied().unwrap_or(false)
                {
                    return None;
                }
                let mt = self.tables[ud.metatable?.0 as usize].as_ref()?;
                (!mt.raw_get_str(gc_key).is_nil()).then(|| GcIdx::new(i as u32))
            })
            .collect()
    }

    /// Record that the finalizer of `idx` ran; it will not run again.
    pub fn mark_finalized(&mut self, idx: GcIdx<Userdata>) {
        if let Some(flag) = self.gc_state.userdata_finalized.get_mut(idx.0 as usize) {
            *flag = true;
        }
    }

    pub fn is_finalized(&self, idx: GcIdx<Userdata>) -> bool {
        self.gc_state
            .userdata_finalized
            .get(idx.0 as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Sweep everything left unmarked. Returns the number of objects freed.
    pub fn gc_sweep(&mut self) -> usize {
        let st = &self.gc_state;
        let mut freed = sweep_arena(&mut self.tables, &mut self.table_free, &st.table_marks);
        freed += sweep_arena(&mut self.natives, &mut self.native_free, &st.native_marks);
        freed += sweep_arena(&mut self.userdata, &mut self.userdata_free, &st.userdata_marks);
        freed += sweep_arena(&mut self.boxed_ints, &mut self.boxed_int_free, &st.boxed_int_marks);
        self.gc_state.allocs_since_collect = 0;
        freed
    }
}

impl<F: Trace> GcHeap<F> {
    /// Drain the gray lists, marking everything reachable from them.
    /// Returns the number of objects traversed.
    pub fn gc_propagate(&mut self) -> usize {
        let mut work = 0;
        let mut pending = Vec::new();
        loop {
            pending.clear();
            if let Some(i) = self.gc_state.gray_tables.pop() {
                if let Some(t) = self.tables[i as usize].as_ref() {
                    if let Some(mt) = t.metatable {
                        pending.push(TValue::from_table(mt));
                    }
                    pending.extend(t.references());
                }
            } else if let Some(i) = self.gc_state.gray_natives.pop() {
                if let Some(n) = self.natives[i as usize].as_ref() {
                    n.trace(&mut pending);
                }
            } else if let Some(i) = self.gc_state.gray_userdata.pop() {
                if let Some(u) = self.userdata[i as usize].as_ref() {
                    if let Some(mt) = u.metatable {
                        pending.push(TValue::from_table(mt));
                    }
                    pending.push(u.user_value);
                }
            } else {
                return work;
            }
            work += 1;
            for v in pending.drain(..) {
                self.gc_mark_value(v);
            }
        }
    }
}

impl<F> Default for GcHeap<F> {
    fn default() -> Self {
        Self::new()
    }
}
