//! Runtime state: value stack, call frames, registry, globals and collector.

use crate::cache::{CacheKey, IdentityCache};
use crate::callinfo::{CallInfo, FrameInfo, Origin};
use crate::config::StateConfig;
use crate::error::LuaError;
use crate::index::{Pseudo, StackIndex};
use crate::metamethod::MetamethodNames;
use std::ffi::{c_char, c_void};
use std::panic::Location;
use std::ptr::NonNull;
use std::rc::Rc;
use tether_core::gc::{GcHeap, GcIdx, Trace};
use tether_core::object::{format_float, ValueType};
use tether_core::string::{StringId, StringInterner};
use tether_core::table::{Table, TableKey};
use tether_core::value::TValue;

/// Signature of a native function. Arguments occupy the frame's slots
/// `1..=top`; the function returns how many values on top of its stack
/// are results.
pub type NativeFn = fn(&mut State) -> Result<usize, LuaError>;

/// A native closure over Rust state.
pub type RustFn = Rc<dyn Fn(&mut State) -> Result<usize, LuaError>>;

/// Pass as `nresults` to keep every result.
pub const MULTRET: i32 = -1;

/// Longest `__index`/`__newindex` chain followed before giving up.
const MAX_META_CHAIN: usize = 100;

#[derive(Clone)]
pub enum Callable {
    Fn(NativeFn),
    Closure(RustFn),
}

/// Heap payload of a function value.
pub struct NativeFunction {
    pub callable: Callable,
    pub upvalues: Vec<TValue>,
    pub origin: Origin,
}

impl Trace for NativeFunction {
    fn trace(&self, out: &mut Vec<TValue>) {
        out.extend_from_slice(&self.upvalues);
    }
}

/// One active protected call.
struct HandlerSlot {
    handler: Option<TValue>,
    running: bool,
    result: Option<Decorated>,
}

/// A handler result and the error value it was computed from.
#[derive(Clone, Copy)]
struct Decorated {
    source: TValue,
    value: TValue,
}

impl Decorated {
    fn decorates(&self, err: TValue) -> bool {
        self.source.raw_bits() == err.raw_bits()
    }
}

/// A single runtime state. Every operation runs against its one stack.
pub struct State {
    stack: Vec<TValue>,
    call_stack: Vec<CallInfo>,
    pub gc: GcHeap<NativeFunction>,
    pub strings: StringInterner,
    registry: GcIdx<Table>,
    globals: GcIdx<Table>,
    cache: IdentityCache,
    handlers: Vec<HandlerSlot>,
    names: MetamethodNames,
    config: StateConfig,
    call_site: Option<&'static Location<'static>>,
    collecting: bool,
    closed: bool,
}

impl State {
    pub fn new() -> Self {
        Self::with_config(StateConfig::default())
    }

    pub fn with_config(config: StateConfig) -> Self {
        let mut gc = GcHeap::new();
        gc.gc_state.step_interval = config.gc_interval;
        let registry = gc.alloc_table(0, 8);
        let globals = gc.alloc_table(0, 32);
        let mut strings = StringInterner::new();
        let names = MetamethodNames::init(&mut strings);
        State {
            stack: Vec::with_capacity(64),
            call_stack: Vec::new(),
            gc,
            strings,
            registry,
            globals,
            cache: IdentityCache::default(),
            handlers: Vec::new(),
            names,
            config,
            call_site: None,
            collecting: false,
            closed: false,
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    // ---- Index resolution ----

    fn base(&self) -> usize {
        self.call_stack.last().map_or(0, |ci| ci.base)
    }

    /// Number of values in the running frame.
    pub fn top(&self) -> usize {
        self.stack.len() - self.base()
    }

    /// Absolute position in the stack vector, if `idx` names a live slot.
    fn slot(&self, idx: StackIndex) -> Option<usize> {
        let base = self.base();
        match idx {
            StackIndex::Absolute(n) if n >= 1 && base + n <= self.stack.len() => Some(base + n - 1),
            StackIndex::RelativeToTop(n) if n >= 1 && n <= self.stack.len() - base => {
                Some(self.stack.len() - n)
            }
            _ => None,
        }
    }

    /// Whether `idx` names an existing stack slot. Pseudo indices are
    /// always considered valid.
    pub fn is_valid_index(&self, idx: impl Into<StackIndex>) -> bool {
        let idx = idx.into();
        idx.is_pseudo() || self.slot(idx).is_some()
    }

    /// Convert a top-relative index into an absolute one so it stays
    /// meaningful while the stack grows.
    pub fn abs_index(&self, idx: impl Into<StackIndex>) -> StackIndex {
        let idx = idx.into();
        match idx {
            StackIndex::RelativeToTop(n) if n <= self.top() => {
                StackIndex::Absolute(self.top() + 1 - n)
            }
            other => other,
        }
    }

    fn current_function(&self) -> Option<u32> {
        let ci = self.call_stack.last()?;
        self.stack.get(ci.func_stack_idx)?.as_native_idx()
    }

    /// Value at `idx`; nil when the index names nothing.
    pub fn value_at(&self, idx: impl Into<StackIndex>) -> TValue {
        let idx = idx.into();
        match idx {
            StackIndex::Pseudo(Pseudo::Registry) => TValue::from_table(self.registry),
            StackIndex::Pseudo(Pseudo::Environment) => TValue::from_table(self.globals),
            StackIndex::Pseudo(Pseudo::Upvalue(n)) => self
                .current_function()
                .and_then(|f| n.checked_sub(1).and_then(|i| self.gc.get_native(f).upvalues.get(i)))
                .copied()
                .unwrap_or_default(),
            _ => self.slot(idx).map(|p| self.stack[p]).unwrap_or_default(),
        }
    }

    fn store_at(&mut self, idx: StackIndex, v: TValue) -> Result<(), LuaError> {
        match idx {
            StackIndex::Pseudo(Pseudo::Upvalue(n)) => {
                let f = self
                    .current_function()
                    .ok_or_else(|| LuaError::runtime("no running function"))?;
                let upvalues = &mut self.gc.get_native_mut(f).upvalues;
                if n == 0 || n > upvalues.len() {
                    return Err(LuaError::runtime(format!("invalid upvalue index {n}")));
                }
                upvalues[n - 1] = v;
                Ok(())
            }
            StackIndex::Pseudo(Pseudo::Environment) => {
                self.globals = v
                    .as_table_idx()
                    .ok_or_else(|| LuaError::runtime("environment must be a table"))?;
                Ok(())
            }
            StackIndex::Pseudo(Pseudo::Registry) => {
                Err(LuaError::runtime("the registry cannot be replaced"))
            }
            _ => {
                let p = self.slot(idx).ok_or_else(|| bad_index(idx))?;
                self.stack[p] = v;
                Ok(())
            }
        }
    }

    // ---- Stack manipulation ----

    pub fn set_top(&mut self, n: usize) {
        self.stack.resize(self.base() + n, TValue::nil());
    }

    pub fn pop(&mut self, n: usize) {
        let keep = self.stack.len().saturating_sub(n).max(self.base());
        self.stack.truncate(keep);
    }

    /// Ensure `n` more slots can be pushed without exceeding the limit.
    pub fn check_stack(&self, n: usize) -> bool {
        self.stack.len() + n <= self.config.max_stack_slots
    }

    /// Move the top value into `idx`, shifting the values above it up.
    pub fn insert(&mut self, idx: impl Into<StackIndex>) -> Result<(), LuaError> {
        let idx = idx.into();
        let p = self.slot(idx).ok_or_else(|| bad_index(idx))?;
        if let Some(v) = self.stack.pop() {
            self.stack.insert(p, v);
        }
        Ok(())
    }

    /// Remove the value at `idx`, shifting the values above it down.
    pub fn remove(&mut self, idx: impl Into<StackIndex>) -> Result<(), LuaError> {
        let idx = idx.into();
        let p = self.slot(idx).ok_or_else(|| bad_index(idx))?;
        self.stack.remove(p);
        Ok(())
    }

    /// Pop the top value into `idx`.
    pub fn replace(&mut self, idx: impl Into<StackIndex>) -> Result<(), LuaError> {
        let idx = self.abs_index(idx);
        let v = self.value_at(StackIndex::TOP);
        self.store_at(idx, v)?;
        self.pop(1);
        Ok(())
    }

    // ---- Push ----

    pub fn push(&mut self, v: TValue) {
        self.stack.push(v);
    }

    pub fn push_nil(&mut self) {
        self.push(TValue::nil());
    }

    pub fn push_bool(&mut self, b: bool) {
        self.push(TValue::from_bool(b));
    }

    pub fn push_integer(&mut self, i: i64) {
        let v = TValue::from_full_integer(i, &mut self.gc);
        self.push(v);
    }

    pub fn push_number(&mut self, n: f64) {
        self.push(TValue::from_float(n));
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let sid = self.strings.intern(bytes);
        self.push(TValue::from_string_id(sid));
    }

    pub fn push_string(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    /// Push an opaque light handle. A null pointer is a valid handle.
    pub fn push_light(&mut self, ptr: *mut c_void) -> Result<(), LuaError> {
        let v = TValue::from_light(ptr as usize)
            .ok_or_else(|| LuaError::runtime(format!("address {ptr:p} does not fit a light handle")))?;
        self.push(v);
        Ok(())
    }

    /// Push a copy of the value at `idx`.
    pub fn push_value(&mut self, idx: impl Into<StackIndex>) {
        let v = self.value_at(idx);
        self.push(v);
    }

    #[track_caller]
    pub fn push_function(&mut self, f: NativeFn) {
        self.push_native(Callable::Fn(f), 0, Origin::Rust(Location::caller()));
    }

    /// Push a function reporting `name` as its source in frame introspection.
    pub fn push_named_function(&mut self, f: NativeFn, name: &'static str) {
        self.push_native(Callable::Fn(f), 0, Origin::Named(name));
    }

    /// Push `f` closing over the top `n` values, which are popped.
    #[track_caller]
    pub fn push_closure(&mut self, f: NativeFn, n: usize) {
        self.push_native(Callable::Fn(f), n, Origin::Rust(Location::caller()));
    }

    /// Push a Rust closure capturing the top `n` values as upvalues.
    #[track_caller]
    pub fn push_rust_closure<F>(&mut self, f: F, n: usize)
    where
        F: Fn(&mut State) -> Result<usize, LuaError> + 'static,
    {
        self.push_native(Callable::Closure(Rc::new(f)), n, Origin::Rust(Location::caller()));
    }

    fn push_native(&mut self, callable: Callable, n: usize, origin: Origin) {
        self.gc_check();
        let n = n.min(self.top());
        let upvalues = self.stack.split_off(self.stack.len() - n);
        let idx = self.gc.alloc_native(NativeFunction {
            callable,
            upvalues,
            origin,
        });
        self.push(TValue::from_native(idx));
    }

    /// Push a new empty table.
    pub fn new_table(&mut self) {
        self.create_table(0, 0);
    }

    pub fn create_table(&mut self, narr: usize, nrec: usize) {
        self.gc_check();
        let t = self.gc.alloc_table(narr, nrec);
        self.push(TValue::from_table(t));
    }

    /// Push a new zeroed userdata block of `size` bytes and return its address.
    pub fn new_userdata(&mut self, size: usize) -> NonNull<u8> {
        self.gc_check();
        let idx = self.gc.alloc_userdata(size);
        self.push(TValue::from_userdata(idx));
        let ptr = self.gc.get_userdata(idx).as_ptr();
        // SAFETY: userdata blocks are never null.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    // ---- Queries ----

    pub fn value_type(&self, idx: impl Into<StackIndex>) -> ValueType {
        let idx = idx.into();
        if !idx.is_pseudo() && self.slot(idx).is_none() {
            return ValueType::None;
        }
        ValueType::of(self.value_at(idx))
    }

    /// Type name, preferring a `__name` metafield for handles.
    pub fn type_name(&self, idx: impl Into<StackIndex>) -> String {
        let v = self.value_at(idx);
        if let Some(mt) = self.metatable_of(v) {
            if let Some(sid) = self.gc.get_table(mt).raw_get_str(self.names.name).as_string_id() {
                return String::from_utf8_lossy(self.strings.get_bytes(sid)).into_owned();
            }
        }
        ValueType::of(v).name().to_string()
    }

    pub fn is_none(&self, idx: impl Into<StackIndex>) -> bool {
        self.value_type(idx) == ValueType::None
    }

    pub fn is_nil(&self, idx: impl Into<StackIndex>) -> bool {
        self.value_at(idx).is_nil()
    }

    pub fn is_none_or_nil(&self, idx: impl Into<StackIndex>) -> bool {
        self.value_at(idx).is_nil()
    }

    pub fn is_boolean(&self, idx: impl Into<StackIndex>) -> bool {
        self.value_at(idx).is_bool()
    }

    /// True for numbers and strings convertible to numbers.
    pub fn is_number(&self, idx: impl Into<StackIndex>) -> bool {
        self.to_number(idx).is_some()
    }

    /// True for strings and numbers.
    pub fn is_string(&self, idx: impl Into<StackIndex>) -> bool {
        matches!(self.value_type(idx), ValueType::String | ValueType::Number)
    }

    pub fn is_table(&self, idx: impl Into<StackIndex>) -> bool {
        self.value_at(idx).is_table()
    }

    pub fn is_function(&self, idx: impl Into<StackIndex>) -> bool {
        self.value_at(idx).is_function()
    }

    /// True for full userdata and light handles.
    pub fn is_userdata(&self, idx: impl Into<StackIndex>) -> bool {
        let v = self.value_at(idx);
        v.is_userdata() || v.is_light()
    }

    pub fn is_light(&self, idx: impl Into<StackIndex>) -> bool {
        self.value_at(idx).is_light()
    }

    pub fn to_boolean(&self, idx: impl Into<StackIndex>) -> bool {
        self.value_at(idx).is_truthy()
    }

    /// Integer value of a number or numeric string with an exact integer
    /// representation.
    pub fn to_integer(&self, idx: impl Into<StackIndex>) -> Option<i64> {
        let v = self.value_at(idx);
        if let Some(i) = v.as_full_integer(&self.gc) {
            return Some(i);
        }
        let f = match v.as_float() {
            Some(f) => f,
            None => match self.string_number(v)? {
                Ok(i) => return Some(i),
                Err(f) => f,
            },
        };
        float_to_integer(f)
    }

    pub fn to_number(&self, idx: impl Into<StackIndex>) -> Option<f64> {
        let v = self.value_at(idx);
        if let Some(n) = v.as_number(&self.gc) {
            return Some(n);
        }
        match self.string_number(v)? {
            Ok(i) => Some(i as f64),
            Err(f) => Some(f),
        }
    }

    /// Parse a string value as a number: `Ok` for integers, `Err` for floats.
    fn string_number(&self, v: TValue) -> Option<Result<i64, f64>> {
        let sid = v.as_string_id()?;
        let text = std::str::from_utf8(self.strings.get_bytes(sid)).ok()?.trim();
        if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            return u64::from_str_radix(hex, 16).ok().map(|u| Ok(u as i64));
        }
        if let Ok(i) = text.parse::<i64>() {
            return Some(Ok(i));
        }
        text.parse::<f64>().ok().map(Err)
    }

    /// Interned string at `idx`. Numbers are converted in place.
    pub fn to_string_id(&mut self, idx: impl Into<StackIndex>) -> Option<StringId> {
        let idx = idx.into();
        let v = self.value_at(idx);
        if let Some(sid) = v.as_string_id() {
            return Some(sid);
        }
        let text = if let Some(i) = v.as_full_integer(&self.gc) {
            i.to_string()
        } else {
            format_float(v.as_float()?)
        };
        let sid = self.strings.intern(text.as_bytes());
        if let Some(p) = self.slot(idx) {
            self.stack[p] = TValue::from_string_id(sid);
        }
        Some(sid)
    }

    pub fn to_bytes(&mut self, idx: impl Into<StackIndex>) -> Option<&[u8]> {
        let sid = self.to_string_id(idx)?;
        Some(self.strings.get_bytes(sid))
    }

    pub fn to_string_lossy(&mut self, idx: impl Into<StackIndex>) -> Option<String> {
        self.to_bytes(idx)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Stable pointer to the NUL-terminated string at `idx`. The pointer
    /// remains valid for the lifetime of the state.
    pub fn to_c_str(&mut self, idx: impl Into<StackIndex>) -> Option<*const c_char> {
        let sid = self.to_string_id(idx)?;
        Some(self.strings.as_c_ptr(sid))
    }

    /// Block address of a full userdata or the address of a light handle.
    pub fn to_userdata(&self, idx: impl Into<StackIndex>) -> Option<NonNull<u8>> {
        let v = self.value_at(idx);
        if let Some(ud) = v.as_userdata_idx() {
            return NonNull::new(self.gc.get_userdata(ud).as_ptr());
        }
        v.as_light().and_then(|p| NonNull::new(p as *mut u8))
    }

    /// Raw address behind a full userdata or light handle.
    pub fn to_pointer(&self, idx: impl Into<StackIndex>) -> Option<*mut c_void> {
        self.to_userdata(idx).map(|p| p.as_ptr().cast())
    }

    /// Size of the full userdata at `idx`.
    pub fn userdata_size(&self, idx: impl Into<StackIndex>) -> Option<usize> {
        let ud = self.value_at(idx).as_userdata_idx()?;
        Some(self.gc.get_userdata(ud).size())
    }

    pub fn raw_equal(&self, a: impl Into<StackIndex>, b: impl Into<StackIndex>) -> bool {
        let (a, b) = (self.value_at(a), self.value_at(b));
        match (a.as_full_integer(&self.gc), b.as_full_integer(&self.gc)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        }
    }

    /// Length of a string, table border or userdata size, ignoring `__len`.
    pub fn raw_len(&self, idx: impl Into<StackIndex>) -> usize {
        let v = self.value_at(idx);
        if let Some(sid) = v.as_string_id() {
            self.strings.get_bytes(sid).len()
        } else if let Some(t) = v.as_table_idx() {
            self.gc.get_table(t).length().max(0) as usize
        } else if let Some(ud) = v.as_userdata_idx() {
            self.gc.get_userdata(ud).size()
        } else {
            0
        }
    }

    // ---- Tables ----

    fn table_key(&self, key: TValue) -> Option<TableKey> {
        match key.as_full_integer(&self.gc) {
            Some(i) => Some(TableKey::Integer(i)),
            None => TableKey::from_value(key),
        }
    }

    fn key_value(&mut self, key: TableKey) -> TValue {
        match key.to_value() {
            Ok(v) => v,
            Err(i) => TValue::from_full_integer(i, &mut self.gc),
        }
    }

    fn table_arg(&self, idx: StackIndex) -> Result<GcIdx<Table>, LuaError> {
        self.value_at(idx).as_table_idx().ok_or_else(|| {
            LuaError::runtime(format!("table expected, got {}", self.type_name(idx)))
        })
    }

    fn raw_table_get(&self, t: GcIdx<Table>, key: TValue) -> TValue {
        match self.table_key(key) {
            Some(k) => self.gc.get_table(t).get(k),
            None => TValue::nil(),
        }
    }

    fn raw_table_set(&mut self, t: GcIdx<Table>, key: TValue, v: TValue) -> Result<(), LuaError> {
        if key.is_nil() {
            return Err(LuaError::runtime("table index is nil"));
        }
        let k = self
            .table_key(key)
            .ok_or_else(|| LuaError::runtime("table index is NaN"))?;
        self.gc.get_table_mut(t).set(k, v);
        Ok(())
    }

    /// Replace the key on top with `t[key]`, without metamethods.
    pub fn raw_get(&mut self, idx: impl Into<StackIndex>) -> Result<ValueType, LuaError> {
        let t = self.table_arg(self.abs_index(idx))?;
        let key = self.value_at(StackIndex::TOP);
        let v = self.raw_table_get(t, key);
        self.pop(1);
        self.push(v);
        Ok(ValueType::of(v))
    }

    /// Pop key and value and store `t[key] = value`, without metamethods.
    pub fn raw_set(&mut self, idx: impl Into<StackIndex>) -> Result<(), LuaError> {
        let t = self.table_arg(self.abs_index(idx))?;
        let key = self.value_at(StackIndex::RelativeToTop(2));
        let v = self.value_at(StackIndex::TOP);
        self.raw_table_set(t, key, v)?;
        self.pop(2);
        Ok(())
    }

    pub fn raw_geti(&mut self, idx: impl Into<StackIndex>, n: i64) -> Result<ValueType, LuaError> {
        let t = self.table_arg(idx.into())?;
        let v = self.gc.get_table(t).raw_geti(n);
        self.push(v);
        Ok(ValueType::of(v))
    }

    /// Pop the top value into `t[n]`.
    pub fn raw_seti(&mut self, idx: impl Into<StackIndex>, n: i64) -> Result<(), LuaError> {
        let t = self.table_arg(self.abs_index(idx))?;
        let v = self.value_at(StackIndex::TOP);
        self.gc.get_table_mut(t).raw_seti(n, v);
        self.pop(1);
        Ok(())
    }

    /// Push `t[name]` without metamethods.
    pub fn raw_get_field(&mut self, idx: impl Into<StackIndex>, name: &str) -> Result<ValueType, LuaError> {
        let t = self.table_arg(idx.into())?;
        let sid = self.strings.intern(name.as_bytes());
        let v = self.gc.get_table(t).raw_get_str(sid);
        self.push(v);
        Ok(ValueType::of(v))
    }

    /// Pop the top value into `t[name]` without metamethods.
    pub fn raw_set_field(&mut self, idx: impl Into<StackIndex>, name: &str) -> Result<(), LuaError> {
        let t = self.table_arg(self.abs_index(idx))?;
        let sid = self.strings.intern(name.as_bytes());
        let v = self.value_at(StackIndex::TOP);
        self.gc.get_table_mut(t).raw_set_str(sid, v);
        self.pop(1);
        Ok(())
    }

    /// Replace the key on top with `obj[key]`, honouring `__index`.
    pub fn get_table(&mut self, idx: impl Into<StackIndex>) -> Result<ValueType, LuaError> {
        let obj = self.value_at(idx);
        let key = self.value_at(StackIndex::TOP);
        let v = self.index_value(obj, key)?;
        self.pop(1);
        self.push(v);
        Ok(ValueType::of(v))
    }

    /// Push `obj[name]`, honouring `__index`.
    pub fn get_field(&mut self, idx: impl Into<StackIndex>, name: &str) -> Result<ValueType, LuaError> {
        let idx = self.abs_index(idx);
        self.push_string(name);
        self.get_table(idx)
    }

    /// Pop key and value and store `obj[key] = value`, honouring `__newindex`.
    pub fn set_table(&mut self, idx: impl Into<StackIndex>) -> Result<(), LuaError> {
        let obj = self.value_at(idx);
        let key = self.value_at(StackIndex::RelativeToTop(2));
        let v = self.value_at(StackIndex::TOP);
        self.assign_value(obj, key, v)?;
        self.pop(2);
        Ok(())
    }

    /// Pop the top value into `obj[name]`, honouring `__newindex`.
    pub fn set_field(&mut self, idx: impl Into<StackIndex>, name: &str) -> Result<(), LuaError> {
        let idx = self.abs_index(idx);
        self.push_string(name);
        self.insert(StackIndex::RelativeToTop(2))?;
        self.set_table(idx)
    }

    /// Push the global `name` (no path resolution).
    pub fn get_global(&mut self, name: &str) -> Result<ValueType, LuaError> {
        self.get_field(StackIndex::ENVIRONMENT, name)
    }

    /// Pop the top value into the global `name`.
    pub fn set_global(&mut self, name: &str) -> Result<(), LuaError> {
        self.set_field(StackIndex::ENVIRONMENT, name)
    }

    /// Table iteration: pops a key and pushes the next key and value.
    /// Returns false (pushing nothing) at the end.
    pub fn next(&mut self, idx: impl Into<StackIndex>) -> Result<bool, LuaError> {
        let t = self.table_arg(self.abs_index(idx))?;
        let key = self.value_at(StackIndex::TOP);
        self.pop(1);
        let from = if key.is_nil() { None } else { self.table_key(key) };
        match self.gc.get_table(t).next(from) {
            Ok(Some((k, v))) => {
                let k = self.key_value(k);
                self.push(k);
                self.push(v);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(()) => Err(LuaError::runtime("invalid key to 'next'")),
        }
    }

    fn metatable_of(&self, v: TValue) -> Option<GcIdx<Table>> {
        if let Some(t) = v.as_table_idx() {
            self.gc.get_table(t).metatable
        } else if let Some(ud) = v.as_userdata_idx() {
            self.gc.get_userdata(ud).metatable
        } else {
            None
        }
    }

    fn metafield(&self, v: TValue, name: StringId) -> TValue {
        self.metatable_of(v)
            .map(|mt| self.gc.get_table(mt).raw_get_str(name))
            .unwrap_or_default()
    }

    fn index_value(&mut self, obj: TValue, key: TValue) -> Result<TValue, LuaError> {
        let mut obj = obj;
        for _ in 0..MAX_META_CHAIN {
            let handler = if let Some(t) = obj.as_table_idx() {
                let v = self.raw_table_get(t, key);
                if !v.is_nil() {
                    return Ok(v);
                }
                let h = self.metafield(obj, self.names.index);
                if h.is_nil() {
                    return Ok(v);
                }
                h
            } else {
                let h = self.metafield(obj, self.names.index);
                if h.is_nil() {
                    return Err(LuaError::runtime(format!(
                        "attempt to index a {} value",
                        self.describe_value(obj)
                    )));
                }
                h
            };
            if handler.is_function() {
                let pos = self.stack.len();
                self.push(handler);
                self.push(obj);
                self.push(key);
                self.call_at(pos, 1)?;
                let v = self.stack[pos];
                self.stack.truncate(pos);
                return Ok(v);
            }
            obj = handler;
        }
        Err(LuaError::runtime("'__index' chain too long; possible loop"))
    }

    fn assign_value(&mut self, obj: TValue, key: TValue, v: TValue) -> Result<(), LuaError> {
        let mut obj = obj;
        for _ in 0..MAX_META_CHAIN {
            let handler = if let Some(t) = obj.as_table_idx() {
                let h = self.metafield(obj, self.names.newindex);
                if h.is_nil() || !self.raw_table_get(t, key).is_nil() {
                    return self.raw_table_set(t, key, v);
                }
                h
            } else {
                let h = self.metafield(obj, self.names.newindex);
                if h.is_nil() {
                    return Err(LuaError::runtime(format!(
                        "attempt to index a {} value",
                        self.describe_value(obj)
                    )));
                }
                h
            };
            if handler.is_function() {
                let pos = self.stack.len();
                self.push(handler);
                self.push(obj);
                self.push(key);
                self.push(v);
                self.call_at(pos, 0)?;
                self.stack.truncate(pos);
                return Ok(());
            }
            obj = handler;
        }
        Err(LuaError::runtime("'__newindex' chain too long; possible loop"))
    }

    fn describe_value(&self, v: TValue) -> String {
        if let Some(mt) = self.metatable_of(v) {
            if let Some(sid) = self.gc.get_table(mt).raw_get_str(self.names.name).as_string_id() {
                return String::from_utf8_lossy(self.strings.get_bytes(sid)).into_owned();
            }
        }
        ValueType::of(v).name().to_string()
    }

    // ---- Metatables and user values ----

    /// Push the metatable of the value at `idx`, if it has one.
    pub fn get_metatable(&mut self, idx: impl Into<StackIndex>) -> bool {
        match self.metatable_of(self.value_at(idx)) {
            Some(mt) => {
                self.push(TValue::from_table(mt));
                true
            }
            None => false,
        }
    }

    /// Pop a table (or nil) and make it the metatable of the value at `idx`.
    pub fn set_metatable(&mut self, idx: impl Into<StackIndex>) -> Result<(), LuaError> {
        let idx = self.abs_index(idx);
        let top = self.value_at(StackIndex::TOP);
        let mt = if top.is_nil() {
            None
        } else {
            Some(top.as_table_idx().ok_or_else(|| {
                LuaError::runtime("metatable must be a table or nil")
            })?)
        };
        let target = self.value_at(idx);
        if let Some(t) = target.as_table_idx() {
            self.gc.get_table_mut(t).metatable = mt;
        } else if let Some(ud) = target.as_userdata_idx() {
            self.gc.get_userdata_mut(ud).metatable = mt;
        } else {
            return Err(LuaError::runtime(format!(
                "cannot set the metatable of a {} value",
                ValueType::of(target).name()
            )));
        }
        self.pop(1);
        Ok(())
    }

    /// Push `metatable(obj)[name]` if present; returns its type or `None`.
    pub fn get_metafield(&mut self, idx: impl Into<StackIndex>, name: &str) -> Option<ValueType> {
        let obj = self.value_at(idx);
        let sid = self.strings.find(name.as_bytes())?;
        let v = self.metafield(obj, sid);
        if v.is_nil() {
            return None;
        }
        self.push(v);
        Some(ValueType::of(v))
    }

    /// Push the registry metatable named `name`, creating it (with
    /// `__name = name`) if needed. Returns true when it was created.
    pub fn new_metatable(&mut self, name: &str) -> Result<bool, LuaError> {
        if self.get_registered_metatable(name)? != ValueType::Nil {
            return Ok(false);
        }
        self.pop(1);
        self.create_table(0, 4);
        self.push_string(name);
        self.raw_set_field(StackIndex::RelativeToTop(2), "__name")?;
        self.push_value(StackIndex::TOP);
        self.raw_set_field(StackIndex::REGISTRY, name)?;
        Ok(true)
    }

    /// Push `registry[name]`.
    pub fn get_registered_metatable(&mut self, name: &str) -> Result<ValueType, LuaError> {
        self.raw_get_field(StackIndex::REGISTRY, name)
    }

    /// Push the user value of the full userdata at `idx`.
    pub fn get_user_value(&mut self, idx: impl Into<StackIndex>) -> ValueType {
        let v = match self.value_at(idx).as_userdata_idx() {
            Some(ud) => self.gc.get_userdata(ud).user_value,
            None => TValue::nil(),
        };
        self.push(v);
        ValueType::of(v)
    }

    /// Pop the top value into the user value of the full userdata at `idx`.
    pub fn set_user_value(&mut self, idx: impl Into<StackIndex>) -> Result<(), LuaError> {
        let ud = self
            .value_at(self.abs_index(idx))
            .as_userdata_idx()
            .ok_or_else(|| LuaError::runtime("full userdata expected"))?;
        let v = self.value_at(StackIndex::TOP);
        self.gc.get_userdata_mut(ud).user_value = v;
        self.pop(1);
        Ok(())
    }

    // ---- Calls ----

    /// Call the function below the top `nargs` values. Errors propagate
    /// unchanged.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> Result<(), LuaError> {
        let pos = self.func_position(nargs)?;
        self.call_at(pos, nresults)
    }

    /// Call in protected mode. On failure the function and its arguments
    /// are replaced by the error value (after `handler`, if given, has
    /// transformed it at the point of the error) and the error is returned.
    pub fn pcall(
        &mut self,
        nargs: usize,
        nresults: i32,
        handler: Option<StackIndex>,
    ) -> Result<(), LuaError> {
        let pos = self.func_position(nargs)?;
        let handler = handler.map(|h| self.value_at(h));
        let depth = self.call_stack.len();
        self.handlers.push(HandlerSlot {
            handler,
            running: false,
            result: None,
        });
        let outcome = self.call_at(pos, nresults);
        let outcome = match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                // Errors raised before any frame was entered still reach the handler.
                self.fire_handler(&e);
                Err(e)
            }
        };
        let slot = self.handlers.pop();
        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                self.call_stack.truncate(depth);
                let source = e.to_tvalue(&mut self.strings);
                let err = match slot.and_then(|s| s.result) {
                    Some(d) if d.decorates(source) => self.error_from_value(d.value),
                    _ => e,
                };
                let v = err.to_tvalue(&mut self.strings);
                self.stack.truncate(pos);
                self.push(v);
                Err(err)
            }
        }
    }

    fn func_position(&self, nargs: usize) -> Result<usize, LuaError> {
        self.top()
            .checked_sub(nargs + 1)
            .map(|n| self.base() + n)
            .ok_or_else(|| LuaError::runtime("not enough values on the stack for call"))
    }

    fn call_at(&mut self, pos: usize, nresults: i32) -> Result<(), LuaError> {
        if self.call_stack.len() >= self.config.max_call_depth
            || self.stack.len() > self.config.max_stack_slots
        {
            return Err(LuaError::StackOverflow);
        }
        let mut func = self.stack[pos];
        if !func.is_function() {
            let h = self.metafield(func, self.names.call);
            if !h.is_function() {
                return Err(LuaError::runtime(format!(
                    "attempt to call a {} value",
                    self.describe_value(func)
                )));
            }
            self.stack.insert(pos, h);
            func = h;
        }
        let Some(idx) = func.as_native_idx() else {
            return Err(LuaError::runtime("attempt to call a non-function value"));
        };
        let native = self.gc.get_native(idx);
        let callable = native.callable.clone();
        let origin = native.origin;
        self.call_stack.push(CallInfo::new(pos, nresults, origin));

        let result = match callable {
            Callable::Fn(f) => f(self),
            Callable::Closure(c) => c(self),
        };

        match result {
            Ok(n) => {
                // A frame that returns normally has recovered from any
                // error decorated below it.
                if let Some(slot) = self.handlers.last_mut() {
                    if !slot.running {
                        slot.result = None;
                    }
                }
                let ci = self.call_stack.pop();
                let base = ci.map_or(pos + 1, |ci| ci.base);
                let top = self.stack.len();
                let n = n.min(top.saturating_sub(base));
                self.stack.copy_within(top - n..top, pos);
                self.stack.truncate(pos + n);
                if nresults >= 0 {
                    self.stack.resize(pos + nresults as usize, TValue::nil());
                }
                Ok(())
            }
            Err(e) => {
                self.fire_handler(&e);
                self.call_stack.pop();
                Err(e)
            }
        }
    }

    /// Run the innermost protected call's message handler while the
    /// failing frames are still live. An error propagating through outer
    /// frames keeps the decoration it got where it was raised.
    fn fire_handler(&mut self, err: &LuaError) {
        let errv = err.to_tvalue(&mut self.strings);
        let Some(slot) = self.handlers.last_mut() else {
            return;
        };
        if slot.running || slot.result.is_some_and(|d| d.decorates(errv)) {
            return;
        }
        let Some(handler) = slot.handler else {
            return;
        };
        slot.running = true;
        let pos = self.stack.len();
        self.push(handler);
        self.push(errv);
        let result = match self.call_at(pos, 1) {
            Ok(()) => self.stack[pos],
            Err(_) => LuaError::ErrorInHandler.to_tvalue(&mut self.strings),
        };
        self.stack.truncate(pos);
        if let Some(slot) = self.handlers.last_mut() {
            slot.running = false;
            slot.result = Some(Decorated {
                source: errv,
                value: result,
            });
        }
    }

    /// Build an error from the value on top of the stack (popping it).
    pub fn error_from_top(&mut self) -> LuaError {
        let v = self.value_at(StackIndex::TOP);
        self.pop(1);
        self.error_from_value(v)
    }

    fn error_from_value(&self, v: TValue) -> LuaError {
        match v.as_string_id() {
            Some(sid) => LuaError::Runtime(String::from_utf8_lossy(self.strings.get_bytes(sid)).into_owned()),
            None => LuaError::Value(v),
        }
    }

    /// Convert an error into a stack value.
    pub fn error_value(&mut self, err: &LuaError) -> TValue {
        err.to_tvalue(&mut self.strings)
    }

    // ---- Introspection ----

    /// Number of active native frames.
    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    /// Source position of the frame `level` steps below the running one
    /// (level 0 is the running function).
    pub fn frame_info(&self, level: usize) -> Option<FrameInfo> {
        let i = self.call_stack.len().checked_sub(level + 1)?;
        Some(FrameInfo::from(self.call_stack[i].origin))
    }

    /// Record the host source position issuing the current operation.
    pub fn set_call_site(&mut self, site: &'static Location<'static>) {
        self.call_site = Some(site);
    }

    pub fn call_site(&self) -> Option<&'static Location<'static>> {
        self.call_site
    }

    // ---- Identity cache ----

    /// Push the value cached under `key`. Returns false (pushing nothing)
    /// on a miss.
    pub fn cache_get(&mut self, key: CacheKey) -> bool {
        match self.cache.get(key) {
            Some(v) => {
                self.push(v);
                true
            }
            None => false,
        }
    }

    /// Cache the top value under `key` without popping it.
    pub fn cache_set(&mut self, key: CacheKey) {
        let v = self.value_at(StackIndex::TOP);
        log::trace!("cache fill {key:?}");
        self.cache.insert(key, v);
    }

    pub fn fresh_cache_key(&mut self) -> CacheKey {
        self.cache.fresh_key()
    }

    // ---- Argument checking ----

    pub fn type_error(&self, arg: usize, expected: &str) -> LuaError {
        let got = if self.is_none(arg as i32) {
            "no value".to_string()
        } else {
            self.type_name(arg as i32)
        };
        LuaError::runtime(format!("bad argument #{arg} ({expected} expected, got {got})"))
    }

    pub fn arg_error(&self, arg: usize, msg: &str) -> LuaError {
        LuaError::runtime(format!("bad argument #{arg} ({msg})"))
    }

    pub fn check_any(&self, arg: usize) -> Result<(), LuaError> {
        if self.is_none(arg as i32) {
            return Err(self.arg_error(arg, "value expected"));
        }
        Ok(())
    }

    pub fn check_integer(&self, arg: usize) -> Result<i64, LuaError> {
        if let Some(i) = self.to_integer(arg as i32) {
            return Ok(i);
        }
        if self.is_number(arg as i32) {
            return Err(self.arg_error(arg, "number has no integer representation"));
        }
        Err(self.type_error(arg, "number"))
    }

    pub fn check_number(&self, arg: usize) -> Result<f64, LuaError> {
        self.to_number(arg as i32)
            .ok_or_else(|| self.type_error(arg, "number"))
    }

    pub fn check_boolean(&self, arg: usize) -> Result<bool, LuaError> {
        self.value_at(arg as i32)
            .as_bool()
            .ok_or_else(|| self.type_error(arg, "boolean"))
    }

    pub fn check_string(&mut self, arg: usize) -> Result<String, LuaError> {
        match self.to_string_lossy(arg as i32) {
            Some(s) => Ok(s),
            None => Err(self.type_error(arg, "string")),
        }
    }

    pub fn check_c_str(&mut self, arg: usize) -> Result<*const c_char, LuaError> {
        match self.to_c_str(arg as i32) {
            Some(p) => Ok(p),
            None => Err(self.type_error(arg, "string")),
        }
    }

    pub fn check_type(&self, arg: usize, t: ValueType) -> Result<(), LuaError> {
        if self.value_type(arg as i32) != t {
            return Err(self.type_error(arg, t.name()));
        }
        Ok(())
    }

    /// Block of the full userdata at `arg` if its metatable is the one
    /// registered as `tname`.
    pub fn test_userdata(&self, arg: usize, tname: &str) -> Option<NonNull<u8>> {
        let v = self.value_at(arg as i32);
        let ud = v.as_userdata_idx()?;
        let sid = self.strings.find(tname.as_bytes())?;
        let registered = self.gc.get_table(self.registry).raw_get_str(sid).as_table_idx()?;
        if self.gc.get_userdata(ud).metatable != Some(registered) {
            return None;
        }
        NonNull::new(self.gc.get_userdata(ud).as_ptr())
    }

    pub fn check_userdata(&self, arg: usize, tname: &str) -> Result<NonNull<u8>, LuaError> {
        self.test_userdata(arg, tname)
            .ok_or_else(|| self.type_error(arg, tname))
    }

    // ---- Collector ----

    fn gc_check(&mut self) {
        if self.gc.gc_should_step() {
            self.collect_garbage();
        }
    }

    /// Run a full mark-sweep cycle, then any finalizers it queued.
    /// Returns the number of objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        if self.collecting || self.closed {
            return 0;
        }
        self.collecting = true;

        // Phase 1: Prepare mark bits
        self.gc.gc_prepare_marks();

        // Phase 2: Mark roots
        self.gc_mark_roots();
        while self.gc.gc_propagate() > 0 {}

        // Phase 3: Resurrect unreachable finalizable userdata
        self.identify_finalizable_objects();
        while self.gc.gc_propagate() > 0 {}

        // Phase 4: Sweep
        let freed = self.gc.gc_sweep();
        self.collecting = false;

        // Phase 5: Run finalizers
        let finalized = self.run_finalizers();
        log::debug!("gc cycle: {freed} objects freed, {finalized} finalizers run");
        freed
    }

    fn gc_mark_roots(&mut self) {
        let mut roots: Vec<TValue> = self.stack.clone();
        roots.push(TValue::from_table(self.registry));
        roots.push(TValue::from_table(self.globals));
        roots.extend(self.cache.values());
        for slot in &self.handlers {
            roots.extend(slot.handler);
            if let Some(d) = slot.result {
                roots.push(d.source);
                roots.push(d.value);
            }
        }
        for v in roots {
            self.gc.gc_mark_value(v);
        }
    }

    fn identify_finalizable_objects(&mut self) {
        for ud in self.gc.unmarked_finalizable(self.names.gc) {
            let v = TValue::from_userdata(ud);
            self.gc.gc_mark_value(v);
            self.gc.gc_state.finalization_queue.push(v);
        }
    }

    /// Call `__gc` on every queued object, most recent first. Errors are
    /// logged and swallowed.
    fn run_finalizers(&mut self) -> usize {
        let queue: Vec<TValue> = self.gc.gc_state.finalization_queue.drain(..).collect();
        let mut ran = 0;
        for obj in queue.iter().rev() {
            if let Some(ud) = obj.as_userdata_idx() {
                self.gc.mark_finalized(ud);
            }
            let gc_func = self.metafield(*obj, self.names.gc);
            if !gc_func.is_function() {
                continue;
            }
            log::trace!("running finalizer for {obj:?}");
            let pos = self.stack.len();
            self.push(gc_func);
            self.push(*obj);
            // A handler-less slot keeps outer message handlers out of it.
            self.handlers.push(HandlerSlot {
                handler: None,
                running: false,
                result: None,
            });
            let depth = self.call_stack.len();
            let outcome = self.call_at(pos, 0);
            self.handlers.pop();
            self.call_stack.truncate(depth);
            if let Err(e) = outcome {
                log::warn!("error in __gc finalizer: {e}");
            }
            self.stack.truncate(pos);
            ran += 1;
        }
        ran
    }

    /// Run every outstanding finalizer. Called on drop; the state is
    /// unusable for collection afterwards.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stack.clear();
        self.call_stack.clear();
        self.handlers.clear();
        // With nothing marked, every unfinalized handle with a `__gc` is due.
        self.gc.gc_prepare_marks();
        let pending = self.gc.unmarked_finalizable(self.names.gc);
        self.gc
            .gc_state
            .finalization_queue
            .extend(pending.into_iter().map(TValue::from_userdata));
        self.closed = true;
        let ran = self.run_finalizers();
        log::debug!("state closed, {ran} finalizers run");
        self.cache.clear();
    }

    /// Handle for tests and tools that need to look at the raw registry.
    /// Number of live heap objects.
    pub fn live_objects(&self) -> usize {
        self.gc.live_objects()
    }

    pub(crate) fn native_count(&self) -> usize {
        self.gc.natives.iter().filter(|n| n.is_some()).count()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for State {
    fn drop(&mut self) {
        self.close();
    }
}

fn bad_index(idx: StackIndex) -> LuaError {
    LuaError::runtime(format!("invalid stack index {idx:?}"))
}

fn float_to_integer(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("top", &self.top())
            .field("depth", &self.call_stack.len())
            .field("objects", &self.gc.live_objects())
            .field("natives", &self.native_count())
            .finish()
    }
}
