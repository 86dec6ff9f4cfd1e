//! Reflective property access: `__index` / `__newindex` handlers that read
//! and write fields of native memory through member descriptors.
//!
//! A lookup first consults the override tables (native getters and
//! setters keyed by member name), then the descriptor table. Getters are
//! called with `(object, key, data)` and return one value; setters with
//! `(object, key, value, data)` and return nothing. `data` is a light
//! handle to the start of the native block.

use std::ffi::{c_char, c_int, c_long, c_uint, c_ulong, c_void, CStr};
use std::ptr;
use std::rc::Rc;

use indexmap::IndexMap;
use log::{debug, trace};
use tether_runtime::{LuaError, NativeFn, StackIndex, State, ValueType};

use crate::arg;
use crate::descriptor::{DescriptorTable, MemberDescriptor, TypeTag};

/// How the handle's block relates to the native object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Addressing {
    /// The block holds the object's fields.
    Inline,
    /// The block holds a pointer to the object.
    Boxed,
}

/// Native accessors keyed by member name.
#[derive(Clone, Debug, Default)]
pub struct OverrideTable {
    entries: IndexMap<&'static str, NativeFn>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, f: NativeFn) -> Self {
        self.insert(name, f);
        self
    }

    pub fn insert(&mut self, name: &'static str, f: NativeFn) {
        self.entries.insert(name, f);
    }

    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.entries.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything a pair of property handlers needs.
#[derive(Clone, Debug)]
pub struct Peer {
    pub members: DescriptorTable,
    pub getters: OverrideTable,
    pub setters: OverrideTable,
    pub addressing: Addressing,
}

impl Peer {
    pub fn new(members: DescriptorTable, addressing: Addressing) -> Self {
        Peer {
            members,
            getters: OverrideTable::new(),
            setters: OverrideTable::new(),
            addressing,
        }
    }

    pub fn with_getters(mut self, getters: OverrideTable) -> Self {
        self.getters = getters;
        self
    }

    pub fn with_setters(mut self, setters: OverrideTable) -> Self {
        self.setters = setters;
        self
    }

    /// Start of the native object behind the handle at argument 1.
    fn base_address(&self, state: &State) -> Result<*mut u8, LuaError> {
        let block = state
            .to_userdata(1)
            .ok_or_else(|| state.type_error(1, "userdata"))?;
        if let Some(size) = state.userdata_size(1) {
            let needed = match self.addressing {
                Addressing::Inline => self.members.extent(),
                Addressing::Boxed => std::mem::size_of::<*mut u8>(),
            };
            if needed > size {
                return Err(LuaError::runtime(format!(
                    "userdata of {size} bytes is too small for its members ({needed} bytes)"
                )));
            }
        }
        match self.addressing {
            Addressing::Inline => Ok(block.as_ptr()),
            Addressing::Boxed => {
                // SAFETY: the block is at least pointer-sized (checked above
                // for full userdata; light handles are trusted).
                let target = unsafe { block.as_ptr().cast::<*mut u8>().read_unaligned() };
                if target.is_null() {
                    return Err(LuaError::runtime("boxed userdata holds a null pointer"));
                }
                Ok(target)
            }
        }
    }

    /// Members and overrides are both looked up by name, so only string
    /// keys can reach them. Any other key reads as nil and writes nothing,
    /// leaving it to a fallback `__index` chain.
    fn key_name(state: &mut State) -> Option<String> {
        if state.value_type(2) == ValueType::String {
            state.to_string_lossy(2)
        } else {
            None
        }
    }

    fn index(&self, state: &mut State) -> Result<usize, LuaError> {
        let base = self.base_address(state)?;
        let Some(name) = Self::key_name(state) else {
            state.push_nil();
            return Ok(1);
        };
        if let Some(getter) = self.getters.get(&name) {
            state.push_function(getter);
            state.push_value(1);
            state.push_value(2);
            state.push_light(base.cast())?;
            state.call(3, 1)?;
            return Ok(1);
        }
        match self.members.get(&name) {
            Some(member) => {
                // SAFETY: the block covers the member (checked in base_address).
                unsafe { read_member(state, base, member)? };
            }
            None => {
                trace!("no member '{name}' to read");
                state.push_nil();
            }
        }
        Ok(1)
    }

    fn new_index(&self, state: &mut State) -> Result<usize, LuaError> {
        let base = self.base_address(state)?;
        let Some(name) = Self::key_name(state) else {
            return Ok(0);
        };
        if let Some(setter) = self.setters.get(&name) {
            state.push_function(setter);
            state.push_value(1);
            state.push_value(2);
            state.push_value(3);
            state.push_light(base.cast())?;
            state.call(4, 0)?;
            return Ok(0);
        }
        match self.members.get(&name) {
            // SAFETY: the block covers the member (checked in base_address).
            Some(member) => unsafe { write_member(state, base, member)? },
            None => trace!("no member '{name}' to write"),
        }
        Ok(0)
    }
}

/// Push the value of `member` read from the block at `base`.
///
/// # Safety
///
/// `base + member.offset` must be readable for the member's width.
pub unsafe fn read_member(
    state: &mut State,
    base: *mut u8,
    member: &MemberDescriptor,
) -> Result<(), LuaError> {
    let at = base.add(member.offset);
    match member.tag {
        TypeTag::Pointer => state.push_light(at.cast::<*mut c_void>().read_unaligned())?,
        TypeTag::SChar => state.push_integer(at.cast::<i8>().read() as i64),
        TypeTag::SShort => state.push_integer(at.cast::<i16>().read_unaligned() as i64),
        TypeTag::SLong => state.push_integer(at.cast::<c_long>().read_unaligned() as i64),
        TypeTag::SInt => state.push_integer(at.cast::<c_int>().read_unaligned() as i64),
        TypeTag::UChar => state.push_integer(at.read() as i64),
        TypeTag::UShort => state.push_integer(at.cast::<u16>().read_unaligned() as i64),
        TypeTag::ULong => state.push_integer(at.cast::<c_ulong>().read_unaligned() as i64),
        TypeTag::UInt => state.push_integer(at.cast::<c_uint>().read_unaligned() as i64),
        TypeTag::String => {
            let s = at.cast::<*const c_char>().read_unaligned();
            if s.is_null() {
                state.push_nil();
            } else {
                state.push_bytes(CStr::from_ptr(s).to_bytes());
            }
        }
        TypeTag::Boolean => state.push_bool(at.read() != 0),
        TypeTag::Float => state.push_number(at.cast::<f32>().read_unaligned() as f64),
        TypeTag::Double => state.push_number(at.cast::<f64>().read_unaligned()),
    }
    Ok(())
}

/// Store argument 3 into `member` of the block at `base`.
///
/// Strings are not copied: the field receives the interned string's
/// pointer, which stays valid as long as the state lives. Nil clears a
/// string field.
///
/// # Safety
///
/// `base + member.offset` must be writable for the member's width.
pub unsafe fn write_member(
    state: &mut State,
    base: *mut u8,
    member: &MemberDescriptor,
) -> Result<(), LuaError> {
    const VALUE: usize = 3;
    let at = base.add(member.offset);
    match member.tag {
        TypeTag::Pointer => {
            let p = arg::check_ptr(state, VALUE)?;
            at.cast::<*mut c_void>().write_unaligned(p);
        }
        TypeTag::SChar => at.cast::<i8>().write(arg::check(state, VALUE)?),
        TypeTag::SShort => at.cast::<i16>().write_unaligned(arg::check(state, VALUE)?),
        TypeTag::SLong => {
            let v = state.check_integer(VALUE)? as c_long;
            at.cast::<c_long>().write_unaligned(v);
        }
        TypeTag::SInt => at.cast::<c_int>().write_unaligned(arg::check(state, VALUE)?),
        TypeTag::UChar => at.write(arg::check(state, VALUE)?),
        TypeTag::UShort => at.cast::<u16>().write_unaligned(arg::check(state, VALUE)?),
        TypeTag::ULong => {
            let v = state.check_integer(VALUE)? as c_ulong;
            at.cast::<c_ulong>().write_unaligned(v);
        }
        TypeTag::UInt => at.cast::<c_uint>().write_unaligned(arg::check(state, VALUE)?),
        TypeTag::String => {
            let s = if state.is_nil(StackIndex::Absolute(VALUE)) {
                ptr::null()
            } else {
                state.check_c_str(VALUE)?
            };
            at.cast::<*const c_char>().write_unaligned(s);
        }
        TypeTag::Boolean => {
            let b: bool = arg::check(state, VALUE)?;
            at.write(b as u8);
        }
        TypeTag::Float => at.cast::<f32>().write_unaligned(arg::check(state, VALUE)?),
        TypeTag::Double => at.cast::<f64>().write_unaligned(arg::check(state, VALUE)?),
    }
    Ok(())
}

/// Push the `__index` handler and then the `__newindex` handler for `peer`.
pub fn bind_peer(state: &mut State, peer: Peer) {
    debug!(
        "binding peer: {} members, {} getters, {} setters, {:?}",
        peer.members.len(),
        peer.getters.len(),
        peer.setters.len(),
        peer.addressing
    );
    let peer = Rc::new(peer);
    let reader = Rc::clone(&peer);
    state.push_rust_closure(move |s| reader.index(s), 0);
    state.push_rust_closure(move |s| peer.new_index(s), 0);
}

/// Install property handlers on the metatable at `metatable`. Reads that
/// no override or member answers fall back to a raw lookup in the
/// metatable itself, so methods stored there stay reachable.
pub fn install_peer(
    state: &mut State,
    metatable: impl Into<StackIndex>,
    peer: Peer,
) -> Result<(), LuaError> {
    let mt = state.abs_index(metatable);
    if !state.is_table(mt) {
        return Err(LuaError::runtime(format!(
            "cannot install properties on a {} value",
            state.type_name(mt)
        )));
    }
    bind_peer(state, peer);
    // index, newindex
    state.set_field(mt, "__newindex")?;
    state.push_value(mt);
    state.push_rust_closure(
        |s| {
            s.push_value(StackIndex::upvalue(1));
            s.push_value(1);
            s.push_value(2);
            s.call(2, 1)?;
            if s.is_nil(-1) {
                s.pop(1);
                s.push_value(2);
                s.raw_get(StackIndex::upvalue(2))?;
            }
            Ok(1)
        },
        2,
    );
    state.set_field(mt, "__index")
}
