//! A small native class registry: named metatables that know their
//! instance size, constructor and finalizer.
//!
//! Classes live in the registry under their name. Scripts and host code
//! reach the registry through the global `class` table (`class.New`,
//! `class.IsInstance`, `class.IsType`); the host-side functions here call
//! those through the identity cache, the same way a script would.

use std::mem::size_of;

use log::debug;
use tether_runtime::{CacheKey, LuaError, NativeFn, StackIndex, State, ValueType};

use crate::call::{call_core, Mode};
use crate::format::{Arg, Spec};
use crate::helpers;
use crate::peer::{install_peer, Peer};

const NEW_KEY: CacheKey = CacheKey::Token(1);
const IS_INSTANCE_KEY: CacheKey = CacheKey::Token(2);
const IS_TYPE_KEY: CacheKey = CacheKey::Token(3);

/// Marks metatables created by [`define`].
const CLASS_MARKER: &str = "__class";

/// A native type exposed through two classes: one whose instances hold
/// the value inline and one whose instances hold a pointer to it.
pub trait Bound: 'static {
    const TYPE_NAME: &'static str;
    const BOXED_TYPE_NAME: &'static str;
}

/// Everything needed to register a class.
#[derive(Clone, Debug)]
pub struct ClassDef {
    pub name: &'static str,
    /// Size of the userdata block of each instance.
    pub size: usize,
    pub methods: Vec<(&'static str, NativeFn)>,
    /// Called as `(instance, ...)` with the extra arguments of `New`.
    pub constructor: Option<NativeFn>,
    pub finalizer: Option<NativeFn>,
    pub peer: Option<Peer>,
}

impl ClassDef {
    pub fn new(name: &'static str, size: usize) -> Self {
        ClassDef {
            name,
            size,
            methods: Vec::new(),
            constructor: None,
            finalizer: None,
            peer: None,
        }
    }

    /// The class whose instances hold a `T`.
    pub fn inline<T: Bound>() -> Self {
        ClassDef::new(T::TYPE_NAME, size_of::<T>())
    }

    /// The class whose instances hold a `*mut T`.
    pub fn boxed<T: Bound>() -> Self {
        ClassDef::new(T::BOXED_TYPE_NAME, size_of::<*mut T>())
    }

    pub fn method(mut self, name: &'static str, f: NativeFn) -> Self {
        self.methods.push((name, f));
        self
    }

    pub fn constructor(mut self, f: NativeFn) -> Self {
        self.constructor = Some(f);
        self
    }

    pub fn finalizer(mut self, f: NativeFn) -> Self {
        self.finalizer = Some(f);
        self
    }

    pub fn properties(mut self, peer: Peer) -> Self {
        self.peer = Some(peer);
        self
    }
}

/// Register the global `class` functions. Safe to call repeatedly.
pub fn install(state: &mut State) -> Result<(), LuaError> {
    helpers::register(
        state,
        Some("class"),
        &[
            ("New", new_object),
            ("IsInstance", is_instance_fn),
            ("IsType", is_type_fn),
        ],
    )
}

/// Register the class described by `def`.
pub fn define(state: &mut State, def: ClassDef) -> Result<(), LuaError> {
    install(state)?;
    if !state.new_metatable(def.name)? {
        state.pop(1);
        return Err(LuaError::runtime(format!(
            "class '{}' is already defined",
            def.name
        )));
    }
    let mt = StackIndex::Absolute(state.top());
    state.push_bool(true);
    state.raw_set_field(mt, CLASS_MARKER)?;
    state.push_integer(def.size as i64);
    state.raw_set_field(mt, "__size")?;
    if let Some(f) = def.constructor {
        state.push_function(f);
        state.raw_set_field(mt, "__cons")?;
    }
    if let Some(f) = def.finalizer {
        state.push_function(f);
        state.raw_set_field(mt, "__gc")?;
    }
    for &(name, f) in &def.methods {
        state.push_named_function(f, name);
        state.raw_set_field(mt, name)?;
    }
    state.push_value(mt);
    state.raw_set_field(mt, "__index")?;
    if let Some(peer) = def.peer {
        install_peer(state, mt, peer)?;
    }
    state.pop(1);
    debug!(
        "defined class {} ({} bytes, {} methods)",
        def.name,
        def.size,
        def.methods.len()
    );
    Ok(())
}

fn push_library_fn(state: &mut State, path: &str, key: CacheKey) -> Result<(), LuaError> {
    if state.cache_get(key) {
        return Ok(());
    }
    let installed = helpers::get_global(state, "class")? == ValueType::Table;
    state.pop(1);
    if !installed {
        install(state)?;
    }
    helpers::cache_and_get(state, path, key)
}

/// Create an instance of class `name`, passing the marshaled `args` to
/// its constructor, and leave it on top of the stack.
pub fn new_instance<S: Spec + ?Sized>(
    state: &mut State,
    name: &str,
    spec: &S,
    args: &[Arg<'_>],
) -> Result<(), LuaError> {
    push_library_fn(state, "class.New", NEW_KEY)?;
    state.push_string(name);
    call_core(state, 1, 1, spec, args, Mode::Unprotected)?;
    Ok(())
}

/// Whether the value at `idx` is an instance of any defined class.
pub fn is_instance(state: &mut State, idx: impl Into<StackIndex>) -> Result<bool, LuaError> {
    let idx = state.abs_index(idx);
    push_library_fn(state, "class.IsInstance", IS_INSTANCE_KEY)?;
    state.push_value(idx);
    state.call(1, 1)?;
    let result = state.to_boolean(-1);
    state.pop(1);
    Ok(result)
}

/// Whether the value at `idx` is an instance of class `name`.
pub fn is_type(state: &mut State, idx: impl Into<StackIndex>, name: &str) -> Result<bool, LuaError> {
    let idx = state.abs_index(idx);
    push_library_fn(state, "class.IsType", IS_TYPE_KEY)?;
    state.push_value(idx);
    state.push_string(name);
    state.call(2, 1)?;
    let result = state.to_boolean(-1);
    state.pop(1);
    Ok(result)
}

/// `class.New(name, ...)`
fn new_object(state: &mut State) -> Result<usize, LuaError> {
    let name = state.check_string(1)?;
    let nargs = state.top();
    if state.get_registered_metatable(&name)? != ValueType::Table {
        return Err(LuaError::runtime(format!("unknown class '{name}'")));
    }
    let mt = StackIndex::Absolute(state.top());
    state.raw_get_field(mt, "__size")?;
    let size = state.to_integer(-1).unwrap_or(0).max(0) as usize;
    state.pop(1);

    state.new_userdata(size);
    let instance = StackIndex::Absolute(state.top());
    state.push_value(mt);
    state.set_metatable(instance)?;

    if state.raw_get_field(mt, "__cons")? == ValueType::Function {
        state.push_value(instance);
        for i in 2..=nargs {
            state.push_value(StackIndex::Absolute(i));
        }
        state.call(nargs, 0)?;
    } else {
        state.pop(1);
    }
    state.push_value(instance);
    Ok(1)
}

fn class_metatable(state: &mut State, idx: i32) -> bool {
    if state.value_type(idx) != ValueType::Userdata || !state.get_metatable(idx) {
        return false;
    }
    let marked = matches!(state.raw_get_field(-1, CLASS_MARKER), Ok(ValueType::Boolean));
    state.pop(1);
    if !marked {
        state.pop(1);
    }
    marked
}

/// `class.IsInstance(value)`
fn is_instance_fn(state: &mut State) -> Result<usize, LuaError> {
    let result = class_metatable(state, 1);
    if result {
        state.pop(1);
    }
    state.push_bool(result);
    Ok(1)
}

/// `class.IsType(value, name)`
fn is_type_fn(state: &mut State) -> Result<usize, LuaError> {
    let name = state.check_string(2)?;
    let result = class_metatable(state, 1) && {
        state.get_registered_metatable(&name)?;
        state.raw_equal(-1, -2)
    };
    state.set_top(2);
    state.push_bool(result);
    Ok(1)
}
