//! Typed argument extraction for native functions.
//!
//! Integer conversions check that the argument is a number and then
//! narrow it like a C cast: out-of-range values wrap, they are not
//! rejected.

use std::ffi::{c_char, c_void};

use tether_runtime::{LuaError, StackIndex, State, ValueType};

/// A Rust type that can be read from a native function argument.
pub trait FromArg: Sized {
    fn check(state: &mut State, arg: usize) -> Result<Self, LuaError>;
}

macro_rules! int_from_arg {
    ($($ty:ty),*) => {
        $(
            impl FromArg for $ty {
                fn check(state: &mut State, arg: usize) -> Result<Self, LuaError> {
                    Ok(state.check_integer(arg)? as $ty)
                }
            }
        )*
    };
}

int_from_arg!(i8, i16, i32, i64, u8, u16, u32, u64);

impl FromArg for f32 {
    fn check(state: &mut State, arg: usize) -> Result<Self, LuaError> {
        Ok(state.check_number(arg)? as f32)
    }
}

impl FromArg for f64 {
    fn check(state: &mut State, arg: usize) -> Result<Self, LuaError> {
        state.check_number(arg)
    }
}

impl FromArg for bool {
    fn check(state: &mut State, arg: usize) -> Result<Self, LuaError> {
        state.check_boolean(arg)
    }
}

impl FromArg for String {
    fn check(state: &mut State, arg: usize) -> Result<Self, LuaError> {
        state.check_string(arg)
    }
}

/// Interned, NUL-terminated and valid for the life of the state.
impl FromArg for *const c_char {
    fn check(state: &mut State, arg: usize) -> Result<Self, LuaError> {
        state.check_c_str(arg)
    }
}

/// Address behind a full userdata or light handle; null for a null handle.
impl FromArg for *mut c_void {
    fn check(state: &mut State, arg: usize) -> Result<Self, LuaError> {
        check_ptr(state, arg)
    }
}

/// Read argument `arg` as `T`.
pub fn check<T: FromArg>(state: &mut State, arg: usize) -> Result<T, LuaError> {
    T::check(state, arg)
}

/// Read the top value as `T` and pop it.
pub fn pop_arg<T: FromArg>(state: &mut State) -> Result<T, LuaError> {
    let top = state.top();
    let value = T::check(state, top)?;
    state.pop(1);
    Ok(value)
}

pub fn check_ptr(state: &mut State, arg: usize) -> Result<*mut c_void, LuaError> {
    let idx = StackIndex::Absolute(arg);
    match state.value_type(idx) {
        ValueType::Userdata | ValueType::LightHandle => {
            Ok(state.to_pointer(idx).unwrap_or(std::ptr::null_mut()))
        }
        _ => Err(LuaError::runtime(format!("Argument {arg} is not a userdata"))),
    }
}
