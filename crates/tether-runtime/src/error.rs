//! Runtime error types.

use tether_core::object::format_float;
use tether_core::string::StringInterner;
use tether_core::value::TValue;
use thiserror::Error;

/// An error raised while running native functions against a [`State`](crate::state::State).
#[derive(Clone, Debug, Error)]
pub enum LuaError {
    /// General runtime error with message.
    #[error("{0}")]
    Runtime(String),
    /// Too many nested calls or stack slots.
    #[error("stack overflow")]
    StackOverflow,
    /// The message handler of a protected call failed itself.
    #[error("error in error handling")]
    ErrorInHandler,
    /// An arbitrary value raised as an error.
    #[error("{}", describe(.0))]
    Value(TValue),
}

fn describe(v: &TValue) -> String {
    if let Some(i) = v.as_integer() {
        i.to_string()
    } else if let Some(f) = v.as_float() {
        format_float(f)
    } else {
        format!("(error object is a {} value)", tether_core::object::type_name(*v))
    }
}

impl LuaError {
    /// Build a runtime error from anything printable.
    pub fn runtime(msg: impl Into<String>) -> Self {
        LuaError::Runtime(msg.into())
    }

    /// Convert this error into the value a protected call leaves on the stack.
    pub fn to_tvalue(&self, strings: &mut StringInterner) -> TValue {
        match self {
            LuaError::Runtime(msg) => TValue::from_string_id(strings.intern(msg.as_bytes())),
            LuaError::StackOverflow => TValue::from_string_id(strings.intern(b"stack overflow")),
            LuaError::ErrorInHandler => {
                TValue::from_string_id(strings.intern(b"error in error handling"))
            }
            LuaError::Value(v) => *v,
        }
    }
}
