//! Value type classification and type name helpers.

use crate::gc::*;
use crate::value::TValue;

/// The dynamic type of a stack slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// An index past the top of the stack.
    None,
    Nil,
    Boolean,
    LightHandle,
    Number,
    String,
    Table,
    Function,
    Userdata,
}

impl ValueType {
    pub fn of(val: TValue) -> ValueType {
        if val.is_nil() {
            ValueType::Nil
        } else if val.is_bool() {
            ValueType::Boolean
        } else if val.is_integer() || val.is_float() {
            ValueType::Number
        } else if val.is_light() {
            ValueType::LightHandle
        } else {
            match val.gc_sub_tag() {
                Some(GC_SUB_TABLE) => ValueType::Table,
                Some(GC_SUB_NATIVE) => ValueType::Function,
                Some(GC_SUB_STRING) => ValueType::String,
                Some(GC_SUB_BOXED_INT) => ValueType::Number,
                _ => ValueType::Userdata,
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::None => "no value",
            ValueType::Nil => "nil",
            ValueType::Boolean => "boolean",
            ValueType::LightHandle | ValueType::Userdata => "userdata",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Table => "table",
            ValueType::Function => "function",
        }
    }
}

/// The script-visible type name of a value.
pub fn type_name(val: TValue) -> &'static str {
    ValueType::of(val).name()
}

/// Format a float the way `tostring` renders it: integral values keep a
/// trailing `.0`, non-finite values print as `inf`, `-inf` and `nan`.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return if f.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let magnitude = f.abs();
    if magnitude >= 1e16 || (magnitude < 1e-4 && f != 0.0) {
        format!("{f:e}")
    } else if f.fract() == 0.0 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}
