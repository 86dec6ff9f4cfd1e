//! Format-string driven argument marshaling.
//!
//! A format string is a sequence of single-character directives separated
//! by optional whitespace. Each directive pushes one value built from the
//! next host argument (or from a stack slot), and `{ ... }` builds a table
//! from the elements between the braces:
//!
//! | directive | argument | pushes |
//! |-----------|----------|--------|
//! | `a` | index | copy of a stack slot; negative counts back from the marshal start |
//! | `r` | index | copy of a stack slot; negative counts back from the current top |
//! | `b` | bool | a boolean |
//! | `T` / `F` | none | `true` / `false` |
//! | `f` | function | a native function |
//! | `i` | integer | an integer |
//! | `n` | number | a float |
//! | `s` | string | a string |
//! | `u` | pointer | a light handle, or nil for null |
//! | `U` | pointer | a light handle; null is an error |
//! | `0` | none | nil |
//! | `g` | string | the (dotted) global of that name |
//! | `{` ... `}` | none | a table; plain elements are appended in order |
//! | `K` k v | none | sets `t[k] = v` in the enclosing table |
//! | `C` x | bool | `x` when the condition holds; otherwise `x` is skipped |
//!
//! Skipped elements still consume their host arguments, so the argument
//! list stays aligned with the format string.

use std::borrow::Cow;
use std::ffi::c_void;
use std::slice;

use tether_runtime::{NativeFn, StackIndex, State};
use thiserror::Error;

use crate::helpers;

/// A host value handed to the marshaler.
#[derive(Clone, Copy, Debug)]
pub enum Arg<'a> {
    Int(i64),
    Num(f64),
    Bool(bool),
    Str(&'a str),
    Func(NativeFn),
    Ptr(*mut c_void),
    Index(StackIndex),
}

impl From<i64> for Arg<'_> {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<i32> for Arg<'_> {
    fn from(v: i32) -> Self {
        Arg::Int(v as i64)
    }
}

impl From<u32> for Arg<'_> {
    fn from(v: u32) -> Self {
        Arg::Int(v as i64)
    }
}

impl From<usize> for Arg<'_> {
    fn from(v: usize) -> Self {
        Arg::Int(v as i64)
    }
}

impl From<f64> for Arg<'_> {
    fn from(v: f64) -> Self {
        Arg::Num(v)
    }
}

impl From<f32> for Arg<'_> {
    fn from(v: f32) -> Self {
        Arg::Num(v as f64)
    }
}

impl From<bool> for Arg<'_> {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(v: &'a str) -> Self {
        Arg::Str(v)
    }
}

impl<'a> From<&'a String> for Arg<'a> {
    fn from(v: &'a String) -> Self {
        Arg::Str(v)
    }
}

impl From<NativeFn> for Arg<'_> {
    fn from(f: NativeFn) -> Self {
        Arg::Func(f)
    }
}

impl<T> From<*mut T> for Arg<'_> {
    fn from(p: *mut T) -> Self {
        Arg::Ptr(p.cast())
    }
}

impl<T> From<*const T> for Arg<'_> {
    fn from(p: *const T) -> Self {
        Arg::Ptr(p as *mut c_void)
    }
}

impl From<StackIndex> for Arg<'_> {
    fn from(i: StackIndex) -> Self {
        Arg::Index(i)
    }
}

/// Build an argument array for the marshaler, converting each expression
/// with `Arg::from`.
///
/// ```
/// use tether::args;
/// let a = args![1, 2.5, "name", true];
/// assert_eq!(a.len(), 4);
/// ```
#[macro_export]
macro_rules! args {
    ($($e:expr),* $(,)?) => {
        [$($crate::format::Arg::from($e)),*]
    };
}

/// One parsed format directive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    Absolute,
    Relative,
    Bool,
    True,
    False,
    Function,
    Integer,
    Number,
    String,
    Light,
    LightNonNull,
    Nil,
    Global,
    Open,
    Close,
    Condition,
    Key,
    /// An unrecognized character; reading it fails with `Bad type`.
    Unknown(char),
}

impl Directive {
    pub fn from_char(c: char) -> Directive {
        match c {
            'a' => Directive::Absolute,
            'r' => Directive::Relative,
            'b' => Directive::Bool,
            'T' => Directive::True,
            'F' => Directive::False,
            'f' => Directive::Function,
            'i' => Directive::Integer,
            'n' => Directive::Number,
            's' => Directive::String,
            'u' => Directive::Light,
            'U' => Directive::LightNonNull,
            '0' => Directive::Nil,
            'g' => Directive::Global,
            '{' => Directive::Open,
            '}' => Directive::Close,
            'C' => Directive::Condition,
            'K' => Directive::Key,
            other => Directive::Unknown(other),
        }
    }
}

/// A format string parsed once for repeated use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormatSpec {
    directives: Vec<Directive>,
}

impl FormatSpec {
    pub fn parse(format: &str) -> FormatSpec {
        FormatSpec {
            directives: parse_directives(format),
        }
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}

fn parse_directives(format: &str) -> Vec<Directive> {
    format
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(Directive::from_char)
        .collect()
}

/// Anything that can describe the values to marshal: a format string or a
/// pre-parsed [`FormatSpec`].
pub trait Spec {
    fn directives(&self) -> Cow<'_, [Directive]>;
}

impl Spec for str {
    fn directives(&self) -> Cow<'_, [Directive]> {
        Cow::Owned(parse_directives(self))
    }
}

impl Spec for String {
    fn directives(&self) -> Cow<'_, [Directive]> {
        Cow::Owned(parse_directives(self))
    }
}

impl Spec for FormatSpec {
    fn directives(&self) -> Cow<'_, [Directive]> {
        Cow::Borrowed(&self.directives)
    }
}

/// A structural problem found while marshaling. The first one found wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("Bad index")]
    BadIndex,
    #[error("Null key")]
    NullKey,
    #[error("NaN key")]
    NanKey,
    #[error("Null userdata")]
    NullUserdata,
    #[error("Unclosed table")]
    UnclosedTable,
    #[error("Unopened table")]
    UnopenedTable,
    #[error("Conditional key")]
    ConditionalKey,
    #[error("Conditional value")]
    ConditionalValue,
    #[error("Unfinished condition")]
    UnfinishedCondition,
    #[error("Missing key")]
    MissingKey,
    #[error("Missing value")]
    MissingValue,
    #[error("Key outside table")]
    KeyOutsideTable,
    #[error("Nested key")]
    NestedKey,
    #[error("Bad type")]
    BadType,
    #[error("Missing argument")]
    MissingArgument,
    #[error("Argument mismatch")]
    ArgumentMismatch,
    #[error("Bad global")]
    BadGlobal,
    #[error("Tables nested too deeply")]
    TooDeep,
}

/// Deepest table nesting a format string may describe.
pub const MAX_TABLE_DEPTH: usize = 200;

/// Outcome of reading one element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Read {
    Element,
    /// A `}` closing the innermost open table.
    Close,
    /// The format string is exhausted.
    End,
}

/// Walks a directive list, pushing values onto the state.
pub struct Reader<'s, 'd, 'a> {
    state: &'s mut State,
    directives: &'d [Directive],
    pos: usize,
    args: slice::Iter<'d, Arg<'a>>,
    /// Stack height that negative `a` indices count back from.
    base: usize,
    height: usize,
    in_key: bool,
    in_value: bool,
    skip: bool,
}

impl<'s, 'd, 'a> Reader<'s, 'd, 'a> {
    pub fn new(
        state: &'s mut State,
        directives: &'d [Directive],
        args: &'d [Arg<'a>],
        base: usize,
    ) -> Self {
        Reader {
            state,
            directives,
            pos: 0,
            args: args.iter(),
            base,
            height: 0,
            in_key: false,
            in_value: false,
            skip: false,
        }
    }

    /// Read every element. On error the values pushed so far stay on the
    /// stack; the caller decides how far to unwind.
    pub fn read_all(&mut self) -> Result<(), FormatError> {
        loop {
            match self.read_element()? {
                Read::Element => {}
                Read::End => return Ok(()),
                // Only reachable inside a table.
                Read::Close => return Err(FormatError::UnopenedTable),
            }
        }
    }

    /// Number of host arguments not consumed yet.
    pub fn remaining_args(&self) -> usize {
        self.args.len()
    }

    pub fn read_element(&mut self) -> Result<Read, FormatError> {
        let Some(&directive) = self.directives.get(self.pos) else {
            return Ok(Read::End);
        };
        self.pos += 1;
        match directive {
            Directive::Absolute => self.stack_value(false),
            Directive::Relative => self.stack_value(true),
            Directive::Bool => {
                let b = self.bool_arg()?;
                self.emit(|s| s.push_bool(b));
                Ok(Read::Element)
            }
            Directive::True => {
                self.emit(|s| s.push_bool(true));
                Ok(Read::Element)
            }
            Directive::False => {
                self.emit(|s| s.push_bool(false));
                Ok(Read::Element)
            }
            Directive::Function => {
                let Arg::Func(f) = self.next_arg()? else {
                    return Err(FormatError::ArgumentMismatch);
                };
                self.emit(|s| s.push_function(f));
                Ok(Read::Element)
            }
            Directive::Integer => {
                let Arg::Int(i) = self.next_arg()? else {
                    return Err(FormatError::ArgumentMismatch);
                };
                self.emit(|s| s.push_integer(i));
                Ok(Read::Element)
            }
            Directive::Number => {
                let n = match self.next_arg()? {
                    Arg::Num(n) => n,
                    Arg::Int(i) => i as f64,
                    _ => return Err(FormatError::ArgumentMismatch),
                };
                if self.in_key && n.is_nan() {
                    return Err(FormatError::NanKey);
                }
                self.emit(|s| s.push_number(n));
                Ok(Read::Element)
            }
            Directive::String => {
                let Arg::Str(text) = self.next_arg()? else {
                    return Err(FormatError::ArgumentMismatch);
                };
                self.emit(|s| s.push_string(text));
                Ok(Read::Element)
            }
            Directive::Light => self.light(false),
            Directive::LightNonNull => self.light(true),
            Directive::Nil => {
                if self.in_key {
                    return Err(FormatError::NullKey);
                }
                self.emit(|s| s.push_nil());
                Ok(Read::Element)
            }
            Directive::Global => self.global(),
            Directive::Open => self.table(),
            Directive::Close => {
                if self.height == 0 {
                    Err(FormatError::UnopenedTable)
                } else {
                    Ok(Read::Close)
                }
            }
            Directive::Condition => self.condition(),
            Directive::Key => self.key(),
            Directive::Unknown(_) => Err(FormatError::BadType),
        }
    }

    fn next_arg(&mut self) -> Result<Arg<'a>, FormatError> {
        self.args.next().copied().ok_or(FormatError::MissingArgument)
    }

    fn bool_arg(&mut self) -> Result<bool, FormatError> {
        match self.next_arg()? {
            Arg::Bool(b) => Ok(b),
            _ => Err(FormatError::ArgumentMismatch),
        }
    }

    fn emit(&mut self, push: impl FnOnce(&mut State)) {
        if !self.skip {
            push(self.state);
        }
    }

    fn stack_value(&mut self, relative: bool) -> Result<Read, FormatError> {
        let idx = match self.next_arg()? {
            Arg::Index(idx) => idx,
            Arg::Int(n) => i32::try_from(n)
                .map(StackIndex::from)
                .map_err(|_| FormatError::BadIndex)?,
            _ => return Err(FormatError::ArgumentMismatch),
        };
        let idx = match idx {
            StackIndex::RelativeToTop(n) => {
                let base = if relative {
                    self.state.top() + 1
                } else {
                    self.base
                };
                match base.checked_sub(n) {
                    Some(abs) if abs > 0 => StackIndex::Absolute(abs),
                    _ => return Err(FormatError::BadIndex),
                }
            }
            other => other,
        };
        if let StackIndex::Absolute(n) = idx {
            if n == 0 || n > self.state.top() {
                return Err(FormatError::BadIndex);
            }
        }
        if self.in_key {
            let value = self.state.value_at(idx);
            if value.is_nil() {
                return Err(FormatError::NullKey);
            }
            if value.as_float().is_some_and(f64::is_nan) {
                return Err(FormatError::NanKey);
            }
        }
        self.emit(|s| s.push_value(idx));
        Ok(Read::Element)
    }

    fn light(&mut self, non_null: bool) -> Result<Read, FormatError> {
        let Arg::Ptr(ptr) = self.next_arg()? else {
            return Err(FormatError::ArgumentMismatch);
        };
        if self.skip {
            return Ok(Read::Element);
        }
        if ptr.is_null() {
            if non_null {
                return Err(FormatError::NullUserdata);
            }
            if self.in_key {
                return Err(FormatError::NullKey);
            }
            self.state.push_nil();
        } else {
            self.state
                .push_light(ptr)
                .map_err(|_| FormatError::ArgumentMismatch)?;
        }
        Ok(Read::Element)
    }

    fn global(&mut self) -> Result<Read, FormatError> {
        let Arg::Str(name) = self.next_arg()? else {
            return Err(FormatError::ArgumentMismatch);
        };
        if self.skip {
            return Ok(Read::Element);
        }
        helpers::get_global(self.state, name).map_err(|_| FormatError::BadGlobal)?;
        if self.in_key && self.state.is_nil(-1) {
            self.state.pop(1);
            return Err(FormatError::NullKey);
        }
        Ok(Read::Element)
    }

    fn table(&mut self) -> Result<Read, FormatError> {
        // A table may itself be a key or a value; its own entries are not.
        let (in_key, in_value) = (self.in_key, self.in_value);
        if self.height >= MAX_TABLE_DEPTH {
            return Err(FormatError::TooDeep);
        }
        self.in_key = false;
        self.in_value = false;
        self.height += 1;
        if !self.skip {
            self.state.new_table();
        }
        let table = StackIndex::Absolute(self.state.top());
        loop {
            let before = self.state.top();
            match self.read_element()? {
                Read::Element => {
                    if self.state.top() > before {
                        helpers::table_push(self.state, table)
                            .map_err(|_| FormatError::UnclosedTable)?;
                    }
                }
                Read::Close => break,
                Read::End => return Err(FormatError::UnclosedTable),
            }
        }
        self.height -= 1;
        self.in_key = in_key;
        self.in_value = in_value;
        Ok(Read::Element)
    }

    fn condition(&mut self) -> Result<Read, FormatError> {
        if self.in_key {
            return Err(FormatError::ConditionalKey);
        }
        if self.in_value {
            return Err(FormatError::ConditionalValue);
        }
        let holds = self.bool_arg()?;
        let saved = self.skip;
        self.skip = saved || !holds;
        let read = self.read_element()?;
        self.skip = saved;
        match read {
            Read::Element => Ok(Read::Element),
            Read::Close | Read::End => Err(FormatError::UnfinishedCondition),
        }
    }

    fn key(&mut self) -> Result<Read, FormatError> {
        if self.height == 0 {
            return Err(FormatError::KeyOutsideTable);
        }
        if self.in_key || self.in_value {
            return Err(FormatError::NestedKey);
        }
        self.in_key = true;
        if self.read_element()? != Read::Element {
            return Err(FormatError::MissingKey);
        }
        self.in_key = false;
        self.in_value = true;
        if self.read_element()? != Read::Element {
            return Err(FormatError::MissingValue);
        }
        self.in_value = false;
        if !self.skip {
            self.state.raw_set(-3).map_err(|_| FormatError::NullKey)?;
        }
        Ok(Read::Element)
    }
}

/// Push the values described by `spec` onto the stack and return how many
/// were pushed. On error the stack is restored to its height on entry.
pub fn marshal<S: Spec + ?Sized>(
    state: &mut State,
    spec: &S,
    args: &[Arg<'_>],
) -> Result<usize, FormatError> {
    let top = state.top();
    let directives = spec.directives();
    let result = Reader::new(state, &directives, args, top + 1).read_all();
    match result {
        Ok(()) => Ok(state.top() - top),
        Err(e) => {
            state.set_top(top);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use tether_runtime::ValueType;

    fn noop(_: &mut State) -> Result<usize, tether_runtime::LuaError> {
        Ok(0)
    }

    #[test]
    fn test_parse_skips_whitespace() {
        let spec = FormatSpec::parse(" i\tn  {s}\n");
        assert_eq!(
            spec.directives(),
            &[
                Directive::Integer,
                Directive::Number,
                Directive::Open,
                Directive::String,
                Directive::Close
            ]
        );
        assert!(FormatSpec::parse("   ").is_empty());
        assert_eq!(Directive::from_char('x'), Directive::Unknown('x'));
    }

    #[test]
    fn test_scalars() {
        let mut s = State::new();
        let ptr = 0x1000usize as *mut c_void;
        let n = marshal(
            &mut s,
            "b T F f i n s u 0",
            &args![false, noop as NativeFn, 7, 1.5, "hi", ptr],
        )
        .unwrap();
        assert_eq!(n, 9);
        assert!(!s.to_boolean(1));
        assert!(s.to_boolean(2));
        assert!(!s.to_boolean(3));
        assert!(s.is_function(4));
        assert_eq!(s.to_integer(5), Some(7));
        assert_eq!(s.to_number(6), Some(1.5));
        assert_eq!(s.to_string_lossy(7).as_deref(), Some("hi"));
        assert_eq!(s.to_pointer(8), Some(ptr));
        assert!(s.is_nil(9));
    }

    #[test]
    fn test_null_light_pushes_nil() {
        let mut s = State::new();
        marshal(&mut s, "u", &args![std::ptr::null_mut::<c_void>()]).unwrap();
        assert!(s.is_nil(-1));
        let err = marshal(&mut s, "U", &args![std::ptr::null_mut::<c_void>()]).unwrap_err();
        assert_eq!(err, FormatError::NullUserdata);
        assert_eq!(s.top(), 1);
    }

    #[test]
    fn test_stack_indices() {
        let mut s = State::new();
        s.push_integer(10);
        s.push_integer(20);
        marshal(&mut s, "a a r", &args![1, -1, -1]).unwrap();
        assert_eq!(s.to_integer(3), Some(10));
        // `a -1` is the topmost value when marshaling started.
        assert_eq!(s.to_integer(4), Some(20));
        // `r -1` is the topmost value right now.
        assert_eq!(s.to_integer(5), Some(20));
        assert_eq!(marshal(&mut s, "a", &args![9]), Err(FormatError::BadIndex));
        assert_eq!(marshal(&mut s, "a", &args![0]), Err(FormatError::BadIndex));
    }

    #[test]
    fn test_pseudo_index_is_not_range_checked() {
        let mut s = State::new();
        marshal(&mut s, "a", &args![StackIndex::ENVIRONMENT]).unwrap();
        assert_eq!(s.value_type(-1), ValueType::Table);
    }

    #[test]
    fn test_array_and_keyed_table() {
        let mut s = State::new();
        marshal(&mut s, "{ i i K s n }", &args![1, 2, "x", 0.5]).unwrap();
        assert_eq!(s.top(), 1);
        assert_eq!(s.raw_len(1), 2);
        s.get_field(1, "x").unwrap();
        assert_eq!(s.to_number(-1), Some(0.5));
    }

    #[test]
    fn test_nested_tables() {
        let mut s = State::new();
        marshal(&mut s, "{ { i } K s { i i } }", &args![1, "inner", 2, 3]).unwrap();
        assert_eq!(s.raw_len(1), 1);
        s.raw_geti(1, 1).unwrap();
        assert_eq!(s.raw_len(-1), 1);
        s.pop(1);
        s.get_field(1, "inner").unwrap();
        assert_eq!(s.raw_len(-1), 2);
    }

    #[test]
    fn test_condition_skips_and_consumes() {
        let mut s = State::new();
        marshal(&mut s, "C i C s i", &args![false, 1, true, "kept", 3]).unwrap();
        assert_eq!(s.top(), 2);
        assert_eq!(s.to_string_lossy(1).as_deref(), Some("kept"));
        assert_eq!(s.to_integer(2), Some(3));
    }

    #[test]
    fn test_skipped_table_does_not_close_parent() {
        let mut s = State::new();
        marshal(&mut s, "{ C { i } i }", &args![false, 1, 2]).unwrap();
        assert_eq!(s.top(), 1);
        assert_eq!(s.raw_len(1), 1);
        s.raw_geti(1, 1).unwrap();
        assert_eq!(s.to_integer(-1), Some(2));
    }

    #[test]
    fn test_skipped_key_pair() {
        let mut s = State::new();
        marshal(&mut s, "{ C K s i K s i }", &args![false, "a", 1, "b", 2]).unwrap();
        s.get_field(1, "a").unwrap();
        assert!(s.is_nil(-1));
        s.get_field(1, "b").unwrap();
        assert_eq!(s.to_integer(-1), Some(2));
    }

    #[test]
    fn test_structural_errors() {
        let cases: Vec<(&str, Vec<Arg<'_>>, FormatError)> = vec![
            ("{ i", args![1].to_vec(), FormatError::UnclosedTable),
            ("}", vec![], FormatError::UnopenedTable),
            ("K s i", args!["k", 1].to_vec(), FormatError::KeyOutsideTable),
            ("{ K 0 i }", args![1].to_vec(), FormatError::NullKey),
            ("{ K C s i }", args![true, "k", 1].to_vec(), FormatError::ConditionalKey),
            ("{ K s C i }", args!["k", true, 1].to_vec(), FormatError::ConditionalValue),
            ("C", args![true].to_vec(), FormatError::UnfinishedCondition),
            ("{ C }", args![true].to_vec(), FormatError::UnfinishedCondition),
            ("{ K }", vec![], FormatError::MissingKey),
            ("{ K s }", args!["k"].to_vec(), FormatError::MissingValue),
            ("{ K K s i i }", args!["k", 1, 2].to_vec(), FormatError::NestedKey),
            ("i x", args![1].to_vec(), FormatError::BadType),
        ];
        for (format, args, expected) in cases {
            let mut s = State::new();
            let err = marshal(&mut s, format, &args).unwrap_err();
            assert_eq!(err, expected, "format {format:?}");
            assert_eq!(s.top(), 0, "format {format:?}");
        }
    }

    #[test]
    fn test_nesting_limit() {
        let mut s = State::new();
        let deep = "{".repeat(MAX_TABLE_DEPTH + 1);
        assert_eq!(marshal(&mut s, deep.as_str(), &[]), Err(FormatError::TooDeep));
        assert_eq!(s.top(), 0);
    }

    #[test]
    fn test_nan_key_rejected() {
        let mut s = State::new();
        let err = marshal(&mut s, "{ K n i }", &args![f64::NAN, 1]).unwrap_err();
        assert_eq!(err, FormatError::NanKey);
    }

    #[test]
    fn test_argument_errors() {
        let mut s = State::new();
        assert_eq!(marshal(&mut s, "i i", &args![1]), Err(FormatError::MissingArgument));
        assert_eq!(marshal(&mut s, "i", &args!["no"]), Err(FormatError::ArgumentMismatch));
        assert_eq!(s.top(), 0);
    }

    #[test]
    fn test_global_lookup() {
        let mut s = State::new();
        s.push_integer(4);
        s.set_global("answer").unwrap();
        marshal(&mut s, "g", &args!["answer"]).unwrap();
        assert_eq!(s.to_integer(-1), Some(4));
        assert_eq!(
            marshal(&mut s, "g", &args!["missing.path"]),
            Err(FormatError::BadGlobal)
        );
    }

    #[test]
    fn test_table_as_key() {
        let mut s = State::new();
        marshal(&mut s, "{ K { i } T }", &args![1]).unwrap();
        s.push_nil();
        assert!(s.next(1).unwrap());
        assert!(s.is_table(-2));
        assert!(s.to_boolean(-1));
    }

    #[test]
    fn test_reader_steps_one_element_at_a_time() {
        let mut s = State::new();
        let spec = FormatSpec::parse("i C s n");
        let args = args![1, false, "skipped", 2.5, "extra"];
        let mut reader = Reader::new(&mut s, spec.directives(), &args, 1);
        assert_eq!(reader.read_element(), Ok(Read::Element));
        assert_eq!(reader.remaining_args(), 4);
        assert_eq!(reader.read_element(), Ok(Read::Element));
        assert_eq!(reader.remaining_args(), 2);
        assert_eq!(reader.read_element(), Ok(Read::Element));
        assert_eq!(reader.read_element(), Ok(Read::End));
        assert_eq!(reader.remaining_args(), 1);
        assert_eq!(s.top(), 2);
    }
}
