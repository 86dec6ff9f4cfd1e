//! Invoking script-visible functions with marshaled arguments.
//!
//! Every entry point comes in two flavors. The plain one propagates
//! failures as [`LuaError`]; the `pcall_*` one runs the callee under a
//! traceback-decorating handler and reports failures as [`Thrown`], a
//! single message string. Either way the stack is returned to the height
//! it had before the callee was pushed, plus the callee's results.

use std::panic::Location;

use log::{trace, warn};
use tether_runtime::{LuaError, NativeFn, StackIndex, State};
use thiserror::Error;

use crate::format::{Arg, Reader, Spec};
use crate::helpers;

/// Whether failures of the callee are intercepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Unprotected,
    Protected,
}

/// A failure reported by a protected call.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Thrown {
    pub message: String,
}

impl Thrown {
    pub fn new(message: impl Into<String>) -> Self {
        Thrown {
            message: message.into(),
        }
    }
}

impl From<Thrown> for LuaError {
    fn from(t: Thrown) -> Self {
        LuaError::Runtime(t.message)
    }
}

/// Message used when a protected call fails with a value that has no
/// string form.
pub const NON_STRING_ERROR: &str = "Caught non-string error";

/// Marshal `args` per `spec` and call the function sitting below the top
/// `count` values, returning how many results it left on the stack.
///
/// In protected mode every failure, including a malformed format string,
/// comes back as `LuaError::Runtime` carrying the decorated message.
pub fn call_core<S: Spec + ?Sized>(
    state: &mut State,
    count: usize,
    retc: i32,
    spec: &S,
    args: &[Arg<'_>],
    mode: Mode,
) -> Result<usize, LuaError> {
    let top = state.top();
    if top < count + 1 {
        return Err(LuaError::runtime("no function to call below the arguments"));
    }
    let mut count = count;
    let directives = spec.directives();
    let mut marshal_error = None;
    if !directives.is_empty() {
        let mut reader = Reader::new(state, &directives, args, top - count);
        marshal_error = reader.read_all().err();
        if marshal_error.is_none() && reader.remaining_args() > 0 {
            trace!("{} host arguments left unread", reader.remaining_args());
        }
        count += state.top() - top;
    }
    let after = state.top() - count - 1;

    if let Some(e) = marshal_error {
        state.set_top(after);
        trace!("marshaling failed before the call: {e}");
        return Err(LuaError::Runtime(e.to_string()));
    }

    let outcome = match mode {
        Mode::Unprotected => state.call(count, retc),
        Mode::Protected => pcall_ef(state, count, retc).map_err(|_| {
            let message = error_message(state);
            LuaError::Runtime(message)
        }),
    };
    match outcome {
        Ok(()) => Ok(state.top() - after),
        Err(e) => {
            state.set_top(after);
            Err(e)
        }
    }
}

fn error_message(state: &mut State) -> String {
    if state.is_string(-1) {
        state.to_string_lossy(-1).unwrap_or_default()
    } else {
        warn!("protected call failed with a {} value", state.type_name(-1));
        NON_STRING_ERROR.to_string()
    }
}

fn protect(result: Result<usize, LuaError>) -> Result<usize, Thrown> {
    result.map_err(|e| Thrown::new(e.to_string()))
}

/// Protected call of the function below the top `argc` values, with a
/// cached traceback decorator as the message handler. On failure the
/// decorated error value is left on top of the stack.
pub fn pcall_ef(state: &mut State, argc: usize, retc: i32) -> Result<(), LuaError> {
    helpers::cache_and_get_fn(state, traceback);
    // The decorator goes below the function and its arguments.
    let func = StackIndex::Absolute(state.top() - argc - 1);
    state.insert(func)?;
    let result = state.pcall(argc, retc, Some(func));
    state.remove(func)?;
    result
}

/// Message handler appending the source position of every active frame.
/// Frames without a line number contribute only their source name.
fn traceback(state: &mut State) -> Result<usize, LuaError> {
    if !state.is_string(1) {
        state.set_top(1);
        return Ok(1);
    }
    let mut message = state.to_string_lossy(1).unwrap_or_default();
    let mut level = 1;
    while let Some(frame) = state.frame_info(level) {
        match frame.line {
            Some(line) => message.push_str(&format!("\n{}:{}", frame.source, line)),
            None => message.push_str(&format!("\n{}", frame.source)),
        }
        level += 1;
    }
    state.push_string(&message);
    Ok(1)
}

/// Call the global function `name` (dotted paths allowed).
#[track_caller]
pub fn call_global<S: Spec + ?Sized>(
    state: &mut State,
    name: &str,
    retc: i32,
    spec: &S,
    args: &[Arg<'_>],
) -> Result<usize, LuaError> {
    state.set_call_site(Location::caller());
    helpers::get_global(state, name)?;
    call_core(state, 0, retc, spec, args, Mode::Unprotected)
}

/// Call the function on top of the stack.
#[track_caller]
pub fn call<S: Spec + ?Sized>(
    state: &mut State,
    retc: i32,
    spec: &S,
    args: &[Arg<'_>],
) -> Result<usize, LuaError> {
    state.set_call_site(Location::caller());
    call_core(state, 0, retc, spec, args, Mode::Unprotected)
}

/// Call `source[name]` with the global `source` as its first argument.
#[track_caller]
pub fn call_method<S: Spec + ?Sized>(
    state: &mut State,
    source: &str,
    name: &str,
    retc: i32,
    spec: &S,
    args: &[Arg<'_>],
) -> Result<usize, LuaError> {
    state.set_call_site(Location::caller());
    push_method_global(state, source, name)?;
    call_core(state, 1, retc, spec, args, Mode::Unprotected)
}

/// Call `source[name]` with the value at `source` as its first argument.
#[track_caller]
pub fn call_method_at<S: Spec + ?Sized>(
    state: &mut State,
    source: impl Into<StackIndex>,
    name: &str,
    retc: i32,
    spec: &S,
    args: &[Arg<'_>],
) -> Result<usize, LuaError> {
    state.set_call_site(Location::caller());
    push_method_at(state, source.into(), name)?;
    call_core(state, 1, retc, spec, args, Mode::Unprotected)
}

/// Protected [`call_global`].
#[track_caller]
pub fn pcall_global<S: Spec + ?Sized>(
    state: &mut State,
    name: &str,
    retc: i32,
    spec: &S,
    args: &[Arg<'_>],
) -> Result<usize, Thrown> {
    state.set_call_site(Location::caller());
    protect(helpers::get_global(state, name).map(|_| 0))?;
    protect(call_core(state, 0, retc, spec, args, Mode::Protected))
}

/// Protected [`call`].
#[track_caller]
pub fn pcall<S: Spec + ?Sized>(
    state: &mut State,
    retc: i32,
    spec: &S,
    args: &[Arg<'_>],
) -> Result<usize, Thrown> {
    state.set_call_site(Location::caller());
    protect(call_core(state, 0, retc, spec, args, Mode::Protected))
}

/// Protected [`call_method`].
#[track_caller]
pub fn pcall_method<S: Spec + ?Sized>(
    state: &mut State,
    source: &str,
    name: &str,
    retc: i32,
    spec: &S,
    args: &[Arg<'_>],
) -> Result<usize, Thrown> {
    state.set_call_site(Location::caller());
    protect(push_method_global(state, source, name).map(|()| 0))?;
    protect(call_core(state, 1, retc, spec, args, Mode::Protected))
}

/// Protected [`call_method_at`].
#[track_caller]
pub fn pcall_method_at<S: Spec + ?Sized>(
    state: &mut State,
    source: impl Into<StackIndex>,
    name: &str,
    retc: i32,
    spec: &S,
    args: &[Arg<'_>],
) -> Result<usize, Thrown> {
    state.set_call_site(Location::caller());
    protect(push_method_at(state, source.into(), name).map(|()| 0))?;
    protect(call_core(state, 1, retc, spec, args, Mode::Protected))
}

/// Leaves `source[name], source` on the stack.
fn push_method_global(state: &mut State, source: &str, name: &str) -> Result<(), LuaError> {
    helpers::get_global(state, source)?;
    if let Err(e) = state.get_field(-1, name) {
        state.pop(1);
        return Err(e);
    }
    state.insert(-2)
}

fn push_method_at(state: &mut State, source: StackIndex, name: &str) -> Result<(), LuaError> {
    let source = state.abs_index(source);
    state.get_field(source, name)?;
    state.push_value(source);
    Ok(())
}

/// Run each library opener in protected mode, stopping at the first
/// failure.
pub fn load_libs(state: &mut State, libs: &[NativeFn]) -> Result<(), Thrown> {
    for &open in libs {
        state.push_function(open);
        if pcall_ef(state, 0, 0).is_err() {
            let message = error_message(state);
            state.pop(1);
            return Err(Thrown::new(message));
        }
    }
    Ok(())
}

/// Render an unrecoverable error together with the last recorded host
/// call site, for reporting before the host aborts.
pub fn fatal_report(state: &State, err: &LuaError) -> String {
    match state.call_site() {
        Some(site) => format!(
            "{err}: file = {}, line = {}, column = {}",
            site.file(),
            site.line(),
            site.column()
        ),
        None => err.to_string(),
    }
}
