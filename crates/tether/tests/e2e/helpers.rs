use tether::{LuaError, State};

/// Expect `result` to be an error and return its message.
pub fn expect_err<T: std::fmt::Debug, E: std::fmt::Display>(result: Result<T, E>) -> String {
    match result {
        Err(e) => e.to_string(),
        Ok(v) => panic!("expected error, got {v:?}"),
    }
}

/// Returns its arguments unchanged.
pub fn echo(s: &mut State) -> Result<usize, LuaError> {
    Ok(s.top())
}

/// Raises its first argument as a string error.
pub fn raise(s: &mut State) -> Result<usize, LuaError> {
    let msg = s.check_string(1)?;
    Err(LuaError::runtime(msg))
}

/// Number of arguments it was called with.
pub fn count_args(s: &mut State) -> Result<usize, LuaError> {
    let n = s.top() as i64;
    s.push_integer(n);
    Ok(1)
}

/// Install `f` as the global `name`.
pub fn set_global_fn(s: &mut State, name: &str, f: tether::NativeFn) {
    s.push_function(f);
    s.set_global(name).unwrap();
}
