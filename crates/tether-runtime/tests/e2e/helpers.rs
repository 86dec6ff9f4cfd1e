use tether_runtime::{LuaError, State, StateConfig};

/// A state that only collects when asked to.
pub fn manual_gc_state() -> State {
    State::with_config(StateConfig {
        gc_interval: None,
        ..StateConfig::default()
    })
}

/// Integers of the whole frame, bottom to top. Panics on non-integers.
pub fn stack_ints(s: &State) -> Vec<i64> {
    (1..=s.top())
        .map(|i| {
            s.to_integer(i as i32)
                .unwrap_or_else(|| panic!("slot {i} is {}, expected integer", s.type_name(i as i32)))
        })
        .collect()
}

/// Expect `result` to be an error and return its message.
pub fn expect_err<T: std::fmt::Debug>(result: Result<T, LuaError>) -> String {
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
