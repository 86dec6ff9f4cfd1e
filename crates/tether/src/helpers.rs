//! Stack and namespace helpers shared by the marshaler and bindings.

use tether_runtime::{CacheKey, LuaError, NativeFn, StackIndex, State, ValueType};

/// Push the global `name`, resolving dotted paths (`"a.b.c"`) through
/// nested tables. On failure the stack is left as it was.
pub fn get_global(state: &mut State, name: &str) -> Result<ValueType, LuaError> {
    let top = state.top();
    state.push_value(StackIndex::ENVIRONMENT);
    for segment in name.split('.') {
        if let Err(e) = state.get_field(-1, segment) {
            state.set_top(top);
            return Err(e);
        }
        state.remove(-2)?;
    }
    Ok(state.value_type(-1))
}

/// Pop the top value into the global `name`, resolving dotted paths
/// through nested tables.
pub fn set_global(state: &mut State, name: &str) -> Result<(), LuaError> {
    let Some((path, field)) = name.rsplit_once('.') else {
        return state.set_global(name);
    };
    let top = state.top();
    let result = get_global(state, path).and_then(|_| {
        state.insert(-2)?; // table, value
        state.set_field(-2, field)
    });
    match result {
        Ok(()) => {
            state.pop(1);
            Ok(())
        }
        Err(e) => {
            state.set_top(top.saturating_sub(1));
            Err(e)
        }
    }
}

/// Push the global `name`, looking it up once and caching it under `key`.
pub fn cache_and_get(state: &mut State, name: &str, key: CacheKey) -> Result<(), LuaError> {
    if !state.cache_get(key) {
        get_global(state, name)?;
        state.cache_set(key);
    }
    Ok(())
}

/// Push a function value for `func`, created once and cached under the
/// function's own identity.
#[track_caller]
pub fn cache_and_get_fn(state: &mut State, func: NativeFn) {
    let key = CacheKey::of_fn(func);
    if !state.cache_get(key) {
        state.push_function(func);
        state.cache_set(key);
    }
}

/// Border length of the table at `idx`.
pub fn table_len(state: &State, idx: impl Into<StackIndex>) -> usize {
    state.raw_len(idx)
}

/// Pop the top value and append it to the table at `idx`.
pub fn table_push(state: &mut State, idx: impl Into<StackIndex>) -> Result<(), LuaError> {
    let idx = state.abs_index(idx);
    let n = table_len(state, idx);
    state.raw_seti(idx, n as i64 + 1)
}

/// Remove the last element of the table at `idx`, leaving it on the stack
/// when `keep` is set.
pub fn table_pop(state: &mut State, idx: impl Into<StackIndex>, keep: bool) -> Result<(), LuaError> {
    let idx = state.abs_index(idx);
    let n = table_len(state, idx) as i64;
    if keep {
        state.raw_geti(idx, n)?;
    }
    state.push_nil();
    state.raw_seti(idx, n)
}

/// Push the last element of the table at `idx`.
pub fn table_top(state: &mut State, idx: impl Into<StackIndex>) -> Result<ValueType, LuaError> {
    let idx = state.abs_index(idx);
    let n = table_len(state, idx) as i64;
    state.raw_geti(idx, n)
}

/// Push `source[start..=end]`. Negative bounds count back from the
/// table's length (`-1` is the last element). Returns how many values
/// were pushed.
pub fn unpack(
    state: &mut State,
    source: impl Into<StackIndex>,
    start: i64,
    end: i64,
) -> Result<usize, LuaError> {
    let source = state.abs_index(source);
    let count = table_len(state, source) as i64;
    let resolve = |i: i64| if i < 0 { count + i + 1 } else { i };
    let (start, end) = (resolve(start), resolve(end));
    if start > end {
        return Ok(0);
    }
    if !state.check_stack((end - start + 1) as usize) {
        return Err(LuaError::StackOverflow);
    }
    for i in start..=end {
        state.raw_geti(source, i)?;
    }
    Ok((end - start + 1) as usize)
}

/// True for functions and for values whose metatable has a callable
/// `__call`.
pub fn is_callable(state: &mut State, idx: impl Into<StackIndex>) -> bool {
    let idx = state.abs_index(idx);
    if state.is_function(idx) {
        return true;
    }
    match state.get_metafield(idx, "__call") {
        Some(_) => {
            state.pop(1);
            true
        }
        None => false,
    }
}

/// Push the global table at the dotted path `name`, creating every missing
/// table along the way. The last one is sized for `size_hint` fields. A
/// non-table value on the path is an error, and the stack is left as it was.
pub fn find_table(state: &mut State, name: &str, size_hint: usize) -> Result<(), LuaError> {
    let top = state.top();
    state.push_value(StackIndex::ENVIRONMENT);
    let mut segments = name.split('.').peekable();
    while let Some(segment) = segments.next() {
        let found = match state.raw_get_field(-1, segment) {
            Ok(t) => t,
            Err(e) => {
                state.set_top(top);
                return Err(e);
            }
        };
        match found {
            ValueType::Table => {}
            ValueType::Nil => {
                state.pop(1);
                let fields = if segments.peek().is_none() { size_hint } else { 1 };
                state.create_table(0, fields);
                state.push_value(-1);
                if let Err(e) = state.raw_set_field(-3, segment) {
                    state.set_top(top);
                    return Err(e);
                }
            }
            _ => {
                state.set_top(top);
                return Err(LuaError::runtime(format!("name conflict for module '{name}'")));
            }
        }
        state.remove(-2)?;
    }
    Ok(())
}

/// Install named functions. With `Some(name)` they go into the global
/// table at that (dotted) path, which is created if missing; with `None`
/// they go into the table on top of the stack, which stays there.
pub fn register(
    state: &mut State,
    name: Option<&str>,
    funcs: &[(&'static str, NativeFn)],
) -> Result<(), LuaError> {
    if let Some(name) = name {
        find_table(state, name, funcs.len())?;
    }
    for &(field, func) in funcs {
        state.push_named_function(func, field);
        state.set_field(-2, field)?;
    }
    if name.is_some() {
        state.pop(1);
    }
    Ok(())
}
