use super::helpers::*;
use tether_runtime::{LuaError, StackIndex, State, ValueType, MULTRET};

#[test]
fn test_multret_keeps_every_result() {
    let mut s = State::new();
    s.push_function(echo);
    for i in 1..=4 {
        s.push_integer(i);
    }
    s.call(4, MULTRET).unwrap();
    assert_eq!(stack_ints(&s), vec![1, 2, 3, 4]);
}

#[test]
fn test_zero_results_discards() {
    let mut s = State::new();
    s.push_integer(9);
    s.push_function(echo);
    s.push_integer(1);
    s.call(1, 0).unwrap();
    assert_eq!(stack_ints(&s), vec![9]);
}

#[test]
fn test_call_does_not_catch() {
    let mut s = State::new();
    s.push_function(raise);
    s.push_string("boom");
    assert_eq!(expect_err(s.call(1, 0)), "boom");
    assert_eq!(s.call_depth(), 0);
}

#[test]
fn test_nested_pcall_isolates_handlers() {
    fn inner(s: &mut State) -> Result<usize, LuaError> {
        s.push_function(raise);
        s.push_string("inner");
        let caught = s.pcall(1, 0, None).is_err();
        s.push_bool(caught);
        Ok(1)
    }
    fn outer_handler(s: &mut State) -> Result<usize, LuaError> {
        s.push_string("outer handler ran");
        Ok(1)
    }
    let mut s = State::new();
    s.push_function(outer_handler);
    s.push_function(inner);
    s.pcall(0, 1, Some(StackIndex::Absolute(1))).unwrap();
    assert!(s.to_boolean(-1));
    assert_eq!(s.top(), 2);
}

#[test]
fn test_call_metamethod() {
    fn called(s: &mut State) -> Result<usize, LuaError> {
        // self, then the original argument
        assert!(s.is_table(1));
        let n = s.check_integer(2)?;
        s.push_integer(n * 2);
        Ok(1)
    }
    let mut s = State::new();
    s.new_table();
    s.new_table();
    s.push_function(called);
    s.raw_set_field(-2, "__call").unwrap();
    s.set_metatable(-2).unwrap();
    s.push_integer(21);
    s.call(1, 1).unwrap();
    assert_eq!(stack_ints(&s), vec![42]);
}

#[test]
fn test_rust_closure_captures_state() {
    use std::cell::Cell;
    use std::rc::Rc;
    let hits = Rc::new(Cell::new(0));
    let counter = hits.clone();
    let mut s = State::new();
    s.push_rust_closure(
        move |s| {
            counter.set(counter.get() + 1);
            s.push_integer(counter.get());
            Ok(1)
        },
        0,
    );
    s.set_global("tick").unwrap();
    for _ in 0..3 {
        s.get_global("tick").unwrap();
        s.call(0, 1).unwrap();
        s.pop(1);
    }
    assert_eq!(hits.get(), 3);
}

#[test]
fn test_frame_info_reports_origin() {
    fn where_am_i(s: &mut State) -> Result<usize, LuaError> {
        let info = s.frame_info(0).expect("running frame");
        s.push_string(&info.source);
        s.push_integer(i64::from(info.line.unwrap_or(0)));
        Ok(2)
    }
    let mut s = State::new();
    s.push_named_function(where_am_i, "probe");
    s.call(0, 2).unwrap();
    assert_eq!(s.to_string_lossy(1).as_deref(), Some("probe"));
    assert_eq!(s.to_integer(2), Some(0));

    let line = line!() + 1;
    s.push_function(where_am_i);
    s.call(0, 2).unwrap();
    assert!(s.to_string_lossy(3).unwrap().ends_with("test_calls.rs"));
    assert_eq!(s.to_integer(4), Some(i64::from(line)));
    assert!(s.frame_info(0).is_none());
}

#[test]
fn test_pcall_non_callable_reaches_handler() {
    fn handler(s: &mut State) -> Result<usize, LuaError> {
        let msg = s.check_string(1)?;
        s.push_string(&format!("handled: {msg}"));
        Ok(1)
    }
    let mut s = State::new();
    s.push_function(handler);
    s.push_bool(true);
    let err = s.pcall(0, 0, Some(StackIndex::Absolute(1))).unwrap_err();
    assert_eq!(err.to_string(), "handled: attempt to call a boolean value");
    assert_eq!(s.value_type(-1), ValueType::String);
}
