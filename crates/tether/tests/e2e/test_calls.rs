use super::helpers::{count_args, echo, expect_err, raise, set_global_fn};
use tether::helpers::{get_global, set_global};
use tether::{
    args, call, call_global, call_method_at, pcall, pcall_global, pcall_method, LuaError, State,
    MULTRET,
};

#[test]
fn test_results_and_stack_discipline() {
    let mut s = State::new();
    s.push_integer(100);
    set_global_fn(&mut s, "echo", echo);
    let n = call_global(&mut s, "echo", MULTRET, "i s { i }", &args![1, "two", 3]).unwrap();
    assert_eq!(n, 3);
    assert_eq!(s.top(), 4);
    assert_eq!(s.to_integer(1), Some(100));
    assert_eq!(s.to_integer(2), Some(1));
    assert!(s.is_table(4));
}

#[test]
fn test_fixed_result_count_pads_with_nil() {
    let mut s = State::new();
    set_global_fn(&mut s, "echo", echo);
    let n = call_global(&mut s, "echo", 3, "i", &args![1]).unwrap();
    assert_eq!(n, 3);
    assert!(s.is_nil(3));
}

#[test]
fn test_dotted_global_callee() {
    let mut s = State::new();
    s.new_table();
    set_global(&mut s, "util").unwrap();
    s.push_function(count_args);
    set_global(&mut s, "util.count").unwrap();
    call_global(&mut s, "util.count", 1, "T F 0", &[]).unwrap();
    assert_eq!(s.to_integer(-1), Some(3));
}

#[test]
fn test_nested_pcall_isolation() {
    fn inner(s: &mut State) -> Result<usize, LuaError> {
        let thrown = pcall_global(s, "raise", 0, "s", &args!["inner failure"]).unwrap_err();
        assert!(thrown.message.starts_with("inner failure"));
        s.push_string("recovered");
        Ok(1)
    }
    let mut s = State::new();
    set_global_fn(&mut s, "raise", raise);
    s.push_function(inner);
    let n = pcall(&mut s, 1, "", &[]).unwrap();
    assert_eq!(n, 1);
    assert_eq!(s.to_string_lossy(-1).as_deref(), Some("recovered"));
    assert_eq!(s.top(), 1);
}

#[test]
fn test_traceback_lists_every_frame() {
    fn outer(s: &mut State) -> Result<usize, LuaError> {
        call_global(s, "raise", 0, "s", &args!["deep"])?;
        Ok(0)
    }
    let mut s = State::new();
    set_global_fn(&mut s, "raise", raise);
    s.push_named_function(outer, "outer");
    let thrown = pcall(&mut s, 0, "", &[]).unwrap_err();
    let lines: Vec<&str> = thrown.message.lines().collect();
    assert_eq!(lines[0], "deep");
    assert!(lines.len() >= 3, "{}", thrown.message);
    assert!(lines.contains(&"outer"));
}

#[test]
fn test_unprotected_failure_restores_stack() {
    let mut s = State::new();
    s.push_integer(5);
    set_global_fn(&mut s, "raise", raise);
    let msg = expect_err(call_global(&mut s, "raise", 0, "s", &args!["nope"]));
    assert_eq!(msg, "nope");
    assert_eq!(s.top(), 1);
}

#[test]
fn test_method_on_global_object() {
    fn name_of(s: &mut State) -> Result<usize, LuaError> {
        s.get_field(1, "name")?;
        Ok(1)
    }
    let mut s = State::new();
    s.new_table();
    s.push_string("widget");
    s.set_field(-2, "name").unwrap();
    s.push_function(name_of);
    s.set_field(-2, "getName").unwrap();
    s.set_global("obj").unwrap();

    let n = pcall_method(&mut s, "obj", "getName", 1, "", &[]).unwrap();
    assert_eq!(n, 1);
    assert_eq!(s.to_string_lossy(-1).as_deref(), Some("widget"));

    get_global(&mut s, "obj").unwrap();
    call_method_at(&mut s, -1, "getName", 1, "", &[]).unwrap();
    assert_eq!(s.to_string_lossy(-1).as_deref(), Some("widget"));
}

#[test]
fn test_callee_sees_marshaled_function() {
    fn apply(s: &mut State) -> Result<usize, LuaError> {
        s.push_value(1);
        s.push_integer(7);
        s.call(1, 1)?;
        Ok(1)
    }
    fn double(s: &mut State) -> Result<usize, LuaError> {
        let v = s.check_integer(1)?;
        s.push_integer(v * 2);
        Ok(1)
    }
    let mut s = State::new();
    s.push_function(apply);
    call(&mut s, 1, "f", &args![double as tether::NativeFn]).unwrap();
    assert_eq!(s.to_integer(-1), Some(14));
}

#[test]
fn test_pcall_reports_the_error_that_escaped() {
    fn swallow_then_raise(s: &mut State) -> Result<usize, LuaError> {
        let before = s.top();
        assert!(call_global(s, "raise", 0, "s", &args!["first"]).is_err());
        s.set_top(before);
        Err(LuaError::runtime("second"))
    }
    let mut s = State::new();
    set_global_fn(&mut s, "raise", raise);
    s.push_function(swallow_then_raise);
    let thrown = pcall(&mut s, 0, "", &[]).unwrap_err();
    assert!(thrown.message.starts_with("second\n"), "{}", thrown.message);
    assert!(!thrown.message.contains("first"));
    assert_eq!(s.top(), 0);
}
