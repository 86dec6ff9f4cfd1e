use super::helpers::*;
use tether_runtime::{StackIndex, State, ValueType};

#[test]
fn test_set_top_grows_with_nil_and_shrinks() {
    let mut s = State::new();
    s.push_integer(1);
    s.set_top(3);
    assert_eq!(s.top(), 3);
    assert!(s.is_nil(3));
    s.set_top(0);
    assert_eq!(s.top(), 0);
}

#[test]
fn test_invalid_indices_read_as_none() {
    let s = State::new();
    assert_eq!(s.value_type(1), ValueType::None);
    assert_eq!(s.value_type(-1), ValueType::None);
    assert_eq!(s.value_type(0), ValueType::None);
    assert!(!s.is_valid_index(1));
    assert!(s.is_valid_index(StackIndex::REGISTRY));
}

#[test]
fn test_large_integers_round_trip() {
    let mut s = State::new();
    for v in [i64::MAX, i64::MIN, 1 << 50, -(1 << 50), 0] {
        s.push_integer(v);
    }
    assert_eq!(stack_ints(&s), vec![i64::MAX, i64::MIN, 1 << 50, -(1 << 50), 0]);
    assert!(s.raw_equal(1, 1));
    s.push_integer(i64::MAX);
    assert!(s.raw_equal(1, -1));
}

#[test]
fn test_light_handles() {
    let mut s = State::new();
    let mut x = 5u32;
    let p = &mut x as *mut u32 as *mut std::ffi::c_void;
    s.push_light(p).unwrap();
    s.push_light(std::ptr::null_mut()).unwrap();
    assert!(s.is_light(1));
    assert!(s.is_userdata(1));
    assert_eq!(s.to_userdata(1).map(|p| p.as_ptr() as usize), Some(p as usize));
    assert!(s.is_light(2));
    assert!(s.to_userdata(2).is_none());
    assert_eq!(s.type_name(1), "userdata");
}

#[test]
fn test_c_str_is_stable_and_nul_terminated() {
    let mut s = State::new();
    s.push_string("field");
    let p = s.to_c_str(1).unwrap();
    for i in 0..100 {
        s.push_string(&format!("other {i}"));
    }
    let back = unsafe { std::ffi::CStr::from_ptr(p) };
    assert_eq!(back.to_bytes(), b"field");
}

#[test]
fn test_userdata_blocks_are_zeroed() {
    let mut s = State::new();
    let block = s.new_userdata(24);
    let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 24) };
    assert!(bytes.iter().all(|&b| b == 0));
    assert_eq!(s.userdata_size(1), Some(24));
    assert_eq!(s.raw_len(1), 24);
    assert_eq!(s.to_userdata(1), Some(block));
}

#[test]
fn test_registry_and_globals() {
    let mut s = State::new();
    s.push_integer(3);
    s.set_global("answer").unwrap();
    assert_eq!(s.get_global("answer").unwrap(), ValueType::Number);
    assert_eq!(s.to_integer(-1), Some(3));
    s.push_bool(true);
    s.raw_set_field(StackIndex::REGISTRY, "flag").unwrap();
    s.raw_get_field(StackIndex::REGISTRY, "flag").unwrap();
    assert!(s.to_boolean(-1));
    assert_eq!(s.get_global("missing").unwrap(), ValueType::Nil);
}

#[test]
fn test_table_keys_reject_nil_and_nan() {
    let mut s = State::new();
    s.new_table();
    s.push_nil();
    s.push_integer(1);
    assert_eq!(expect_err(s.raw_set(1)), "table index is nil");
    s.set_top(1);
    s.push_number(f64::NAN);
    s.push_integer(1);
    assert_eq!(expect_err(s.set_table(1)), "table index is NaN");
}

#[test]
fn test_integer_valued_float_keys_normalize() {
    let mut s = State::new();
    s.new_table();
    s.push_number(2.0);
    s.push_string("two");
    s.set_table(1).unwrap();
    s.raw_geti(1, 2).unwrap();
    assert_eq!(s.to_string_lossy(-1).as_deref(), Some("two"));
    assert_eq!(s.raw_len(1), 0);
}

#[test]
fn test_check_number_messages() {
    let mut s = State::new();
    s.push_number(1.5);
    s.push_string("x");
    assert_eq!(
        expect_err(s.check_integer(1)),
        "bad argument #1 (number has no integer representation)"
    );
    assert_eq!(
        expect_err(s.check_number(2)),
        "bad argument #2 (number expected, got string)"
    );
    assert_eq!(s.check_number(1).unwrap(), 1.5);
    assert_eq!(s.check_string(1).unwrap(), "1.5");
}

#[test]
fn test_check_any_and_check_type() {
    let mut s = State::new();
    s.push_bool(false);
    s.push_nil();
    assert!(s.is_boolean(1));
    assert!(!s.is_boolean(2));
    assert!(s.check_any(2).is_ok());
    assert_eq!(expect_err(s.check_any(3)), "bad argument #3 (value expected)");
    assert!(s.check_type(1, ValueType::Boolean).is_ok());
    assert_eq!(
        expect_err(s.check_type(2, ValueType::Table)),
        "bad argument #2 (table expected, got nil)"
    );
}

#[test]
fn test_error_value_pushes_message() {
    let mut s = State::new();
    let err = tether_runtime::LuaError::runtime("boom");
    let v = s.error_value(&err);
    s.push(v);
    assert_eq!(s.to_string_lossy(-1).as_deref(), Some("boom"));
    let v = s.error_value(&tether_runtime::LuaError::StackOverflow);
    s.push(v);
    assert_eq!(s.to_string_lossy(-1).as_deref(), Some("stack overflow"));
}
