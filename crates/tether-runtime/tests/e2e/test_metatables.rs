use super::helpers::*;
use tether_runtime::{LuaError, State, ValueType};

fn index_fn(s: &mut State) -> Result<usize, LuaError> {
    let key = s.check_string(2)?;
    s.push_string(&format!("computed {key}"));
    Ok(1)
}

#[test]
fn test_index_function_on_userdata() {
    let mut s = State::new();
    s.new_userdata(4);
    s.new_metatable("Box").unwrap();
    s.push_function(index_fn);
    s.raw_set_field(-2, "__index").unwrap();
    s.set_metatable(1).unwrap();
    s.get_field(1, "width").unwrap();
    assert_eq!(s.to_string_lossy(-1).as_deref(), Some("computed width"));
}

#[test]
fn test_newindex_table_redirects_writes() {
    let mut s = State::new();
    s.new_table(); // 1: proxy
    s.new_table(); // 2: storage
    s.new_table(); // 3: metatable
    s.push_value(2);
    s.raw_set_field(3, "__newindex").unwrap();
    s.push_value(3);
    s.set_metatable(1).unwrap();
    s.push_integer(7);
    s.set_field(1, "x").unwrap();
    s.raw_get_field(1, "x").unwrap();
    assert!(s.is_nil(-1));
    s.raw_get_field(2, "x").unwrap();
    assert_eq!(s.to_integer(-1), Some(7));
}

#[test]
fn test_index_loop_is_bounded() {
    let mut s = State::new();
    s.new_table();
    s.new_table();
    s.push_value(1);
    s.raw_set_field(2, "__index").unwrap();
    s.push_value(2);
    s.set_metatable(1).unwrap();
    // The metatable indexes itself through the table, which has it as metatable.
    s.push_value(1);
    s.set_metatable(2).unwrap();
    s.push_value(1);
    s.raw_set_field(1, "__index").unwrap();
    let msg = expect_err(s.get_field(1, "missing"));
    assert!(msg.contains("chain too long"), "{msg}");
}

#[test]
fn test_metafield_lookup() {
    let mut s = State::new();
    s.new_table();
    assert!(s.get_metafield(1, "__name").is_none());
    s.new_metatable("Named").unwrap();
    s.set_metatable(1).unwrap();
    assert_eq!(s.get_metafield(1, "__name"), Some(ValueType::String));
    assert_eq!(s.to_string_lossy(-1).as_deref(), Some("Named"));
    assert_eq!(s.type_name(1), "Named");
    assert!(s.get_metatable(1));
}

#[test]
fn test_user_values() {
    let mut s = State::new();
    s.new_userdata(0);
    assert_eq!(s.get_user_value(1), ValueType::Nil);
    s.pop(1);
    s.new_table();
    s.set_user_value(1).unwrap();
    assert_eq!(s.get_user_value(1), ValueType::Table);
}
